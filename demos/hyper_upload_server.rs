use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyStream, Full};
use hyper::{body::Incoming, header::CONTENT_TYPE, Request, Response};
// Import the ingestion types.
use multipart_ingest::{IngestOptions, IngestionSession, PartPayload, SinkKind};
use tokio_util::sync::CancellationToken;

// A handler for incoming requests.
async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, multipart_ingest::Error> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    // Convert the body into a stream of data frames.
    let body_stream = BodyStream::new(req.into_body())
        .filter_map(|result| async move { result.map(|frame| frame.into_data().ok()).transpose() });

    let token = CancellationToken::new();
    let options = IngestOptions::new().cancellation_token(token.clone());
    let mut session = IngestionSession::new(body_stream, &content_type, options);

    // File parts go to temporary files, plain fields are kept in memory. Uploads that take
    // longer than a minute are cancelled, which deletes their temporary files.
    let deadline = Duration::from_secs(60);
    let outcome = match tokio::time::timeout(deadline, session.run(SinkKind::by_file_name)).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => {
            token.cancel();
            session.run(SinkKind::by_file_name).await
        }
    };

    let result = match outcome {
        Ok(result) => result,
        Err(err) => {
            eprintln!("upload failed: {}", err);

            // A cancelled upload gets no response at all.
            let status = err.status_code().ok_or(err)?;
            return Ok(Response::builder()
                .status(status)
                .body(Full::from(status.canonical_reason().unwrap_or_default()))
                .expect("valid response"));
        }
    };

    let mut summary = String::new();
    for part in &result {
        let descriptor = part.descriptor();
        match part.payload() {
            PartPayload::File { path, size } => summary.push_str(&format!(
                "{}: {:?} -> {} ({} bytes)\n",
                descriptor.name(),
                descriptor.file_name(),
                path.display(),
                size
            )),
            PartPayload::Memory(bytes) => summary.push_str(&format!("{}: {:?}\n", descriptor.name(), bytes)),
            other => summary.push_str(&format!("{}: {:?}\n", descriptor.name(), other)),
        }
    }

    // Temporary files are deleted when `result` is dropped, use `result.persist()` to keep them.
    Ok(Response::new(Full::from(summary)))
}

#[tokio::main]
async fn main() {
    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    println!("Server running at: {}", addr);

    let service = hyper::service::service_fn(handle);

    loop {
        let (socket, _remote_addr) = listener.accept().await.unwrap();
        let socket = hyper_util::rt::TokioIo::new(socket);
        tokio::spawn(async move {
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(socket, service)
                .await
            {
                eprintln!("server error: {}", e);
            }
        });
    }
}
