use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
// Import the ingestion types.
use multipart_ingest::{passthrough_channel, IngestOptions, IngestionSession, Multipart, PartEvent, SinkKind};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Generate an `AsyncRead` and the boundary from somewhere e.g. server request body.
    let (reader, boundary) = get_async_reader_from_somewhere().await;

    // Create a `Multipart` instance from that async reader and the boundary.
    let mut multipart = Multipart::with_reader(reader, boundary);

    // Iterate over the parts, use `next_part()` to get the next part.
    while let Some(part) = multipart.next_part().await? {
        println!("Name: {:?}, File Name: {:?}", part.name(), part.file_name());

        // Read part content as text.
        let content = part.text().await?;
        println!("Content: {:?}", content);
    }

    // The same body again, this time forwarded chunk by chunk to a consumer task.
    let (reader, boundary) = get_async_reader_from_somewhere().await;
    let content_type = format!("multipart/form-data; boundary={}", boundary);
    let mut session = IngestionSession::new(ReaderStream::new(reader), &content_type, IngestOptions::new());

    let (tx, mut rx) = passthrough_channel();
    let consumer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                PartEvent::Start(descriptor) => println!("Start: {:?}", descriptor.name()),
                PartEvent::Data(chunk) => println!("Chunk: {:?}", chunk),
                PartEvent::End(descriptor) => println!("End: {} bytes", descriptor.size()),
            }
        }
    });

    let result = session.run(move |_| SinkKind::Passthrough(tx.clone())).await?;
    println!("Parts forwarded: {}", result.len());

    drop(result);
    drop(session);
    consumer.await?;

    Ok(())
}

// Generate an `AsyncRead` and the boundary from somewhere e.g. server request body.
async fn get_async_reader_from_somewhere() -> (impl AsyncRead + Send + Unpin, &'static str) {
    let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"My Field\"\r\n\r\nabcd\r\n--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"File Field\"; filename=\"a-text-file.txt\"\r\nContent-Type: text/plain\r\n\r\nHello world\nHello\r\nWorld\rAgain\r\n--X-BOUNDARY--\r\n";

    (data.as_bytes(), "X-BOUNDARY")
}
