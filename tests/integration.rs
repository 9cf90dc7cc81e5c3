use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future;
use futures_util::stream::{self, Stream, StreamExt};
use multipart_ingest::{
    passthrough_channel, BodyViolation, Constraints, Error, FailurePolicy, IngestOptions, IngestionSession, Multipart,
    PartDescriptor, PartEvent, PartPayload, PartStatus, SessionState, SinkKind, SizeLimit,
};
use tokio_util::sync::CancellationToken;

const XYZ: &str = "multipart/form-data; boundary=XYZ";

fn chunked(data: &str, size: usize) -> impl Stream<Item = multipart_ingest::Result<Bytes>> + Send + 'static {
    let chunks: Vec<multipart_ingest::Result<Bytes>> = data
        .as_bytes()
        .chunks(size)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    stream::iter(chunks)
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

fn title_and_file() -> String {
    [
        "--XYZ\r\n",
        "Content-Disposition: form-data; name=\"title\"\r\n\r\n",
        "hello\r\n",
        "--XYZ\r\n",
        "Content-Disposition: form-data; name=\"data\"; filename=\"data.txt\"\r\n",
        "Content-Type: text/plain\r\n\r\n",
        "abcde\r\n",
        "--XYZ--\r\n",
    ]
    .concat()
}

fn three_files() -> Vec<String> {
    ["a", "b", "c"]
        .iter()
        .map(|name| {
            format!(
                "--XYZ\r\nContent-Disposition: form-data; name=\"{0}\"; filename=\"{0}.bin\"\r\n\r\n{1}\r\n",
                name,
                name.repeat(64)
            )
        })
        .chain(std::iter::once("--XYZ--\r\n".to_owned()))
        .collect()
}

#[tokio::test]
async fn test_title_and_file_byte_by_byte() {
    let dir = tempfile::tempdir().unwrap();
    let options = IngestOptions::new().temp_dir(dir.path());
    let mut session = IngestionSession::new(chunked(&title_and_file(), 1), XYZ, options);

    let result = session.run(SinkKind::by_file_name).await.unwrap();
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(result.len(), 2);

    let title = result.get("title").unwrap();
    assert_eq!(title.descriptor().index(), 0);
    assert_eq!(title.descriptor().file_name(), None);
    assert_eq!(title.descriptor().content_type(), &mime::TEXT_PLAIN);
    assert_eq!(title.text(), Some("hello"));

    let data = result.get("data").unwrap();
    assert_eq!(data.descriptor().index(), 1);
    assert_eq!(data.descriptor().file_name(), Some("data.txt"));
    assert_eq!(data.descriptor().size(), 5);
    assert_eq!(data.descriptor().status(), PartStatus::Complete);
    assert_eq!(std::fs::read(data.file().unwrap()).unwrap(), b"abcde");

    drop(result);
    drop(session);
    assert_eq!(files_in(dir.path()), 0);
}

#[tokio::test]
async fn test_wire_order_in_odd_chunks() {
    let names = ["zeta", "alpha", "mid", "alpha", "omega"];
    let mut data = String::new();
    for (i, name) in names.iter().enumerate() {
        data.push_str(&format!(
            "--XYZ\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\nvalue {}\r\n",
            name, i
        ));
    }
    data.push_str("--XYZ--\r\n");

    for size in &[1, 3, 7, 13, 4096] {
        let mut session = IngestionSession::new(chunked(&data, *size), XYZ, IngestOptions::new());
        let result = session.run(SinkKind::by_file_name).await.unwrap();

        let seen: Vec<&str> = result.descriptors().map(PartDescriptor::name).collect();
        assert_eq!(seen, names);

        let alphas: Vec<&str> = result.get_all("alpha").filter_map(|part| part.text()).collect();
        assert_eq!(alphas, vec!["value 1", "value 3"]);
    }
}

#[tokio::test]
async fn test_temp_file_round_trip_binary() {
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

    let mut body = b"--XYZ\r\nContent-Disposition: form-data; name=\"blob\"; filename=\"blob.bin\"\r\n\r\n".to_vec();
    body.extend_from_slice(&content);
    body.extend_from_slice(b"\r\n--XYZ--\r\n");

    let chunks: Vec<Result<Vec<u8>, std::io::Error>> = body.chunks(333).map(|c| Ok(c.to_vec())).collect();
    let options = IngestOptions::new().temp_dir(dir.path());
    let mut session = IngestionSession::new(stream::iter(chunks), XYZ, options);

    let result = session.run(SinkKind::by_file_name).await.unwrap();
    match result.get("blob").unwrap().payload() {
        PartPayload::File { path, size } => {
            assert_eq!(*size, content.len() as u64);
            assert_eq!(std::fs::read(path).unwrap(), content);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    assert_eq!(result.cleanup(), 1);
    assert_eq!(result.cleanup(), 0);
    assert_eq!(files_in(dir.path()), 0);
}

#[tokio::test]
async fn test_boundary_text_inside_content() {
    let data = "--XYZ\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\n\
                a--XYZ b\n--XYZ c\r--XYZ d\r\n--XYZW e\r\n--XYZ--\r\n";

    for size in &[1, 5, 64] {
        let mut session = IngestionSession::new(chunked(data, *size), XYZ, IngestOptions::new());
        let result = session.run(SinkKind::by_file_name).await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result.text("note"), Some("a--XYZ b\n--XYZ c\r--XYZ d\r\n--XYZW e"));
    }
}

#[tokio::test]
async fn test_missing_close_delimiter() {
    let truncated = title_and_file().replace("--XYZ--\r\n", "");

    for size in &[1, 4, 1024] {
        let dir = tempfile::tempdir().unwrap();
        let options = IngestOptions::new().temp_dir(dir.path());
        let mut session = IngestionSession::new(chunked(&truncated, *size), XYZ, options);

        let err = session.run(SinkKind::by_file_name).await.unwrap_err();
        assert!(matches!(err, Error::MalformedBody(_)), "unexpected error {:?}", err);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(files_in(dir.path()), 0);
    }
}

#[tokio::test]
async fn test_no_boundary_at_all() {
    let mut session = IngestionSession::new(chunked("just some text", 3), XYZ, IngestOptions::new());

    assert_eq!(
        session.run(SinkKind::by_file_name).await.unwrap_err(),
        Error::MalformedBody(BodyViolation::NoBoundary)
    );
}

#[tokio::test]
async fn test_preamble_and_epilogue_are_ignored() {
    let data = format!("This is the preamble.\r\n{}trailing epilogue --XYZ--", title_and_file());
    let mut session = IngestionSession::new(chunked(&data, 9), XYZ, IngestOptions::new());

    let result = session.run(|_: &PartDescriptor| SinkKind::InMemory).await.unwrap();
    assert_eq!(result.text("title"), Some("hello"));
    assert_eq!(result.text("data"), Some("abcde"));
}

#[tokio::test]
async fn test_missing_name_is_malformed_headers() {
    let data = "--XYZ\r\nContent-Disposition: form-data; filename=\"a.txt\"\r\n\r\nabc\r\n--XYZ--\r\n";
    let mut session = IngestionSession::new(chunked(data, 8), XYZ, IngestOptions::new());

    let err = session.run(SinkKind::by_file_name).await.unwrap_err();
    assert!(matches!(err, Error::MalformedHeaders { part_index: 0, .. }));
    assert_eq!(err.status_code(), Some(http::StatusCode::BAD_REQUEST));
}

#[tokio::test]
async fn test_unsupported_media_type() {
    let mut session = IngestionSession::new(chunked(&title_and_file(), 8), "application/json", IngestOptions::new());

    let err = session.run(SinkKind::by_file_name).await.unwrap_err();
    assert_eq!(err.status_code(), Some(http::StatusCode::UNSUPPORTED_MEDIA_TYPE));
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_in_memory_limit() {
    let data = "--XYZ\r\nContent-Disposition: form-data; name=\"n\"\r\n\r\n123456\r\n--XYZ--\r\n";

    let mut session = IngestionSession::new(chunked(data, 2), XYZ, IngestOptions::new().memory_limit(6));
    let result = session.run(|_: &PartDescriptor| SinkKind::InMemory).await.unwrap();
    assert_eq!(result.text("n"), Some("123456"));

    let mut session = IngestionSession::new(chunked(data, 2), XYZ, IngestOptions::new().memory_limit(5));
    let err = session.run(|_: &PartDescriptor| SinkKind::InMemory).await.unwrap_err();
    assert_eq!(
        err,
        Error::PartTooLarge {
            field_name: Some("n".to_owned()),
            limit: 5
        }
    );
}

#[tokio::test]
async fn test_skip_part_keeps_files_of_other_parts() {
    let dir = tempfile::tempdir().unwrap();
    let data = [
        "--XYZ\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"doc.txt\"\r\n\r\ndocument\r\n",
        "--XYZ\r\nContent-Disposition: form-data; name=\"comment\"\r\n\r\nfar too long\r\n",
        "--XYZ--\r\n",
    ]
    .concat();

    let options = IngestOptions::new()
        .temp_dir(dir.path())
        .memory_limit(4)
        .failure_policy(FailurePolicy::SkipPart);
    let mut session = IngestionSession::new(chunked(&data, 5), XYZ, options);

    let result = session.run(SinkKind::by_file_name).await.unwrap();
    assert_eq!(session.state(), SessionState::Completed);
    assert!(matches!(result.get("comment").unwrap().payload(), PartPayload::Rejected(_)));
    assert_eq!(std::fs::read_to_string(result.file("doc").unwrap()).unwrap(), "document");
    assert_eq!(files_in(dir.path()), 1);
}

#[tokio::test]
async fn test_cancel_between_parts() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let options = IngestOptions::new()
        .temp_dir(dir.path())
        .cancellation_token(token.clone());
    let mut session = IngestionSession::new(chunked(&three_files().concat(), 16), XYZ, options);

    let first = session.next_part(SinkKind::by_file_name).await.unwrap().unwrap();
    assert_eq!(first.name(), "a");
    assert_eq!(files_in(dir.path()), 1);

    token.cancel();

    assert_eq!(
        session.next_part(SinkKind::by_file_name).await.unwrap_err(),
        Error::Cancelled
    );
    assert_eq!(session.state(), SessionState::Cancelled);
    assert_eq!(files_in(dir.path()), 0);
    assert!(session.next_part(SinkKind::by_file_name).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_while_streaming() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let trigger = token.clone();

    // One chunk per part; the token fires as the third part arrives.
    let body = stream::iter(three_files().into_iter().enumerate()).map(move |(i, chunk)| {
        if i == 2 {
            trigger.cancel();
        }
        Result::<String, std::io::Error>::Ok(chunk)
    });

    let options = IngestOptions::new()
        .temp_dir(dir.path())
        .cancellation_token(token);
    let mut session = IngestionSession::new(body, XYZ, options);

    assert_eq!(session.run(SinkKind::by_file_name).await.unwrap_err(), Error::Cancelled);
    assert_eq!(session.state(), SessionState::Cancelled);
    assert_eq!(session.reaper().live(), 0);
    assert_eq!(files_in(dir.path()), 0);
}

#[tokio::test]
async fn test_passthrough_backpressure() {
    const CHUNKS: usize = 20;

    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulled);

    let mut chunks = vec!["--XYZ\r\nContent-Disposition: form-data; name=\"stream\"\r\n\r\n".to_owned()];
    chunks.extend((0..CHUNKS).map(|i| format!("{:0100}", i)));
    chunks.push("\r\n--XYZ--\r\n".to_owned());
    let total = chunks.len();

    let body = stream::iter(chunks).map(move |chunk| {
        counter.fetch_add(1, Ordering::SeqCst);
        Result::<String, std::io::Error>::Ok(chunk)
    });

    let (tx, mut rx) = passthrough_channel();
    let mut session = IngestionSession::new(body, XYZ, IngestOptions::new());

    let producer = session.run(move |_: &PartDescriptor| SinkKind::Passthrough(tx.clone()));
    let consumer = async {
        assert!(matches!(rx.recv().await, Some(PartEvent::Start(_))));
        assert!(matches!(rx.recv().await, Some(PartEvent::Data(_))));

        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        let pulled_while_stalled = pulled.load(Ordering::SeqCst);

        let mut received = 0;
        let mut ended = false;
        while let Some(event) = rx.recv().await {
            match event {
                PartEvent::Data(bytes) => received += bytes.len(),
                PartEvent::End(descriptor) => {
                    assert_eq!(descriptor.size(), (CHUNKS * 100) as u64);
                    ended = true;
                    break;
                }
                PartEvent::Start(_) => unreachable!(),
            }
        }

        (pulled_while_stalled, received, ended)
    };

    let (result, (pulled_while_stalled, _, ended)) = future::join(producer, consumer).await;
    let result = result.unwrap();

    assert!(ended);
    assert!(pulled_while_stalled < total / 2, "pulled {} of {}", pulled_while_stalled, total);
    assert!(matches!(
        result.get("stream").unwrap().payload(),
        PartPayload::Drained { size } if *size == (CHUNKS * 100) as u64
    ));
}

#[tokio::test]
async fn test_constraints() {
    let data = [
        "--XYZ\r\nContent-Disposition: form-data; name=\"short\"\r\n\r\nabc\r\n",
        "--XYZ\r\nContent-Disposition: form-data; name=\"long\"\r\n\r\nabcdefghij\r\n",
        "--XYZ--\r\n",
    ]
    .concat();

    let constraints = Constraints::new().size_limit(SizeLimit::new().per_field(100).for_field("long", 4));
    let mut session = IngestionSession::new(
        chunked(&data, 3),
        XYZ,
        IngestOptions::new().constraints(constraints),
    );
    let err = session.run(SinkKind::by_file_name).await.unwrap_err();
    assert!(matches!(err, Error::PartTooLarge { limit: 4, .. }));

    let constraints = Constraints::new().allowed_fields(vec!["short"]);
    let mut session = IngestionSession::new(
        chunked(&data, 3),
        XYZ,
        IngestOptions::new().constraints(constraints),
    );
    let err = session.run(SinkKind::by_file_name).await.unwrap_err();
    assert_eq!(
        err,
        Error::UnknownField {
            field_name: "long".to_owned()
        }
    );

    let constraints = Constraints::new().size_limit(SizeLimit::new().whole_stream(20));
    let mut session = IngestionSession::new(
        chunked(&data, 3),
        XYZ,
        IngestOptions::new().constraints(constraints),
    );
    let err = session.run(SinkKind::by_file_name).await.unwrap_err();
    assert_eq!(err, Error::BodyTooLarge { limit: 20 });
}

#[tokio::test]
async fn test_skipped_part_ending_in_the_same_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let data = [
        "--XYZ\r\nContent-Disposition: form-data; name=\"long\"; filename=\"long.bin\"\r\n\r\nabcdefghij\r\n",
        "--XYZ\r\nContent-Disposition: form-data; name=\"short\"; filename=\"short.bin\"\r\n\r\nabc\r\n",
        "--XYZ--\r\n",
    ]
    .concat();

    let options = IngestOptions::new()
        .temp_dir(dir.path())
        .failure_policy(FailurePolicy::SkipPart)
        .constraints(Constraints::new().size_limit(SizeLimit::new().for_field("long", 4)));
    let mut session = IngestionSession::new(chunked(&data, data.len()), XYZ, options);

    let result = session.run(SinkKind::by_file_name).await.unwrap();
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(result.len(), 2);
    assert!(matches!(
        result.get("long").unwrap().payload(),
        PartPayload::Rejected(Error::PartTooLarge { limit: 4, .. })
    ));

    let short = result.file("short").unwrap();
    assert_eq!(std::fs::read(short).unwrap(), b"abc");
    assert_eq!(files_in(dir.path()), 1);
}

#[tokio::test]
async fn test_multipart_skips_unread_parts() {
    let mut m = Multipart::new(chunked(&title_and_file(), 2), "XYZ");

    let first = m.next_part().await.unwrap().unwrap();
    assert_eq!(first.name(), "title");
    drop(first);

    let (idx, second) = m.next_part_with_idx().await.unwrap().unwrap();
    assert_eq!(idx, 1);
    assert_eq!(second.file_name(), Some("data.txt"));
    assert_eq!(second.content_type(), &mime::TEXT_PLAIN);
    assert_eq!(second.bytes().await.unwrap(), "abcde");

    assert!(m.next_part().await.unwrap().is_none());
    assert!(m.next_part().await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_multipart() {
    let mut m = Multipart::new(chunked("--XYZ--\r\n", 1), "XYZ");

    assert!(m.next_part().await.unwrap().is_none());
    assert!(m.next_part().await.unwrap().is_none());
}

#[tokio::test]
async fn test_transport_padding_and_extended_file_name() {
    let data = "--XYZ \t\r\nContent-Disposition: form-data; name=\"f\"; filename=\"fallback.txt\"; filename*=UTF-8''na%C3%AFve.txt\r\n\r\nx\r\n--XYZ--\r\n";
    let mut m = Multipart::new(chunked(data, 6), "XYZ");

    let part = m.next_part().await.unwrap().unwrap();
    assert_eq!(part.file_name(), Some("naïve.txt"));
    assert_eq!(part.content_type(), &mime::APPLICATION_OCTET_STREAM);
    assert_eq!(part.text().await.unwrap(), "x");
}
