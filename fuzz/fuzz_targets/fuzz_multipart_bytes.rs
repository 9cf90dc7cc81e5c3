#![no_main]

use std::convert::Infallible;

use futures_util::stream::iter;
use libfuzzer_sys::fuzz_target;
use multipart_ingest::bytes::Bytes;
use multipart_ingest::{Constraints, Multipart};
use tokio::runtime;

fuzz_target!(|data: &[u8]| {
    // The first byte picks the chunk size so that delimiters get split at every offset.
    let (chunk_size, body) = match data.split_first() {
        Some((size, body)) => (usize::from(*size).max(1), body),
        None => return,
    };

    let chunks: Vec<Result<Bytes, Infallible>> = body.chunks(chunk_size).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
    let constraints = Constraints::new().max_header_bytes(1024);
    let mut multipart = Multipart::with_constraints(iter(chunks), "X-BOUNDARY", constraints);

    let rt = runtime::Builder::new_current_thread().build().expect("runtime");
    rt.block_on(async {
        loop {
            match multipart.next_part().await {
                Ok(Some(mut part)) => {
                    let mut delivered = 0u64;
                    while let Ok(Some(chunk)) = part.chunk().await {
                        delivered += chunk.len() as u64;
                    }
                    assert_eq!(delivered, part.size());
                    assert!(delivered <= body.len() as u64);
                }
                Err(_) | Ok(None) => break,
            }
        }
    })
});
