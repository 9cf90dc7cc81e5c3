//! Reads a part into memory.

use bytes::BytesMut;

use super::PartPayload;
use crate::Part;

/// Buffers a part in memory, up to `limit` bytes.
#[derive(Debug)]
pub struct MemorySink {
    limit: u64,
    buf: BytesMut,
    closed: bool,
}

impl MemorySink {
    pub fn new(limit: u64) -> Self {
        MemorySink {
            limit,
            buf: BytesMut::new(),
            closed: false,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes currently held by the sink.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Accumulates the part body. Exceeding the limit discards everything read so far.
    pub async fn accept(&mut self, part: &mut Part<'_>) -> crate::Result<PartPayload> {
        self.buf.clear();

        while let Some(chunk) = part.chunk().await.map_err(|err| {
            self.buf.clear();
            err
        })? {
            if self.buf.len() as u64 + chunk.len() as u64 > self.limit {
                self.buf = BytesMut::new();
                return Err(crate::Error::PartTooLarge {
                    field_name: Some(part.name().to_owned()),
                    limit: self.limit,
                });
            }

            self.buf.extend_from_slice(&chunk);
        }

        log::debug!("part '{}' buffered in memory ({} bytes)", part.name(), self.buf.len());

        Ok(PartPayload::Memory(self.buf.split().freeze()))
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.buf = BytesMut::new();
        }
    }
}
