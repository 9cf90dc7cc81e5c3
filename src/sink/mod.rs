//! Destinations for part bodies.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::{self, Either};
use tokio_util::sync::CancellationToken;

use crate::descriptor::PartDescriptor;
use crate::reaper::Reaper;
use crate::Part;

pub use memory::MemorySink;
pub use passthrough::{channel, PartEvent, PassthroughReceiver, PassthroughSender, PassthroughSink};
pub use temp_file::TempFileSink;

mod memory;
mod passthrough;
mod temp_file;

/// Runs `fut` unless `cancellation` fires first. A token that is already cancelled wins.
pub(crate) async fn until_cancelled<F: Future>(
    cancellation: &CancellationToken,
    fut: F,
) -> crate::Result<F::Output> {
    let cancelled = cancellation.cancelled();
    futures_util::pin_mut!(cancelled, fut);

    match future::select(cancelled, fut).await {
        Either::Left(_) => Err(crate::Error::Cancelled),
        Either::Right((output, _)) => Ok(output),
    }
}

/// What a sink produced for one part.
#[derive(Debug)]
pub enum PartPayload {
    /// The body was written to a temporary file owned by the session's reaper.
    File { path: PathBuf, size: u64 },
    /// The body was buffered in memory.
    Memory(Bytes),
    /// The body was forwarded to a pass-through consumer.
    Drained { size: u64 },
    /// The sink failed and the rest of the part was skipped.
    Rejected(crate::Error),
}

impl PartPayload {
    /// The number of body bytes the sink accepted, if it succeeded.
    pub fn size(&self) -> Option<u64> {
        match self {
            PartPayload::File { size, .. } | PartPayload::Drained { size } => Some(*size),
            PartPayload::Memory(bytes) => Some(bytes.len() as u64),
            PartPayload::Rejected(_) => None,
        }
    }
}

/// Chooses where the body of a part goes.
#[derive(Debug, Clone)]
pub enum SinkKind {
    TemporaryFile,
    InMemory,
    Passthrough(PassthroughSender),
}

impl SinkKind {
    /// File uploads go to a temporary file, plain fields are kept in memory.
    pub fn by_file_name(descriptor: &PartDescriptor) -> SinkKind {
        if descriptor.is_file() {
            SinkKind::TemporaryFile
        } else {
            SinkKind::InMemory
        }
    }
}

/// A sink ready to accept one part.
#[derive(Debug)]
pub enum SinkTarget {
    TemporaryFile(TempFileSink),
    InMemory(MemorySink),
    Passthrough(PassthroughSink),
}

impl SinkTarget {
    pub(crate) fn build(
        kind: SinkKind,
        reaper: &Arc<Reaper>,
        memory_limit: u64,
        cancellation: &CancellationToken,
    ) -> SinkTarget {
        match kind {
            SinkKind::TemporaryFile => {
                SinkTarget::TemporaryFile(TempFileSink::new(Arc::clone(reaper), cancellation.clone()))
            },
            SinkKind::InMemory => SinkTarget::InMemory(MemorySink::new(memory_limit)),
            SinkKind::Passthrough(sender) => {
                SinkTarget::Passthrough(PassthroughSink::new(sender, cancellation.clone()))
            }
        }
    }

    /// Consumes the body of `part` until its closing delimiter.
    pub async fn accept(&mut self, part: &mut Part<'_>) -> crate::Result<PartPayload> {
        match self {
            SinkTarget::TemporaryFile(sink) => sink.accept(part).await,
            SinkTarget::InMemory(sink) => sink.accept(part).await,
            SinkTarget::Passthrough(sink) => sink.accept(part).await,
        }
    }

    /// Releases the sink. Closing twice is a no-op.
    pub fn close(&mut self) {
        match self {
            SinkTarget::TemporaryFile(sink) => sink.close(),
            SinkTarget::InMemory(sink) => sink.close(),
            SinkTarget::Passthrough(sink) => sink.close(),
        }
    }

    /// Whether a failure of this sink must abort the whole session.
    pub fn is_mandatory(&self) -> bool {
        matches!(self, SinkTarget::TemporaryFile(_))
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            SinkTarget::TemporaryFile(_) => "temporary file",
            SinkTarget::InMemory(_) => "in-memory",
            SinkTarget::Passthrough(_) => "pass-through",
        }
    }
}
