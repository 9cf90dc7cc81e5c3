//! Writes a part to a temporary file on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::{until_cancelled, PartPayload};
use crate::reaper::Reaper;
use crate::Part;

/// Streams a part into a uniquely named file registered with the session's [`Reaper`].
#[derive(Debug)]
pub struct TempFileSink {
    reaper: Arc<Reaper>,
    cancellation: CancellationToken,
    path: Option<PathBuf>,
    file: Option<tokio::fs::File>,
}

impl TempFileSink {
    /// Disk writes give up with [`Error::Cancelled`](crate::Error::Cancelled) once
    /// `cancellation` fires.
    pub fn new(reaper: Arc<Reaper>, cancellation: CancellationToken) -> Self {
        TempFileSink {
            reaper,
            cancellation,
            path: None,
            file: None,
        }
    }

    /// The file written by this sink, until it is cleaned up.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn accept(&mut self, part: &mut Part<'_>) -> crate::Result<PartPayload> {
        let (path, file) = self
            .reaper
            .create_file()
            .map_err(|err| {
                crate::Error::write_failure(Some(part.name()), Some(self.reaper.dir().to_owned()), err)
            })?;

        self.path = Some(path.clone());
        self.file = Some(tokio::fs::File::from_std(file));

        match self.write_part(part).await {
            Ok(size) => {
                self.close();
                log::debug!("part '{}' stored in {} ({} bytes)", part.name(), path.display(), size);
                Ok(PartPayload::File { path, size })
            }
            Err(err) => {
                self.close();
                self.cleanup();
                Err(err)
            }
        }
    }

    async fn write_part(&mut self, part: &mut Part<'_>) -> crate::Result<u64> {
        let mut size = 0;

        let (path, file) = match (self.path.as_ref(), self.file.as_mut()) {
            (Some(path), Some(file)) => (path, file),
            _ => return Ok(size),
        };

        while let Some(chunk) = part.chunk().await? {
            until_cancelled(&self.cancellation, file.write_all(&chunk))
                .await?
                .map_err(|err| crate::Error::write_failure(Some(part.name()), Some(path.clone()), err))?;
            size += chunk.len() as u64;
        }

        until_cancelled(&self.cancellation, file.flush())
            .await?
            .map_err(|err| crate::Error::write_failure(Some(part.name()), Some(path.clone()), err))?;

        Ok(size)
    }

    /// Drops the file handle. The file itself stays on disk.
    pub fn close(&mut self) {
        self.file.take();
    }

    /// Deletes the file written by this sink.
    ///
    /// Returns `true` only for the call that actually removed it.
    pub fn cleanup(&mut self) -> bool {
        self.close();

        match self.path.take() {
            Some(path) => self.reaper.remove(&path),
            None => false,
        }
    }
}
