//! Tracks the temporary files of one session and deletes the ones nobody claimed.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use spin::mutex::spin::SpinMutex as Mutex;

use crate::constants;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tracked {
    Live,
    Claimed,
    Deleted,
}

/// Owns the temporary files created during one ingestion session.
///
/// Every file is deleted at most once: explicitly via [`Reaper::remove`], in bulk via
/// [`Reaper::reap`], or when the reaper is dropped. Files handed over with [`Reaper::claim`]
/// are left alone.
#[derive(Debug)]
pub struct Reaper {
    session_id: u64,
    dir: PathBuf,
    prefix: String,
    files: Mutex<Vec<(PathBuf, Tracked)>>,
}

impl Reaper {
    /// Creates a reaper placing files in `dir`, their names starting with `prefix`.
    pub fn new<P: Into<PathBuf>, S: Into<String>>(dir: P, prefix: S) -> Self {
        Reaper {
            session_id: rand::random(),
            dir: dir.into(),
            prefix: prefix.into(),
            files: Mutex::new(Vec::new()),
        }
    }

    /// Random identifier embedded in every file name of this session.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// The directory temporary files are created in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generates a collision-resistant name: `<prefix><session id>-<random suffix>.upload`.
    pub fn generate_name(&self) -> String {
        format!(
            "{}{:016x}-{:016x}{}",
            self.prefix,
            self.session_id,
            rand::random::<u64>(),
            constants::TEMP_FILE_SUFFIX
        )
    }

    /// Creates and registers a new, empty temporary file.
    ///
    /// Names are never reused: a name that already exists on disk is replaced by a fresh one.
    pub fn create_file(&self) -> io::Result<(PathBuf, File)> {
        let mut last_err = None;

        for _ in 0..constants::TEMP_FILE_CREATE_ATTEMPTS {
            let path = self.dir.join(self.generate_name());

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    log::debug!("created temporary file {}", path.display());
                    self.register(path.clone());
                    return Ok((path, file));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "no unique file name")))
    }

    /// Starts tracking a file created elsewhere.
    pub fn register<P: Into<PathBuf>>(&self, path: P) {
        self.files.lock().push((path.into(), Tracked::Live));
    }

    /// Hands a live file over to the caller; it will not be deleted by this reaper.
    ///
    /// Returns `false` if the file is unknown, already claimed or already deleted.
    pub fn claim(&self, path: &Path) -> bool {
        self.transition(path, Tracked::Claimed)
    }

    /// Deletes one live file now.
    ///
    /// Returns `false`, without touching the filesystem, when the file is unknown, claimed or
    /// already deleted.
    pub fn remove(&self, path: &Path) -> bool {
        if !self.transition(path, Tracked::Deleted) {
            return false;
        }

        delete(path);
        true
    }

    /// Deletes every live file, returning how many were scheduled for deletion.
    pub fn reap(&self) -> usize {
        let doomed: Vec<PathBuf> = {
            let mut files = self.files.lock();
            files
                .iter_mut()
                .filter(|(_, tracked)| *tracked == Tracked::Live)
                .map(|(path, tracked)| {
                    *tracked = Tracked::Deleted;
                    path.clone()
                })
                .collect()
        };

        if !doomed.is_empty() {
            log::debug!("reaping {} temporary file(s) of session {:016x}", doomed.len(), self.session_id);
        }

        for path in &doomed {
            delete(path);
        }

        doomed.len()
    }

    /// Number of files still waiting for deletion.
    pub fn live(&self) -> usize {
        self.files
            .lock()
            .iter()
            .filter(|(_, tracked)| *tracked == Tracked::Live)
            .count()
    }

    fn transition(&self, path: &Path, to: Tracked) -> bool {
        let mut files = self.files.lock();

        match files.iter_mut().find(|(tracked_path, _)| tracked_path == path) {
            Some((_, tracked)) if *tracked == Tracked::Live => {
                *tracked = to;
                true
            }
            _ => false,
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.reap();
    }
}

fn delete(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::trace!("deleted temporary file {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            log::debug!("temporary file {} already gone", path.display())
        }
        Err(err) => log::warn!("failed to delete temporary file {}: {}", path.display(), err),
    }
}
