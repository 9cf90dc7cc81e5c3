use std::fmt::{self, Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::constants;
use crate::constraints::Constraints;
use crate::descriptor::PartDescriptor;
use crate::reaper::Reaper;
use crate::sink::{PartPayload, SinkKind, SinkTarget};
use crate::Multipart;

/// Where an [`IngestionSession`] stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Scanning,
    FramingPart,
    DrainingPart,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// Terminal states are never left.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What happens when an optional sink fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The whole session fails.
    AbortSession,
    /// The part is recorded as [`PartPayload::Rejected`] and the session carries on.
    ///
    /// Temporary file sinks always abort.
    SkipPart,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::AbortSession
    }
}

/// Settings of an [`IngestionSession`].
///
/// # Examples
///
/// ```
/// use multipart_ingest::{Constraints, FailurePolicy, IngestOptions, SizeLimit};
///
/// let options = IngestOptions::new()
///     .temp_dir(std::env::temp_dir())
///     .temp_prefix("avatar-")
///     .memory_limit(64 * 1024)
///     .failure_policy(FailurePolicy::SkipPart)
///     .constraints(Constraints::new().size_limit(SizeLimit::new().per_field(10 * 1024 * 1024)));
/// ```
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub(crate) temp_dir: PathBuf,
    pub(crate) temp_prefix: String,
    pub(crate) memory_limit: u64,
    pub(crate) failure_policy: FailurePolicy,
    pub(crate) cancellation_token: Option<CancellationToken>,
    pub(crate) constraints: Constraints,
}

impl IngestOptions {
    /// Creates the default options: system temp directory, `upload-` prefix, 2 MiB in-memory
    /// limit and [`FailurePolicy::AbortSession`].
    pub fn new() -> IngestOptions {
        IngestOptions::default()
    }

    /// Directory receiving temporary files.
    pub fn temp_dir<P: Into<PathBuf>>(mut self, dir: P) -> IngestOptions {
        self.temp_dir = dir.into();
        self
    }

    /// Prefix of every temporary file name.
    pub fn temp_prefix<S: Into<String>>(mut self, prefix: S) -> IngestOptions {
        self.temp_prefix = prefix.into();
        self
    }

    /// Maximum size of a part buffered by an in-memory sink.
    pub fn memory_limit(mut self, limit: u64) -> IngestOptions {
        self.memory_limit = limit;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> IngestOptions {
        self.failure_policy = policy;
        self
    }

    /// Token whose cancellation moves the session to [`SessionState::Cancelled`].
    pub fn cancellation_token(mut self, token: CancellationToken) -> IngestOptions {
        self.cancellation_token = Some(token);
        self
    }

    pub fn constraints(mut self, constraints: Constraints) -> IngestOptions {
        self.constraints = constraints;
        self
    }
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptions {
            temp_dir: std::env::temp_dir(),
            temp_prefix: constants::DEFAULT_TEMP_PREFIX.to_owned(),
            memory_limit: constants::DEFAULT_MEMORY_LIMIT,
            failure_policy: FailurePolicy::default(),
            cancellation_token: None,
            constraints: Constraints::default(),
        }
    }
}

/// One part as stored by its sink.
#[derive(Debug)]
pub struct IngestedPart {
    descriptor: PartDescriptor,
    payload: PartPayload,
}

impl IngestedPart {
    pub fn descriptor(&self) -> &PartDescriptor {
        &self.descriptor
    }

    pub fn payload(&self) -> &PartPayload {
        &self.payload
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// The buffered body, for parts kept in memory.
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.payload {
            PartPayload::Memory(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The buffered body as UTF-8 text, for parts kept in memory.
    pub fn text(&self) -> Option<&str> {
        self.bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// The temporary file, for parts written to disk.
    pub fn file(&self) -> Option<&Path> {
        match &self.payload {
            PartPayload::File { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// The parts of a completed session, in wire order.
///
/// Temporary files that were not claimed are deleted when the last of this value and its
/// session is dropped, or on [`IngestionResult::cleanup`].
#[derive(Debug)]
pub struct IngestionResult {
    parts: Vec<IngestedPart>,
    reaper: Arc<Reaper>,
}

impl IngestionResult {
    pub fn parts(&self) -> &[IngestedPart] {
        &self.parts
    }

    pub fn iter(&self) -> std::slice::Iter<'_, IngestedPart> {
        self.parts.iter()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The descriptors of all parts, in wire order.
    pub fn descriptors(&self) -> impl Iterator<Item = &PartDescriptor> {
        self.parts.iter().map(IngestedPart::descriptor)
    }

    /// The first part named `name`.
    pub fn get(&self, name: &str) -> Option<&IngestedPart> {
        self.parts.iter().find(|part| part.name() == name)
    }

    /// Every part named `name`.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a IngestedPart> + 'a {
        self.parts.iter().filter(move |part| part.name() == name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(IngestedPart::text)
    }

    pub fn bytes(&self, name: &str) -> Option<&Bytes> {
        self.get(name).and_then(IngestedPart::bytes)
    }

    pub fn file(&self, name: &str) -> Option<&Path> {
        self.get(name).and_then(IngestedPart::file)
    }

    /// Takes ownership of the temporary file of the part named `name`; it will no longer be
    /// deleted automatically.
    pub fn claim(&self, name: &str) -> Option<PathBuf> {
        let path = self.file(name)?;

        if self.reaper.claim(path) {
            Some(path.to_owned())
        } else {
            None
        }
    }

    /// Moves the temporary file of the part named `name` to `dest`.
    ///
    /// Falls back to copying when a rename is impossible, e.g. across filesystems.
    pub async fn persist<P: AsRef<Path>>(&self, name: &str, dest: P) -> io::Result<()> {
        let dest = dest.as_ref();
        let path = self.file(name).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no file part named '{}'", name))
        })?;

        match tokio::fs::rename(path, dest).await {
            Ok(()) => {
                self.reaper.claim(path);
            }
            Err(err) => {
                log::debug!("rename of {} failed ({}), copying instead", path.display(), err);
                tokio::fs::copy(path, dest).await?;
                self.reaper.remove(path);
            }
        }

        log::debug!("part '{}' persisted to {}", name, dest.display());
        Ok(())
    }

    /// Deletes every unclaimed temporary file now, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        self.reaper.reap()
    }
}

impl<'a> IntoIterator for &'a IngestionResult {
    type Item = &'a IngestedPart;
    type IntoIter = std::slice::Iter<'a, IngestedPart>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.iter()
    }
}

/// Drives one multipart request from its `Content-Type` to the stored parts.
///
/// The session walks `Initializing -> Scanning -> FramingPart -> DrainingPart`, back to
/// `Scanning` for every further part, until it ends in `Completed`, `Failed` or `Cancelled`.
/// Temporary files of a failed or cancelled session are deleted before the error is returned.
///
/// # Examples
///
/// ```
/// use multipart_ingest::{IngestionSession, IngestOptions, SinkKind};
/// use bytes::Bytes;
/// use std::convert::Infallible;
/// use futures_util::stream::once;
///
/// # async fn run() {
/// let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello\r\n--X-BOUNDARY--\r\n";
/// let stream = once(async move { Result::<Bytes, Infallible>::Ok(Bytes::from(data)) });
///
/// let mut session = IngestionSession::new(stream, "multipart/form-data; boundary=X-BOUNDARY", IngestOptions::new());
/// let result = session.run(SinkKind::by_file_name).await.unwrap();
///
/// assert_eq!(result.text("title"), Some("hello"));
/// # }
/// # tokio::runtime::Runtime::new().unwrap().block_on(run());
/// ```
pub struct IngestionSession<'r> {
    state: SessionState,
    multipart: Option<Multipart<'r>>,
    rejected: Option<crate::Error>,
    boundary: Option<String>,
    descriptors: Vec<PartDescriptor>,
    reaper: Arc<Reaper>,
    cancellation: CancellationToken,
    memory_limit: u64,
    failure_policy: FailurePolicy,
}

impl<'r> IngestionSession<'r> {
    /// Creates a session for a body `stream` sent with the given `Content-Type`.
    ///
    /// An unsupported content type is reported by the first call to [`run`](Self::run) or
    /// [`next_part`](Self::next_part).
    pub fn new<S, O, E>(stream: S, content_type: &str, options: IngestOptions) -> Self
    where
        S: Stream<Item = Result<O, E>> + Send + 'r,
        O: Into<Bytes> + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'r,
    {
        let IngestOptions {
            temp_dir,
            temp_prefix,
            memory_limit,
            failure_policy,
            cancellation_token,
            constraints,
        } = options;

        let cancellation = cancellation_token.unwrap_or_default();

        let (multipart, rejected, boundary) = match crate::parse_boundary(content_type) {
            Ok(boundary) => {
                let multipart = Multipart::with_constraints(stream, boundary.clone(), constraints)
                    .cancel_on(cancellation.clone());
                (Some(multipart), None, Some(boundary))
            }
            Err(err) => (None, Some(err), None),
        };

        IngestionSession {
            state: SessionState::Initializing,
            multipart,
            rejected,
            boundary,
            descriptors: Vec::new(),
            reaper: Arc::new(Reaper::new(temp_dir, temp_prefix)),
            cancellation,
            memory_limit,
            failure_policy,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The boundary taken from the `Content-Type`, if it was valid.
    pub fn boundary(&self) -> Option<&str> {
        self.boundary.as_deref()
    }

    /// The token cancelling this session.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The descriptors of every part seen so far, including failed ones.
    pub fn descriptors(&self) -> &[PartDescriptor] {
        &self.descriptors
    }

    /// The reaper owning this session's temporary files.
    pub fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }

    /// Ingests every remaining part, asking `selector` where each one goes.
    pub async fn run<F>(&mut self, mut selector: F) -> crate::Result<IngestionResult>
    where
        F: FnMut(&PartDescriptor) -> SinkKind,
    {
        let mut parts = Vec::new();

        while let Some(part) = self.next_part(&mut selector).await? {
            parts.push(part);
        }

        Ok(IngestionResult {
            parts,
            reaper: Arc::clone(&self.reaper),
        })
    }

    /// Ingests the next part into the sink chosen by `selector`.
    ///
    /// Returns `Ok(None)` once the close delimiter was read, and on every call after the
    /// session reached a terminal state.
    pub async fn next_part<F>(&mut self, selector: F) -> crate::Result<Option<IngestedPart>>
    where
        F: FnOnce(&PartDescriptor) -> SinkKind,
    {
        if self.state.is_terminal() {
            return Ok(None);
        }

        if let Some(err) = self.rejected.take() {
            return Err(self.fail(err));
        }

        if self.cancellation.is_cancelled() {
            return Err(self.fail(crate::Error::Cancelled));
        }

        self.transition(SessionState::Scanning);

        let next = match self.multipart.as_mut() {
            Some(multipart) => multipart.next_part().await,
            None => Ok(None),
        };

        let mut part = match next {
            Ok(Some(part)) => part,
            Ok(None) => {
                self.transition(SessionState::Completed);
                self.multipart = None;
                return Ok(None);
            }
            Err(err) => return Err(self.fail(err)),
        };

        self.transition(SessionState::FramingPart);

        let mut sink = SinkTarget::build(
            selector(part.descriptor()),
            &self.reaper,
            self.memory_limit,
            &self.cancellation,
        );
        log::debug!(
            "part #{} '{}' goes to the {} sink",
            part.index(),
            part.name(),
            sink.label()
        );

        self.transition(SessionState::DrainingPart);

        let outcome = sink.accept(&mut part).await;
        sink.close();

        if outcome.is_err() {
            part.fail();
        }

        let descriptor = part.descriptor().clone();
        drop(part);

        self.descriptors.push(descriptor.clone());

        let payload = match outcome {
            Ok(payload) => payload,
            Err(err) if self.skips(&sink, &err) => {
                log::debug!("part #{} '{}' rejected: {}", descriptor.index(), descriptor.name(), err);
                PartPayload::Rejected(err)
            }
            Err(err) => return Err(self.fail(err)),
        };

        self.transition(SessionState::Scanning);

        Ok(Some(IngestedPart { descriptor, payload }))
    }

    fn skips(&self, sink: &SinkTarget, err: &crate::Error) -> bool {
        self.failure_policy == FailurePolicy::SkipPart
            && !sink.is_mandatory()
            && matches!(
                err,
                crate::Error::PartTooLarge { .. } | crate::Error::WriteFailure { .. }
            )
    }

    fn fail(&mut self, err: crate::Error) -> crate::Error {
        let state = match err {
            crate::Error::Cancelled => SessionState::Cancelled,
            _ => SessionState::Failed,
        };

        log::warn!("ingestion session {}: {}", state, err);
        self.transition(state);

        self.multipart = None;
        let reaped = self.reaper.reap();
        if reaped > 0 {
            log::debug!("removed {} temporary file(s) of the {} session", reaped, state);
        }

        err
    }

    fn transition(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("ingestion session {} -> {}", self.state, state);
            self.state = state;
        }
    }
}

impl fmt::Debug for IngestionSession<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionSession")
            .field("state", &self.state)
            .field("boundary", &self.boundary)
            .field("descriptors", &self.descriptors)
            .field("reaper", &self.reaper)
            .finish()
    }
}
