use http::header::HeaderMap;
use mime::Mime;

/// Lifecycle of one part's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    /// Body bytes are still being delivered.
    Open,
    /// The delimiter ending the part was observed.
    Complete,
    /// The part was abandoned because of an error.
    Failed,
}

/// Describes one part of a multipart body.
///
/// The size only counts bytes that were actually delivered to a consumer and the status only
/// becomes [`PartStatus::Complete`] once the delimiter ending the part was seen, so a truncated
/// body never produces a complete descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct PartDescriptor {
    pub(crate) index: usize,
    pub(crate) name: String,
    pub(crate) file_name: Option<String>,
    pub(crate) content_type: Mime,
    pub(crate) headers: HeaderMap,
    pub(crate) size: u64,
    pub(crate) status: PartStatus,
}

impl PartDescriptor {
    /// Position of the part in the body, starting at zero.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The `name` attribute of the `Content-Disposition` header.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `filename` (or `filename*`) attribute of the `Content-Disposition` header.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// The declared `Content-Type`, or the default for the kind of part.
    pub fn content_type(&self) -> &Mime {
        &self.content_type
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Number of body bytes delivered so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn status(&self) -> PartStatus {
        self.status
    }

    /// Whether the part carries a file name, i.e. is a file upload rather than a form field.
    pub fn is_file(&self) -> bool {
        self.file_name.is_some()
    }

    pub(crate) fn record(&mut self, delivered: usize) {
        self.size += delivered as u64;
    }

    pub(crate) fn complete(&mut self) {
        if self.status == PartStatus::Open {
            self.status = PartStatus::Complete;
        }
    }

    pub(crate) fn fail(&mut self) {
        self.status = PartStatus::Failed;
    }
}
