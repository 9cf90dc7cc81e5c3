#![cfg_attr(nightly, feature(doc_cfg))]

//! Streaming ingestion of `multipart/form-data` request bodies.
//!
//! A body is scanned incrementally for its boundary delimiters, every part's headers are
//! framed into a [`PartDescriptor`] and its bytes are routed to a sink: a temporary file, an
//! in-memory buffer, or a pass-through consumer. The whole body is never held in memory, and
//! temporary files created for a request are deleted unless the caller claims them.
//!
//! Two levels of API are available:
//!
//! * [`Multipart`] yields one [`Part`] at a time and lets the caller read its body as a
//!   [`Stream`](futures_util::stream::Stream).
//! * [`IngestionSession`] drives a whole request, choosing a sink per part and collecting an
//!   [`IngestionResult`].
//!
//! # Examples
//!
//! ```
//! use multipart_ingest::{IngestionSession, IngestOptions, SinkKind};
//! use bytes::Bytes;
//! use std::convert::Infallible;
//! use futures_util::stream::once;
//!
//! # async fn run() {
//! let data = "--XYZ\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello\r\n\
//!             --XYZ\r\nContent-Disposition: form-data; name=\"data\"; filename=\"data.txt\"\r\n\r\nabcde\r\n--XYZ--\r\n";
//! let stream = once(async move { Result::<Bytes, Infallible>::Ok(Bytes::from(data)) });
//!
//! let mut session = IngestionSession::new(stream, "multipart/form-data; boundary=XYZ", IngestOptions::new());
//! let result = session.run(SinkKind::by_file_name).await.unwrap();
//!
//! assert_eq!(result.text("title"), Some("hello"));
//! assert_eq!(result.get("data").unwrap().descriptor().size(), 5);
//! # }
//! # tokio::runtime::Runtime::new().unwrap().block_on(run());
//! ```
//!
//! ## Optional features
//!
//! * `json`: Enables [`Part::json`] to deserialize a part body.
//! * `tokio-io`: Enables [`Multipart::with_reader`] for [`AsyncRead`](tokio::io::AsyncRead)
//!   sources.
//! * `all`: Enables all of the above.
//!
//! ## Prevent Denial of Service (DoS) Attacks
//!
//! [`Constraints`] bound the whole body, each part and each header block, and restrict the
//! accepted field names:
//!
//! ```
//! use multipart_ingest::{Constraints, IngestOptions, SizeLimit};
//!
//! let constraints = Constraints::new()
//!     .allowed_fields(vec!["title", "data"])
//!     .max_header_bytes(4 * 1024)
//!     .size_limit(
//!         SizeLimit::new()
//!             .whole_stream(15 * 1024 * 1024)
//!             .per_field(10 * 1024 * 1024)
//!             .for_field("title", 1024),
//!     );
//!
//! let options = IngestOptions::new().memory_limit(64 * 1024).constraints(constraints);
//! ```

pub use bytes;
pub use constraints::Constraints;
pub use descriptor::{PartDescriptor, PartStatus};
pub use error::{BodyViolation, Error, HeaderViolation};
pub use multipart::Multipart;
pub use part::Part;
pub use reaper::Reaper;
pub use session::{FailurePolicy, IngestOptions, IngestedPart, IngestionResult, IngestionSession, SessionState};
pub use sink::{
    channel as passthrough_channel, MemorySink, PartEvent, PartPayload, PassthroughReceiver, PassthroughSender,
    PassthroughSink, SinkKind, SinkTarget, TempFileSink,
};
pub use size_limit::SizeLimit;

mod buffer;
mod constants;
mod constraints;
mod content_disposition;
mod descriptor;
mod error;
mod framer;
mod helpers;
mod multipart;
mod part;
mod reaper;
mod session;
mod sink;
mod size_limit;
mod state;

/// A Result type often returned from methods that can have `multipart-ingest` errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

const MAX_BOUNDARY_LEN: usize = 70;

/// Parses the `Content-Type` header to extract the boundary value.
///
/// # Examples
///
/// ```
/// let content_type = "multipart/form-data; boundary=ABCDEFG";
///
/// assert_eq!(multipart_ingest::parse_boundary(content_type), Ok("ABCDEFG".to_owned()));
/// ```
pub fn parse_boundary<T: AsRef<str>>(content_type: T) -> Result<String> {
    let unsupported = |reason| Error::UnsupportedMediaType {
        content_type: content_type.as_ref().to_owned(),
        reason,
    };

    let m = content_type
        .as_ref()
        .parse::<mime::Mime>()
        .map_err(|_| unsupported("not a valid media type"))?;

    if !(m.type_() == mime::MULTIPART && m.subtype() == mime::FORM_DATA) {
        return Err(unsupported("not multipart/form-data"));
    }

    let boundary = m
        .get_param(mime::BOUNDARY)
        .map(|name| name.as_str().to_owned())
        .ok_or_else(|| unsupported("no boundary parameter"))?;

    if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
        return Err(unsupported("boundary must be 1 to 70 characters long"));
    }

    Ok(boundary)
}
