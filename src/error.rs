use std::fmt::{self, Debug, Display, Formatter};
use std::io;
use std::path::PathBuf;

use http::StatusCode;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A set of errors that can occur while ingesting a multipart stream.
#[non_exhaustive]
pub enum Error {
    /// The `Content-Type` is not `multipart/form-data` or has no usable boundary.
    UnsupportedMediaType { content_type: String, reason: &'static str },

    /// The body violates the boundary-delimited framing.
    MalformedBody(BodyViolation),

    /// The headers of one part are missing or invalid.
    MalformedHeaders { part_index: usize, violation: HeaderViolation },

    /// A part exceeded its size limit.
    PartTooLarge { field_name: Option<String>, limit: u64 },

    /// The whole body exceeded its size limit.
    BodyTooLarge { limit: u64 },

    /// A part with a name outside of
    /// [`Constraints::allowed_fields`](crate::Constraints::allowed_fields) was received.
    UnknownField { field_name: String },

    /// A sink could not store or forward part data.
    WriteFailure {
        field_name: Option<String>,
        path: Option<PathBuf>,
        cause: io::Error,
    },

    /// Reading the underlying body stream failed.
    StreamReadFailed(BoxError),

    /// The session was cancelled before it finished.
    Cancelled,

    /// Failed to decode the part data as `JSON` in
    /// [`part.json()`](crate::Part::json) method.
    #[cfg(feature = "json")]
    #[cfg_attr(nightly, doc(cfg(feature = "json")))]
    DecodeJson(serde_json::Error),
}

/// The way a body broke the multipart framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BodyViolation {
    /// No boundary delimiter was found anywhere in the body.
    NoBoundary,
    /// The body ended before the close delimiter `--boundary--`.
    UnexpectedEof,
    /// A header block was not terminated by a blank line within the lookahead.
    HeadersTooLong { limit: usize },
    /// A delimiter was followed by something other than `--` or padding and CRLF.
    InvalidDelimiter,
}

/// The way a part's header block was invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HeaderViolation {
    /// There is no `Content-Disposition` header.
    MissingContentDisposition,
    /// The `Content-Disposition` header has no `name` attribute.
    MissingName,
    /// The header block could not be parsed.
    Unparsable(httparse::Error),
    /// The header block holds more headers than allowed or ends early.
    Incomplete,
    /// A raw header name is not a valid HTTP header name.
    InvalidName(String),
    /// A raw header value is not a valid HTTP header value.
    InvalidValue(Vec<u8>),
}

impl Error {
    /// The HTTP status an upload endpoint is expected to answer with, or `None` when the
    /// response should be dropped.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Error::UnsupportedMediaType { .. } => Some(StatusCode::UNSUPPORTED_MEDIA_TYPE),
            Error::MalformedBody(_)
            | Error::MalformedHeaders { .. }
            | Error::UnknownField { .. }
            | Error::StreamReadFailed(_) => Some(StatusCode::BAD_REQUEST),
            #[cfg(feature = "json")]
            Error::DecodeJson(_) => Some(StatusCode::BAD_REQUEST),
            Error::PartTooLarge { .. } | Error::BodyTooLarge { .. } => Some(StatusCode::PAYLOAD_TOO_LARGE),
            Error::WriteFailure { .. } => Some(StatusCode::INTERNAL_SERVER_ERROR),
            Error::Cancelled => None,
        }
    }

    pub(crate) fn malformed_headers(part_index: usize, violation: HeaderViolation) -> Self {
        Error::MalformedHeaders { part_index, violation }
    }

    pub(crate) fn write_failure(field_name: Option<&str>, path: Option<PathBuf>, cause: io::Error) -> Self {
        Error::WriteFailure {
            field_name: field_name.map(ToOwned::to_owned),
            path,
            cause,
        }
    }
}

impl Display for BodyViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BodyViolation::NoBoundary => write!(f, "no multipart boundary found in the body"),
            BodyViolation::UnexpectedEof => write!(f, "body ended before the closing boundary"),
            BodyViolation::HeadersTooLong { limit } => {
                write!(f, "part headers not terminated within {} bytes", limit)
            }
            BodyViolation::InvalidDelimiter => write!(f, "invalid bytes after a boundary delimiter"),
        }
    }
}

impl Display for HeaderViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HeaderViolation::MissingContentDisposition => write!(f, "missing Content-Disposition header"),
            HeaderViolation::MissingName => write!(f, "Content-Disposition has no name attribute"),
            HeaderViolation::Unparsable(err) => write!(f, "failed to read headers: {}", err),
            HeaderViolation::Incomplete => write!(f, "failed to read complete headers"),
            HeaderViolation::InvalidName(name) => write!(f, "invalid header name: {:?}", name),
            HeaderViolation::InvalidValue(value) => {
                write!(f, "invalid header value: {:?}", String::from_utf8_lossy(value))
            }
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnsupportedMediaType { content_type, reason } => {
                write!(f, "unsupported media type {:?}: {}", content_type, reason)
            }
            Error::MalformedBody(violation) => write!(f, "malformed multipart body: {}", violation),
            Error::MalformedHeaders { part_index, violation } => {
                write!(f, "malformed headers in part #{}: {}", part_index, violation)
            }
            Error::PartTooLarge { field_name, limit } => write!(
                f,
                "part '{}' exceeded the maximum size limit: {} bytes",
                field_name.as_deref().unwrap_or("<unknown>"),
                limit
            ),
            Error::BodyTooLarge { limit } => write!(f, "body exceeded the maximum size limit: {} bytes", limit),
            Error::UnknownField { field_name } => write!(f, "unknown field received: {}", field_name),
            Error::WriteFailure { field_name, path, cause } => {
                write!(
                    f,
                    "failed to write part '{}'",
                    field_name.as_deref().unwrap_or("<unknown>")
                )?;
                if let Some(path) = path {
                    write!(f, " to {}", path.display())?;
                }
                write!(f, ": {}", cause)
            }
            Error::StreamReadFailed(err) => write!(f, "stream read failed: {}", err),
            Error::Cancelled => write!(f, "ingestion cancelled"),
            #[cfg(feature = "json")]
            Error::DecodeJson(err) => write!(f, "failed to decode part data as JSON: {}", err),
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::WriteFailure { cause, .. } => Some(cause),
            Error::StreamReadFailed(err) => Some(err.as_ref()),
            #[cfg(feature = "json")]
            Error::DecodeJson(err) => Some(err),
            _ => None,
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string().eq(&other.to_string())
    }
}

impl Eq for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        let err = Error::UnsupportedMediaType {
            content_type: "text/plain".to_owned(),
            reason: "not multipart/form-data",
        };
        assert_eq!(err.status_code(), Some(StatusCode::UNSUPPORTED_MEDIA_TYPE));

        let err = Error::MalformedBody(BodyViolation::UnexpectedEof);
        assert_eq!(err.status_code(), Some(StatusCode::BAD_REQUEST));

        let err = Error::malformed_headers(1, HeaderViolation::MissingName);
        assert_eq!(err.status_code(), Some(StatusCode::BAD_REQUEST));

        let err = Error::PartTooLarge {
            field_name: Some("file".to_owned()),
            limit: 4,
        };
        assert_eq!(err.status_code(), Some(StatusCode::PAYLOAD_TOO_LARGE));

        let err = Error::write_failure(None, None, io::Error::new(io::ErrorKind::Other, "disk full"));
        assert_eq!(err.status_code(), Some(StatusCode::INTERNAL_SERVER_ERROR));

        assert_eq!(Error::Cancelled.status_code(), None);
    }

    #[test]
    fn test_display() {
        let err = Error::malformed_headers(2, HeaderViolation::MissingContentDisposition);
        assert_eq!(
            err.to_string(),
            "malformed headers in part #2: missing Content-Disposition header"
        );

        let err = Error::PartTooLarge {
            field_name: None,
            limit: 10,
        };
        assert_eq!(
            err.to_string(),
            "part '<unknown>' exceeded the maximum size limit: 10 bytes"
        );
    }
}
