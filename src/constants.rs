pub(crate) const DEFAULT_WHOLE_STREAM_SIZE_LIMIT: u64 = u64::MAX;
pub(crate) const DEFAULT_PER_FIELD_SIZE_LIMIT: u64 = u64::MAX;
pub(crate) const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;
pub(crate) const DEFAULT_MEMORY_LIMIT: u64 = 2 * 1024 * 1024;
pub(crate) const DEFAULT_TEMP_PREFIX: &str = "upload-";
pub(crate) const TEMP_FILE_SUFFIX: &str = ".upload";
pub(crate) const TEMP_FILE_CREATE_ATTEMPTS: usize = 8;

pub(crate) const MAX_HEADERS: usize = 32;
pub(crate) const MAX_TRANSPORT_PADDING: usize = 256;
pub(crate) const BOUNDARY_EXT: &str = "--";
pub(crate) const CRLF: &str = "\r\n";
pub(crate) const CRLF_CRLF: &str = "\r\n\r\n";

/// Builds the in-body delimiter `\r\n--<boundary>`.
pub(crate) fn delimiter_for(boundary: &str) -> Vec<u8> {
    let mut delimiter = Vec::with_capacity(CRLF.len() + BOUNDARY_EXT.len() + boundary.len());
    delimiter.extend_from_slice(CRLF.as_bytes());
    delimiter.extend_from_slice(BOUNDARY_EXT.as_bytes());
    delimiter.extend_from_slice(boundary.as_bytes());
    delimiter
}

pub(crate) fn is_transport_padding(byte: u8) -> bool {
    byte == b' ' || byte == b'\t'
}
