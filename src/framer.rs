use http::header::{self, HeaderMap};
use mime::Mime;

use crate::constants;
use crate::content_disposition::ContentDisposition;
use crate::descriptor::{PartDescriptor, PartStatus};
use crate::error::HeaderViolation;
use crate::helpers;

/// Turns a raw header block (terminated by a blank line) into a fresh descriptor.
pub(crate) fn frame_part(raw: &[u8], part_index: usize) -> crate::Result<PartDescriptor> {
    let headers = parse_headers(raw).map_err(|violation| crate::Error::malformed_headers(part_index, violation))?;

    let content_disposition = ContentDisposition::parse(&headers)
        .ok_or_else(|| crate::Error::malformed_headers(part_index, HeaderViolation::MissingContentDisposition))?;

    let name = content_disposition
        .field_name
        .ok_or_else(|| crate::Error::malformed_headers(part_index, HeaderViolation::MissingName))?;

    let file_name = content_disposition.file_name;
    let content_type = parse_content_type(&headers, file_name.is_some());

    log::debug!(
        "framed part #{}: name={:?} file_name={:?} content_type={}",
        part_index,
        name,
        file_name,
        content_type
    );

    Ok(PartDescriptor {
        index: part_index,
        name,
        file_name,
        content_type,
        headers,
        size: 0,
        status: PartStatus::Open,
    })
}

fn parse_headers(raw: &[u8]) -> Result<HeaderMap, HeaderViolation> {
    let mut headers = [httparse::EMPTY_HEADER; constants::MAX_HEADERS];

    match httparse::parse_headers(raw, &mut headers) {
        Ok(httparse::Status::Complete((_, raw_headers))) => helpers::convert_raw_headers_to_header_map(raw_headers),
        Ok(httparse::Status::Partial) => Err(HeaderViolation::Incomplete),
        Err(err) => Err(HeaderViolation::Unparsable(err)),
    }
}

fn parse_content_type(headers: &HeaderMap, has_file_name: bool) -> Mime {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.parse::<Mime>().ok())
        .unwrap_or(if has_file_name {
            mime::APPLICATION_OCTET_STREAM
        } else {
            mime::TEXT_PLAIN
        })
}
