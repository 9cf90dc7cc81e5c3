use std::convert::TryFrom;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use httparse::Header;

use crate::error::HeaderViolation;

pub(crate) fn convert_raw_headers_to_header_map(raw_headers: &[Header<'_>]) -> Result<HeaderMap, HeaderViolation> {
    let mut headers = HeaderMap::with_capacity(raw_headers.len());

    for raw_header in raw_headers {
        let name = HeaderName::try_from(raw_header.name)
            .map_err(|_| HeaderViolation::InvalidName(raw_header.name.to_owned()))?;

        let value = HeaderValue::try_from(raw_header.value)
            .map_err(|_| HeaderViolation::InvalidValue(raw_header.value.to_vec()))?;

        headers.append(name, value);
    }

    Ok(headers)
}
