use std::borrow::Cow;

use encoding_rs::{Encoding, UTF_8};
use http::header::{self, HeaderMap};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ContentDisposition {
    pub(crate) field_name: Option<String>,
    pub(crate) file_name: Option<String>,
}

impl ContentDisposition {
    /// Returns `None` when there is no `Content-Disposition` header.
    pub(crate) fn parse(headers: &HeaderMap) -> Option<ContentDisposition> {
        headers
            .get(header::CONTENT_DISPOSITION)
            .map(|val| ContentDisposition::parse_value(val.as_bytes()))
    }

    pub(crate) fn parse_value(value: &[u8]) -> ContentDisposition {
        let mut field_name = None;
        let mut file_name = None;
        let mut file_name_ext = None;

        for (attr, val) in Params::new(value) {
            if attr.eq_ignore_ascii_case(b"name") {
                field_name.get_or_insert_with(|| String::from_utf8_lossy(&val).into_owned());
            } else if attr.eq_ignore_ascii_case(b"filename") {
                file_name.get_or_insert_with(|| String::from_utf8_lossy(&val).into_owned());
            } else if attr.eq_ignore_ascii_case(b"filename*") && file_name_ext.is_none() {
                file_name_ext = decode_ext_value(&val);
            }
        }

        ContentDisposition {
            field_name,
            file_name: file_name_ext.or(file_name),
        }
    }
}

/// Iterates over `attr=value` pairs after the disposition type.
struct Params<'a> {
    rest: &'a [u8],
}

impl<'a> Params<'a> {
    fn new(value: &'a [u8]) -> Self {
        let rest: &[u8] = match memchr::memchr(b';', value) {
            Some(idx) => &value[idx + 1..],
            None => &[],
        };

        Params { rest }
    }
}

impl<'a> Iterator for Params<'a> {
    type Item = (&'a [u8], Cow<'a, [u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rest: &'a [u8] = trim_start(self.rest);

            if rest.is_empty() {
                self.rest = rest;
                return None;
            }

            if rest[0] == b';' {
                self.rest = &rest[1..];
                continue;
            }

            let attr_end = rest
                .iter()
                .position(|b| *b == b'=' || *b == b';')
                .unwrap_or(rest.len());
            let attr = trim_end(&rest[..attr_end]);

            if rest.get(attr_end) != Some(&b'=') {
                self.rest = &rest[attr_end..];
                continue;
            }

            self.rest = trim_start(&rest[attr_end + 1..]);

            let value = if self.rest.first() == Some(&b'"') {
                self.quoted_value()
            } else {
                let rest: &'a [u8] = self.rest;
                let end = memchr::memchr(b';', rest).unwrap_or(rest.len());
                self.rest = &rest[end..];
                Cow::Borrowed(trim_end(&rest[..end]))
            };

            return Some((attr, value));
        }
    }
}

impl<'a> Params<'a> {
    fn quoted_value(&mut self) -> Cow<'a, [u8]> {
        let rest: &'a [u8] = self.rest;
        let body = &rest[1..];
        let mut unescaped: Option<Vec<u8>> = None;
        let mut idx = 0;

        while idx < body.len() {
            match body[idx] {
                b'"' => {
                    self.rest = &body[idx + 1..];
                    return unescaped.map(Cow::Owned).unwrap_or(Cow::Borrowed(&body[..idx]));
                }
                // Only `\"` and `\\` are escapes, browsers send other backslashes literally.
                b'\\' if matches!(body.get(idx + 1), Some(b'"') | Some(b'\\')) => {
                    let buf = unescaped.get_or_insert_with(|| body[..idx].to_vec());
                    buf.push(body[idx + 1]);
                    idx += 2;
                }
                byte => {
                    if let Some(buf) = unescaped.as_mut() {
                        buf.push(byte);
                    }
                    idx += 1;
                }
            }
        }

        self.rest = &[];
        unescaped.map(Cow::Owned).unwrap_or(Cow::Borrowed(body))
    }
}

/// Decodes an extended value such as `UTF-8''na%C3%AFve.txt`.
fn decode_ext_value(value: &[u8]) -> Option<String> {
    let mut pieces = value.splitn(3, |b| *b == b'\'');
    let charset = pieces.next()?;
    let _language = pieces.next()?;
    let encoded = pieces.next()?;

    let mut decoded = Vec::with_capacity(encoded.len());
    let mut idx = 0;

    while idx < encoded.len() {
        if encoded[idx] == b'%' {
            let hi = encoded.get(idx + 1).and_then(|b| (*b as char).to_digit(16))?;
            let lo = encoded.get(idx + 2).and_then(|b| (*b as char).to_digit(16))?;
            decoded.push((hi * 16 + lo) as u8);
            idx += 3;
        } else {
            decoded.push(encoded[idx]);
            idx += 1;
        }
    }

    let encoding = Encoding::for_label(charset).unwrap_or(UTF_8);
    let (text, _, _) = encoding.decode(&decoded);

    Some(text.into_owned())
}

fn trim_start(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    &bytes[start..]
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(0, |idx| idx + 1);
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: &str) -> ContentDisposition {
        ContentDisposition::parse_value(value.as_bytes())
    }

    #[test]
    fn test_field_name() {
        assert_eq!(parse(r#"form-data; name="my_field""#).field_name.as_deref(), Some("my_field"));
        assert_eq!(parse(r#"form-data; name="my field""#).field_name.as_deref(), Some("my field"));
        assert_eq!(parse("form-data; name=plain").field_name.as_deref(), Some("plain"));
        assert_eq!(parse(r#"form-data; NAME="upper""#).field_name.as_deref(), Some("upper"));
        assert_eq!(
            parse("form-data; name=\"你好\"; filename=\"file abc.txt\"").field_name.as_deref(),
            Some("你好")
        );
    }

    #[test]
    fn test_name_does_not_match_inside_filename() {
        let cd = parse(r#"form-data; filename="file-name.txt""#);
        assert_eq!(cd.field_name, None);
        assert_eq!(cd.file_name.as_deref(), Some("file-name.txt"));

        let cd = parse(r#"form-data; filename="a.txt"; name="data""#);
        assert_eq!(cd.field_name.as_deref(), Some("data"));
        assert_eq!(cd.file_name.as_deref(), Some("a.txt"));
    }

    #[test]
    fn test_file_name() {
        let cd = parse(r#"form-data; name="my_field"; filename="file name.txt""#);
        assert_eq!(cd.file_name.as_deref(), Some("file name.txt"));

        let cd = parse("form-data; filename=\"কখগ-你好.txt\"");
        assert_eq!(cd.file_name.as_deref(), Some("কখগ-你好.txt"));

        let cd = parse(r#"form-data; name="f"; filename="with \"quotes\".txt""#);
        assert_eq!(cd.file_name.as_deref(), Some(r#"with "quotes".txt"#));

        let cd = parse(r#"form-data; name="f"; filename="C:\docs\a;b.txt""#);
        assert_eq!(cd.file_name.as_deref(), Some(r#"C:\docs\a;b.txt"#));

        let cd = parse(r#"form-data; name="f"; filename="""#);
        assert_eq!(cd.file_name.as_deref(), Some(""));
    }

    #[test]
    fn test_extended_file_name() {
        let cd = parse(r#"form-data; name="f"; filename="fallback.txt"; filename*=UTF-8''na%C3%AFve.txt"#);
        assert_eq!(cd.file_name.as_deref(), Some("naïve.txt"));

        let cd = parse(r#"form-data; name="f"; filename*=iso-8859-1'en'%E9t%E9.txt"#);
        assert_eq!(cd.file_name.as_deref(), Some("été.txt"));

        let cd = parse(r#"form-data; name="f"; filename="fallback.txt"; filename*=broken"#);
        assert_eq!(cd.file_name.as_deref(), Some("fallback.txt"));
    }

    #[test]
    fn test_missing_header() {
        assert_eq!(ContentDisposition::parse(&HeaderMap::new()), None);
        assert_eq!(parse("form-data"), ContentDisposition::default());
    }
}
