use crate::constants;
use crate::size_limit::SizeLimit;

/// Represents some rules to be applied on the stream and part's content size to prevent DoS
/// attacks.
///
/// It's recommended to add some rules on part (specially text part) size to avoid potential
/// DoS attacks from attackers running the server out of memory. This type provides some API to
/// apply constraints on basis of a single part and the whole stream.
///
/// # Examples
///
/// ```
/// use multipart_ingest::{Constraints, Multipart, SizeLimit};
/// # use bytes::Bytes;
/// # use std::convert::Infallible;
/// # use futures_util::stream::once;
///
/// # async fn run() {
/// # let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"my_text_field\"\r\n\r\nabcd\r\n--X-BOUNDARY--\r\n";
/// # let some_stream = once(async move { Result::<Bytes, Infallible>::Ok(Bytes::from(data)) });
/// let constraints = Constraints::new()
///     .allowed_fields(vec!["my_text_field", "my_file_field"])
///     .size_limit(
///         SizeLimit::new()
///             // Set 15mb as size limit for the whole stream body.
///             .whole_stream(15 * 1024 * 1024)
///             // Set 10mb as size limit for all parts.
///             .per_field(10 * 1024 * 1024)
///             // Set 30kb as size limit for our text part only.
///             .for_field("my_text_field", 30 * 1024),
///     );
///
/// let mut multipart = Multipart::with_constraints(some_stream, "X-BOUNDARY", constraints);
///
/// while let Some(part) = multipart.next_part().await.unwrap() {
///     println!("{:?}", part.text().await)
/// }
/// # }
/// # tokio::runtime::Runtime::new().unwrap().block_on(run());
/// ```
#[derive(Debug, Clone)]
pub struct Constraints {
    pub(crate) size_limit: SizeLimit,
    pub(crate) allowed_fields: Option<Vec<String>>,
    pub(crate) max_header_bytes: usize,
}

impl Constraints {
    /// Creates a set of rules with default behaviour.
    pub fn new() -> Constraints {
        Constraints::default()
    }

    /// Applies rules on part's content length.
    pub fn size_limit(self, size_limit: SizeLimit) -> Constraints {
        Constraints {
            size_limit,
            allowed_fields: self.allowed_fields,
            max_header_bytes: self.max_header_bytes,
        }
    }

    /// Specify which fields are allowed, for any unknown field
    /// [`next_part`](crate::Multipart::next_part) will throw an error.
    pub fn allowed_fields<N: Into<String>>(self, allowed_fields: Vec<N>) -> Constraints {
        let allowed_fields = allowed_fields.into_iter().map(|item| item.into()).collect();

        Constraints {
            size_limit: self.size_limit,
            allowed_fields: Some(allowed_fields),
            max_header_bytes: self.max_header_bytes,
        }
    }

    /// Sets how many bytes a part's header block may span before the blank line that ends it.
    pub fn max_header_bytes(mut self, limit: usize) -> Constraints {
        self.max_header_bytes = limit;
        self
    }

    pub(crate) fn is_it_allowed(&self, field: Option<&str>) -> bool {
        if let Some(ref allowed_fields) = self.allowed_fields {
            field
                .map(|field| allowed_fields.iter().any(|item| item == field))
                .unwrap_or(false)
        } else {
            true
        }
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            size_limit: SizeLimit::default(),
            allowed_fields: None,
            max_header_bytes: constants::DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_it_allowed() {
        let constraints = Constraints::new();
        assert!(constraints.is_it_allowed(Some("anything")));
        assert!(constraints.is_it_allowed(None));

        let constraints = Constraints::new().allowed_fields(vec!["title", "data"]);
        assert!(constraints.is_it_allowed(Some("title")));
        assert!(!constraints.is_it_allowed(Some("other")));
        assert!(!constraints.is_it_allowed(None));
    }
}
