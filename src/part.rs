use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use encoding_rs::{Encoding, UTF_8};
use futures_util::stream::{Stream, TryStreamExt};
use http::header::HeaderMap;
#[cfg(feature = "json")]
use serde::de::DeserializeOwned;
use spin::mutex::spin::SpinMutex as Mutex;

use crate::descriptor::{PartDescriptor, PartStatus};
use crate::state::{MultipartState, StreamingStage};

/// A single part in a multipart stream.
///
/// Its content can be accessed via the [`Stream`] API or the methods defined in this type.
///
/// # Lifetime
///
/// The lifetime of the stream `'r` corresponds to the lifetime of the underlying `Stream`. If
/// the underlying stream holds no references directly or transitively, then the lifetime can be
/// `'static`.
///
/// # Examples
///
/// ```
/// use multipart_ingest::Multipart;
/// use bytes::Bytes;
/// use std::convert::Infallible;
/// use futures_util::stream::once;
///
/// # async fn run() {
/// let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"my_text_field\"\r\n\r\nabcd\r\n--X-BOUNDARY--\r\n";
/// let stream = once(async move { Result::<Bytes, Infallible>::Ok(Bytes::from(data)) });
/// let mut multipart = Multipart::new(stream, "X-BOUNDARY");
///
/// while let Some(part) = multipart.next_part().await.unwrap() {
///     let content = part.text().await.unwrap();
///     assert_eq!(content, "abcd");
/// }
/// # }
/// # tokio::runtime::Runtime::new().unwrap().block_on(run());
/// ```
///
/// # Warning About Leaks
///
/// To avoid the next part being initialized before this one is done being read or dropped,
/// only one instance per [`Multipart`](crate::Multipart) instance is allowed at a time. A
/// [`Drop`] implementation is used to notify [`Multipart`](crate::Multipart) that this part
/// is done being read.
///
/// If this value is leaked (via [`std::mem::forget()`] or some other mechanism), then the
/// parent [`Multipart`](crate::Multipart) will never be able to yield the next part in the
/// stream. The task waiting on the [`Multipart`](crate::Multipart) will also never be
/// notified, which, depending on the event loop/reactor/executor implementation, may cause a
/// deadlock.
pub struct Part<'r> {
    state: Arc<Mutex<MultipartState<'r>>>,
    done: bool,
    descriptor: PartDescriptor,
}

impl<'r> Part<'r> {
    pub(crate) fn new(state: Arc<Mutex<MultipartState<'r>>>, descriptor: PartDescriptor) -> Self {
        Part {
            state,
            done: false,
            descriptor,
        }
    }

    /// The part name found in the
    /// [`Content-Disposition`](https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/Content-Disposition)
    /// header.
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// The file name found in the
    /// [`Content-Disposition`](https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/Content-Disposition)
    /// header.
    pub fn file_name(&self) -> Option<&str> {
        self.descriptor.file_name()
    }

    /// Get the content type of the part, defaulted when the header is absent.
    pub fn content_type(&self) -> &mime::Mime {
        self.descriptor.content_type()
    }

    /// Get a map of headers as [`HeaderMap`].
    pub fn headers(&self) -> &HeaderMap {
        self.descriptor.headers()
    }

    /// Get the index of this part in order they appeared in the stream.
    pub fn index(&self) -> usize {
        self.descriptor.index()
    }

    /// Number of body bytes yielded so far.
    pub fn size(&self) -> u64 {
        self.descriptor.size()
    }

    /// Whether the delimiter ending this part has been reached.
    pub fn is_complete(&self) -> bool {
        self.descriptor.status() == PartStatus::Complete
    }

    /// A snapshot of this part's descriptor.
    pub fn descriptor(&self) -> &PartDescriptor {
        &self.descriptor
    }

    pub(crate) fn fail(&mut self) {
        self.descriptor.fail();
    }

    /// Get the full data of the part as [`Bytes`].
    ///
    /// # Examples
    ///
    /// ```
    /// use multipart_ingest::Multipart;
    /// use bytes::Bytes;
    /// use std::convert::Infallible;
    /// use futures_util::stream::once;
    ///
    /// # async fn run() {
    /// let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"my_text_field\"\r\n\r\nabcd\r\n--X-BOUNDARY--\r\n";
    /// let stream = once(async move { Result::<Bytes, Infallible>::Ok(Bytes::from(data)) });
    /// let mut multipart = Multipart::new(stream, "X-BOUNDARY");
    ///
    /// while let Some(part) = multipart.next_part().await.unwrap() {
    ///     let bytes = part.bytes().await.unwrap();
    ///     assert_eq!(bytes.len(), 4);
    /// }
    /// # }
    /// # tokio::runtime::Runtime::new().unwrap().block_on(run());
    /// ```
    pub async fn bytes(mut self) -> crate::Result<Bytes> {
        let mut buf = BytesMut::new();

        while let Some(bytes) = self.chunk().await? {
            buf.extend_from_slice(&bytes);
        }

        Ok(buf.freeze())
    }

    /// Stream a chunk of the part data.
    ///
    /// When the part data has been exhausted, this will return [`None`].
    pub async fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        self.try_next().await
    }

    /// Try to deserialize the part data as JSON.
    ///
    /// # Optional
    ///
    /// This requires the optional `json` feature to be enabled.
    #[cfg(feature = "json")]
    #[cfg_attr(nightly, doc(cfg(feature = "json")))]
    pub async fn json<T: DeserializeOwned>(self) -> crate::Result<T> {
        serde_json::from_slice(&self.bytes().await?).map_err(crate::Error::DecodeJson)
    }

    /// Get the full part data as text.
    ///
    /// This method decodes the part data with `BOM sniffing` and with malformed sequences
    /// replaced with the `REPLACEMENT CHARACTER`. The `charset` parameter of the part's
    /// `Content-Type` is honoured, UTF-8 is the default.
    pub async fn text(self) -> crate::Result<String> {
        self.text_with_charset("utf-8").await
    }

    /// Get the full part data as text given a specific encoding.
    ///
    /// The `default_encoding` is used when the part's `Content-Type` carries no `charset`.
    pub async fn text_with_charset(self, default_encoding: &str) -> crate::Result<String> {
        let encoding_name = self
            .content_type()
            .get_param(mime::CHARSET)
            .map(|charset| charset.as_str().to_owned())
            .unwrap_or_else(|| default_encoding.to_owned());

        let encoding = Encoding::for_label(encoding_name.as_bytes()).unwrap_or(UTF_8);

        let bytes = self.bytes().await?;

        let (text, _, _) = encoding.decode(&bytes);

        Ok(text.into_owned())
    }
}

impl Stream for Part<'_> {
    type Item = Result<Bytes, crate::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done || self.descriptor.status() == PartStatus::Failed {
            return Poll::Ready(None);
        }

        let this = &mut *self;
        let mut guard = this.state.lock();
        let state = &mut *guard;

        if state.poll_cancelled(cx) {
            this.descriptor.fail();
            return Poll::Ready(Some(Err(crate::Error::Cancelled)));
        }

        loop {
            match state.buffer.read_field_data(&state.delimiter) {
                Ok(Some((done, bytes))) => {
                    state.curr_field_size_counter += bytes.len() as u64;

                    if state.curr_field_size_counter > state.curr_field_size_limit {
                        // The closing delimiter may already be consumed; drop must not scan past it.
                        this.done = done;
                        this.descriptor.fail();
                        return Poll::Ready(Some(Err(crate::Error::PartTooLarge {
                            limit: state.curr_field_size_limit,
                            field_name: state.curr_field_name.clone(),
                        })));
                    }

                    this.descriptor.record(bytes.len());

                    if done {
                        this.done = true;
                        this.descriptor.complete();

                        if bytes.is_empty() {
                            return Poll::Ready(None);
                        }
                    }

                    return Poll::Ready(Some(Ok(bytes)));
                }
                Ok(None) => match state.buffer.poll_chunk(cx) {
                    Poll::Ready(Ok(())) => continue,
                    Poll::Ready(Err(err)) => {
                        this.descriptor.fail();
                        return Poll::Ready(Some(Err(err)));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                Err(err) => {
                    this.descriptor.fail();
                    return Poll::Ready(Some(Err(err)));
                }
            }
        }
    }
}

impl Drop for Part<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();

        if state.stage == StreamingStage::ReadingFieldData {
            state.stage = if self.done {
                StreamingStage::ReadingBoundary
            } else {
                StreamingStage::CleaningPrevFieldData
            };
        }

        state.is_prev_field_consumed = true;
        state.wake_next_field();
    }
}
