use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future;
use futures_util::stream::{Stream, TryStreamExt};
use spin::mutex::spin::SpinMutex as Mutex;
#[cfg(feature = "tokio-io")]
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
#[cfg(feature = "tokio-io")]
use tokio_util::io::ReaderStream;

use crate::buffer::StreamBuffer;
use crate::constraints::Constraints;
use crate::framer;
use crate::state::{MultipartState, Scan, StreamingStage};
use crate::Part;

/// Represents the implementation of `multipart/form-data` formatted data.
///
/// This will parse the source stream into [`Part`] instances via [`next_part`](Multipart::next_part).
///
/// To maintain consistency in the underlying stream, this will not yield more than one [`Part`]
/// at a time. The [`Drop`] implementation on [`Part`] is used to signal when it's time to move
/// forward, so do avoid leaking that type or anything which contains it. Unread bytes of a
/// dropped part are skipped.
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
///     println!("Part: {:?}", part.text().await)
/// }
/// # }
/// # tokio::runtime::Runtime::new().unwrap().block_on(run());
/// ```
pub struct Multipart<'r> {
    state: Arc<Mutex<MultipartState<'r>>>,
    constraints: Constraints,
}

impl<'r> Multipart<'r> {
    /// Construct a new `Multipart` instance with the given [`Bytes`] stream and the boundary.
    pub fn new<S, O, E, B>(stream: S, boundary: B) -> Self
    where
        S: Stream<Item = Result<O, E>> + Send + 'r,
        O: Into<Bytes> + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'r,
        B: Into<String>,
    {
        Multipart::with_constraints(stream, boundary, Constraints::default())
    }

    /// Construct a new `Multipart` instance with the given [`Bytes`] stream, the boundary and
    /// the [`Constraints`] to enforce.
    pub fn with_constraints<S, O, E, B>(stream: S, boundary: B, constraints: Constraints) -> Self
    where
        S: Stream<Item = Result<O, E>> + Send + 'r,
        O: Into<Bytes> + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'r,
        B: Into<String>,
    {
        let stream = stream
            .map_ok(|b| b.into())
            .map_err(|err| crate::Error::StreamReadFailed(err.into()));

        let buffer = StreamBuffer::new(stream, constraints.size_limit.whole_stream);
        let state = MultipartState::new(buffer, boundary.into(), constraints.size_limit.per_field);

        Multipart {
            state: Arc::new(Mutex::new(state)),
            constraints,
        }
    }

    /// Construct a new `Multipart` instance with the given [`AsyncRead`] reader and the
    /// boundary.
    ///
    /// # Optional
    ///
    /// This requires the optional `tokio-io` feature to be enabled.
    ///
    /// # Examples
    ///
    /// ```
    /// use multipart_ingest::Multipart;
    ///
    /// # async fn run() {
    /// let data = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"my_text_field\"\r\n\r\nabcd\r\n--X-BOUNDARY--\r\n";
    /// let reader = data.as_bytes();
    /// let mut multipart = Multipart::with_reader(reader, "X-BOUNDARY");
    ///
    /// while let Some(mut part) = multipart.next_part().await.unwrap() {
    ///     while let Some(chunk) = part.chunk().await.unwrap() {
    ///         println!("Chunk: {:?}", chunk);
    ///     }
    /// }
    /// # }
    /// # tokio::runtime::Runtime::new().unwrap().block_on(run());
    /// ```
    #[cfg(feature = "tokio-io")]
    #[cfg_attr(nightly, doc(cfg(feature = "tokio-io")))]
    pub fn with_reader<R, B>(reader: R, boundary: B) -> Self
    where
        R: AsyncRead + Send + 'r,
        B: Into<String>,
    {
        let stream = ReaderStream::new(reader);
        Multipart::new(stream, boundary)
    }

    /// Construct a new `Multipart` instance with the given [`AsyncRead`] reader, the boundary
    /// and the [`Constraints`] to enforce.
    ///
    /// # Optional
    ///
    /// This requires the optional `tokio-io` feature to be enabled.
    #[cfg(feature = "tokio-io")]
    #[cfg_attr(nightly, doc(cfg(feature = "tokio-io")))]
    pub fn with_reader_with_constraints<R, B>(reader: R, boundary: B, constraints: Constraints) -> Self
    where
        R: AsyncRead + Send + 'r,
        B: Into<String>,
    {
        let stream = ReaderStream::new(reader);
        Multipart::with_constraints(stream, boundary, constraints)
    }

    /// Makes every pending read observe `token`: once it is cancelled, [`next_part`] and the
    /// open [`Part`] fail with [`Error::Cancelled`](crate::Error::Cancelled).
    ///
    /// [`next_part`]: Multipart::next_part
    pub fn cancel_on(self, token: CancellationToken) -> Self {
        self.state.lock().cancel_on(token);
        self
    }

    /// The boundary this instance scans for.
    pub fn boundary(&self) -> String {
        self.state.lock().boundary.clone()
    }

    /// Yields the next [`Part`] if available.
    ///
    /// Any previous `Part` returned by this method must be dropped before calling this method
    /// or [`Multipart::next_part_with_idx()`] again, otherwise the returned future waits for it.
    pub async fn next_part(&mut self) -> crate::Result<Option<Part<'r>>> {
        future::poll_fn(|cx| self.poll_next_part(cx)).await
    }

    /// Yields the next [`Part`] with their positioning index as a tuple `(usize, Part)`.
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
    /// while let Some((idx, part)) = multipart.next_part_with_idx().await.unwrap() {
    ///     println!("Index: {:?}, Content: {:?}", idx, part.text().await)
    /// }
    /// # }
    /// # tokio::runtime::Runtime::new().unwrap().block_on(run());
    /// ```
    pub async fn next_part_with_idx(&mut self) -> crate::Result<Option<(usize, Part<'r>)>> {
        self.next_part().await.map(|part| part.map(|part| (part.index(), part)))
    }

    /// Polls for the next [`Part`].
    pub fn poll_next_part(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<Option<Part<'r>>>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.poll_cancelled(cx) {
            return Poll::Ready(Err(crate::Error::Cancelled));
        }

        if state.stage == StreamingStage::Eof {
            return Poll::Ready(Ok(None));
        }

        if !state.is_prev_field_consumed {
            state.next_field_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let header_bytes = loop {
            match state.scan(self.constraints.max_header_bytes) {
                Ok(Scan::Headers(header_bytes)) => break header_bytes,
                Ok(Scan::End) => return Poll::Ready(Ok(None)),
                Ok(Scan::NeedMore) => match state.buffer.poll_chunk(cx) {
                    Poll::Ready(Ok(())) => continue,
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => return Poll::Pending,
                },
                Err(err) => return Poll::Ready(Err(err)),
            }
        };

        let field_idx = state.next_field_idx;
        state.next_field_idx += 1;

        let descriptor = match framer::frame_part(&header_bytes, field_idx) {
            Ok(descriptor) => descriptor,
            Err(err) => return Poll::Ready(Err(err)),
        };

        if !self.constraints.is_it_allowed(Some(descriptor.name())) {
            return Poll::Ready(Err(crate::Error::UnknownField {
                field_name: descriptor.name().to_owned(),
            }));
        }

        state.is_prev_field_consumed = false;
        state.curr_field_name = Some(descriptor.name().to_owned());
        state.curr_field_size_limit = self
            .constraints
            .size_limit
            .extract_size_limit_for(Some(descriptor.name()));
        state.curr_field_size_counter = 0;

        drop(guard);

        Poll::Ready(Ok(Some(Part::new(Arc::clone(&self.state), descriptor))))
    }
}
