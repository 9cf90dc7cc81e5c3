use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::stream::Stream;
use memchr::memmem;

use crate::constants;
use crate::error::BodyViolation;

/// Outcome of looking for a delimiter in buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delimiter {
    /// A complete delimiter starts at this index.
    Found(usize),
    /// A delimiter may start at this index, more bytes are needed to decide.
    Partial(usize),
    /// No delimiter; bytes before this index can never be part of one.
    Absent(usize),
}

/// Looks for `delimiter` followed by a valid boundary tail: `--`, or optional transport padding
/// and CRLF. Occurrences with any other tail are content.
pub(crate) fn find_delimiter(haystack: &[u8], delimiter: &[u8], eof: bool) -> Delimiter {
    let finder = memmem::Finder::new(delimiter);
    let mut pos = 0;

    while let Some(rel_idx) = finder.find(&haystack[pos..]) {
        let idx = pos + rel_idx;

        match classify_tail(&haystack[idx + delimiter.len()..], eof) {
            Tail::Valid => return Delimiter::Found(idx),
            Tail::Undecided => return Delimiter::Partial(idx),
            Tail::Invalid => pos = idx + 1,
        }
    }

    if eof {
        return Delimiter::Absent(haystack.len());
    }

    let max_overlap = std::cmp::min(haystack.len(), delimiter.len() - 1);
    let overlap = (1..=max_overlap)
        .rev()
        .find(|&len| haystack.ends_with(&delimiter[..len]))
        .unwrap_or(0);

    Delimiter::Absent(haystack.len() - overlap)
}

enum Tail {
    Valid,
    Undecided,
    Invalid,
}

fn classify_tail(tail: &[u8], eof: bool) -> Tail {
    let undecided = if eof { Tail::Invalid } else { Tail::Undecided };

    match tail {
        [] | [_] if tail.first().map_or(true, |b| *b == b'-' || *b == b'\r' || constants::is_transport_padding(*b)) => {
            undecided
        }
        [b'-', b'-', ..] | [b'\r', b'\n', ..] => Tail::Valid,
        [first, ..] if constants::is_transport_padding(*first) => {
            let padding = tail
                .iter()
                .take(constants::MAX_TRANSPORT_PADDING + 1)
                .take_while(|b| constants::is_transport_padding(**b))
                .count();

            if padding > constants::MAX_TRANSPORT_PADDING {
                return Tail::Invalid;
            }

            match &tail[padding..] {
                [] | [b'\r'] => undecided,
                [b'\r', b'\n', ..] => Tail::Valid,
                _ => Tail::Invalid,
            }
        }
        _ => Tail::Invalid,
    }
}

pub(crate) struct StreamBuffer<'r> {
    pub(crate) eof: bool,
    pub(crate) buf: BytesMut,
    pub(crate) stream: Pin<Box<dyn Stream<Item = Result<Bytes, crate::Error>> + Send + 'r>>,
    pub(crate) whole_stream_size_limit: u64,
    pub(crate) stream_size_counter: u64,
}

impl<'r> StreamBuffer<'r> {
    pub fn new<S>(stream: S, whole_stream_size_limit: u64) -> Self
    where
        S: Stream<Item = Result<Bytes, crate::Error>> + Send + 'r,
    {
        StreamBuffer {
            eof: false,
            buf: BytesMut::new(),
            stream: Box::pin(stream),
            whole_stream_size_limit,
            stream_size_counter: 0,
        }
    }

    /// Pulls at most one chunk from the underlying stream.
    ///
    /// Resolves once a chunk was appended or the stream ended.
    pub fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<crate::Result<()>> {
        if self.eof {
            return Poll::Ready(Ok(()));
        }

        match self.stream.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(data))) => {
                self.stream_size_counter += data.len() as u64;

                if self.stream_size_counter > self.whole_stream_size_limit {
                    return Poll::Ready(Err(crate::Error::BodyTooLarge {
                        limit: self.whole_stream_size_limit,
                    }));
                }

                self.buf.extend_from_slice(&data);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Err(err)),
            Poll::Ready(None) => {
                self.eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Whether no byte of the body has been consumed yet.
    pub fn at_body_start(&self) -> bool {
        self.stream_size_counter == self.buf.len() as u64
    }

    pub fn read_exact(&mut self, size: usize) -> Option<Bytes> {
        if size <= self.buf.len() {
            Some(self.buf.split_to(size).freeze())
        } else {
            None
        }
    }

    pub fn peek(&self, size: usize) -> Option<&[u8]> {
        self.buf.get(..size)
    }

    pub fn discard(&mut self, size: usize) {
        let size = std::cmp::min(size, self.buf.len());
        drop(self.buf.split_to(size));
    }

    /// Skips the preamble until the buffer starts with `--boundary`.
    ///
    /// Returns `Ok(true)` once positioned, `Ok(false)` when more bytes are needed.
    pub fn skip_preamble(&mut self, dash_boundary: &[u8], delimiter: &[u8]) -> crate::Result<bool> {
        if self.at_body_start() {
            if self.buf.len() < dash_boundary.len() {
                return if dash_boundary.starts_with(&self.buf) && !self.eof {
                    Ok(false)
                } else if self.eof {
                    Err(crate::Error::MalformedBody(BodyViolation::NoBoundary))
                } else {
                    self.skip_preamble_after_start(delimiter)
                };
            }

            if self.buf.starts_with(dash_boundary) {
                match classify_tail(&self.buf[dash_boundary.len()..], self.eof) {
                    Tail::Valid => return Ok(true),
                    Tail::Undecided => return Ok(false),
                    Tail::Invalid => {}
                }
            }
        }

        self.skip_preamble_after_start(delimiter)
    }

    fn skip_preamble_after_start(&mut self, delimiter: &[u8]) -> crate::Result<bool> {
        match find_delimiter(&self.buf, delimiter, self.eof) {
            Delimiter::Found(idx) => {
                self.discard(idx + constants::CRLF.len());
                Ok(true)
            }
            Delimiter::Partial(idx) => {
                self.discard(idx);
                Ok(false)
            }
            Delimiter::Absent(_) if self.eof => Err(crate::Error::MalformedBody(BodyViolation::NoBoundary)),
            Delimiter::Absent(idx) => {
                self.discard(idx);
                Ok(false)
            }
        }
    }

    /// Reads one part's header block including its terminating blank line.
    pub fn read_header_block(&mut self, max_header_bytes: usize) -> crate::Result<Option<Bytes>> {
        if self.buf.starts_with(constants::CRLF.as_bytes()) {
            return Ok(self.read_exact(constants::CRLF.len()));
        }

        let pattern = constants::CRLF_CRLF.as_bytes();
        let window = std::cmp::min(self.buf.len(), max_header_bytes + pattern.len());

        match memmem::find(&self.buf[..window], pattern) {
            Some(idx) => Ok(self.read_exact(idx + pattern.len())),
            None if self.buf.len() >= max_header_bytes + pattern.len() => {
                Err(crate::Error::MalformedBody(BodyViolation::HeadersTooLong {
                    limit: max_header_bytes,
                }))
            }
            None if self.eof => Err(crate::Error::MalformedBody(BodyViolation::UnexpectedEof)),
            None => Ok(None),
        }
    }

    /// Reads the padding and line break that follow a non-final boundary.
    ///
    /// Returns `Ok(true)` once consumed, `Ok(false)` when more bytes are needed.
    pub fn read_transport_padding(&mut self) -> crate::Result<bool> {
        let padding = self
            .buf
            .iter()
            .take_while(|b| constants::is_transport_padding(**b))
            .count();

        if padding > constants::MAX_TRANSPORT_PADDING {
            return Err(crate::Error::MalformedBody(BodyViolation::InvalidDelimiter));
        }

        match &self.buf[padding..] {
            [b'\r', b'\n', ..] => {
                self.discard(padding + constants::CRLF.len());
                Ok(true)
            }
            [] | [b'\r'] if !self.eof => Ok(false),
            [] | [b'\r'] => Err(crate::Error::MalformedBody(BodyViolation::UnexpectedEof)),
            _ => Err(crate::Error::MalformedBody(BodyViolation::InvalidDelimiter)),
        }
    }

    /// Reads the next piece of a part's body.
    ///
    /// Yields `(true, bytes)` when the delimiter ending the part was reached; the buffer is then
    /// positioned at `--boundary`. Bytes that may be the start of a delimiter are held back.
    pub fn read_field_data(&mut self, delimiter: &[u8]) -> crate::Result<Option<(bool, Bytes)>> {
        log::trace!("finding next part delimiter in {} buffered bytes", self.buf.len());

        if self.buf.is_empty() {
            return if self.eof {
                Err(crate::Error::MalformedBody(BodyViolation::UnexpectedEof))
            } else {
                Ok(None)
            };
        }

        match find_delimiter(&self.buf, delimiter, self.eof) {
            Delimiter::Found(idx) => {
                let bytes = self.buf.split_to(idx).freeze();

                // discard \r\n.
                self.discard(constants::CRLF.len());

                Ok(Some((true, bytes)))
            }
            Delimiter::Absent(_) if self.eof => Err(crate::Error::MalformedBody(BodyViolation::UnexpectedEof)),
            Delimiter::Partial(0) | Delimiter::Absent(0) => Ok(None),
            Delimiter::Partial(idx) | Delimiter::Absent(idx) => Ok(Some((false, self.buf.split_to(idx).freeze()))),
        }
    }
}

impl fmt::Debug for StreamBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("eof", &self.eof)
            .field("buffered", &self.buf.len())
            .field("stream_size_counter", &self.stream_size_counter)
            .finish()
    }
}
