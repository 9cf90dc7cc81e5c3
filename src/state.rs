use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::buffer::StreamBuffer;
use crate::constants;
use crate::error::BodyViolation;

pub(crate) struct MultipartState<'r> {
    pub(crate) buffer: StreamBuffer<'r>,
    pub(crate) boundary: String,
    pub(crate) dash_boundary: Vec<u8>,
    pub(crate) delimiter: Vec<u8>,
    pub(crate) stage: StreamingStage,
    pub(crate) is_prev_field_consumed: bool,
    pub(crate) next_field_waker: Option<Waker>,
    pub(crate) next_field_idx: usize,
    pub(crate) curr_field_name: Option<String>,
    pub(crate) curr_field_size_limit: u64,
    pub(crate) curr_field_size_counter: u64,
    pub(crate) cancellation: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamingStage {
    FindingFirstBoundary,
    ReadingBoundary,
    DeterminingBoundaryType,
    ReadingTransportPadding,
    ReadingFieldHeaders,
    ReadingFieldData,
    CleaningPrevFieldData,
    Eof,
    Cancelled,
}

/// What the scanner produced while advancing towards the next part.
pub(crate) enum Scan {
    /// More bytes from the stream are required.
    NeedMore,
    /// The close delimiter was reached.
    End,
    /// The raw header block of the next part.
    Headers(Bytes),
}

impl<'r> MultipartState<'r> {
    pub(crate) fn new(buffer: StreamBuffer<'r>, boundary: String, per_field_limit: u64) -> Self {
        let mut dash_boundary = constants::BOUNDARY_EXT.as_bytes().to_vec();
        dash_boundary.extend_from_slice(boundary.as_bytes());

        MultipartState {
            buffer,
            delimiter: constants::delimiter_for(&boundary),
            dash_boundary,
            boundary,
            stage: StreamingStage::FindingFirstBoundary,
            is_prev_field_consumed: true,
            next_field_waker: None,
            next_field_idx: 0,
            curr_field_name: None,
            curr_field_size_limit: per_field_limit,
            curr_field_size_counter: 0,
            cancellation: None,
        }
    }

    pub(crate) fn cancel_on(&mut self, token: CancellationToken) {
        self.cancellation = Some(Box::pin(token.cancelled_owned()));
    }

    /// Checks the cancellation signal, registering the task to be woken when it fires.
    pub(crate) fn poll_cancelled(&mut self, cx: &mut Context<'_>) -> bool {
        if self.stage == StreamingStage::Cancelled {
            return true;
        }

        let fired = match self.cancellation.as_mut() {
            Some(cancellation) => cancellation.as_mut().poll(cx).is_ready(),
            None => false,
        };

        if fired {
            log::debug!("multipart stream with boundary {:?} cancelled", self.boundary);
            self.stage = StreamingStage::Cancelled;
            self.cancellation = None;
            self.wake_next_field();
        }

        fired
    }

    pub(crate) fn wake_next_field(&mut self) {
        if let Some(waker) = self.next_field_waker.take() {
            waker.wake();
        }
    }

    /// Drives the scanner from its current stage up to the next part's header block.
    pub(crate) fn scan(&mut self, max_header_bytes: usize) -> crate::Result<Scan> {
        loop {
            match self.stage {
                StreamingStage::FindingFirstBoundary => {
                    if !self.buffer.skip_preamble(&self.dash_boundary, &self.delimiter)? {
                        return Ok(Scan::NeedMore);
                    }
                    self.set_stage(StreamingStage::ReadingBoundary);
                }
                // A part that was rejected or dropped unread is skipped up to its delimiter.
                StreamingStage::ReadingFieldData | StreamingStage::CleaningPrevFieldData => match self.buffer.read_field_data(&self.delimiter)? {
                    Some((true, _)) => self.set_stage(StreamingStage::ReadingBoundary),
                    Some((false, _)) => {}
                    None => return Ok(Scan::NeedMore),
                },
                StreamingStage::ReadingBoundary => {
                    let boundary_bytes = match self.buffer.read_exact(self.dash_boundary.len()) {
                        Some(bytes) => bytes,
                        None if self.buffer.eof => {
                            return Err(crate::Error::MalformedBody(BodyViolation::UnexpectedEof));
                        }
                        None => return Ok(Scan::NeedMore),
                    };

                    if boundary_bytes[..] != self.dash_boundary[..] {
                        return Err(crate::Error::MalformedBody(BodyViolation::InvalidDelimiter));
                    }

                    self.set_stage(StreamingStage::DeterminingBoundaryType);
                }
                StreamingStage::DeterminingBoundaryType => {
                    let is_close = match self.buffer.peek(constants::BOUNDARY_EXT.len()) {
                        Some(ext) => ext == constants::BOUNDARY_EXT.as_bytes(),
                        None if self.buffer.eof => {
                            return Err(crate::Error::MalformedBody(BodyViolation::UnexpectedEof));
                        }
                        None => return Ok(Scan::NeedMore),
                    };

                    if is_close {
                        self.buffer.discard(constants::BOUNDARY_EXT.len());
                        self.set_stage(StreamingStage::Eof);
                        return Ok(Scan::End);
                    }

                    self.set_stage(StreamingStage::ReadingTransportPadding);
                }
                StreamingStage::ReadingTransportPadding => {
                    if !self.buffer.read_transport_padding()? {
                        return Ok(Scan::NeedMore);
                    }
                    self.set_stage(StreamingStage::ReadingFieldHeaders);
                }
                StreamingStage::ReadingFieldHeaders => {
                    return match self.buffer.read_header_block(max_header_bytes)? {
                        Some(header_bytes) => {
                            self.set_stage(StreamingStage::ReadingFieldData);
                            Ok(Scan::Headers(header_bytes))
                        }
                        None => Ok(Scan::NeedMore),
                    };
                }
                StreamingStage::Eof => return Ok(Scan::End),
                StreamingStage::Cancelled => return Err(crate::Error::Cancelled),
            }
        }
    }

    fn set_stage(&mut self, stage: StreamingStage) {
        log::trace!("multipart stage {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }
}
