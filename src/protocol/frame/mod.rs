//! Utilities to work with raw WebSocket frames.

pub mod coding;

#[allow(clippy::module_inception)]
mod frame;
mod mask;
pub(crate) mod utf8;

pub use self::{
    frame::{CloseFrame, Frame, FrameHeader},
    utf8::{Utf8Bytes, Utf8Validator},
};

use self::{
    coding::{Control, OpCode},
    mask::apply_mask_offset,
};
use crate::error::{CapacityError, Error, ProtocolError, Result};
use bytes::{Buf, Bytes, BytesMut};
use log::trace;

/// An incremental WebSocket frame parser.
///
/// Consumes from the session's read buffer as bytes arrive; between calls
/// it remembers how far into the frame it is, so the reader can be asked
/// for exactly the bytes still missing. Masked payloads are unmasked on
/// the fly while they are moved out of the read buffer.
#[derive(Debug)]
pub(crate) struct FrameParser {
    state: ParseState,
    header: FrameHeader,
    masked: bool,
    length_code: u8,
    payload_length: u64,
    payload: BytesMut,
    /// Whether incoming frames must be masked (server role) or must not
    /// be (client role).
    require_mask: bool,
    max_frame_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    BasicHeader,
    ExtendedLength,
    MaskKey,
    Payload,
}

impl FrameParser {
    pub(crate) fn new(require_mask: bool, max_frame_size: Option<usize>) -> Self {
        Self {
            state: ParseState::BasicHeader,
            header: FrameHeader::default(),
            masked: false,
            length_code: 0,
            payload_length: 0,
            payload: BytesMut::new(),
            require_mask,
            max_frame_size,
        }
    }

    /// How many bytes are required to make progress from the current state.
    pub(crate) fn bytes_needed(&self) -> usize {
        match self.state {
            ParseState::BasicHeader => 2,
            ParseState::ExtendedLength => match self.length_code {
                126 => 2,
                _ => 8,
            },
            ParseState::MaskKey => 4,
            ParseState::Payload => (self.payload_length as usize).saturating_sub(self.payload.len()),
        }
    }

    /// Forget any partial frame. Used between frames and to recover from
    /// errors raised while a frame was being processed.
    pub(crate) fn reset(&mut self) {
        self.state = ParseState::BasicHeader;
        self.header = FrameHeader::default();
        self.masked = false;
        self.length_code = 0;
        self.payload_length = 0;
        self.payload = BytesMut::new();
    }

    /// Advance as far as `buf` allows. Returns a complete frame once all
    /// of its bytes have been consumed, `None` if more input is needed.
    pub(crate) fn consume(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state {
                ParseState::BasicHeader => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    self.parse_basic_header(buf[0], buf[1])?;
                    buf.advance(2);
                }
                ParseState::ExtendedLength => {
                    let needed = self.bytes_needed();
                    if buf.len() < needed {
                        return Ok(None);
                    }
                    self.payload_length = match needed {
                        2 => u64::from(u16::from_be_bytes([buf[0], buf[1]])),
                        _ => {
                            let mut bytes = [0u8; 8];
                            bytes.copy_from_slice(&buf[..8]);
                            let length = u64::from_be_bytes(bytes);
                            if length >= 0x8000_0000_0000_0000 {
                                return Err(Error::Protocol(ProtocolError::InvalidPayloadLength));
                            }
                            length
                        }
                    };
                    buf.advance(needed);
                    self.state = self.checked_payload_state()?;
                }
                ParseState::MaskKey => {
                    if buf.len() < 4 {
                        return Ok(None);
                    }
                    let mut mask = [0u8; 4];
                    mask.copy_from_slice(&buf[..4]);
                    buf.advance(4);
                    self.header.mask = Some(mask);
                    self.state = ParseState::Payload;
                }
                ParseState::Payload => {
                    let missing = (self.payload_length as usize) - self.payload.len();
                    if missing > 0 {
                        if buf.is_empty() {
                            return Ok(None);
                        }
                        let offset = self.payload.len();
                        let mut chunk = buf.split_to(missing.min(buf.len()));
                        if let Some(mask) = self.header.mask {
                            apply_mask_offset(&mut chunk, mask, offset);
                        }
                        self.payload.unsplit(chunk);
                        if self.payload.len() < self.payload_length as usize {
                            return Ok(None);
                        }
                    }

                    let mut header = std::mem::take(&mut self.header);
                    // The payload has been unmasked above.
                    header.mask = None;
                    let payload = std::mem::take(&mut self.payload).freeze();
                    self.reset();
                    let frame = Frame::from_payload(header, payload);
                    trace!("received frame {frame}");
                    return Ok(Some(frame));
                }
            }
        }
    }

    fn parse_basic_header(&mut self, first: u8, second: u8) -> Result<()> {
        let header = FrameHeader {
            is_final: first & 0x80 != 0,
            rsv1: first & 0x40 != 0,
            rsv2: first & 0x20 != 0,
            rsv3: first & 0x10 != 0,
            opcode: OpCode::from(first & 0x0f),
            mask: None,
        };

        if header.rsv1 || header.rsv2 || header.rsv3 {
            return Err(Error::Protocol(ProtocolError::NonZeroReservedBits));
        }

        match header.opcode {
            OpCode::Data(coding::Data::Reserved(i)) | OpCode::Control(Control::Reserved(i)) => {
                return Err(Error::Protocol(ProtocolError::InvalidOpcode(i)));
            }
            _ => {}
        }

        self.masked = second & 0x80 != 0;
        if self.masked && !self.require_mask {
            return Err(Error::Protocol(ProtocolError::MaskedFrameFromServer));
        }
        if !self.masked && self.require_mask {
            return Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient));
        }

        self.length_code = second & 0x7f;

        if header.opcode.is_control() {
            if !header.is_final {
                return Err(Error::Protocol(ProtocolError::FragmentedControlFrame));
            }
            if self.length_code > 125 {
                return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
            }
        }

        self.header = header;
        self.state = if self.length_code >= 126 {
            ParseState::ExtendedLength
        } else {
            self.payload_length = u64::from(self.length_code);
            self.checked_payload_state()?
        };
        Ok(())
    }

    /// Validations that need the payload length, shared between the short
    /// and extended length paths.
    fn checked_payload_state(&mut self) -> Result<ParseState> {
        if self.header.opcode == OpCode::Control(Control::Close) && self.payload_length == 1 {
            return Err(Error::Protocol(ProtocolError::InvalidCloseSequence));
        }

        if let Some(max_size) = self.max_frame_size {
            if self.payload_length > max_size as u64 {
                return Err(Error::Capacity(CapacityError::FrameTooLong {
                    size: self.payload_length as usize,
                    max_size,
                }));
            }
        }

        // Sized from the claimed length, capped so a hostile length field
        // cannot force a huge allocation up front.
        self.payload = BytesMut::with_capacity((self.payload_length as usize).min(64 * 1024));
        Ok(if self.masked { ParseState::MaskKey } else { ParseState::Payload })
    }
}

/// Serializer for outgoing frames.
///
/// Frames are formatted into an internal buffer which the session flushes
/// to the socket in one write, so only a single write is ever in flight.
#[derive(Debug, Default)]
pub(crate) struct FrameWriter {
    out_buffer: Vec<u8>,
}

impl FrameWriter {
    /// Queue a frame for the next flush.
    pub(crate) fn queue(&mut self, frame: Frame) {
        trace!("queueing frame {frame}");
        self.out_buffer.reserve(frame.len());
        frame.format_into(&mut self.out_buffer);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.out_buffer.is_empty()
    }

    /// Hand the queued bytes to the caller for writing, leaving the
    /// buffer empty.
    pub(crate) fn take(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.out_buffer))
    }
}
