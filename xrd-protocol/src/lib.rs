// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! The control-socket wire format for the xrd runtime service.
//!
//! Every datagram is one frame: a 16-byte little-endian header followed by
//! the payload. Requests and replies are paired one-to-one by sequence
//! number; a reply's opcode is the request's with the high bit set, and its
//! payload leads with a status word. Event frames use the `0xFF` opcode
//! prefix and lead with a timestamp. OS handles (fds) ride out-of-band as
//! ancillary data, flagged in the header.

mod messages;
mod types;
mod wire;

pub use messages::*;
pub use types::*;
pub use wire::Wire;

use bytes::{BufMut, Bytes, BytesMut};

/// Frame header size: length, sequence, opcode, flags.
pub const HEADER_LEN: usize = 16;
/// Upper bound on a whole frame, header included.
pub const MAX_MESSAGE_SIZE: usize = 65536;
/// Set on a reply's opcode.
pub const REPLY_BIT: u32 = 0x8000_0000;
/// The high byte of every event opcode.
pub const EVENT_PREFIX: u32 = 0xFF00_0000;
/// Header flag bit 0: ancillary data carries OS handles.
pub const FLAG_HAS_HANDLES: u32 = 1 << 0;
/// Diagnostic strings on failing replies are capped at this many bytes.
pub const MAX_DIAGNOSTIC: usize = 256;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("short buffer, need {0} bytes")]
    ShortBuffer(usize),
    #[error("truncated payload")]
    Truncated,
    #[error("invalid message")]
    InvalidMessage,
    #[error("invalid opcode: {0:#010x}")]
    InvalidOpcode(u32),
    #[error("invalid {0} value: {1}")]
    InvalidEnum(&'static str, u32),
    #[error("oversize {0} field: {1} > {2}")]
    OversizeField(&'static str, usize, usize),
    #[error("frame length {header} does not match datagram length {actual}")]
    LengthMismatch { header: u32, actual: usize },
    #[error("message too large to encode")]
    Oversize,
}

/// Status word leading every reply payload.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    /// `begin_frame` only: the frame is valid but will not be shown.
    FrameDiscarded = 1,
    Validation = 2,
    CallOrder = 3,
    ResourceExhausted = 4,
    Timeout = 5,
    IpcFailure = 6,
    Runtime = 7,
    DeviceLost = 8,
}

impl Status {
    pub fn from_u32(v: u32) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(Status::Ok),
            1 => Ok(Status::FrameDiscarded),
            2 => Ok(Status::Validation),
            3 => Ok(Status::CallOrder),
            4 => Ok(Status::ResourceExhausted),
            5 => Ok(Status::Timeout),
            6 => Ok(Status::IpcFailure),
            7 => Ok(Status::Runtime),
            8 => Ok(Status::DeviceLost),
            _ => Err(ProtocolError::InvalidEnum("Status", v)),
        }
    }

    /// Ok and FrameDiscarded replies carry a message body; everything else
    /// carries a diagnostic string.
    pub fn is_success(self) -> bool {
        matches!(self, Status::Ok | Status::FrameDiscarded)
    }
}

// A simplified take on enum_dispatch, pairing each opcode with its body
// type. Replies are listed with the reply bit already set.
macro_rules! message_types {
    ($($num:expr => $variant:ident),*,) => {
        /// A request or reply body.
        #[derive(Clone, Debug, PartialEq)]
        pub enum Message {
            $($variant($variant)),*
        }

        impl std::fmt::Display for Message {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Message::$variant(_) => write!(f, "{:#x}:{}", $num, stringify!($variant))),*
                }
            }
        }

        impl Message {
            pub fn opcode(&self) -> u32 {
                match self {
                    $(Message::$variant(_) => $num),*
                }
            }

            fn encode_body(&self, buf: &mut BytesMut) {
                match self {
                    $(Message::$variant(v) => v.encode(buf)),*
                }
            }

            fn decode_body(opcode: u32, buf: &mut Bytes) -> Result<Self, ProtocolError> {
                match opcode {
                    $($num => Ok($variant::decode(buf)?.into())),*,
                    _ => Err(ProtocolError::InvalidOpcode(opcode)),
                }
            }
        }

        $(impl From<$variant> for Message {
            fn from(v: $variant) -> Self {
                Message::$variant(v)
            }
        })*
    };
}

message_types! {
    0x01 => InstanceCreate,
    0x02 => SystemGetProperties,
    0x03 => SessionCreate,
    0x04 => SwapchainCreate,
    0x05 => SwapchainAcquire,
    0x06 => SwapchainWait,
    0x07 => SwapchainRelease,
    0x08 => SwapchainDestroy,
    0x09 => BeginSession,
    0x0a => EndSession,
    0x0b => RequestExit,
    0x0c => WaitFrame,
    0x0d => BeginFrame,
    0x0e => EndFrame,
    0x0f => PollEvent,
    0x10 => ApplyHaptic,
    0x8000_0001u32 => InstanceCreated,
    0x8000_0002u32 => SystemProperties,
    0x8000_0003u32 => SessionCreated,
    0x8000_0004u32 => SwapchainCreated,
    0x8000_0005u32 => ImageAcquired,
    0x8000_0006u32 => ImageWaited,
    0x8000_0007u32 => ImageReleased,
    0x8000_0008u32 => SwapchainDestroyed,
    0x8000_0009u32 => SessionBegun,
    0x8000_000au32 => SessionEnded,
    0x8000_000bu32 => ExitRequested,
    0x8000_000cu32 => FrameWaited,
    0x8000_000du32 => FrameBegun,
    0x8000_000eu32 => FrameEnded,
    0x8000_000fu32 => EventPolled,
    0x8000_0010u32 => HapticApplied,
}

/// One decoded datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        sequence: u32,
        message: Message,
    },
    Reply {
        sequence: u32,
        status: Status,
        /// Present iff `status.is_success()`.
        message: Option<Message>,
        /// Empty unless the reply failed.
        diagnostic: String,
        has_handles: bool,
    },
    Event {
        sequence: u32,
        timestamp_ns: u64,
        event: EventPayload,
    },
}

fn finish_frame(
    buf: &mut BytesMut,
    start: usize,
    sequence: u32,
    opcode: u32,
    flags: u32,
) -> Result<usize, ProtocolError> {
    let len = buf.len() - start;
    if len > MAX_MESSAGE_SIZE {
        buf.truncate(start);
        return Err(ProtocolError::Oversize);
    }

    buf[start..start + 4].copy_from_slice(&(len as u32).to_le_bytes());
    buf[start + 4..start + 8].copy_from_slice(&sequence.to_le_bytes());
    buf[start + 8..start + 12].copy_from_slice(&opcode.to_le_bytes());
    buf[start + 12..start + 16].copy_from_slice(&flags.to_le_bytes());

    Ok(len)
}

fn begin_frame_header(buf: &mut BytesMut) -> usize {
    let start = buf.len();
    buf.put_bytes(0, HEADER_LEN);
    start
}

/// Appends a request frame to `buf`, returning its length.
pub fn encode_request(
    sequence: u32,
    message: &Message,
    buf: &mut BytesMut,
) -> Result<usize, ProtocolError> {
    let start = begin_frame_header(buf);
    message.encode_body(buf);
    finish_frame(buf, start, sequence, message.opcode(), 0)
}

/// Appends a successful reply frame. `status` must be a success status.
pub fn encode_reply(
    sequence: u32,
    status: Status,
    message: &Message,
    has_handles: bool,
    buf: &mut BytesMut,
) -> Result<usize, ProtocolError> {
    debug_assert!(status.is_success());
    debug_assert_ne!(message.opcode() & REPLY_BIT, 0);

    let flags = if has_handles { FLAG_HAS_HANDLES } else { 0 };
    let start = begin_frame_header(buf);
    buf.put_u32_le(status as u32);
    message.encode_body(buf);
    finish_frame(buf, start, sequence, message.opcode(), flags)
}

/// Appends a failing reply frame carrying a diagnostic in place of a body.
pub fn encode_error_reply(
    sequence: u32,
    request_opcode: u32,
    status: Status,
    diagnostic: &str,
    buf: &mut BytesMut,
) -> Result<usize, ProtocolError> {
    debug_assert!(!status.is_success());

    let diagnostic = truncate_utf8(diagnostic, MAX_DIAGNOSTIC);
    let start = begin_frame_header(buf);
    buf.put_u32_le(status as u32);
    buf.put_u32_le(diagnostic.len() as u32);
    buf.put_slice(diagnostic.as_bytes());
    finish_frame(buf, start, sequence, request_opcode | REPLY_BIT, 0)
}

/// Appends an unsolicited event frame.
pub fn encode_event(
    sequence: u32,
    timestamp_ns: u64,
    event: &EventPayload,
    buf: &mut BytesMut,
) -> Result<usize, ProtocolError> {
    let start = begin_frame_header(buf);
    buf.put_u64_le(timestamp_ns);
    event.encode_body(buf);
    finish_frame(buf, start, sequence, EVENT_PREFIX | event.kind(), 0)
}

/// Decodes one datagram. The datagram must be exactly one frame.
pub fn decode_frame(datagram: &[u8]) -> Result<Frame, ProtocolError> {
    if datagram.len() < HEADER_LEN {
        return Err(ProtocolError::ShortBuffer(HEADER_LEN));
    }

    let mut buf = Bytes::copy_from_slice(datagram);
    let length = buf.split_to(4);
    let length = u32::from_le_bytes(length.as_ref().try_into().unwrap());
    let sequence = u32::from_le_bytes(buf.split_to(4).as_ref().try_into().unwrap());
    let opcode = u32::from_le_bytes(buf.split_to(4).as_ref().try_into().unwrap());
    let flags = u32::from_le_bytes(buf.split_to(4).as_ref().try_into().unwrap());

    if length as usize != datagram.len() || length as usize > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::LengthMismatch {
            header: length,
            actual: datagram.len(),
        });
    }

    if opcode & EVENT_PREFIX == EVENT_PREFIX {
        let timestamp_ns = wire::get_u64(&mut buf)?;
        let event = EventPayload::decode_body(opcode & !EVENT_PREFIX, &mut buf)?;

        return Ok(Frame::Event {
            sequence,
            timestamp_ns,
            event,
        });
    }

    if opcode & REPLY_BIT != 0 {
        let status = Status::from_u32(wire::get_u32(&mut buf)?)?;
        let (message, diagnostic) = if status.is_success() {
            (Some(Message::decode_body(opcode, &mut buf)?), String::new())
        } else {
            (None, wire::get_string(&mut buf, MAX_DIAGNOSTIC)?)
        };

        return Ok(Frame::Reply {
            sequence,
            status,
            message,
            diagnostic,
            has_handles: flags & FLAG_HAS_HANDLES != 0,
        });
    }

    Ok(Frame::Request {
        sequence,
        message: Message::decode_body(opcode, &mut buf)?,
    })
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }

    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }

    &s[..end]
}
