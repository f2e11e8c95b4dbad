// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! Field-level encoding primitives. All integers are little-endian, all
//! fields are 32- or 64-bit aligned widths.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtocolError;

/// Anything that can be written to and read from a frame payload.
pub trait Wire: Sized {
    fn encode(&self, buf: &mut BytesMut);
    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError>;
}

pub(crate) fn get_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::Truncated);
    }

    Ok(buf.get_u8())
}

pub(crate) fn get_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }

    Ok(buf.get_u32_le())
}

pub(crate) fn get_i32(buf: &mut Bytes) -> Result<i32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }

    Ok(buf.get_i32_le())
}

pub(crate) fn get_u64(buf: &mut Bytes) -> Result<u64, ProtocolError> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::Truncated);
    }

    Ok(buf.get_u64_le())
}

pub(crate) fn get_i64(buf: &mut Bytes) -> Result<i64, ProtocolError> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::Truncated);
    }

    Ok(buf.get_i64_le())
}

pub(crate) fn get_f32(buf: &mut Bytes) -> Result<f32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }

    Ok(buf.get_f32_le())
}

pub(crate) fn get_bool(buf: &mut Bytes) -> Result<bool, ProtocolError> {
    Ok(get_u32(buf)? != 0)
}

pub(crate) fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u32_le(v as u32);
}

/// Strings are a u32 byte length followed by utf-8 bytes, unpadded.
pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_string(buf: &mut Bytes, max: usize) -> Result<String, ProtocolError> {
    let len = get_u32(buf)? as usize;
    if len > max {
        return Err(ProtocolError::OversizeField("string", len, max));
    } else if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }

    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidMessage)
}

pub(crate) fn put_byte_vec(buf: &mut BytesMut, v: &[u8]) {
    buf.put_u32_le(v.len() as u32);
    buf.put_slice(v);
}

pub(crate) fn get_byte_vec(buf: &mut Bytes, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let len = get_u32(buf)? as usize;
    if len > max {
        return Err(ProtocolError::OversizeField("bytes", len, max));
    } else if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }

    Ok(buf.split_to(len).to_vec())
}

pub(crate) fn get_vec<T: Wire>(
    buf: &mut Bytes,
    max: usize,
    what: &'static str,
) -> Result<Vec<T>, ProtocolError> {
    let len = get_u32(buf)? as usize;
    if len > max {
        return Err(ProtocolError::OversizeField(what, len, max));
    }

    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(T::decode(buf)?);
    }

    Ok(out)
}

pub(crate) fn put_vec<T: Wire>(buf: &mut BytesMut, v: &[T]) {
    buf.put_u32_le(v.len() as u32);
    for item in v {
        item.encode(buf);
    }
}
