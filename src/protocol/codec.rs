//! Field-level encoding shared by peer frames and client messages.
//!
//! All integers are big-endian `i32`. Strings and JSON blobs are written as
//! `[4B length][bytes]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{MAX_FRAME_LEN, ProtocolError};

fn ensure(buf: &Bytes, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_i32(buf: &mut Bytes) -> Result<i32, ProtocolError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

/// Reads a length-prefixed byte run.
pub fn get_len_prefixed(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = get_i32(buf)?;
    if len < 0 || len as usize > MAX_FRAME_LEN {
        return Err(ProtocolError::InvalidLength(len as i64));
    }
    let len = len as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

pub fn get_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = get_len_prefixed(buf)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

pub fn get_json<T: DeserializeOwned>(buf: &mut Bytes) -> Result<T, ProtocolError> {
    let raw = get_len_prefixed(buf)?;
    Ok(serde_json::from_slice(&raw)?)
}

pub fn put_len_prefixed(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_len_prefixed(buf, value.as_bytes());
}

pub fn put_json<T: Serialize>(buf: &mut BytesMut, value: &T) -> Result<(), ProtocolError> {
    let encoded = serde_json::to_vec(value)?;
    put_len_prefixed(buf, &encoded);
    Ok(())
}

/// Port numbers travel as `i32`; anything outside `u16` is rejected.
pub fn get_port(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    let raw = get_i32(buf)?;
    u16::try_from(raw).map_err(|_| ProtocolError::InvalidField {
        field: "port",
        reason: format!("{} is not a valid port", raw),
    })
}
