// Reading and writing JDWP data types
//
// Command payloads arrive as byte slices; replies and events are built in
// `BytesMut`. Everything is big-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::{AgentError, AgentResult};

fn need(buf: &&[u8], bytes: usize, what: &str) -> AgentResult<()> {
    if buf.remaining() < bytes {
        return Err(AgentError::Malformed(format!(
            "not enough data for {what}: expected {bytes}, got {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn read_u8(buf: &mut &[u8]) -> AgentResult<u8> {
    need(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

pub fn read_bool(buf: &mut &[u8]) -> AgentResult<bool> {
    Ok(read_u8(buf)? != 0)
}

pub fn read_i32(buf: &mut &[u8]) -> AgentResult<i32> {
    need(buf, 4, "i32")?;
    Ok(buf.get_i32())
}

pub fn read_u64(buf: &mut &[u8]) -> AgentResult<u64> {
    need(buf, 8, "u64")?;
    Ok(buf.get_u64())
}

/// Read a JDWP string: 4-byte length prefix + UTF-8 bytes.
pub fn read_string(buf: &mut &[u8]) -> AgentResult<String> {
    need(buf, 4, "string length")?;
    let len = buf.get_u32() as usize;
    need(buf, len, "string body")?;

    let bytes = &buf[..len];
    buf.advance(len);

    String::from_utf8(bytes.to_vec())
        .map_err(|e| AgentError::Malformed(format!("invalid UTF-8 in string: {e}")))
}

/// Write a JDWP string: 4-byte length prefix + UTF-8 bytes.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Write a fixed-width identifier.
pub fn write_id(buf: &mut BytesMut, id: u64) {
    buf.put_u64(id);
}

/// Write a {1-byte kind tag, fixed-width identifier} pair.
pub fn write_tagged_id(buf: &mut BytesMut, tag: u8, id: u64) {
    buf.put_u8(tag);
    buf.put_u64(id);
}
