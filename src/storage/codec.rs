//! Binary codec for events inside a block.
//!
//! Block payloads are a sequence of `[uvarint length][event bytes]`
//! entries; decode stops cleanly at the end of the slice. Event bytes
//! use fixed little-endian framing with length-prefixed strings.

use bytes::{Buf, BufMut};

use crate::error::{Result, SpectreError};
use crate::model::{Event, EventKind, ResourceRef};

/// Appends an unsigned LEB128 varint.
pub fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Reads an unsigned LEB128 varint, returning `None` at end of input.
pub fn read_uvarint(buf: &mut &[u8]) -> Result<Option<u64>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        if buf.is_empty() {
            return Err(SpectreError::Corruption("truncated varint".into()));
        }
        let byte = buf[0];
        *buf = &buf[1..];
        if shift >= 64 {
            return Err(SpectreError::Corruption("varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
}

fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    let len: u32 = bytes
        .len()
        .try_into()
        .map_err(|_| SpectreError::Validation("string length exceeds u32::MAX".into()))?;
    buf.put_u32_le(len);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_string(buf: &mut &[u8]) -> Result<String> {
    let len = read_exact_u32(buf)? as usize;
    if buf.len() < len {
        return Err(SpectreError::Corruption("truncated string".into()));
    }
    let (head, tail) = buf.split_at(len);
    let out = std::str::from_utf8(head)
        .map_err(|_| SpectreError::Corruption("string is not valid UTF-8".into()))?
        .to_string();
    *buf = tail;
    Ok(out)
}

fn read_exact_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.len() < 4 {
        return Err(SpectreError::Corruption("truncated u32".into()));
    }
    Ok(buf.get_u32_le())
}

fn read_exact_i64(buf: &mut &[u8]) -> Result<i64> {
    if buf.len() < 8 {
        return Err(SpectreError::Corruption("truncated i64".into()));
    }
    Ok(buf.get_i64_le())
}

fn read_exact_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.is_empty() {
        return Err(SpectreError::Corruption("truncated u8".into()));
    }
    Ok(buf.get_u8())
}

/// Encodes a single event (without the varint length prefix).
pub fn encode_event(event: &Event) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(&event.payload)?;
    let mut buf = Vec::with_capacity(payload.len() + 128);
    write_string(&mut buf, &event.id)?;
    buf.put_i64_le(event.timestamp);
    buf.put_u8(event.kind.to_u8());
    write_string(&mut buf, &event.resource.group)?;
    write_string(&mut buf, &event.resource.version)?;
    write_string(&mut buf, &event.resource.kind)?;
    write_string(&mut buf, &event.resource.namespace)?;
    write_string(&mut buf, &event.resource.name)?;
    write_string(&mut buf, &event.resource.uid)?;
    let payload_len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| SpectreError::Validation("payload exceeds u32::MAX bytes".into()))?;
    buf.put_u32_le(payload_len);
    buf.extend_from_slice(&payload);
    buf.put_u32_le(event.raw_size);
    match &event.involved_uid {
        Some(uid) => {
            buf.put_u8(1);
            write_string(&mut buf, uid)?;
        }
        None => buf.put_u8(0),
    }
    Ok(buf)
}

/// Decodes a single event from `buf`, consuming it fully.
pub fn decode_event(mut buf: &[u8]) -> Result<Event> {
    let id = read_string(&mut buf)?;
    let timestamp = read_exact_i64(&mut buf)?;
    let kind = EventKind::from_u8(read_exact_u8(&mut buf)?)?;
    let group = read_string(&mut buf)?;
    let version = read_string(&mut buf)?;
    let resource_kind = read_string(&mut buf)?;
    let namespace = read_string(&mut buf)?;
    let name = read_string(&mut buf)?;
    let uid = read_string(&mut buf)?;
    let payload_len = read_exact_u32(&mut buf)? as usize;
    if buf.len() < payload_len {
        return Err(SpectreError::Corruption("truncated payload".into()));
    }
    let (payload_bytes, mut tail) = buf.split_at(payload_len);
    let payload = serde_json::from_slice(payload_bytes)
        .map_err(|err| SpectreError::Corruption(format!("payload is not valid JSON: {err}")))?;
    let raw_size = read_exact_u32(&mut tail)?;
    let involved_uid = match read_exact_u8(&mut tail)? {
        0 => None,
        1 => Some(read_string(&mut tail)?),
        other => {
            return Err(SpectreError::Corruption(format!(
                "invalid involved-uid tag {other}"
            )))
        }
    };
    Ok(Event {
        id,
        timestamp,
        kind,
        resource: ResourceRef {
            group,
            version,
            kind: resource_kind,
            namespace,
            name,
            uid,
        },
        payload,
        raw_size,
        involved_uid,
    })
}

/// Appends `[uvarint length][event bytes]` for one event.
pub fn append_framed(buf: &mut Vec<u8>, event: &Event) -> Result<usize> {
    let encoded = encode_event(event)?;
    let before = buf.len();
    write_uvarint(buf, encoded.len() as u64);
    buf.extend_from_slice(&encoded);
    Ok(buf.len() - before)
}

/// Decodes every framed event in a decompressed block payload.
pub fn decode_framed(mut buf: &[u8]) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    while let Some(len) = read_uvarint(&mut buf)? {
        let len = len as usize;
        if buf.len() < len {
            return Err(SpectreError::Corruption(
                "framed event extends past block end".into(),
            ));
        }
        let (head, tail) = buf.split_at(len);
        events.push(decode_event(head)?);
        buf = tail;
    }
    Ok(events)
}
