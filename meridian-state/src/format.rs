//! On-disk encoding of state snapshots.
//!
//! Every state file is `header | body | footer`:
//!
//! - Header: the codec name `"state"` (length-prefixed) and a `u32` file
//!   format version. Version 2 is current; version 1 files are accepted
//!   read-only.
//! - Body, version 2: a varint protocol version followed by the bincode
//!   serialization of the payload. Version 1: an `i32` content-type tag
//!   followed by a JSON payload.
//! - Footer: CRC32 over every preceding byte.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StateError};

/// Codec name written into every state file header.
pub const STATE_CODEC: &str = "state";

/// Current file format version.
pub const STATE_FILE_VERSION: u32 = 2;

/// Oldest file format version we can still read.
pub const LEGACY_FILE_VERSION: u32 = 1;

/// Content-type tag used by version-1 files (JSON was the only variant).
const LEGACY_CONTENT_TYPE_JSON: i32 = 0;

/// Append a LEB128 varint.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
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

/// Read a LEB128 varint, returning the value and the number of bytes consumed.
pub fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Encode a payload into the versioned envelope shared by state files and
/// the wire: a varint protocol version followed by the bincode payload.
pub fn encode_payload<T: Serialize>(value: &T, protocol_version: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_varint(&mut buf, protocol_version);
    let body = bincode::serialize(value)?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode a payload from the versioned envelope, returning the value and the
/// protocol version the peer (or the file) wrote it with.
pub fn decode_payload<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, u64)> {
    let (version, consumed) = read_varint(buf)
        .ok_or_else(|| StateError::Serialization("truncated protocol version".to_string()))?;
    let value = bincode::deserialize(&buf[consumed..])?;
    Ok((value, version))
}

/// Encode a complete state file: header, versioned body, CRC32 footer.
pub fn encode_state_file<T: Serialize>(value: &T, protocol_version: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.push(STATE_CODEC.len() as u8);
    buf.extend_from_slice(STATE_CODEC.as_bytes());
    buf.extend_from_slice(&STATE_FILE_VERSION.to_le_bytes());
    let body = encode_payload(value, protocol_version)?;
    buf.extend_from_slice(&body);
    let checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

/// Decode and verify a complete state file.
///
/// The whole-file checksum is verified before any parsing happens; a
/// mismatch, a truncated file, or an unknown header all report
/// [`StateError::Corrupt`] with `path` as context.
pub fn decode_state_file<T: DeserializeOwned>(bytes: &[u8], path: &str) -> Result<T> {
    // Smallest possible file: 1-byte codec length, empty codec, version, crc.
    if bytes.len() < 1 + 4 + 4 {
        return Err(StateError::corrupt(path, "truncated file"));
    }

    let (content, footer) = bytes.split_at(bytes.len() - 4);
    let expected = u32::from_le_bytes(footer.try_into().expect("footer is four bytes"));
    let actual = crc32fast::hash(content);
    if actual != expected {
        return Err(StateError::corrupt(
            path,
            format!("checksum mismatch (expected {expected:#010x}, got {actual:#010x})"),
        ));
    }

    let codec_len = content[0] as usize;
    if content.len() < 1 + codec_len + 4 {
        return Err(StateError::corrupt(path, "truncated header"));
    }
    let codec = &content[1..1 + codec_len];
    if codec != STATE_CODEC.as_bytes() {
        return Err(StateError::corrupt(
            path,
            format!("unexpected codec {:?}", String::from_utf8_lossy(codec)),
        ));
    }

    let version_start = 1 + codec_len;
    let version = u32::from_le_bytes(
        content[version_start..version_start + 4]
            .try_into()
            .expect("version is four bytes"),
    );
    let body = &content[version_start + 4..];

    match version {
        STATE_FILE_VERSION => {
            let (value, _protocol) = decode_payload(body)?;
            Ok(value)
        }
        LEGACY_FILE_VERSION => decode_legacy_body(body, path),
        other => Err(StateError::corrupt(
            path,
            format!("unsupported state file version {other}"),
        )),
    }
}

fn decode_legacy_body<T: DeserializeOwned>(body: &[u8], path: &str) -> Result<T> {
    if body.len() < 4 {
        return Err(StateError::corrupt(path, "truncated legacy body"));
    }
    let content_type = i32::from_le_bytes(body[..4].try_into().expect("tag is four bytes"));
    if content_type != LEGACY_CONTENT_TYPE_JSON {
        return Err(StateError::corrupt(
            path,
            format!("unknown legacy content type {content_type}"),
        ));
    }
    Ok(serde_json::from_slice(&body[4..])?)
}

/// Encode a version-1 state file. Only used by tests and migration tooling;
/// production writes always use the current version.
pub fn encode_legacy_state_file<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.push(STATE_CODEC.len() as u8);
    buf.extend_from_slice(STATE_CODEC.as_bytes());
    buf.extend_from_slice(&LEGACY_FILE_VERSION.to_le_bytes());
    buf.extend_from_slice(&LEGACY_CONTENT_TYPE_JSON.to_le_bytes());
    let body = serde_json::to_vec(value)?;
    buf.extend_from_slice(&body);
    let checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}
