//! Schema-registry value framing: magic byte `0`, big-endian `u32` schema id,
//! then the Avro binary body.

use bytes::{BufMut, Bytes, BytesMut};

use super::SchemaError;

pub const MAGIC_BYTE: u8 = 0;
pub const HEADER_LEN: usize = 5;

/// Split a framed value into its schema id and Avro body.
pub fn unframe(value: &[u8]) -> Result<(u32, &[u8]), SchemaError> {
    if value.len() < HEADER_LEN {
        return Err(SchemaError::SchemaMismatch(format!(
            "value of {} bytes is shorter than the {HEADER_LEN}-byte schema header",
            value.len()
        )));
    }
    if value[0] != MAGIC_BYTE {
        return Err(SchemaError::SchemaMismatch(format!(
            "unknown magic byte {:#04x} in schema header",
            value[0]
        )));
    }

    let id = u32::from_be_bytes([value[1], value[2], value[3], value[4]]);
    Ok((id, &value[HEADER_LEN..]))
}

pub fn frame(schema_id: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u8(MAGIC_BYTE);
    buf.put_u32(schema_id);
    buf.put_slice(body);
    buf.freeze()
}
