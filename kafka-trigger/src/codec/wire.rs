//! Kafka protocol primitives: big-endian fixed-width integers, zig-zag
//! varints, length-prefixed strings and byte arrays.
//!
//! Every read is bounds-checked and returns `CodecError::Truncated` instead of
//! panicking, so callers can map short buffers onto their own error kind.

use bytes::{BufMut, Bytes, BytesMut};

use super::CodecError;

pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if len > self.remaining() {
            return Err(CodecError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_i8(&mut self) -> Result<i8, CodecError> {
        Ok(i8::from_be_bytes(self.take_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    /// Unsigned LEB128 followed by zig-zag decoding, as used for record fields.
    pub fn read_varlong(&mut self) -> Result<i64, CodecError> {
        let mut raw: u64 = 0;
        for shift in (0..70).step_by(7) {
            let [byte] = self.take_array::<1>()?;
            if shift == 63 && byte > 1 {
                return Err(CodecError::InvalidVarint);
            }
            raw |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64));
            }
        }
        Err(CodecError::InvalidVarint)
    }

    pub fn read_varint(&mut self) -> Result<i32, CodecError> {
        i32::try_from(self.read_varlong()?).map_err(|_| CodecError::InvalidVarint)
    }

    /// Varint-length-prefixed bytes where a negative length means null.
    pub fn read_var_bytes(&mut self) -> Result<Option<Bytes>, CodecError> {
        let len = self.read_varint()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(self.take(len as usize)?)))
    }

    /// i16-length-prefixed string where -1 means null.
    pub fn read_nullable_string(&mut self) -> Result<Option<String>, CodecError> {
        let len = self.read_i16()?;
        if len < 0 {
            return Ok(None);
        }
        let raw = self.take(len as usize)?;
        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|_| CodecError::MalformedMessage("string is not valid UTF-8".to_string()))
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        self.read_nullable_string()?
            .ok_or_else(|| CodecError::MalformedMessage("unexpected null string".to_string()))
    }

    /// i32-length-prefixed bytes where -1 means null.
    pub fn read_nullable_bytes(&mut self) -> Result<Option<Bytes>, CodecError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(self.take(len as usize)?)))
    }

    /// i32 array length where -1 (null) reads as zero elements.
    pub fn read_array_len(&mut self) -> Result<usize, CodecError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(0);
        }
        Ok(len as usize)
    }
}

pub(crate) fn put_varlong(buf: &mut BytesMut, value: i64) {
    let mut raw = ((value << 1) ^ (value >> 63)) as u64;
    while raw >= 0x80 {
        buf.put_u8((raw as u8 & 0x7f) | 0x80);
        raw >>= 7;
    }
    buf.put_u8(raw as u8);
}

pub(crate) fn put_varint(buf: &mut BytesMut, value: i32) {
    put_varlong(buf, i64::from(value));
}

pub(crate) fn put_var_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            put_varint(buf, bytes.len() as i32);
            buf.put_slice(bytes);
        }
        None => put_varint(buf, -1),
    }
}

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_i16(value.len() as i16);
    buf.put_slice(value.as_bytes());
}

pub(crate) fn put_nullable_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            buf.put_i32(bytes.len() as i32);
            buf.put_slice(bytes);
        }
        None => buf.put_i32(-1),
    }
}
