//! Big-endian primitives shared by every API body.
//!
//! Strings carry an int16 length, byte blobs and arrays an int32 length/count. A length of
//! `-1` is the protocol's null marker and decodes as an empty value.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::KafkaError;
use crate::Result;

/// Write an int16 length-prefixed string. An empty string is written with length 0.
pub fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = i16::try_from(s.len())
        .map_err(|_| KafkaError::protocol(format!("string of {} bytes is too long", s.len())))?;
    buf.put_i16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Write an int32 length-prefixed byte blob.
pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<()> {
    let len = i32::try_from(bytes.len())
        .map_err(|_| KafkaError::protocol(format!("blob of {} bytes is too long", bytes.len())))?;
    buf.put_i32(len);
    buf.put_slice(bytes);
    Ok(())
}

/// Write a nullable byte blob; an empty slice is written as null (-1).
pub fn put_nullable_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        buf.put_i32(-1);
        Ok(())
    } else {
        put_bytes(buf, bytes)
    }
}

/// Write an int32 count followed by each element.
pub fn put_array<T, F>(buf: &mut BytesMut, items: &[T], mut f: F) -> Result<()>
where
    F: FnMut(&mut BytesMut, &T) -> Result<()>,
{
    let len = i32::try_from(items.len())
        .map_err(|_| KafkaError::protocol("array has too many elements"))?;
    buf.put_i32(len);
    for item in items {
        f(buf, item)?;
    }
    Ok(())
}

/// Write a field that must be present, rejecting empty values.
pub fn put_required_string(buf: &mut BytesMut, field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(KafkaError::protocol(format!("required field `{}` is missing", field)));
    }
    put_string(buf, value)
}

/// Cursor over a response body.
#[derive(Debug, Clone)]
pub struct Reader {
    buf: Bytes,
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, needed: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(KafkaError::protocol(format!(
                "not enough bytes for {}: need {}, have {}",
                what,
                needed,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn i8(&mut self) -> Result<i8> {
        self.ensure(1, "int8")?;
        Ok(self.buf.get_i8())
    }

    pub fn i16(&mut self) -> Result<i16> {
        self.ensure(2, "int16")?;
        Ok(self.buf.get_i16())
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.ensure(4, "int32")?;
        Ok(self.buf.get_i32())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.ensure(4, "uint32")?;
        Ok(self.buf.get_u32())
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.ensure(8, "int64")?;
        Ok(self.buf.get_i64())
    }

    /// Split off the next `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len, "byte run")?;
        Ok(self.buf.split_to(len))
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.i16()?;
        if len < 0 {
            return Ok(String::new());
        }
        let raw = self.take(len as usize)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| KafkaError::protocol(format!("invalid UTF-8 string: {}", e)))
    }

    pub fn bytes(&mut self) -> Result<Bytes> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(Bytes::new());
        }
        self.take(len as usize)
    }

    /// Read an int32 count and decode that many elements.
    pub fn array<T, F>(&mut self, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Reader) -> Result<T>,
    {
        let count = self.i32()?;
        if count == -1 {
            return Ok(Vec::new());
        }
        if count < 0 {
            return Err(KafkaError::protocol(format!("negative array count {}", count)));
        }
        // every element occupies at least one byte
        if count as usize > self.remaining() {
            return Err(KafkaError::protocol(format!(
                "array count {} exceeds remaining {} bytes",
                count,
                self.remaining()
            )));
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(f(self)?);
        }
        Ok(items)
    }

    pub fn into_inner(self) -> Bytes {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_string_and_null_string() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "group").unwrap();
        buf.put_i16(-1);
        let mut reader = Reader::new(buf.freeze());
        assert_eq!(reader.string().unwrap(), "group");
        assert_eq!(reader.string().unwrap(), "");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_empty_string_is_zero_length() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "").unwrap();
        assert_eq!(&buf[..], &[0, 0]);
    }

    #[test]
    fn test_null_bytes_and_array() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xFFFF_FFFF);
        buf.put_i32(-1);
        let mut reader = Reader::new(buf.freeze());
        assert!(reader.bytes().unwrap().is_empty());
        assert!(reader.array(|r| r.i32()).unwrap().is_empty());
    }

    #[test]
    fn test_negative_int16_decodes_signed() {
        let mut reader = Reader::new(Bytes::from_static(&[0xFF, 0xFE]));
        assert_eq!(reader.i16().unwrap(), -2);
    }

    #[test]
    fn test_truncated_input_is_protocol_error() {
        let mut reader = Reader::new(Bytes::from_static(&[0, 0, 0, 9, b'a']));
        assert_matches!(reader.bytes(), Err(KafkaError::ProtocolError(_)));
    }

    #[test]
    fn test_array_callback_error_propagates() {
        let mut buf = BytesMut::new();
        put_array(&mut buf, &[1i32, 2], |b, v| {
            b.put_i32(*v);
            Ok(())
        })
        .unwrap();
        let mut reader = Reader::new(buf.freeze());
        let result: Result<Vec<i64>> = reader.array(|r| r.i64());
        assert_matches!(result, Err(KafkaError::ProtocolError(_)));
    }

    #[test]
    fn test_required_string_rejects_empty() {
        let mut buf = BytesMut::new();
        assert_matches!(
            put_required_string(&mut buf, "group_id", ""),
            Err(KafkaError::ProtocolError(msg)) if msg.contains("group_id")
        );
    }
}
