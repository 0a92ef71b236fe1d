//! Message sets: the record format shared by Produce and Fetch.
//!
//! ```text
//! MessageSet => [offset:int64 message_size:int32 message]
//! Message    => crc:uint32 magic:int8 attributes:int8 [timestamp:int64 if magic 1] key:bytes value:bytes
//! ```
//!
//! The CRC covers everything after itself. Compressed messages wrap a nested message set in
//! their value; decoding flattens the nested records into the outer list in order.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, warn};

use super::wire::{self, Reader};
use crate::error::KafkaError;
use crate::Result;

const COMPRESSION_MASK: i8 = 0x07;

/// Compression codec selected by the low three bits of the attributes byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
}

impl Compression {
    pub fn from_attributes(attributes: i8) -> Result<Self> {
        match attributes & COMPRESSION_MASK {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Snappy),
            other => Err(KafkaError::protocol(format!(
                "unknown compression codec {}",
                other
            ))),
        }
    }

    pub fn attribute_bits(self) -> i8 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Snappy => 2,
        }
    }
}

/// One record of a message set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub offset: i64,
    pub magic: i8,
    pub attributes: i8,
    /// Present for magic 1 records.
    pub timestamp: Option<i64>,
    pub key: Bytes,
    pub value: Bytes,
}

impl Message {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            offset: 0,
            magic: 0,
            attributes: 0,
            timestamp: None,
            key: Bytes::new(),
            value: value.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.magic = 1;
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_i8(self.magic);
        buf.put_i8(self.attributes);
        if self.magic >= 1 {
            buf.put_i64(self.timestamp.unwrap_or(-1));
        }
        wire::put_nullable_bytes(buf, &self.key)?;
        wire::put_nullable_bytes(buf, &self.value)?;
        Ok(())
    }
}

/// Encode `messages` as a message set, wrapping them in one compressed record unless
/// `compression` is [`Compression::None`].
pub fn encode_message_set(
    buf: &mut BytesMut,
    messages: &[Message],
    compression: Compression,
) -> Result<()> {
    match compression {
        Compression::None => {
            for message in messages {
                encode_entry(buf, message)?;
            }
            Ok(())
        }
        Compression::Gzip => {
            let mut inner = BytesMut::new();
            for message in messages {
                encode_entry(&mut inner, message)?;
            }
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&inner)?;
            let compressed = encoder.finish()?;
            let magic = messages.first().map(|m| m.magic).unwrap_or(0);
            let wrapper = Message {
                offset: messages.last().map(|m| m.offset).unwrap_or(0),
                magic,
                attributes: Compression::Gzip.attribute_bits(),
                timestamp: messages.first().and_then(|m| m.timestamp),
                key: Bytes::new(),
                value: Bytes::from(compressed),
            };
            encode_entry(buf, &wrapper)
        }
        Compression::Snappy => Err(KafkaError::protocol(
            "snappy compression is not supported",
        )),
    }
}

fn encode_entry(buf: &mut BytesMut, message: &Message) -> Result<()> {
    let mut body = BytesMut::new();
    message.encode_body(&mut body)?;
    let crc = crc32fast::hash(&body);
    buf.put_i64(message.offset);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_u32(crc);
    buf.put_slice(&body);
    Ok(())
}

/// Decode a message set. A trailing partial message, which brokers send when a fetch hits
/// its byte limit, ends decoding without error.
pub fn decode_message_set(data: Bytes) -> Result<Vec<Message>> {
    let mut reader = Reader::new(data);
    let mut messages = Vec::new();
    while reader.remaining() >= 12 {
        let offset = reader.i64()?;
        let size = reader.i32()?;
        if size < 0 {
            return Err(KafkaError::protocol(format!("negative message size {}", size)));
        }
        let size = size as usize;
        if reader.remaining() < size {
            debug!(offset, size, "stopping at partial trailing message");
            break;
        }
        let raw = reader.take(size)?;
        let message = decode_message(offset, raw)?;
        match Compression::from_attributes(message.attributes)? {
            Compression::None => messages.push(message),
            Compression::Gzip => {
                let inflated = gunzip(&message.value)?;
                let inner = decode_message_set(inflated)?;
                messages.extend(absolute_offsets(&message, inner));
            }
            Compression::Snappy => {
                return Err(KafkaError::protocol(
                    "snappy compressed messages are not supported",
                ))
            }
        }
    }
    Ok(messages)
}

/// Magic 1 wrappers carry the offset of their last inner record and inner records carry
/// relative offsets; magic 0 inner records already hold absolute offsets.
fn absolute_offsets(wrapper: &Message, mut inner: Vec<Message>) -> Vec<Message> {
    if wrapper.magic >= 1 {
        if let Some(last) = inner.last().map(|m| m.offset) {
            let base = wrapper.offset - last;
            for message in &mut inner {
                message.offset += base;
            }
        }
    }
    inner
}

fn decode_message(offset: i64, raw: Bytes) -> Result<Message> {
    let size = raw.len();
    let mut reader = Reader::new(raw.clone());
    let crc = reader.u32()?;
    let computed = crc32fast::hash(&raw[4..]);
    if crc != computed {
        return Err(KafkaError::protocol(format!(
            "crc mismatch at offset {}: expected {:#010x}, computed {:#010x}",
            offset, crc, computed
        )));
    }
    let magic = reader.i8()?;
    let attributes = reader.i8()?;
    let body = reader.into_inner();

    if magic >= 1 {
        // The magic byte alone does not settle the layout, so a v1 parse whose length
        // disagrees with the declared size is retried with the v0 layout.
        match decode_fields(body.clone(), true) {
            Ok((timestamp, key, value, consumed)) if consumed + 6 == size => {
                return Ok(Message {
                    offset,
                    magic,
                    attributes,
                    timestamp,
                    key,
                    value,
                })
            }
            _ => warn!(offset, magic, "message does not fit the v1 layout, retrying as v0"),
        }
    }

    let (timestamp, key, value, _) = decode_fields(body, false)?;
    Ok(Message {
        offset,
        magic,
        attributes,
        timestamp,
        key,
        value,
    })
}

/// Returns timestamp, key, value and the number of bytes consumed.
fn decode_fields(body: Bytes, with_timestamp: bool) -> Result<(Option<i64>, Bytes, Bytes, usize)> {
    let total = body.len();
    let mut reader = Reader::new(body);
    let timestamp = if with_timestamp {
        Some(reader.i64()?)
    } else {
        None
    };
    let key = reader.bytes()?;
    let value = reader.bytes()?;
    Ok((timestamp, key, value, total - reader.remaining()))
}

fn gunzip(data: &[u8]) -> Result<Bytes> {
    let mut decoder = GzDecoder::new(data);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| KafkaError::protocol(format!("gzip decompression failed: {}", e)))?;
    Ok(Bytes::from(inflated))
}
