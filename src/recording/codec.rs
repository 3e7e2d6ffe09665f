// src/recording/codec.rs
//! Binary framing for recording parts
//!
//! A recording artifact is a plain concatenation of parts. Each part is
//! self-describing, so the reader never needs the upload manifest:
//!
//! ```text
//! part    := header body [padding]
//! header  := "ASRP" | version u8 | flags u8 | reserved u16
//!            | body_len u32 | padding_len u32 | crc32(body) u32
//! body    := event frame*            (zstd-compressed when flagged)
//! frame   := 0x01 | index u64 | len u32 | payload (JSON)
//! padding := 0xFF | len u32 | len zero bytes
//! ```
//!
//! All integers are big-endian. Padding lets the writer satisfy minimum
//! part sizes imposed by object stores; the decoder drops it.

use crate::recording::event::AuditEvent;
use crate::utils::errors::{AuditError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Magic bytes opening every part
pub const PART_MAGIC: [u8; 4] = *b"ASRP";

/// Current part format version
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed part header
pub const PART_HEADER_LEN: usize = 20;

/// Size of an event frame without its payload
pub const EVENT_FRAME_OVERHEAD: usize = 1 + 8 + 4;

/// Size of a padding frame without its zero bytes
pub const PADDING_FRAME_OVERHEAD: usize = 1 + 4;

/// Largest body a single part may declare (64 MiB)
pub const MAX_PART_BODY_LEN: usize = 64 * 1024 * 1024;

const FRAME_EVENT: u8 = 0x01;
const FRAME_PADDING: u8 = 0xFF;
const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Compression applied to part bodies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Store frames as-is
    None,

    /// zstd level 1
    Fast,

    /// zstd level 3
    #[default]
    Balanced,

    /// zstd level 19
    Best,
}

impl CompressionLevel {
    pub fn zstd_level(&self) -> Option<i32> {
        match self {
            CompressionLevel::None => None,
            CompressionLevel::Fast => Some(1),
            CompressionLevel::Balanced => Some(3),
            CompressionLevel::Best => Some(19),
        }
    }
}

/// Events recovered from one part
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPart {
    /// Events in encoded order
    pub events: Vec<AuditEvent>,

    /// Whether the part carried a padding frame
    pub padded: bool,
}

/// Append one event frame to `buf`, returning the number of bytes written
pub fn encode_event(buf: &mut BytesMut, event: &AuditEvent) -> Result<usize> {
    if event.index < 0 {
        return Err(AuditError::Serialization(format!(
            "negative event index {}",
            event.index
        )));
    }

    let payload = serde_json::to_vec(event)?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        AuditError::Serialization(format!("event payload of {} bytes is too large", payload.len()))
    })?;

    buf.reserve(EVENT_FRAME_OVERHEAD + payload.len());
    buf.put_u8(FRAME_EVENT);
    buf.put_u64(event.index as u64);
    buf.put_u32(len);
    buf.put_slice(&payload);

    Ok(EVENT_FRAME_OVERHEAD + payload.len())
}

/// Decode a run of event frames
pub fn decode_frames(mut body: &[u8]) -> Result<Vec<AuditEvent>> {
    let mut events = Vec::new();

    while body.has_remaining() {
        let tag = body.get_u8();
        if tag != FRAME_EVENT {
            return Err(AuditError::CorruptFrame(format!(
                "unexpected frame tag {:#04x}",
                tag
            )));
        }
        if body.remaining() < EVENT_FRAME_OVERHEAD - 1 {
            return Err(AuditError::CorruptFrame(format!(
                "truncated frame header ({} bytes left)",
                body.remaining()
            )));
        }

        let index = body.get_u64();
        let len = body.get_u32() as usize;
        if len > body.remaining() {
            return Err(AuditError::CorruptFrame(format!(
                "frame length {} exceeds remaining {} bytes",
                len,
                body.remaining()
            )));
        }
        let index = i64::try_from(index)
            .map_err(|_| AuditError::CorruptFrame(format!("event index {} out of range", index)))?;

        let mut event: AuditEvent = serde_json::from_slice(&body[..len]).map_err(|e| {
            AuditError::CorruptFrame(format!("undecodable event {}: {}", index, e))
        })?;
        event.index = index;
        body.advance(len);

        events.push(event);
    }

    Ok(events)
}

/// Tokio codec turning frame buffers into parts and byte streams back into
/// [`DecodedPart`]s
#[derive(Debug, Clone)]
pub struct PartCodec {
    compression: CompressionLevel,
    min_part_size: usize,
    max_body_len: usize,
}

impl Default for PartCodec {
    fn default() -> Self {
        Self::new(CompressionLevel::default(), 0)
    }
}

impl PartCodec {
    pub fn new(compression: CompressionLevel, min_part_size: usize) -> Self {
        Self {
            compression,
            min_part_size,
            max_body_len: MAX_PART_BODY_LEN,
        }
    }

    /// Lower the body size limit (encoded frames and decompressed bodies)
    pub fn with_max_body_len(mut self, max_body_len: usize) -> Self {
        self.max_body_len = max_body_len.min(MAX_PART_BODY_LEN);
        self
    }

    pub fn max_body_len(&self) -> usize {
        self.max_body_len
    }

    /// Codec used for reading; encoding settings do not affect decoding
    pub fn reader() -> Self {
        Self::default()
    }

    /// Seal encoded frames into a complete part
    pub fn seal(&mut self, frames: BytesMut) -> Result<Bytes> {
        let mut part = BytesMut::new();
        self.encode(frames, &mut part)?;
        Ok(part.freeze())
    }

    /// Seal the last part of a recording, which is never padded
    pub fn seal_final(&mut self, frames: BytesMut) -> Result<Bytes> {
        Self::new(self.compression, 0)
            .with_max_body_len(self.max_body_len)
            .seal(frames)
    }

    fn padding_len(&self, unpadded: usize) -> usize {
        if unpadded >= self.min_part_size {
            return 0;
        }
        (self.min_part_size - unpadded).max(PADDING_FRAME_OVERHEAD)
    }
}

impl Encoder<BytesMut> for PartCodec {
    type Error = AuditError;

    fn encode(&mut self, frames: BytesMut, dst: &mut BytesMut) -> Result<()> {
        if frames.len() > self.max_body_len {
            return Err(AuditError::Serialization(format!(
                "part body of {} bytes exceeds limit of {}",
                frames.len(),
                self.max_body_len
            )));
        }

        // Incompressible bodies are stored raw, so a body never outgrows its frames
        let (flags, body) = match self.compression.zstd_level() {
            Some(level) => {
                let compressed = zstd::encode_all(&frames[..], level)
                    .map_err(|e| AuditError::Compression(e.to_string()))?;
                if compressed.len() < frames.len() {
                    (FLAG_COMPRESSED, Bytes::from(compressed))
                } else {
                    (0, frames.freeze())
                }
            }
            None => (0, frames.freeze()),
        };

        let padding = self.padding_len(PART_HEADER_LEN + body.len());

        dst.reserve(PART_HEADER_LEN + body.len() + padding);
        dst.put_slice(&PART_MAGIC);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(flags);
        dst.put_u16(0);
        dst.put_u32(body.len() as u32);
        dst.put_u32(padding as u32);
        dst.put_u32(crc32fast::hash(&body));
        dst.put_slice(&body);

        if padding > 0 {
            dst.put_u8(FRAME_PADDING);
            dst.put_u32((padding - PADDING_FRAME_OVERHEAD) as u32);
            dst.put_bytes(0, padding - PADDING_FRAME_OVERHEAD);
        }

        trace!(body = body.len(), padding, "sealed part");
        Ok(())
    }
}

/// Inflate a part body, refusing output beyond `limit` bytes
fn decompress_bounded(body: &[u8], limit: usize) -> Result<Vec<u8>> {
    use std::io::Read;

    let undecodable = |e: std::io::Error| {
        AuditError::CorruptFrame(format!("undecodable part body: {}", e))
    };

    let decoder = zstd::stream::read::Decoder::new(body).map_err(undecodable)?;
    let mut frames = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut frames)
        .map_err(undecodable)?;

    if frames.len() > limit {
        return Err(AuditError::CorruptFrame(format!(
            "decompressed part body exceeds limit of {} bytes",
            limit
        )));
    }
    Ok(frames)
}

impl Decoder for PartCodec {
    type Item = DecodedPart;
    type Error = AuditError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DecodedPart>> {
        if src.len() < PART_HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..PART_HEADER_LEN];
        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if magic != PART_MAGIC {
            return Err(AuditError::CorruptFrame(format!(
                "bad part magic {:02x?}",
                magic
            )));
        }

        let version = header.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(AuditError::CorruptFrame(format!(
                "unsupported part version {}",
                version
            )));
        }

        let flags = header.get_u8();
        let _reserved = header.get_u16();
        let body_len = header.get_u32() as usize;
        let padding_len = header.get_u32() as usize;
        let crc = header.get_u32();

        if body_len > self.max_body_len {
            return Err(AuditError::CorruptFrame(format!(
                "part body length {} exceeds limit",
                body_len
            )));
        }
        if padding_len > MAX_PART_BODY_LEN {
            return Err(AuditError::CorruptFrame(format!(
                "padding length {} exceeds limit",
                padding_len
            )));
        }
        if padding_len > 0 && padding_len < PADDING_FRAME_OVERHEAD {
            return Err(AuditError::CorruptFrame(format!(
                "padding length {} shorter than a padding frame",
                padding_len
            )));
        }

        let total = PART_HEADER_LEN + body_len + padding_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut part = src.split_to(total);
        part.advance(PART_HEADER_LEN);
        let body = part.split_to(body_len);

        if crc32fast::hash(&body) != crc {
            return Err(AuditError::CorruptFrame("part checksum mismatch".to_string()));
        }

        if padding_len > 0 {
            let tag = part.get_u8();
            let len = part.get_u32() as usize;
            if tag != FRAME_PADDING || len != padding_len - PADDING_FRAME_OVERHEAD {
                return Err(AuditError::CorruptFrame(format!(
                    "malformed padding frame (tag {:#04x}, len {})",
                    tag, len
                )));
            }
            if part.iter().any(|b| *b != 0) {
                return Err(AuditError::CorruptFrame("non-zero padding bytes".to_string()));
            }
        }

        let events = if flags & FLAG_COMPRESSED != 0 {
            let frames = decompress_bounded(&body, self.max_body_len)?;
            decode_frames(&frames)?
        } else {
            decode_frames(&body)?
        };

        Ok(Some(DecodedPart {
            events,
            padded: padding_len > 0,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<DecodedPart>> {
        match self.decode(src)? {
            Some(part) => Ok(Some(part)),
            None if src.is_empty() => Ok(None),
            None => Err(AuditError::CorruptFrame(format!(
                "truncated part: {} trailing bytes",
                src.len()
            ))),
        }
    }
}
