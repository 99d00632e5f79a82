//! Binary chunk frame codec.
//!
//! Two frame types share a leading tag byte. `CHUNK_FULL` carries one
//! chunk as sorted sparse `(local_index, block_type)` pairs;
//! `CHUNK_BATCH` is an envelope concatenating length-prefixed
//! `CHUNK_FULL` payloads. All integers are little-endian.

use std::io::Cursor;

use vaste_utils::{CHUNK_VOLUME, ChunkPos};

use crate::error::ProtocolError;
use crate::ser::{ReadFrom, WriteTo};

/// Frame tag of a single-chunk frame.
pub const TAG_CHUNK_FULL: u8 = 1;
/// Frame tag of a batch envelope.
pub const TAG_CHUNK_BATCH: u8 = 2;

/// Fixed header bytes of a `CHUNK_FULL` frame before the entry table.
const FULL_HEADER_LEN: usize = 1 + 4 + 12 + 4 + 2;
/// Fixed header bytes of a `CHUNK_BATCH` envelope.
pub const BATCH_HEADER_LEN: usize = 1 + 4;
/// Per-item overhead inside a batch envelope (the length prefix).
pub const BATCH_ITEM_OVERHEAD: usize = 4;

/// A decoded (or to-be-encoded) single-chunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFull {
    /// Server-local frame sequence number, used for ACK correlation.
    pub seq: u32,
    /// The chunk position.
    pub pos: ChunkPos,
    /// The chunk version this frame captures.
    pub version: u32,
    /// Sparse non-air cells as `(local_index, block_type)`, ascending index.
    pub entries: Vec<(u16, u16)>,
}

impl ChunkFull {
    /// Exact encoded size of this frame in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FULL_HEADER_LEN + self.entries.len() * 4
    }

    /// Encodes this frame into a fresh buffer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        TAG_CHUNK_FULL.write(&mut out);
        self.seq.write(&mut out);
        self.pos.x.write(&mut out);
        self.pos.y.write(&mut out);
        self.pos.z.write(&mut out);
        self.version.write(&mut out);
        (self.entries.len() as u16).write(&mut out);
        for &(index, block) in &self.entries {
            index.write(&mut out);
            block.write(&mut out);
        }
        out
    }

    /// Decodes a `CHUNK_FULL` frame, tag byte included.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut data = Cursor::new(bytes);
        let tag = u8::read(&mut data)?;
        if tag != TAG_CHUNK_FULL {
            return Err(ProtocolError::UnknownTag(tag));
        }
        Self::decode_body(&mut data, bytes.len())
    }

    fn decode_body(data: &mut Cursor<&[u8]>, total_len: usize) -> Result<Self, ProtocolError> {
        let seq = u32::read(data)?;
        let pos = ChunkPos::new(i32::read(data)?, i32::read(data)?, i32::read(data)?);
        let version = u32::read(data)?;
        let entry_count = u16::read(data)?;

        let remaining = total_len - data.position() as usize;
        if usize::from(entry_count) * 4 > remaining {
            return Err(ProtocolError::EntryOverrun { count: entry_count });
        }

        let mut entries = Vec::with_capacity(usize::from(entry_count));
        for _ in 0..entry_count {
            let index = u16::read(data)?;
            let block = u16::read(data)?;
            if usize::from(index) >= CHUNK_VOLUME {
                return Err(ProtocolError::IndexOutOfRange(index));
            }
            entries.push((index, block));
        }

        Ok(Self {
            seq,
            pos,
            version,
            entries,
        })
    }
}

/// The `CHUNK_BATCH` envelope codec.
pub struct ChunkBatch;

impl ChunkBatch {
    /// Encoded envelope size for payloads of the given lengths.
    #[must_use]
    pub fn encoded_len(payload_lens: impl IntoIterator<Item = usize>) -> usize {
        payload_lens
            .into_iter()
            .fold(BATCH_HEADER_LEN, |acc, len| {
                acc + BATCH_ITEM_OVERHEAD + len
            })
    }

    /// Wraps pre-encoded `CHUNK_FULL` payloads into one envelope.
    #[must_use]
    pub fn encode<B: AsRef<[u8]>>(payloads: &[B]) -> Vec<u8> {
        let total = Self::encoded_len(payloads.iter().map(|p| p.as_ref().len()));
        let mut out = Vec::with_capacity(total);
        TAG_CHUNK_BATCH.write(&mut out);
        (payloads.len() as u32).write(&mut out);
        for payload in payloads {
            let payload = payload.as_ref();
            (payload.len() as u32).write(&mut out);
            out.extend_from_slice(payload);
        }
        out
    }

    /// Decodes an envelope into its contained frames, tag byte included.
    pub fn decode(bytes: &[u8]) -> Result<Vec<ChunkFull>, ProtocolError> {
        let mut data = Cursor::new(bytes);
        let tag = u8::read(&mut data)?;
        if tag != TAG_CHUNK_BATCH {
            return Err(ProtocolError::UnknownTag(tag));
        }
        let count = u32::read(&mut data)?;

        let mut frames = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let len = u32::read(&mut data)?;
            let start = data.position() as usize;
            let end = start
                .checked_add(len as usize)
                .ok_or(ProtocolError::InnerLengthOutOfBounds { len })?;
            if end > bytes.len() {
                return Err(ProtocolError::InnerLengthOutOfBounds { len });
            }
            frames.push(ChunkFull::decode(&bytes[start..end])?);
            data.set_position(end as u64);
        }
        Ok(frames)
    }
}

/// Decodes any binary frame by its leading tag.
///
/// A `CHUNK_FULL` frame decodes to a single-element vec.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<ChunkFull>, ProtocolError> {
    match bytes.first() {
        Some(&TAG_CHUNK_FULL) => Ok(vec![ChunkFull::decode(bytes)?]),
        Some(&TAG_CHUNK_BATCH) => ChunkBatch::decode(bytes),
        Some(&tag) => Err(ProtocolError::UnknownTag(tag)),
        None => Err(ProtocolError::Truncated("frame tag")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> ChunkFull {
        ChunkFull {
            seq: 7,
            pos: ChunkPos::new(-1, 0, 3),
            version: 42,
            entries: vec![(0, 1), (136, 2), (4095, 9)],
        }
    }

    #[test]
    fn chunk_full_roundtrip() {
        let frame = sample_frame();
        let bytes = frame.encode();
        assert_eq!(bytes.len(), frame.encoded_len());
        assert_eq!(ChunkFull::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn single_block_frame_layout() {
        // One block at world (8, 0, 8) in chunk (0,0,0): local index 136.
        let frame = ChunkFull {
            seq: 1,
            pos: ChunkPos::new(0, 0, 0),
            version: 1,
            entries: vec![(136, 1)],
        };
        let bytes = frame.encode();
        assert_eq!(bytes[0], TAG_CHUNK_FULL);
        // seq = 1, little-endian
        assert_eq!(&bytes[1..5], &[1, 0, 0, 0]);
        // entry_count = 1 at offset 21, then (136, 1)
        assert_eq!(&bytes[21..23], &[1, 0]);
        assert_eq!(&bytes[23..25], &[136, 0]);
        assert_eq!(&bytes[25..27], &[1, 0]);
    }

    #[test]
    fn batch_roundtrip() {
        let a = sample_frame();
        let b = ChunkFull {
            seq: 8,
            pos: ChunkPos::new(2, 2, 2),
            version: 1,
            entries: Vec::new(),
        };
        let envelope = ChunkBatch::encode(&[a.encode(), b.encode()]);
        assert_eq!(
            envelope.len(),
            ChunkBatch::encoded_len([a.encoded_len(), b.encoded_len()])
        );
        assert_eq!(decode_frame(&envelope).unwrap(), vec![a, b]);
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(matches!(
            decode_frame(&[9, 0, 0]),
            Err(ProtocolError::UnknownTag(9))
        ));
    }

    #[test]
    fn rejects_truncated_frame() {
        let bytes = sample_frame().encode();
        assert!(ChunkFull::decode(&bytes[..10]).is_err());
    }

    #[test]
    fn rejects_entry_overrun() {
        let mut bytes = sample_frame().encode();
        // Claim more entries than the payload holds.
        bytes[21] = 0xFF;
        bytes[22] = 0x0F;
        assert!(matches!(
            ChunkFull::decode(&bytes),
            Err(ProtocolError::EntryOverrun { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let frame = ChunkFull {
            seq: 1,
            pos: ChunkPos::new(0, 0, 0),
            version: 1,
            entries: vec![(4096, 1)],
        };
        let bytes = frame.encode();
        assert!(matches!(
            ChunkFull::decode(&bytes),
            Err(ProtocolError::IndexOutOfRange(4096))
        ));
    }

    #[test]
    fn rejects_inner_length_past_envelope() {
        let mut envelope = ChunkBatch::encode(&[sample_frame().encode()]);
        // Inflate the first inner length field past the buffer end.
        envelope[5] = 0xFF;
        envelope[6] = 0xFF;
        assert!(matches!(
            ChunkBatch::decode(&envelope),
            Err(ProtocolError::InnerLengthOutOfBounds { .. })
        ));
    }
}
