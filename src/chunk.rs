use std::fmt;

use thiserror::Error;

/// Identifier of a serialized chunk, stored as a little-endian fourcc.
pub type ChunkId = u32;

pub const fn fourcc(tag: &[u8; 4]) -> ChunkId {
    u32::from_le_bytes(*tag)
}

/// Serialized state of a single scene node.
pub const CHUNK_NODE: ChunkId = fourcc(b"NODE");
/// One committed frame of a branch history.
pub const CHUNK_FRAME: ChunkId = fourcc(b"FRME");
/// Frame history and fork metadata of one branch.
pub const CHUNK_BRANCH: ChunkId = fourcc(b"BRCH");
/// Whole state stack: branch hierarchy plus per-branch data.
pub const CHUNK_STACK: ChunkId = fourcc(b"STCK");

/// Wrapper that renders a chunk id as its fourcc in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTag(pub ChunkId);

impl fmt::Display for ChunkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic()) {
            for byte in bytes {
                write!(f, "{}", byte as char)?;
            }
            Ok(())
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("unexpected end of data while reading {what} at offset {offset}")]
    Truncated { what: &'static str, offset: usize },
    #[error("expected chunk {expected}, found {found}")]
    UnexpectedChunk { expected: ChunkTag, found: ChunkTag },
    #[error("chunk {id} payload length {length} exceeds remaining {remaining} bytes")]
    PayloadOverrun {
        id: ChunkTag,
        length: usize,
        remaining: usize,
    },
}

/// A parsed chunk header together with its raw payload bytes.
///
/// Reading a chunk always consumes the payload, so a caller that does
/// not recognise the id or version simply ignores the payload and the
/// read cursor stays aligned on the next chunk.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub id: ChunkId,
    pub version: u32,
    pub payload: &'a [u8],
}

impl<'a> Chunk<'a> {
    /// Returns a reader positioned at the start of the payload.
    pub fn reader(&self) -> ChunkReader<'a> {
        ChunkReader::new(self.payload)
    }

    /// Fails unless the chunk carries the expected id.
    pub fn expect(self, expected: ChunkId) -> Result<Self, ChunkError> {
        if self.id == expected {
            Ok(self)
        } else {
            Err(ChunkError::UnexpectedChunk {
                expected: ChunkTag(expected),
                found: ChunkTag(self.id),
            })
        }
    }
}

/// Cursor over a borrowed byte slice with bounds-checked reads.
#[derive(Debug, Clone)]
pub struct ChunkReader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> ChunkReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u32(&mut self, what: &'static str) -> Result<u32, ChunkError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_u64(&mut self, what: &'static str) -> Result<u64, ChunkError> {
        let bytes = self.take(8, what)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_bytes(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ChunkError> {
        self.take(len, what)
    }

    /// Reads one `{id, version, length, payload}` chunk, consuming the
    /// payload regardless of whether the caller understands it.
    pub fn read_chunk(&mut self) -> Result<Chunk<'a>, ChunkError> {
        let id = self.read_u32("chunk id")?;
        let version = self.read_u32("chunk version")?;
        let length = self.read_u32("chunk length")? as usize;
        if length > self.remaining() {
            return Err(ChunkError::PayloadOverrun {
                id: ChunkTag(id),
                length,
                remaining: self.remaining(),
            });
        }
        let payload = self.take(length, "chunk payload")?;
        Ok(Chunk {
            id,
            version,
            payload,
        })
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ChunkError> {
        if self.cursor + len > self.data.len() {
            return Err(ChunkError::Truncated {
                what,
                offset: self.cursor,
            });
        }
        let slice = &self.data[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }
}

/// Growable buffer that writes the crate's little-endian chunk layout.
#[derive(Debug, Default)]
pub struct ChunkWriter {
    data: Vec<u8>,
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Writes a chunk header, runs `body` to fill the payload and then
    /// patches the recorded payload length.
    pub fn chunk<F>(&mut self, id: ChunkId, version: u32, body: F)
    where
        F: FnOnce(&mut ChunkWriter),
    {
        self.write_u32(id);
        self.write_u32(version);
        self.write_u32(0); // placeholder for the payload length
        let payload_start = self.data.len();
        body(self);
        let length = (self.data.len() - payload_start) as u32;
        self.data[payload_start - 4..payload_start].copy_from_slice(&length.to_le_bytes());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut writer = ChunkWriter::new();
        writer.write_u32(7);
        writer.write_u64(u64::MAX - 1);
        writer.write_bytes(b"abc");
        let bytes = writer.into_bytes();

        let mut reader = ChunkReader::new(&bytes);
        assert_eq!(reader.read_u32("a").unwrap(), 7);
        assert_eq!(reader.read_u64("b").unwrap(), u64::MAX - 1);
        assert_eq!(reader.read_bytes(3, "c").unwrap(), b"abc");
        assert!(reader.is_empty());
    }

    #[test]
    fn truncated_read_is_an_error() {
        let bytes = 3u32.to_le_bytes();
        let mut reader = ChunkReader::new(&bytes);
        reader.read_u32("first").unwrap();
        let err = reader.read_u32("second").unwrap_err();
        assert!(matches!(err, ChunkError::Truncated { what: "second", .. }));
    }

    #[test]
    fn chunk_length_is_patched() {
        let mut writer = ChunkWriter::new();
        writer.chunk(CHUNK_NODE, 1, |w| {
            w.write_u64(42);
            w.write_u32(9);
        });
        let bytes = writer.into_bytes();

        let mut reader = ChunkReader::new(&bytes);
        let chunk = reader.read_chunk().unwrap().expect(CHUNK_NODE).unwrap();
        assert_eq!(chunk.version, 1);
        assert_eq!(chunk.payload.len(), 12);
        let mut payload = chunk.reader();
        assert_eq!(payload.read_u64("value").unwrap(), 42);
        assert_eq!(payload.read_u32("extra").unwrap(), 9);
    }

    #[test]
    fn nested_chunks_round_trip() {
        let mut writer = ChunkWriter::new();
        writer.chunk(CHUNK_BRANCH, 1, |w| {
            w.write_u32(2);
            w.chunk(CHUNK_FRAME, 1, |w| w.write_u64(1));
            w.chunk(CHUNK_FRAME, 1, |w| w.write_u64(2));
        });
        let bytes = writer.into_bytes();

        let mut reader = ChunkReader::new(&bytes);
        let branch = reader.read_chunk().unwrap().expect(CHUNK_BRANCH).unwrap();
        let mut payload = branch.reader();
        let count = payload.read_u32("frame count").unwrap();
        for expected in 1..=u64::from(count) {
            let frame = payload.read_chunk().unwrap().expect(CHUNK_FRAME).unwrap();
            assert_eq!(frame.reader().read_u64("index").unwrap(), expected);
        }
        assert!(payload.is_empty());
    }

    #[test]
    fn unknown_chunk_can_be_skipped() {
        let mut writer = ChunkWriter::new();
        writer.chunk(fourcc(b"MYST"), 99, |w| w.write_bytes(&[0xab; 17]));
        writer.chunk(CHUNK_NODE, 1, |w| w.write_u64(5));
        let bytes = writer.into_bytes();

        let mut reader = ChunkReader::new(&bytes);
        let mystery = reader.read_chunk().unwrap();
        assert_eq!(mystery.version, 99);
        // Ignoring the payload leaves the cursor on the next chunk.
        let node = reader.read_chunk().unwrap().expect(CHUNK_NODE).unwrap();
        assert_eq!(node.reader().read_u64("value").unwrap(), 5);
    }

    #[test]
    fn wrong_id_reports_both_tags() {
        let mut writer = ChunkWriter::new();
        writer.chunk(CHUNK_FRAME, 1, |_| {});
        let bytes = writer.into_bytes();

        let err = ChunkReader::new(&bytes)
            .read_chunk()
            .unwrap()
            .expect(CHUNK_STACK)
            .unwrap_err();
        assert_eq!(err.to_string(), "expected chunk STCK, found FRME");
    }

    #[test]
    fn overlong_payload_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&CHUNK_NODE.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 4]);

        let err = ChunkReader::new(&bytes).read_chunk().unwrap_err();
        assert!(matches!(err, ChunkError::PayloadOverrun { length: 100, .. }));
    }
}
