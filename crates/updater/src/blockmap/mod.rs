//! Block maps: per-file lists of block sizes and checksums.
//!
//! A block map describes a file as an ordered sequence of blocks. The
//! chunking is fixed by whoever produced the artifact, so two versions of the
//! same file can be compared block by block without reading the remote bytes.
//! Maps travel as gzip-compressed JSON, either as a sidecar document or as a
//! trailer appended to the artifact (`gzip(json)` followed by its length as a
//! big-endian `u32`).

mod plan;

pub use plan::{DiffPlan, Operation, PlanOptions};

use crate::error::{Result, UpdaterError};
use base64::{engine::general_purpose, Engine as _};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Format version written by [`BlockMap::encode`].
pub const BLOCK_MAP_FORMAT_VERSION: &str = "2";

/// Default block granularity of [`BlockMap::compute`].
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Length of the size suffix of an embedded block map.
pub const EMBEDDED_SIZE_LEN: u64 = 4;

/// Upper bound on a block map document, compressed.
pub const MAX_BLOCK_MAP_LEN: u64 = 64 * 1024 * 1024;

/// Serialized block map document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockMapDocument {
    pub version: String,
    pub files: Vec<BlockMapFileEntry>,
}

/// Serialized per-file entry of a block map document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockMapFileEntry {
    pub name: String,
    pub offset: u64,
    pub checksums: Vec<String>,
    pub sizes: Vec<u64>,
}

/// One block of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Absolute offset of the block in its file.
    pub offset: u64,
    pub size: u64,
    /// Fast checksum, good enough to match blocks but not to trust them.
    pub checksum: String,
}

/// Validated block map of exactly one file version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMap {
    version: String,
    name: String,
    offset: u64,
    blocks: Vec<Block>,
}

impl BlockMap {
    /// Validate a document. The first file entry is the one described.
    pub fn from_document(document: BlockMapDocument) -> Result<Self> {
        let entry = document
            .files
            .into_iter()
            .next()
            .ok_or_else(|| UpdaterError::InvalidBlockMap("no file entries".into()))?;
        if entry.sizes.len() != entry.checksums.len() {
            return Err(UpdaterError::InvalidBlockMap(format!(
                "{} sizes but {} checksums",
                entry.sizes.len(),
                entry.checksums.len()
            )));
        }

        let mut offset = entry.offset;
        let mut blocks = Vec::with_capacity(entry.sizes.len());
        for (index, (size, checksum)) in entry.sizes.into_iter().zip(entry.checksums).enumerate() {
            if size == 0 {
                return Err(UpdaterError::InvalidBlockMap(format!(
                    "block {index} has zero length"
                )));
            }
            blocks.push(Block {
                offset,
                size,
                checksum,
            });
            offset = offset.checked_add(size).ok_or_else(|| {
                UpdaterError::InvalidBlockMap("block sizes overflow".into())
            })?;
        }

        Ok(Self {
            version: document.version,
            name: entry.name,
            offset: entry.offset,
            blocks,
        })
    }

    /// Build a map by chunking `reader` into blocks of `block_size` bytes.
    pub fn compute(mut reader: impl Read, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(UpdaterError::InvalidBlockMap("block size must be positive".into()));
        }
        let mut document = BlockMapFileEntry {
            name: "file".into(),
            offset: 0,
            checksums: Vec::new(),
            sizes: Vec::new(),
        };
        let mut buf = vec![0u8; block_size];
        loop {
            let filled = read_full(&mut reader, &mut buf)?;
            if filled == 0 {
                break;
            }
            document.checksums.push(block_checksum(&buf[..filled]));
            document.sizes.push(filled as u64);
            if filled < block_size {
                break;
            }
        }
        Self::from_document(BlockMapDocument {
            version: BLOCK_MAP_FORMAT_VERSION.into(),
            files: vec![document],
        })
    }

    /// Decode a gzip-compressed JSON document.
    pub fn decode(compressed: &[u8]) -> Result<Self> {
        let mut json = Vec::new();
        GzDecoder::new(compressed)
            .read_to_end(&mut json)
            .map_err(|err| UpdaterError::InvalidBlockMap(format!("gunzip failed: {err}")))?;
        let document: BlockMapDocument = serde_json::from_slice(&json)
            .map_err(|err| UpdaterError::InvalidBlockMap(format!("bad JSON: {err}")))?;
        Self::from_document(document)
    }

    /// Encode as a gzip-compressed JSON document.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(&self.to_document())
            .map_err(|err| UpdaterError::InvalidBlockMap(err.to_string()))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    /// Encode as an embedded trailer: the document followed by its big-endian length.
    pub fn encode_embedded(&self) -> Result<Vec<u8>> {
        let mut trailer = self.encode()?;
        let len = u32::try_from(trailer.len())
            .map_err(|_| UpdaterError::InvalidBlockMap("block map too large to embed".into()))?;
        trailer.extend_from_slice(&len.to_be_bytes());
        Ok(trailer)
    }

    /// Read the block map embedded at the tail of a local file.
    pub fn read_embedded(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < EMBEDDED_SIZE_LEN {
            return Err(UpdaterError::InvalidBlockMap(format!(
                "{} is too short to carry a block map",
                path.display()
            )));
        }
        file.seek(SeekFrom::Start(file_len - EMBEDDED_SIZE_LEN))?;
        let mut len_bytes = [0u8; EMBEDDED_SIZE_LEN as usize];
        file.read_exact(&mut len_bytes)?;
        let map_len = embedded_map_len(&len_bytes, file_len)?;

        file.seek(SeekFrom::Start(file_len - EMBEDDED_SIZE_LEN - map_len))?;
        let mut compressed = vec![0u8; map_len as usize];
        file.read_exact(&mut compressed)?;
        Self::decode(&compressed)
    }

    /// Read a sidecar document from disk.
    pub fn read_file(path: &Path) -> Result<Self> {
        Self::decode(&std::fs::read(path)?)
    }

    /// Sidecar document describing this map as its only file entry.
    pub fn to_document(&self) -> BlockMapDocument {
        BlockMapDocument {
            version: self.version.clone(),
            files: vec![BlockMapFileEntry {
                name: self.name.clone(),
                offset: self.offset,
                checksums: self.blocks.iter().map(|b| b.checksum.clone()).collect(),
                sizes: self.blocks.iter().map(|b| b.size).collect(),
            }],
        }
    }

    /// Block map format version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Logical file name the map was computed for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks in file order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Offset of the first block in the file.
    pub fn start(&self) -> u64 {
        self.offset
    }

    /// Offset just past the last block.
    pub fn end(&self) -> u64 {
        self.blocks
            .last()
            .map(|b| b.offset + b.size)
            .unwrap_or(self.offset)
    }

    /// Sum of all block sizes.
    pub fn total_size(&self) -> u64 {
        self.end() - self.offset
    }

    /// Whether the map has no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Whether `other` was produced by the same chunking scheme for the same logical file.
    pub fn is_compatible_with(&self, other: &BlockMap) -> bool {
        self.version == other.version && self.name == other.name
    }
}

/// Validate the length suffix of an embedded block map against the file size.
pub fn embedded_map_len(suffix: &[u8], file_len: u64) -> Result<u64> {
    let bytes: [u8; 4] = suffix
        .try_into()
        .map_err(|_| UpdaterError::InvalidBlockMap("length suffix must be 4 bytes".into()))?;
    let map_len = u64::from(u32::from_be_bytes(bytes));
    if map_len == 0 || map_len > MAX_BLOCK_MAP_LEN || map_len + EMBEDDED_SIZE_LEN > file_len {
        return Err(UpdaterError::InvalidBlockMap(format!(
            "embedded block map length {map_len} does not fit a {file_len} byte file"
        )));
    }
    Ok(map_len)
}

/// Checksum of one block, base64 SHA-256.
pub fn block_checksum(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(Sha256::digest(data))
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_chunks_and_sums() {
        let data = vec![7u8; 2500];
        let map = BlockMap::compute(&data[..], 1000).unwrap();
        let sizes: Vec<u64> = map.blocks().iter().map(|b| b.size).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(map.total_size(), 2500);
        assert_eq!(map.blocks()[2].offset, 2000);
        assert_eq!(map.blocks()[0].checksum, map.blocks()[1].checksum);
    }

    #[test]
    fn encode_decode_preserves_map() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let map = BlockMap::compute(&data[..], 1024).unwrap();
        let decoded = BlockMap::decode(&map.encode().unwrap()).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn embedded_trailer_is_read_from_file_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("App.AppImage");
        let data = vec![1u8; 3000];
        let map = BlockMap::compute(&data[..], 1000).unwrap();
        let mut contents = data.clone();
        contents.extend(map.encode_embedded().unwrap());
        std::fs::write(&path, contents).unwrap();

        let read = BlockMap::read_embedded(&path).unwrap();
        assert_eq!(read, map);
    }

    #[test]
    fn rejects_inconsistent_documents() {
        let mismatched = BlockMapDocument {
            version: "2".into(),
            files: vec![BlockMapFileEntry {
                name: "file".into(),
                offset: 0,
                checksums: vec!["a".into()],
                sizes: vec![1, 2],
            }],
        };
        assert!(BlockMap::from_document(mismatched).is_err());

        let zero = BlockMapDocument {
            version: "2".into(),
            files: vec![BlockMapFileEntry {
                name: "file".into(),
                offset: 0,
                checksums: vec!["a".into()],
                sizes: vec![0],
            }],
        };
        assert!(BlockMap::from_document(zero).is_err());
        assert!(BlockMap::decode(b"definitely not gzip").is_err());
    }

    #[test]
    fn embedded_length_must_fit() {
        assert_eq!(embedded_map_len(&10u32.to_be_bytes(), 100).unwrap(), 10);
        assert!(embedded_map_len(&200u32.to_be_bytes(), 100).is_err());
        assert!(embedded_map_len(&0u32.to_be_bytes(), 100).is_err());
    }
}
