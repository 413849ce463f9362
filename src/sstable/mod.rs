//! Sorted String Tables: immutable, block-structured on-disk files.
//!
//! # On-disk layout
//!
//! ```text
//! [data block 0][data block 1]…[data block N-1]
//! [index block]
//! [bloom block]          (optional)
//! [footer, fixed 64 B]
//! ```
//!
//! Every block (data, index, bloom) starts with a 24-byte little-endian
//! header:
//!
//! ```text
//! u32 block_type      1=data, 2=index, 3=bloom
//! u32 compressed_size    bytes stored after the header
//! u32 uncompressed_size  bytes after decompression
//! u32 crc32              CRC32 over the stored payload
//! u32 entry_count
//! u32 codec              0=none, 1=lz4
//! ```
//!
//! A data-block entry is `u32 key_len, u32 value_len, u64 seq,
//! u8 deleted, 7 pad bytes`, then key and value. An index entry is
//! `u32 key_len, u64 block_offset, u32 block_size, u64 seq` then the
//! block's first key; `seq` is the block's highest sequence number.
//!
//! The footer is `u32 magic "SSTA", u32 version, u64 index_offset,
//! u32 index_size, u64 bloom_offset, u32 bloom_size, u64 min_seq,
//! u64 max_seq, u64 entry_count, u32 reserved, u32 crc32`, with the CRC
//! covering the preceding 60 bytes.
//!
//! # Reading
//!
//! [`SsTable::open`] memory-maps the file and verifies the footer; the
//! index and bloom blocks materialize lazily on first use. A point
//! lookup consults the bloom filter, binary-searches the index for the
//! only candidate block, and scans it. Any checksum mismatch surfaces
//! as [`TableError::Corrupted`] so the caller can quarantine the file.
//!
//! # Immutability
//!
//! Tables are written once (temp file + rename), never modified, and
//! unlinked only after compaction has replaced them. Reads are
//! lock-free.

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::{TableBuilder, TableBuilderConfig, TableSummary};
pub use iterator::TableIter;

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;

use crate::engine::KeyRange;
use crate::error::ErrorCode;

/// Footer magic: `"SSTA"` read as a little-endian u32.
pub const TABLE_MAGIC: u32 = 0x5353_5441;
/// Current format version.
pub const TABLE_VERSION: u32 = 1;
/// Fixed footer size in bytes.
pub const FOOTER_SIZE: usize = 64;
/// Fixed block header size in bytes.
pub const BLOCK_HEADER_SIZE: usize = 24;
/// Fixed per-entry header size in bytes.
pub const ENTRY_HEADER_SIZE: usize = 24;
/// Default data-block payload target.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;
/// Default bloom sizing.
pub const DEFAULT_BLOOM_BITS_PER_KEY: usize = 10;

const BLOCK_TYPE_DATA: u32 = 1;
const BLOCK_TYPE_INDEX: u32 = 2;
const BLOCK_TYPE_BLOOM: u32 = 3;

/// Sanity cap on decoded lengths; larger values mean corruption.
const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024;

/// Errors from SSTable reading and writing.
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Memory mapping failed.
    #[error("mmap failed: {0}")]
    Mmap(io::Error),

    /// The file failed structural or checksum verification.
    #[error("corrupted table: {0}")]
    Corrupted(String),

    /// The builder received unusable input.
    #[error("invalid table input: {0}")]
    InvalidInput(String),
}

impl TableError {
    /// Maps onto the stable error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::IoError,
            Self::Mmap(_) => ErrorCode::MmapFailed,
            Self::Corrupted(_) => ErrorCode::Corrupted,
            Self::InvalidInput(_) => ErrorCode::InvalidParam,
        }
    }
}

/// Data-block compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Store payloads verbatim.
    #[default]
    None,
    /// LZ4 block compression.
    Lz4,
}

impl Compression {
    /// Parses a configuration selector string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "lz4" => Some(Self::Lz4),
            _ => None,
        }
    }

    /// The canonical selector string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
        }
    }

    fn tag(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            _ => None,
        }
    }
}

/// One versioned entry travelling between memtables, tables, and the
/// compaction merge. `value: None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes; `None` marks a deletion.
    pub value: Option<Vec<u8>>,
    /// Sequence number of this version.
    pub seq: u64,
}

impl TableEntry {
    /// A live entry.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, seq: u64) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            seq,
        }
    }

    /// A tombstone.
    pub fn tombstone(key: impl Into<Vec<u8>>, seq: u64) -> Self {
        Self {
            key: key.into(),
            value: None,
            seq,
        }
    }

    /// Whether this entry is a delete marker.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

// ------------------------------------------------------------------------------------------------
// Fixed-layout structures
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockHeader {
    pub block_type: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub crc32: u32,
    pub entry_count: u32,
    pub codec: u32,
}

impl BlockHeader {
    pub(crate) fn encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.block_type.to_le_bytes());
        buf[4..8].copy_from_slice(&self.compressed_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc32.to_le_bytes());
        buf[16..20].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[20..24].copy_from_slice(&self.codec.to_le_bytes());
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, TableError> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Err(TableError::Corrupted("short block header".into()));
        }
        let le32 = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Ok(Self {
            block_type: le32(0),
            compressed_size: le32(4),
            uncompressed_size: le32(8),
            crc32: le32(12),
            entry_count: le32(16),
            codec: le32(20),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    /// First key of the referenced data block.
    pub first_key: Vec<u8>,
    /// File offset of the block header.
    pub block_offset: u64,
    /// Total block size including its header.
    pub block_size: u32,
    /// Highest sequence number inside the block.
    pub max_seq: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Footer {
    pub index_offset: u64,
    pub index_size: u32,
    pub bloom_offset: u64,
    pub bloom_size: u32,
    pub min_seq: u64,
    pub max_seq: u64,
    pub entry_count: u64,
}

impl Footer {
    pub(crate) fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..4].copy_from_slice(&TABLE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&TABLE_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.index_size.to_le_bytes());
        buf[20..28].copy_from_slice(&self.bloom_offset.to_le_bytes());
        buf[28..32].copy_from_slice(&self.bloom_size.to_le_bytes());
        buf[32..40].copy_from_slice(&self.min_seq.to_le_bytes());
        buf[40..48].copy_from_slice(&self.max_seq.to_le_bytes());
        buf[48..56].copy_from_slice(&self.entry_count.to_le_bytes());
        // bytes 56..60 stay reserved/zero
        let mut crc = Crc32::new();
        crc.update(&buf[..60]);
        buf[60..64].copy_from_slice(&crc.finalize().to_le_bytes());
        buf
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, TableError> {
        if buf.len() < FOOTER_SIZE {
            return Err(TableError::Corrupted("short footer".into()));
        }
        let le32 = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let le64 = |i: usize| {
            u64::from_le_bytes([
                buf[i],
                buf[i + 1],
                buf[i + 2],
                buf[i + 3],
                buf[i + 4],
                buf[i + 5],
                buf[i + 6],
                buf[i + 7],
            ])
        };

        let stored_crc = le32(60);
        let mut crc = Crc32::new();
        crc.update(&buf[..60]);
        if crc.finalize() != stored_crc {
            return Err(TableError::Corrupted("footer checksum mismatch".into()));
        }
        if le32(0) != TABLE_MAGIC {
            return Err(TableError::Corrupted("bad footer magic".into()));
        }
        if le32(4) != TABLE_VERSION {
            return Err(TableError::Corrupted(format!(
                "unsupported table version {}",
                le32(4)
            )));
        }
        Ok(Self {
            index_offset: le64(8),
            index_size: le32(16),
            bloom_offset: le64(20),
            bloom_size: le32(28),
            min_seq: le64(32),
            max_seq: le64(40),
            entry_count: le64(48),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Block payload codec, shared by builder and reader
// ------------------------------------------------------------------------------------------------

/// Serializes one entry into a block payload buffer.
pub(crate) fn encode_entry(entry: &TableEntry, buf: &mut Vec<u8>) {
    let value_len = entry.value.as_ref().map_or(0, Vec::len);
    buf.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value_len as u32).to_le_bytes());
    buf.extend_from_slice(&entry.seq.to_le_bytes());
    buf.push(u8::from(entry.is_tombstone()));
    buf.extend_from_slice(&[0u8; 7]);
    buf.extend_from_slice(&entry.key);
    if let Some(value) = &entry.value {
        buf.extend_from_slice(value);
    }
}

/// Parses every entry of a decompressed block payload.
pub(crate) fn decode_entries(payload: &[u8], expected: u32) -> Result<Vec<TableEntry>, TableError> {
    let mut entries = Vec::with_capacity(expected as usize);
    let mut off = 0usize;
    while off < payload.len() {
        if payload.len() - off < ENTRY_HEADER_SIZE {
            return Err(TableError::Corrupted("truncated entry header".into()));
        }
        let head = &payload[off..off + ENTRY_HEADER_SIZE];
        let key_len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let value_len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        let seq = u64::from_le_bytes([
            head[8], head[9], head[10], head[11], head[12], head[13], head[14], head[15],
        ]);
        let deleted = head[16] != 0;
        off += ENTRY_HEADER_SIZE;

        if key_len > MAX_FIELD_LEN || value_len > MAX_FIELD_LEN {
            return Err(TableError::Corrupted("implausible entry length".into()));
        }
        let need = key_len as usize + value_len as usize;
        if payload.len() - off < need {
            return Err(TableError::Corrupted("truncated entry payload".into()));
        }
        let key = payload[off..off + key_len as usize].to_vec();
        off += key_len as usize;
        let value = payload[off..off + value_len as usize].to_vec();
        off += value_len as usize;

        entries.push(TableEntry {
            key,
            value: if deleted { None } else { Some(value) },
            seq,
        });
    }
    if entries.len() != expected as usize {
        return Err(TableError::Corrupted(format!(
            "entry count mismatch: header says {expected}, block holds {}",
            entries.len()
        )));
    }
    Ok(entries)
}

pub(crate) fn compress_payload(codec: Compression, payload: &[u8]) -> Vec<u8> {
    match codec {
        Compression::None => payload.to_vec(),
        Compression::Lz4 => lz4_flex::compress(payload),
    }
}

fn decompress_payload(
    codec: Compression,
    stored: &[u8],
    uncompressed_size: usize,
) -> Result<Vec<u8>, TableError> {
    match codec {
        Compression::None => Ok(stored.to_vec()),
        Compression::Lz4 => lz4_flex::decompress(stored, uncompressed_size)
            .map_err(|e| TableError::Corrupted(format!("lz4 decompress failed: {e}"))),
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Result of a point lookup against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableGet {
    /// A live value at `seq`.
    Found {
        /// Owned copy of the value.
        value: Vec<u8>,
        /// Sequence number of the version.
        seq: u64,
    },
    /// A tombstone at `seq`.
    Tombstone {
        /// Sequence number of the tombstone.
        seq: u64,
    },
    /// This table holds no version of the key.
    Missing,
}

/// An open, immutable table backed by a read-only memory map.
pub struct SsTable {
    path: PathBuf,
    mmap: Mmap,
    footer: Footer,
    index: OnceLock<Vec<IndexEntry>>,
    bloom_bytes: OnceLock<Vec<u8>>,
}

impl SsTable {
    /// Opens and verifies a table file.
    ///
    /// The footer is checked eagerly (magic, version, CRC); index and
    /// bloom blocks are materialized on first use.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(TableError::Mmap)?;

        if mmap.len() < FOOTER_SIZE {
            return Err(TableError::Corrupted("file smaller than footer".into()));
        }
        let footer = Footer::decode(&mmap[mmap.len() - FOOTER_SIZE..])?;

        Ok(Self {
            path,
            mmap,
            footer,
            index: OnceLock::new(),
            bloom_bytes: OnceLock::new(),
        })
    }

    /// Path this table was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Number of entries (tombstones included).
    pub fn entry_count(&self) -> u64 {
        self.footer.entry_count
    }

    /// Lowest sequence number stored.
    pub fn min_seq(&self) -> u64 {
        self.footer.min_seq
    }

    /// Highest sequence number stored.
    pub fn max_seq(&self) -> u64 {
        self.footer.max_seq
    }

    /// Reads and verifies the raw bytes of one block.
    fn read_block_raw(&self, offset: u64, size: u32) -> Result<(BlockHeader, Vec<u8>), TableError> {
        let start = usize::try_from(offset)
            .map_err(|_| TableError::Corrupted("block offset out of range".into()))?;
        let size = size as usize;
        if size < BLOCK_HEADER_SIZE || start.checked_add(size).is_none_or(|end| end > self.mmap.len())
        {
            return Err(TableError::Corrupted("block out of bounds".into()));
        }

        let header = BlockHeader::decode(&self.mmap[start..start + BLOCK_HEADER_SIZE])?;
        let payload_start = start + BLOCK_HEADER_SIZE;
        let payload_len = header.compressed_size as usize;
        if payload_len != size - BLOCK_HEADER_SIZE {
            return Err(TableError::Corrupted("block size mismatch".into()));
        }

        let stored = &self.mmap[payload_start..payload_start + payload_len];
        let mut crc = Crc32::new();
        crc.update(stored);
        if crc.finalize() != header.crc32 {
            return Err(TableError::Corrupted("block checksum mismatch".into()));
        }

        let codec = Compression::from_tag(header.codec)
            .ok_or_else(|| TableError::Corrupted(format!("unknown codec {}", header.codec)))?;
        let payload = decompress_payload(codec, stored, header.uncompressed_size as usize)?;
        if payload.len() != header.uncompressed_size as usize {
            return Err(TableError::Corrupted("decompressed size mismatch".into()));
        }
        Ok((header, payload))
    }

    /// Loads and parses one data block.
    pub(crate) fn read_data_block(&self, entry: &IndexEntry) -> Result<Vec<TableEntry>, TableError> {
        let (header, payload) = self.read_block_raw(entry.block_offset, entry.block_size)?;
        if header.block_type != BLOCK_TYPE_DATA {
            return Err(TableError::Corrupted("expected data block".into()));
        }
        decode_entries(&payload, header.entry_count)
    }

    /// The parsed index, materialized on first use.
    pub(crate) fn index(&self) -> Result<&[IndexEntry], TableError> {
        if let Some(index) = self.index.get() {
            return Ok(index);
        }
        let (header, payload) =
            self.read_block_raw(self.footer.index_offset, self.footer.index_size)?;
        if header.block_type != BLOCK_TYPE_INDEX {
            return Err(TableError::Corrupted("expected index block".into()));
        }

        let mut parsed = Vec::with_capacity(header.entry_count as usize);
        let mut off = 0usize;
        while off < payload.len() {
            if payload.len() - off < 24 {
                return Err(TableError::Corrupted("truncated index entry".into()));
            }
            let key_len =
                u32::from_le_bytes([payload[off], payload[off + 1], payload[off + 2], payload[off + 3]]);
            let block_offset = u64::from_le_bytes([
                payload[off + 4],
                payload[off + 5],
                payload[off + 6],
                payload[off + 7],
                payload[off + 8],
                payload[off + 9],
                payload[off + 10],
                payload[off + 11],
            ]);
            let block_size = u32::from_le_bytes([
                payload[off + 12],
                payload[off + 13],
                payload[off + 14],
                payload[off + 15],
            ]);
            let max_seq = u64::from_le_bytes([
                payload[off + 16],
                payload[off + 17],
                payload[off + 18],
                payload[off + 19],
                payload[off + 20],
                payload[off + 21],
                payload[off + 22],
                payload[off + 23],
            ]);
            off += 24;
            if key_len > MAX_FIELD_LEN || payload.len() - off < key_len as usize {
                return Err(TableError::Corrupted("truncated index key".into()));
            }
            let first_key = payload[off..off + key_len as usize].to_vec();
            off += key_len as usize;
            parsed.push(IndexEntry {
                first_key,
                block_offset,
                block_size,
                max_seq,
            });
        }
        if parsed.len() != header.entry_count as usize {
            return Err(TableError::Corrupted("index entry count mismatch".into()));
        }
        Ok(self.index.get_or_init(|| parsed))
    }

    /// The serialized bloom filter, materialized on first use. Empty when
    /// the table was written without one.
    fn bloom(&self) -> Result<&[u8], TableError> {
        if self.footer.bloom_size == 0 {
            return Ok(&[]);
        }
        if let Some(bytes) = self.bloom_bytes.get() {
            return Ok(bytes);
        }
        let (header, payload) =
            self.read_block_raw(self.footer.bloom_offset, self.footer.bloom_size)?;
        if header.block_type != BLOCK_TYPE_BLOOM {
            return Err(TableError::Corrupted("expected bloom block".into()));
        }
        Ok(self.bloom_bytes.get_or_init(|| payload))
    }

    /// Whether `key` may be present according to the bloom filter.
    ///
    /// `true` means "maybe" (including the no-filter and corrupt-filter
    /// cases); only `false` is definitive.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        match self.bloom() {
            Ok([]) => true,
            Ok(bytes) => match Bloom::<[u8]>::from_slice(bytes) {
                Ok(bloom) => bloom.check(key),
                Err(_) => true,
            },
            Err(_) => true,
        }
    }

    /// Index position of the only block that can contain `key`.
    pub(crate) fn candidate_block(&self, key: &[u8]) -> Result<Option<usize>, TableError> {
        let index = self.index()?;
        if index.is_empty() {
            return Ok(None);
        }
        let pos = index.partition_point(|entry| entry.first_key.as_slice() <= key);
        Ok(pos.checked_sub(1))
    }

    /// Point lookup. Returns the highest-seq version stored here.
    pub fn get(&self, key: &[u8]) -> Result<TableGet, TableError> {
        if !self.may_contain(key) {
            return Ok(TableGet::Missing);
        }
        let Some(block_pos) = self.candidate_block(key)? else {
            return Ok(TableGet::Missing);
        };
        let index = self.index()?;
        let entries = self.read_data_block(&index[block_pos])?;

        let mut best: Option<&TableEntry> = None;
        for entry in entries.iter().filter(|e| e.key == key) {
            if best.is_none_or(|b| entry.seq > b.seq) {
                best = Some(entry);
            }
        }
        Ok(match best {
            Some(entry) => match &entry.value {
                Some(value) => TableGet::Found {
                    value: value.clone(),
                    seq: entry.seq,
                },
                None => TableGet::Tombstone { seq: entry.seq },
            },
            None => TableGet::Missing,
        })
    }

    /// Smallest and largest keys stored in this table.
    ///
    /// Reads the first and last data blocks; used when re-registering
    /// discovered files after a restart.
    pub fn key_bounds(&self) -> Result<(Vec<u8>, Vec<u8>), TableError> {
        let index = self.index()?;
        let (Some(first), Some(last)) = (index.first(), index.last()) else {
            return Err(TableError::Corrupted("table has no data blocks".into()));
        };
        let min_key = first.first_key.clone();
        let last_block = self.read_data_block(last)?;
        let max_key = last_block
            .last()
            .map(|entry| entry.key.clone())
            .ok_or_else(|| TableError::Corrupted("empty final data block".into()))?;
        Ok((min_key, max_key))
    }

    /// Ordered iteration over the entries inside `range`.
    pub fn scan(&self, range: KeyRange) -> Result<TableIter<'_>, TableError> {
        TableIter::new(self, range)
    }
}
