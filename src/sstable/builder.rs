//! Table builder: streams a sorted entry run into a complete table file.
//!
//! Entries accumulate in an in-memory block buffer; when the buffer
//! crosses the block-size target the block is finalized (compressed,
//! checksummed, written) and its first key is recorded in the index.
//! `build` then writes the index block, the bloom block, and the footer,
//! and atomically renames the temp file into place — a crash can never
//! leave a half-written table behind.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use tracing::debug;

use super::{
    BLOCK_HEADER_SIZE, BLOCK_TYPE_BLOOM, BLOCK_TYPE_DATA, BLOCK_TYPE_INDEX, BlockHeader,
    Compression, DEFAULT_BLOCK_SIZE, DEFAULT_BLOOM_BITS_PER_KEY, Footer, TableEntry, TableError,
    compress_payload, encode_entry,
};

/// Construction-time knobs.
#[derive(Debug, Clone)]
pub struct TableBuilderConfig {
    /// Uncompressed payload bytes that trigger block finalization.
    pub block_size: usize,
    /// Codec applied to data blocks.
    pub compression: Compression,
    /// Bloom bits per key; 0 disables the filter.
    pub bloom_bits_per_key: usize,
}

impl Default for TableBuilderConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compression: Compression::None,
            bloom_bits_per_key: DEFAULT_BLOOM_BITS_PER_KEY,
        }
    }
}

/// Metadata describing the finished table, returned by
/// [`TableBuilder::build`] so callers can register the file without
/// reopening it.
#[derive(Debug, Clone)]
pub struct TableSummary {
    /// Final file size in bytes.
    pub file_size: u64,
    /// Entries written (tombstones included).
    pub entry_count: u64,
    /// Lowest sequence number written.
    pub min_seq: u64,
    /// Highest sequence number written.
    pub max_seq: u64,
    /// Smallest key written.
    pub min_key: Vec<u8>,
    /// Largest key written.
    pub max_key: Vec<u8>,
}

/// Writes one table file from a sorted entry stream.
pub struct TableBuilder {
    path: PathBuf,
    config: TableBuilderConfig,
}

struct IndexDraft {
    first_key: Vec<u8>,
    block_offset: u64,
    block_size: u32,
    max_seq: u64,
}

impl TableBuilder {
    /// Targets `path` with default knobs.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_config(path, TableBuilderConfig::default())
    }

    /// Targets `path` with explicit knobs.
    pub fn with_config(path: impl AsRef<Path>, config: TableBuilderConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config,
        }
    }

    /// Consumes a key-ascending entry stream and writes the table.
    ///
    /// `expected_entries` sizes the bloom filter; it only needs to be an
    /// upper-bound estimate. Input must be non-empty and sorted by key
    /// (ties allowed for multi-version runs, newest first).
    pub fn build(
        self,
        entries: impl Iterator<Item = TableEntry>,
        expected_entries: usize,
    ) -> Result<TableSummary, TableError> {
        let tmp_path = self.path.with_extension("tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = CountingWriter {
            inner: BufWriter::new(file),
            offset: 0,
        };

        let mut bloom = if self.config.bloom_bits_per_key > 0 {
            // k optimally-hashed bits per key give a false-positive rate
            // of ~0.6185^k; 10 bits/key lands near 1 %.
            let fp_rate = 0.6185f64
                .powi(self.config.bloom_bits_per_key as i32)
                .clamp(1e-6, 0.5);
            Some(
                Bloom::<[u8]>::new_for_fp_rate(expected_entries.max(1), fp_rate)
                    .map_err(|e| TableError::InvalidInput(format!("bloom sizing: {e}")))?,
            )
        } else {
            None
        };

        let mut index: Vec<IndexDraft> = Vec::new();
        let mut block_buf: Vec<u8> = Vec::with_capacity(self.config.block_size + 512);
        let mut block_first_key: Option<Vec<u8>> = None;
        let mut block_max_seq = 0u64;
        let mut block_entries = 0u32;

        let mut entry_count = 0u64;
        let mut min_seq = u64::MAX;
        let mut max_seq = 0u64;
        let mut min_key: Option<Vec<u8>> = None;
        let mut max_key: Option<Vec<u8>> = None;
        let mut prev_key: Option<Vec<u8>> = None;

        for entry in entries {
            if let Some(prev) = &prev_key {
                if entry.key < *prev {
                    return Err(TableError::InvalidInput(
                        "entries are not sorted by key".into(),
                    ));
                }
            }
            prev_key = Some(entry.key.clone());

            if let Some(bloom) = bloom.as_mut() {
                bloom.set(&entry.key);
            }
            if block_first_key.is_none() {
                block_first_key = Some(entry.key.clone());
            }
            if min_key.is_none() {
                min_key = Some(entry.key.clone());
            }
            max_key = Some(entry.key.clone());
            min_seq = min_seq.min(entry.seq);
            max_seq = max_seq.max(entry.seq);
            block_max_seq = block_max_seq.max(entry.seq);
            entry_count += 1;
            block_entries += 1;

            encode_entry(&entry, &mut block_buf);

            if block_buf.len() >= self.config.block_size {
                Self::flush_block(
                    &mut writer,
                    &self.config,
                    &mut block_buf,
                    &mut block_first_key,
                    &mut block_max_seq,
                    &mut block_entries,
                    &mut index,
                )?;
            }
        }

        if entry_count == 0 {
            drop(writer);
            let _ = fs::remove_file(&tmp_path);
            return Err(TableError::InvalidInput(
                "cannot build a table from an empty entry stream".into(),
            ));
        }
        if !block_buf.is_empty() {
            Self::flush_block(
                &mut writer,
                &self.config,
                &mut block_buf,
                &mut block_first_key,
                &mut block_max_seq,
                &mut block_entries,
                &mut index,
            )?;
        }

        // Index block.
        let mut index_payload = Vec::new();
        for draft in &index {
            index_payload.extend_from_slice(&(draft.first_key.len() as u32).to_le_bytes());
            index_payload.extend_from_slice(&draft.block_offset.to_le_bytes());
            index_payload.extend_from_slice(&draft.block_size.to_le_bytes());
            index_payload.extend_from_slice(&draft.max_seq.to_le_bytes());
            index_payload.extend_from_slice(&draft.first_key);
        }
        let (index_offset, index_size) = Self::write_block(
            &mut writer,
            BLOCK_TYPE_INDEX,
            Compression::None,
            &index_payload,
            index.len() as u32,
        )?;

        // Bloom block.
        let (bloom_offset, bloom_size) = match bloom {
            Some(bloom) => {
                let bytes = bloom.as_slice().to_vec();
                Self::write_block(&mut writer, BLOCK_TYPE_BLOOM, Compression::None, &bytes, 1)?
            }
            None => (0, 0),
        };

        // Footer.
        let footer = Footer {
            index_offset,
            index_size,
            bloom_offset,
            bloom_size,
            min_seq,
            max_seq,
            entry_count,
        };
        writer.inner.write_all(&footer.encode())?;
        writer.offset += super::FOOTER_SIZE as u64;
        let file_size = writer.offset;

        let file = writer
            .inner
            .into_inner()
            .map_err(|e| TableError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                dir.sync_all()?;
            }
        }

        debug!(
            path = %self.path.display(),
            entries = entry_count,
            blocks = index.len(),
            file_size,
            "table built"
        );

        Ok(TableSummary {
            file_size,
            entry_count,
            min_seq,
            max_seq,
            min_key: min_key.unwrap_or_default(),
            max_key: max_key.unwrap_or_default(),
        })
    }

    /// Finalizes the pending data block and records its index entry.
    #[allow(clippy::too_many_arguments)]
    fn flush_block(
        writer: &mut CountingWriter,
        config: &TableBuilderConfig,
        block_buf: &mut Vec<u8>,
        block_first_key: &mut Option<Vec<u8>>,
        block_max_seq: &mut u64,
        block_entries: &mut u32,
        index: &mut Vec<IndexDraft>,
    ) -> Result<(), TableError> {
        let payload = std::mem::take(block_buf);
        let first_key = block_first_key
            .take()
            .ok_or_else(|| TableError::InvalidInput("flush of keyless block".into()))?;
        let (offset, size) = Self::write_block(
            writer,
            BLOCK_TYPE_DATA,
            config.compression,
            &payload,
            *block_entries,
        )?;
        index.push(IndexDraft {
            first_key,
            block_offset: offset,
            block_size: size,
            max_seq: *block_max_seq,
        });
        *block_max_seq = 0;
        *block_entries = 0;
        Ok(())
    }

    /// Writes one header-framed block; returns `(offset, total size)`.
    fn write_block(
        writer: &mut CountingWriter,
        block_type: u32,
        codec: Compression,
        payload: &[u8],
        entry_count: u32,
    ) -> Result<(u64, u32), TableError> {
        let stored = compress_payload(codec, payload);
        // Fall back to the identity codec when compression did not help.
        let (stored, codec) = if stored.len() >= payload.len() {
            (payload.to_vec(), Compression::None)
        } else {
            (stored, codec)
        };

        let mut crc = Crc32::new();
        crc.update(&stored);
        let header = BlockHeader {
            block_type,
            compressed_size: stored.len() as u32,
            uncompressed_size: payload.len() as u32,
            crc32: crc.finalize(),
            entry_count,
            codec: codec.tag(),
        };

        let offset = writer.offset;
        writer.inner.write_all(&header.encode())?;
        writer.inner.write_all(&stored)?;
        let total = (BLOCK_HEADER_SIZE + stored.len()) as u32;
        writer.offset += u64::from(total);
        Ok((offset, total))
    }
}

struct CountingWriter {
    inner: BufWriter<File>,
    offset: u64,
}
