//! Durable metadata record of the LSM tree.
//!
//! The manifest is a single fixed-size record at `data_dir/MANIFEST`
//! holding the schema version, the next file id to allocate, the
//! per-level SSTable counts, and the recovery sequence cursor (WAL
//! records at or below it are already persisted in SSTables).
//!
//! It is rewritten — never appended — on every durable state change,
//! using create-temp + rename + directory fsync so a crash leaves either
//! the old record or the new one, never a torn mix. A CRC32 trailer
//! detects partial or damaged records at load time.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::error::ErrorCode;

/// Number of LSM levels tracked.
pub const NUM_LEVELS: usize = 7;

/// Record magic: `"CKVM"` read as a little-endian u32.
const MANIFEST_MAGIC: u32 = 0x4D564B43;
/// Supported schema version.
const MANIFEST_VERSION: u32 = 1;
/// Serialized record size: magic, version, next_file_id, 7 level counts,
/// recovery_seq, crc32.
const RECORD_SIZE: usize = 4 + 4 + 8 + NUM_LEVELS * 4 + 8 + 4;

const TMP_SUFFIX: &str = "tmp";

/// Errors from manifest persistence.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Decoding failure (short or malformed record).
    #[error("manifest encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The record failed structural or checksum verification.
    #[error("corrupted manifest: {0}")]
    Corrupted(String),
}

impl ManifestError {
    /// Maps onto the stable error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::IoError,
            Self::Encoding(_) | Self::Corrupted(_) => ErrorCode::Corrupted,
        }
    }
}

/// The manifest's logical content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestData {
    /// Next SSTable file id to hand out. Monotonic.
    pub next_file_id: u64,
    /// SSTable count per level.
    pub level_file_counts: [u32; NUM_LEVELS],
    /// Highest sequence number whose effects are durable in SSTables.
    /// WAL replay starts just past it.
    pub recovery_seq: u64,
}

impl Default for ManifestData {
    fn default() -> Self {
        Self {
            next_file_id: 1,
            level_file_counts: [0; NUM_LEVELS],
            recovery_seq: 0,
        }
    }
}

impl Encode for ManifestData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        MANIFEST_MAGIC.encode_to(buf)?;
        MANIFEST_VERSION.encode_to(buf)?;
        self.next_file_id.encode_to(buf)?;
        for count in self.level_file_counts {
            count.encode_to(buf)?;
        }
        self.recovery_seq.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for ManifestData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (next_file_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let mut level_file_counts = [0u32; NUM_LEVELS];
        for slot in level_file_counts.iter_mut() {
            let (count, n) = u32::decode_from(&buf[off..])?;
            *slot = count;
            off += n;
        }
        let (recovery_seq, n) = u64::decode_from(&buf[off..])?;
        off += n;

        if magic != MANIFEST_MAGIC {
            return Err(EncodingError::InvalidTag {
                tag: magic,
                type_name: "ManifestData (magic)",
            });
        }
        if version != MANIFEST_VERSION {
            return Err(EncodingError::InvalidTag {
                tag: version,
                type_name: "ManifestData (schema version)",
            });
        }
        Ok((
            Self {
                next_file_id,
                level_file_counts,
                recovery_seq,
            },
            off,
        ))
    }
}

impl ManifestData {
    /// Serializes the record with its trailing CRC32.
    fn encode_record(&self) -> Result<Vec<u8>, ManifestError> {
        let mut buf = encoding::encode_to_vec(self)?;
        let mut crc = Crc32::new();
        crc.update(&buf);
        crc.finalize().encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Verifies and decodes a record written by [`Self::encode_record`].
    fn decode_record(buf: &[u8]) -> Result<Self, ManifestError> {
        if buf.len() != RECORD_SIZE {
            return Err(ManifestError::Corrupted(format!(
                "unexpected record size {} (want {RECORD_SIZE})",
                buf.len()
            )));
        }
        let crc_off = RECORD_SIZE - 4;
        let (stored_crc, _) = u32::decode_from(&buf[crc_off..])?;
        let mut crc = Crc32::new();
        crc.update(&buf[..crc_off]);
        if crc.finalize() != stored_crc {
            return Err(ManifestError::Corrupted("checksum mismatch".into()));
        }
        let (data, _) = encoding::decode_from_slice::<Self>(buf)?;
        Ok(data)
    }
}

/// Handle over the on-disk manifest record.
pub struct Manifest {
    path: PathBuf,
    data: Mutex<ManifestData>,
}

impl Manifest {
    /// Loads the record at `path`, or initialises a fresh one when the
    /// file does not exist. A present-but-damaged record is an error —
    /// silently resetting it would orphan every SSTable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref().to_path_buf();
        let data = match File::open(&path) {
            Ok(mut file) => {
                let mut buf = Vec::with_capacity(RECORD_SIZE);
                file.read_to_end(&mut buf)?;
                let data = ManifestData::decode_record(&buf)?;
                info!(path = %path.display(), ?data, "manifest loaded");
                data
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let data = ManifestData::default();
                info!(path = %path.display(), "manifest initialised");
                data
            }
            Err(e) => return Err(ManifestError::Io(e)),
        };
        let manifest = Self {
            path,
            data: Mutex::new(data),
        };
        // Make the initial record durable immediately so a crash before
        // the first checkpoint still finds a valid manifest.
        manifest.save()?;
        Ok(manifest)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManifestData> {
        match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Copy of the current record.
    pub fn data(&self) -> ManifestData {
        *self.lock()
    }

    /// Hands out the next file id and persists the advanced counter, so
    /// a crash cannot reuse an id already given to a table file.
    pub fn allocate_file_id(&self) -> Result<u64, ManifestError> {
        let mut data = self.lock();
        let id = data.next_file_id;
        data.next_file_id += 1;
        let snapshot = *data;
        drop(data);
        self.write_record(&snapshot)?;
        Ok(id)
    }

    /// Applies `mutate` to the record and persists the result.
    pub fn update(
        &self,
        mutate: impl FnOnce(&mut ManifestData),
    ) -> Result<ManifestData, ManifestError> {
        let mut data = self.lock();
        mutate(&mut data);
        let snapshot = *data;
        drop(data);
        self.write_record(&snapshot)?;
        Ok(snapshot)
    }

    /// Persists the current in-memory record.
    pub fn save(&self) -> Result<(), ManifestError> {
        let snapshot = *self.lock();
        self.write_record(&snapshot)
    }

    /// Create-temp + rename + directory fsync.
    fn write_record(&self, data: &ManifestData) -> Result<(), ManifestError> {
        let record = data.encode_record()?;
        let tmp_path = self.path.with_extension(TMP_SUFFIX);
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&record)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                dir.sync_all()?;
            }
        }
        debug!(
            next_file_id = data.next_file_id,
            recovery_seq = data.recovery_seq,
            "manifest persisted"
        );
        Ok(())
    }
}
