//! Vocabulary index: `(field, feature) -> vocabulary ID`, plus per-field
//! statistics for diagnostics.
//!
//! ## File layout
//!
//! ```text
//! Header (16 bytes, little-endian):
//!   magic        [u8; 4] = "CVOC"
//!   version      u32     = 1
//!   num_entries  u32
//!   num_infos    u32
//! Entries (16 bytes each):
//!   field u32, feat u32, vocab_id u32, counts u32
//! Field infos (16 bytes each):
//!   field u32, slots u32, counts u64
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memmap2::Mmap;
use tracing::{info, warn};

use crate::common::{FeatKey, FieldKey, VocabId};
use crate::error::{FeedError, Result};

pub const VOCAB_MAGIC: [u8; 4] = *b"CVOC";
pub const VOCAB_VERSION: u32 = 1;

const HEADER_BYTES: usize = 16;
const ENTRY_BYTES: usize = 16;
const INFO_BYTES: usize = 16;

/// One vocabulary assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabEntry {
    pub field: FieldKey,
    pub feat: FeatKey,
    pub vocab_id: VocabId,
    /// Observations of this feature in the source data.
    pub counts: u32,
}

/// Per-field summary: distinct features and total observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub field: FieldKey,
    pub slots: u32,
    pub counts: u64,
}

/// Three parallel columns describing every known field, ordered by field ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldInfoColumns {
    pub field_ids: Vec<i64>,
    pub slots: Vec<i64>,
    pub counts: Vec<i64>,
}

impl FieldInfoColumns {
    pub fn len(&self) -> usize {
        self.field_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.field_ids.is_empty()
    }
}

/// In-memory vocabulary. Read-only once constructed.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    table: HashMap<FieldKey, HashMap<FeatKey, VocabId>>,
    field_infos: BTreeMap<FieldKey, FieldInfo>,
    num_entries: usize,
}

impl Vocabulary {
    /// Load a vocabulary file.
    ///
    /// An unreadable path, a malformed payload or a payload with no entries
    /// is reported as [`FeedError::DataCorruption`].
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            FeedError::corrupt(format!("cannot read vocab {}: {e}", path.display()))
        })?;
        let len = file
            .metadata()
            .map_err(|e| FeedError::corrupt(format!("cannot stat vocab {}: {e}", path.display())))?
            .len();
        if len < HEADER_BYTES as u64 {
            return Err(FeedError::corrupt(format!(
                "vocab {} is too small ({len} bytes)",
                path.display()
            )));
        }
        // SAFETY: the file is opened read-only and the map is dropped before
        // this function returns; nothing borrows from it afterwards.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
            FeedError::corrupt(format!("cannot map vocab {}: {e}", path.display()))
        })?;
        let vocab = Self::from_bytes(&mmap)?;
        info!(
            "Loaded vocab {}: {} entries across {} fields",
            path.display(),
            vocab.num_entries,
            vocab.table.len()
        );
        Ok(vocab)
    }

    /// Parse a serialized vocabulary.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_BYTES {
            return Err(FeedError::corrupt("vocab header truncated"));
        }
        if bytes[..4] != VOCAB_MAGIC {
            return Err(FeedError::corrupt("vocab magic mismatch"));
        }
        let version = LittleEndian::read_u32(&bytes[4..8]);
        if version != VOCAB_VERSION {
            return Err(FeedError::corrupt(format!(
                "unsupported vocab version {version}"
            )));
        }
        let num_entries = LittleEndian::read_u32(&bytes[8..12]) as usize;
        let num_infos = LittleEndian::read_u32(&bytes[12..16]) as usize;
        if num_entries == 0 {
            return Err(FeedError::corrupt("vocab has no entries"));
        }

        let expected = HEADER_BYTES + num_entries * ENTRY_BYTES + num_infos * INFO_BYTES;
        if bytes.len() != expected {
            return Err(FeedError::corrupt(format!(
                "vocab size {} does not match header ({expected} bytes for {num_entries} entries, {num_infos} infos)",
                bytes.len()
            )));
        }

        let entries_end = HEADER_BYTES + num_entries * ENTRY_BYTES;
        let entries = bytes[HEADER_BYTES..entries_end]
            .chunks_exact(ENTRY_BYTES)
            .map(|e| VocabEntry {
                field: FieldKey(LittleEndian::read_u32(&e[0..4])),
                feat: FeatKey(LittleEndian::read_u32(&e[4..8])),
                vocab_id: VocabId(LittleEndian::read_u32(&e[8..12])),
                counts: LittleEndian::read_u32(&e[12..16]),
            });
        let infos = bytes[entries_end..]
            .chunks_exact(INFO_BYTES)
            .map(|i| FieldInfo {
                field: FieldKey(LittleEndian::read_u32(&i[0..4])),
                slots: LittleEndian::read_u32(&i[4..8]),
                counts: LittleEndian::read_u64(&i[8..16]),
            });

        Ok(Self::from_parts(entries, infos))
    }

    /// Build a vocabulary from already-decoded entries and field infos. Later
    /// entries for the same `(field, feat)` replace earlier ones.
    pub fn from_parts(
        entries: impl IntoIterator<Item = VocabEntry>,
        infos: impl IntoIterator<Item = FieldInfo>,
    ) -> Self {
        let mut table: HashMap<FieldKey, HashMap<FeatKey, VocabId>> = HashMap::new();
        let mut duplicates = 0usize;
        for entry in entries {
            if table
                .entry(entry.field)
                .or_default()
                .insert(entry.feat, entry.vocab_id)
                .is_some()
            {
                duplicates += 1;
            }
        }
        if duplicates > 0 {
            warn!("vocab contains {duplicates} duplicate (field, feat) entries; last one wins");
        }
        let num_entries = table.values().map(HashMap::len).sum();
        let field_infos = infos.into_iter().map(|i| (i.field, i)).collect();
        Self {
            table,
            field_infos,
            num_entries,
        }
    }

    /// Vocabulary ID of `(field, feat)`, or [`VocabId::UNKNOWN`] if absent.
    #[inline]
    pub fn remap(&self, field: FieldKey, feat: FeatKey) -> VocabId {
        self.table
            .get(&field)
            .and_then(|feats| feats.get(&feat))
            .copied()
            .unwrap_or(VocabId::UNKNOWN)
    }

    /// Number of distinct `(field, feat)` pairs.
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn num_fields(&self) -> usize {
        self.table.len()
    }

    /// Field statistics ordered by field ID.
    pub fn field_infos(&self) -> impl Iterator<Item = &FieldInfo> {
        self.field_infos.values()
    }

    pub fn field_info(&self, field: FieldKey) -> Option<&FieldInfo> {
        self.field_infos.get(&field)
    }

    /// Field statistics as the three parallel columns of the diagnostic op.
    pub fn field_info_columns(&self) -> FieldInfoColumns {
        let mut cols = FieldInfoColumns::default();
        for info in self.field_infos.values() {
            cols.field_ids.push(info.field.0 as i64);
            cols.slots.push(info.slots as i64);
            cols.counts.push(info.counts as i64);
        }
        cols
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Serialize a vocabulary in the on-disk layout.
pub fn encode_vocabulary(entries: &[VocabEntry], infos: &[FieldInfo]) -> Result<Vec<u8>> {
    let num_entries = count_u32(entries.len(), "vocabulary entries")?;
    let num_infos = count_u32(infos.len(), "field infos")?;
    let mut buf =
        Vec::with_capacity(HEADER_BYTES + entries.len() * ENTRY_BYTES + infos.len() * INFO_BYTES);
    buf.extend_from_slice(&VOCAB_MAGIC);
    buf.write_u32::<LittleEndian>(VOCAB_VERSION)?;
    buf.write_u32::<LittleEndian>(num_entries)?;
    buf.write_u32::<LittleEndian>(num_infos)?;
    for e in entries {
        buf.write_u32::<LittleEndian>(e.field.0)?;
        buf.write_u32::<LittleEndian>(e.feat.0)?;
        buf.write_u32::<LittleEndian>(e.vocab_id.0)?;
        buf.write_u32::<LittleEndian>(e.counts)?;
    }
    for i in infos {
        buf.write_u32::<LittleEndian>(i.field.0)?;
        buf.write_u32::<LittleEndian>(i.slots)?;
        buf.write_u64::<LittleEndian>(i.counts)?;
    }
    Ok(buf)
}

fn count_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| FeedError::InvalidInput(format!("too many {what} ({len})")))
}

/// Write a vocabulary file to `path`, replacing any existing file.
pub fn write_vocabulary(path: &Path, entries: &[VocabEntry], infos: &[FieldInfo]) -> Result<()> {
    let bytes = encode_vocabulary(entries, infos)?;
    std::fs::write(path, bytes)?;
    info!(
        "Wrote vocab {}: {} entries, {} field infos",
        path.display(),
        entries.len(),
        infos.len()
    );
    Ok(())
}
