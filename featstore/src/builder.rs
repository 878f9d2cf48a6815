//! Offline store builder: parses raw sample lines into stored records and
//! accumulates the field statistics that become the vocabulary.
//!
//! Raw formats, one record per line:
//!
//! ```text
//! example: example_id,y,z,comm_ref,feat_num,features
//! common:  comm_ref,feat_num,features
//! ```
//!
//! `features` is a `\x01`-separated list of `field\x02feat\x03value` items.

use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;

use tracing::{info, warn};

use crate::common::{
    ExampleId, FeatKey, Feature, FieldEncoding, FieldKey, RawFeat, RawField, VocabId,
    to_feat_key, to_field_key,
};
use crate::error::{FeedError, Result};
use crate::keys::KeyEncoder;
use crate::record::{CommFeatureRecord, ExampleRecord, RecordFeatures, TokenFeature};
use crate::store::{MemStore, StoreWriter};
use crate::vocab::{FieldInfo, VocabEntry};

const ITEM_SEP: char = '\x01';
const ID_SEP: char = '\x02';
const VALUE_SEP: char = '\x03';

// ============================================================================
// Field Statistics
// ============================================================================

/// Occurrence counts per `(field, feat)`, threaded through one scan.
#[derive(Debug, Default, Clone)]
pub struct FieldStats {
    counts: HashMap<FieldKey, HashMap<FeatKey, u32>>,
    observations: u64,
}

impl FieldStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, field: FieldKey, feat: FeatKey) {
        let count = self.counts.entry(field).or_default().entry(feat).or_insert(0);
        *count = count.saturating_add(1);
        self.observations += 1;
    }

    pub fn num_fields(&self) -> usize {
        self.counts.len()
    }

    pub fn observations(&self) -> u64 {
        self.observations
    }

    /// Assign vocabulary IDs: within each field, features are ranked by
    /// descending count (ties by ascending feature ID) and numbered from 1.
    /// Output is ordered by field ID.
    pub fn into_vocabulary(self) -> (Vec<VocabEntry>, Vec<FieldInfo>) {
        let fields: BTreeMap<FieldKey, HashMap<FeatKey, u32>> = self.counts.into_iter().collect();
        let mut entries = Vec::with_capacity(fields.values().map(HashMap::len).sum());
        let mut infos = Vec::with_capacity(fields.len());

        for (field, feats) in fields {
            let mut ranked: Vec<(FeatKey, u32)> = feats.into_iter().collect();
            ranked.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

            let mut field_counts = 0u64;
            for (i, &(feat, counts)) in ranked.iter().enumerate() {
                entries.push(VocabEntry {
                    field,
                    feat,
                    vocab_id: VocabId(i as u32 + 1),
                    counts,
                });
                field_counts += u64::from(counts);
            }
            infos.push(FieldInfo {
                field,
                slots: ranked.len() as u32,
                counts: field_counts,
            });
        }
        (entries, infos)
    }
}

// ============================================================================
// Line Parsing
// ============================================================================

/// Parse a `\x01`-separated feature list. Malformed items are skipped with a
/// warning; every kept item is counted in `stats`.
pub fn parse_features(
    raw: &str,
    encoding: FieldEncoding,
    stats: &mut FieldStats,
) -> RecordFeatures {
    let mut numeric = Vec::new();
    let mut tokens = Vec::new();
    if !raw.is_empty() {
        for item in raw.split(ITEM_SEP) {
            let Some((field_tok, feat_tok, value)) = parse_item(item) else {
                continue;
            };
            let (field, feat) = match (
                to_field_key(RawField::Token(field_tok)),
                to_feat_key(RawFeat::Token(feat_tok)),
            ) {
                (Ok(field), Ok(feat)) => (field, feat),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("skipping feature {item:?}: {e}");
                    continue;
                }
            };
            stats.record(field, feat);
            match encoding {
                FieldEncoding::Numeric => numeric.push(Feature { field, feat, value }),
                FieldEncoding::Token => tokens.push(TokenFeature {
                    field: field_tok.to_string(),
                    feat: feat_tok.to_string(),
                    value,
                }),
            }
        }
    }
    match encoding {
        FieldEncoding::Numeric => RecordFeatures::Numeric(numeric),
        FieldEncoding::Token => RecordFeatures::Token(tokens),
    }
}

fn parse_item(item: &str) -> Option<(&str, &str, f32)> {
    let mut kv = item.split(VALUE_SEP);
    let (Some(ids), Some(value), None) = (kv.next(), kv.next(), kv.next()) else {
        warn!("skipping feature {item:?}: expected ids\\x03value");
        return None;
    };
    let mut parts = ids.split(ID_SEP);
    let (Some(field), Some(feat), None) = (parts.next(), parts.next(), parts.next()) else {
        warn!("skipping feature {item:?}: expected field\\x02feat");
        return None;
    };
    match value.trim().parse::<f32>() {
        Ok(value) => Some((field, feat, value)),
        Err(e) => {
            warn!("skipping feature {item:?}: bad value: {e}");
            None
        }
    }
}

fn parse_num<T: std::str::FromStr>(s: &str, what: &str, line_no: u64) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    s.trim()
        .parse()
        .map_err(|e| FeedError::InvalidInput(format!("line {line_no}: bad {what} {s:?}: {e}")))
}

/// Parse one raw example line.
pub fn parse_example_line(
    line: &str,
    line_no: u64,
    encoding: FieldEncoding,
    stats: &mut FieldStats,
) -> Result<ExampleRecord> {
    let items: Vec<&str> = line.split(',').collect();
    let [id, y, z, comm_ref, feat_num, features] = items[..] else {
        return Err(FeedError::InvalidInput(format!(
            "line {line_no}: expected 6 comma-separated items, got {}",
            items.len()
        )));
    };
    let example_id = ExampleId(parse_num(id, "example id", line_no)?);
    let y = parse_num(y, "y", line_no)?;
    let z = parse_num(z, "z", line_no)?;
    let feat_num = parse_num(feat_num, "feat_num", line_no)?;
    Ok(ExampleRecord {
        example_id,
        y,
        z,
        comm_ref: comm_ref.to_string(),
        feat_num,
        features: parse_features(features, encoding, stats),
    })
}

/// Parse one raw common-feature line.
pub fn parse_common_line(
    line: &str,
    line_no: u64,
    encoding: FieldEncoding,
    stats: &mut FieldStats,
) -> Result<CommFeatureRecord> {
    let items: Vec<&str> = line.split(',').collect();
    let [comm_ref, feat_num, features] = items[..] else {
        return Err(FeedError::InvalidInput(format!(
            "line {line_no}: expected 3 comma-separated items, got {}",
            items.len()
        )));
    };
    if comm_ref.is_empty() {
        return Err(FeedError::InvalidInput(format!(
            "line {line_no}: empty common reference"
        )));
    }
    let feat_num = parse_num(feat_num, "feat_num", line_no)?;
    Ok(CommFeatureRecord {
        comm_ref: comm_ref.to_string(),
        feat_num,
        features: parse_features(features, encoding, stats),
    })
}

// ============================================================================
// Ingest
// ============================================================================

/// Destination of encoded records.
pub trait RecordSink {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
}

impl RecordSink for StoreWriter {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        StoreWriter::put(self, key, value)
    }
}

impl RecordSink for MemStore {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Example,
    Common,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub lines: u64,
    pub written: u64,
    pub skipped: u64,
    pub bytes_read: u64,
}

/// Parse every line of `reader` as `kind` and write the encoded records to
/// `sink`. Unparseable lines are skipped with a warning. `on_line` receives
/// the byte length of each consumed line.
pub fn ingest<R: BufRead>(
    mut reader: R,
    kind: RecordKind,
    encoding: FieldEncoding,
    keys: &KeyEncoder,
    stats: &mut FieldStats,
    sink: &mut dyn RecordSink,
    mut on_line: impl FnMut(u64),
) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    let mut buf = String::new();
    loop {
        buf.clear();
        let consumed = reader.read_line(&mut buf)? as u64;
        if consumed == 0 {
            break;
        }
        summary.lines += 1;
        summary.bytes_read += consumed;
        on_line(consumed);

        let line = buf.strip_suffix('\n').unwrap_or(&buf);
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            summary.skipped += 1;
            continue;
        }

        let encoded = match kind {
            RecordKind::Example => parse_example_line(line, summary.lines, encoding, stats)
                .and_then(|r| Ok((keys.example_key(r.example_id).to_vec(), r.encode()?))),
            RecordKind::Common => parse_common_line(line, summary.lines, encoding, stats)
                .and_then(|r| Ok((keys.common_key(&r.comm_ref).to_vec(), r.encode()?))),
        };
        match encoded {
            Ok((key, value)) => {
                sink.put(&key, &value)?;
                summary.written += 1;
            }
            Err(e) => {
                warn!("skipping line: {e}");
                summary.skipped += 1;
            }
        }
    }
    info!(
        "Ingested {:?} lines: {} written, {} skipped",
        kind, summary.written, summary.skipped
    );
    Ok(summary)
}
