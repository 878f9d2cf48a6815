//! Stored record layout and read-only views.
//!
//! Both record kinds share an 8-byte preamble: a 4-byte magic and a one-byte
//! [`FieldEncoding`] tag, then three zero bytes. All integers are
//! little-endian.
//!
//! ```text
//! Example ("CCPE"):
//!   preamble[8]
//!   example_id u32, y u16, z u16, feat_num u16, pad u16
//!   comm_ref_len u32, comm_ref[comm_ref_len] (UTF-8)
//!   num_feats u32, features[num_feats]
//!
//! Common features ("CCPC"):
//!   preamble[8]
//!   feat_num u16, pad u16
//!   comm_ref_len u32, comm_ref[comm_ref_len] (UTF-8)
//!   num_feats u32, features[num_feats]
//!
//! Numeric feature (12 bytes): field u32, feat u32, value f32
//! Token feature: field_len u16, field[..], feat_len u16, feat[..], value f32
//! ```
//!
//! Numeric feature lists are read in place. Token feature lists are
//! canonicalized through [`to_field_key`]/[`to_feat_key`] once, at parse
//! time, so a view never yields an identifier that has not been normalized.

use byteorder::{ByteOrder, LittleEndian};

use crate::common::{
    ExampleId, FeatKey, Feature, FieldEncoding, FieldKey, RawFeat, RawField, to_feat_key,
    to_field_key,
};
use crate::error::{FeedError, Result};

pub const EXAMPLE_MAGIC: [u8; 4] = *b"CCPE";
pub const COMM_FEATURE_MAGIC: [u8; 4] = *b"CCPC";

const PREAMBLE_BYTES: usize = 8;
const NUMERIC_FEATURE_BYTES: usize = 12;

// ============================================================================
// Feature Lists
// ============================================================================

/// Ordered feature list of a parsed record.
#[derive(Debug, Clone)]
pub enum FeatureList<'a> {
    /// Packed numeric features, borrowed from the payload.
    Packed(&'a [u8]),
    /// Token features, canonicalized at parse time.
    Decoded(Vec<Feature>),
}

impl FeatureList<'_> {
    pub fn len(&self) -> usize {
        match self {
            FeatureList::Packed(bytes) => bytes.len() / NUMERIC_FEATURE_BYTES,
            FeatureList::Decoded(feats) => feats.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feature at position `i`.
    ///
    /// # Panics
    /// Panics if `i >= self.len()`.
    #[inline]
    pub fn get(&self, i: usize) -> Feature {
        match self {
            FeatureList::Packed(bytes) => {
                let f = &bytes[i * NUMERIC_FEATURE_BYTES..(i + 1) * NUMERIC_FEATURE_BYTES];
                Feature {
                    field: FieldKey(LittleEndian::read_u32(&f[0..4])),
                    feat: FeatKey(LittleEndian::read_u32(&f[4..8])),
                    value: LittleEndian::read_f32(&f[8..12]),
                }
            }
            FeatureList::Decoded(feats) => feats[i],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

// ============================================================================
// Views
// ============================================================================

/// Read-only view of one stored example.
#[derive(Debug, Clone)]
pub struct ExampleView<'a> {
    encoding: FieldEncoding,
    example_id: ExampleId,
    y: u16,
    z: u16,
    feat_num: u16,
    comm_ref: &'a str,
    features: FeatureList<'a>,
}

impl<'a> ExampleView<'a> {
    pub fn encoding(&self) -> FieldEncoding {
        self.encoding
    }

    pub fn example_id(&self) -> ExampleId {
        self.example_id
    }

    pub fn y(&self) -> u16 {
        self.y
    }

    pub fn z(&self) -> u16 {
        self.z
    }

    /// Feature count declared by the source data. May differ from
    /// `features().len()`.
    pub fn feat_num(&self) -> u16 {
        self.feat_num
    }

    /// Reference to the shared common-feature record; empty when the example
    /// has none.
    pub fn comm_ref(&self) -> &'a str {
        self.comm_ref
    }

    pub fn features(&self) -> &FeatureList<'a> {
        &self.features
    }
}

/// Read-only view of one stored common-feature record.
#[derive(Debug, Clone)]
pub struct CommFeatureView<'a> {
    encoding: FieldEncoding,
    feat_num: u16,
    comm_ref: &'a str,
    features: FeatureList<'a>,
}

impl<'a> CommFeatureView<'a> {
    pub fn encoding(&self) -> FieldEncoding {
        self.encoding
    }

    pub fn feat_num(&self) -> u16 {
        self.feat_num
    }

    pub fn comm_ref(&self) -> &'a str {
        self.comm_ref
    }

    pub fn features(&self) -> &FeatureList<'a> {
        &self.features
    }
}

// ============================================================================
// Parsing
// ============================================================================

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len()).ok_or_else(|| {
            FeedError::corrupt(format!(
                "{} truncated: need {n} bytes at offset {}, have {}",
                self.what,
                self.pos,
                self.buf.len()
            ))
        })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    fn str(&mut self, len: usize) -> Result<&'a str> {
        let what = self.what;
        std::str::from_utf8(self.take(len)?)
            .map_err(|e| FeedError::corrupt(format!("{what} contains invalid UTF-8: {e}")))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn preamble(&mut self, magic: [u8; 4]) -> Result<FieldEncoding> {
        let head = self.take(PREAMBLE_BYTES)?;
        if head[..4] != magic {
            return Err(FeedError::corrupt(format!("{} magic mismatch", self.what)));
        }
        FieldEncoding::from_tag(head[4]).ok_or_else(|| {
            FeedError::corrupt(format!("{} has unknown field encoding {}", self.what, head[4]))
        })
    }

    fn features(&mut self, encoding: FieldEncoding) -> Result<FeatureList<'a>> {
        let num_feats = self.u32()? as usize;
        let list = match encoding {
            FieldEncoding::Numeric => {
                let expected = num_feats.checked_mul(NUMERIC_FEATURE_BYTES).ok_or_else(|| {
                    FeedError::corrupt(format!("{} feature count overflows", self.what))
                })?;
                if self.remaining() != expected {
                    return Err(FeedError::corrupt(format!(
                        "{} declares {num_feats} features ({expected} bytes) but has {} bytes",
                        self.what,
                        self.remaining()
                    )));
                }
                FeatureList::Packed(self.rest())
            }
            FieldEncoding::Token => {
                let mut feats = Vec::with_capacity(num_feats.min(self.remaining() / 8));
                for _ in 0..num_feats {
                    let field_len = self.u16()? as usize;
                    let field = self.str(field_len)?;
                    let feat_len = self.u16()? as usize;
                    let feat = self.str(feat_len)?;
                    let value = self.f32()?;
                    feats.push(Feature {
                        field: to_field_key(RawField::Token(field))?,
                        feat: to_feat_key(RawFeat::Token(feat))?,
                        value,
                    });
                }
                FeatureList::Decoded(feats)
            }
        };
        if self.remaining() != 0 {
            return Err(FeedError::corrupt(format!(
                "{} has {} trailing bytes",
                self.what,
                self.remaining()
            )));
        }
        Ok(list)
    }
}

/// Interpret `bytes` as a stored example.
pub fn parse_example(bytes: &[u8]) -> Result<ExampleView<'_>> {
    let mut cur = Cursor::new(bytes, "example record");
    let encoding = cur.preamble(EXAMPLE_MAGIC)?;
    let example_id = ExampleId(cur.u32()?);
    let y = cur.u16()?;
    let z = cur.u16()?;
    let feat_num = cur.u16()?;
    let _pad = cur.u16()?;
    let ref_len = cur.u32()? as usize;
    let comm_ref = cur.str(ref_len)?;
    let features = cur.features(encoding)?;
    Ok(ExampleView {
        encoding,
        example_id,
        y,
        z,
        feat_num,
        comm_ref,
        features,
    })
}

/// Interpret `bytes` as a stored common-feature record.
pub fn parse_comm_feature(bytes: &[u8]) -> Result<CommFeatureView<'_>> {
    let mut cur = Cursor::new(bytes, "common feature record");
    let encoding = cur.preamble(COMM_FEATURE_MAGIC)?;
    let feat_num = cur.u16()?;
    let _pad = cur.u16()?;
    let ref_len = cur.u32()? as usize;
    let comm_ref = cur.str(ref_len)?;
    let features = cur.features(encoding)?;
    Ok(CommFeatureView {
        encoding,
        feat_num,
        comm_ref,
        features,
    })
}

// ============================================================================
// Encoding
// ============================================================================

/// A feature whose identifiers are still the raw tokens from the source logs.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenFeature {
    pub field: String,
    pub feat: String,
    pub value: f32,
}

/// Feature payload of a record about to be written.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordFeatures {
    Numeric(Vec<Feature>),
    Token(Vec<TokenFeature>),
}

impl RecordFeatures {
    fn encoding(&self) -> FieldEncoding {
        match self {
            RecordFeatures::Numeric(_) => FieldEncoding::Numeric,
            RecordFeatures::Token(_) => FieldEncoding::Token,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RecordFeatures::Numeric(f) => f.len(),
            RecordFeatures::Token(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owned example, serialized with [`ExampleRecord::encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExampleRecord {
    pub example_id: ExampleId,
    pub y: u16,
    pub z: u16,
    pub comm_ref: String,
    pub feat_num: u16,
    pub features: RecordFeatures,
}

impl ExampleRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(32 + self.comm_ref.len() + self.features.len() * 12);
        put_preamble(&mut buf, EXAMPLE_MAGIC, self.features.encoding());
        put_u32(&mut buf, self.example_id.0);
        put_u16(&mut buf, self.y);
        put_u16(&mut buf, self.z);
        put_u16(&mut buf, self.feat_num);
        put_u16(&mut buf, 0);
        put_ref(&mut buf, &self.comm_ref)?;
        put_features(&mut buf, &self.features)?;
        Ok(buf)
    }
}

/// Owned common-feature record, serialized with [`CommFeatureRecord::encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommFeatureRecord {
    pub comm_ref: String,
    pub feat_num: u16,
    pub features: RecordFeatures,
}

impl CommFeatureRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(24 + self.comm_ref.len() + self.features.len() * 12);
        put_preamble(&mut buf, COMM_FEATURE_MAGIC, self.features.encoding());
        put_u16(&mut buf, self.feat_num);
        put_u16(&mut buf, 0);
        put_ref(&mut buf, &self.comm_ref)?;
        put_features(&mut buf, &self.features)?;
        Ok(buf)
    }
}

fn put_preamble(buf: &mut Vec<u8>, magic: [u8; 4], encoding: FieldEncoding) {
    buf.extend_from_slice(&magic);
    buf.extend_from_slice(&[encoding as u8, 0, 0, 0]);
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_ref(buf: &mut Vec<u8>, comm_ref: &str) -> Result<()> {
    let len = u32::try_from(comm_ref.len())
        .map_err(|_| FeedError::InvalidInput("common reference too long".to_string()))?;
    put_u32(buf, len);
    buf.extend_from_slice(comm_ref.as_bytes());
    Ok(())
}

fn put_token(buf: &mut Vec<u8>, token: &str) -> Result<()> {
    let len = u16::try_from(token.len())
        .map_err(|_| FeedError::InvalidInput(format!("token too long ({} bytes)", token.len())))?;
    put_u16(buf, len);
    buf.extend_from_slice(token.as_bytes());
    Ok(())
}

fn put_features(buf: &mut Vec<u8>, features: &RecordFeatures) -> Result<()> {
    let count = u32::try_from(features.len())
        .map_err(|_| FeedError::InvalidInput("too many features".to_string()))?;
    put_u32(buf, count);
    match features {
        RecordFeatures::Numeric(feats) => {
            for f in feats {
                put_u32(buf, f.field.0);
                put_u32(buf, f.feat.0);
                buf.extend_from_slice(&f.value.to_le_bytes());
            }
        }
        RecordFeatures::Token(feats) => {
            for f in feats {
                put_token(buf, &f.field)?;
                put_token(buf, &f.feat)?;
                buf.extend_from_slice(&f.value.to_le_bytes());
            }
        }
    }
    Ok(())
}
