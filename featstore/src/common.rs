//! Common types and constants used throughout the project.

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};

// ============================================================================
// Index NewTypes
// ============================================================================

/// Identifier of one example in the examples store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExampleId(pub u32);

/// Canonical field identifier. Every stored field encoding is normalized to
/// this type by [`to_field_key`] before any vocabulary lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldKey(pub u32);

/// Canonical (raw) feature identifier within a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatKey(pub u32);

/// Compact vocabulary ID consumed by the embedding tables.
///
/// `VocabId(0)` is both the "unknown feature" result of a vocabulary miss and
/// the padding value; downstream consumers cannot tell the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VocabId(pub u32);

impl VocabId {
    pub const UNKNOWN: VocabId = VocabId(0);
}

// ============================================================================
// Constants
// ============================================================================

/// Examples per parallel work unit.
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// Scheduler cost estimate for one chunk of `DEFAULT_CHUNK_SIZE` examples.
pub const DEFAULT_COST_PER_UNIT: u64 = 10 * 6000 * DEFAULT_CHUNK_SIZE as u64;

/// Width of an example key in the examples store.
pub const EXAMPLE_KEY_LEN: usize = std::mem::size_of::<u32>();

// ============================================================================
// Features
// ============================================================================

/// One canonicalized `(field, feature, value)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Feature {
    pub field: FieldKey,
    pub feat: FeatKey,
    pub value: f32,
}

impl Feature {
    pub fn new(field: u32, feat: u32, value: f32) -> Self {
        Self {
            field: FieldKey(field),
            feat: FeatKey(feat),
            value,
        }
    }
}

/// How a store generation encodes field and feature identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldEncoding {
    /// Identifiers are stored as canonical `u32`s.
    Numeric = 0,
    /// Identifiers are stored as the raw string tokens from the source logs.
    Token = 1,
}

impl FieldEncoding {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FieldEncoding::Numeric),
            1 => Some(FieldEncoding::Token),
            _ => None,
        }
    }
}

/// A field identifier as it appears in storage, before canonicalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawField<'a> {
    Id(u32),
    Token(&'a str),
}

/// A feature identifier as it appears in storage, before canonicalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFeat<'a> {
    Id(u32),
    Token(&'a str),
}

/// Normalize a stored field identifier into a [`FieldKey`].
///
/// Legacy token rules:
/// - a token containing `'_'` drops every underscore and parses the rest
///   (`"150_14"` -> `15014`);
/// - any other token is a base field scaled by 100 (`"205"` -> `20500`).
pub fn to_field_key(raw: RawField<'_>) -> Result<FieldKey> {
    match raw {
        RawField::Id(id) => Ok(FieldKey(id)),
        RawField::Token(token) => {
            if token.contains('_') {
                let digits: String = token.chars().filter(|&c| c != '_').collect();
                parse_u32(&digits)
                    .map(FieldKey)
                    .ok_or_else(|| FeedError::corrupt(format!("bad field token {token:?}")))
            } else {
                parse_u32(token)
                    .and_then(|base| base.checked_mul(100))
                    .map(FieldKey)
                    .ok_or_else(|| FeedError::corrupt(format!("bad field token {token:?}")))
            }
        }
    }
}

/// Normalize a stored feature identifier into a [`FeatKey`].
pub fn to_feat_key(raw: RawFeat<'_>) -> Result<FeatKey> {
    match raw {
        RawFeat::Id(id) => Ok(FeatKey(id)),
        RawFeat::Token(token) => parse_u32(token)
            .map(FeatKey)
            .ok_or_else(|| FeedError::corrupt(format!("bad feature token {token:?}"))),
    }
}

/// Strict decimal parse: ASCII digits only, no sign, no whitespace.
fn parse_u32(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
