//! Store key encoding.
//!
//! Example keys are the example ID as a fixed 4-byte integer in the byte order
//! the store was populated with ([`KeyByteOrder`]). Common-feature keys are the
//! UTF-8 bytes of the common reference, unchanged.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::common::{EXAMPLE_KEY_LEN, ExampleId};
use crate::config::KeyByteOrder;
use crate::error::{FeedError, Result, hex_key};

/// Encodes and decodes store keys for one store generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyEncoder {
    order: KeyByteOrder,
}

impl KeyEncoder {
    pub fn new(order: KeyByteOrder) -> Self {
        Self { order }
    }

    pub fn byte_order(&self) -> KeyByteOrder {
        self.order
    }

    pub fn example_key(&self, id: ExampleId) -> [u8; EXAMPLE_KEY_LEN] {
        let mut key = [0u8; EXAMPLE_KEY_LEN];
        match self.order {
            KeyByteOrder::Little => LittleEndian::write_u32(&mut key, id.0),
            KeyByteOrder::Big => BigEndian::write_u32(&mut key, id.0),
        }
        key
    }

    /// Inverse of [`example_key`](Self::example_key).
    pub fn decode_example_key(&self, key: &[u8]) -> Result<ExampleId> {
        if key.len() != EXAMPLE_KEY_LEN {
            return Err(FeedError::corrupt(format!(
                "example key {} has {} bytes, expected {EXAMPLE_KEY_LEN}",
                hex_key(key),
                key.len()
            )));
        }
        let id = match self.order {
            KeyByteOrder::Little => LittleEndian::read_u32(key),
            KeyByteOrder::Big => BigEndian::read_u32(key),
        };
        Ok(ExampleId(id))
    }

    pub fn common_key<'a>(&self, comm_ref: &'a str) -> &'a [u8] {
        comm_ref.as_bytes()
    }
}
