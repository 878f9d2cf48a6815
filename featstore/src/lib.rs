use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod builder;
pub mod common;
pub mod config;
pub mod error;
pub mod keys;
pub mod materialize;
pub mod merge;
pub mod record;
pub mod retriever;
pub mod store;
pub mod vocab;

#[cfg(feature = "python")]
mod python;

pub use common::{ExampleId, FeatKey, Feature, FieldEncoding, FieldKey, VocabId};
pub use config::{KeyByteOrder, MissPolicy, RetrieverConfig, StoreOptions};
pub use error::{FeedError, FeedErrorKind, Result, StoreRole};
pub use materialize::FeatureBatch;
pub use retriever::{FeatureRetriever, field_info};
pub use vocab::{FieldInfo, FieldInfoColumns, Vocabulary};
