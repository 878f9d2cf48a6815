//! Inspect stored records: fetch keys from an examples or common-features
//! store and dump them in a human-readable format.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --db db/examples --kind example --keys 7,42
//! cargo run --release --bin inspect -- --db db/comm_feats --kind comm --keys 9f0c2a --vocab db/vocab.bin
//! ```

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::warn;

use ccpfeed::report::{render_comm_feature, render_example, render_invalid, render_miss};
use featstore::error::hex_key;
use featstore::keys::KeyEncoder;
use featstore::record::{parse_comm_feature, parse_example};
use featstore::store::{RocksStore, bulk_get};
use featstore::{ExampleId, KeyByteOrder, MissPolicy, StoreOptions, StoreRole, Vocabulary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Kind {
    /// Examples store, keys are example IDs.
    Example,
    /// Common-features store, keys are common references.
    Comm,
}

#[derive(Parser, Debug)]
#[command(about = "Inspect records in a feature store")]
struct Args {
    /// Path to the store.
    #[arg(long)]
    db: PathBuf,

    /// Which kind of store `--db` is.
    #[arg(long, value_enum)]
    kind: Kind,

    /// Comma-separated keys to fetch.
    #[arg(long, value_delimiter = ',', required = true)]
    keys: Vec<String>,

    /// Optional vocabulary file; shows the remapped ID of every feature.
    #[arg(long)]
    vocab: Option<PathBuf>,

    /// The store was built with big-endian example keys.
    #[arg(long, default_value_t = false)]
    big_endian_keys: bool,
}

/// Encode each label as a store key. Labels that do not form a valid key are
/// reported and left out of the read.
fn encode_labels<'a>(
    kind: Kind,
    labels: &[&'a str],
    encoder: &KeyEncoder,
) -> (Vec<&'a str>, Vec<Vec<u8>>) {
    let mut kept = Vec::with_capacity(labels.len());
    let mut raw_keys = Vec::with_capacity(labels.len());
    for &label in labels {
        let key = match kind {
            Kind::Example => match label.parse::<u32>() {
                Ok(id) => encoder.example_key(ExampleId(id)).to_vec(),
                Err(e) => {
                    warn!("{label}: not an example id ({e})");
                    print!("{}", render_invalid(label));
                    continue;
                }
            },
            Kind::Comm => encoder.common_key(label).to_vec(),
        };
        kept.push(label);
        raw_keys.push(key);
    }
    (kept, raw_keys)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let options = StoreOptions {
        stats_dump_period_sec: 0,
        ..StoreOptions::default()
    };
    let store = RocksStore::open_read_only(&args.db, &options)?;
    let vocab = args.vocab.as_deref().map(Vocabulary::load).transpose()?;
    let encoder = KeyEncoder::new(if args.big_endian_keys {
        KeyByteOrder::Big
    } else {
        KeyByteOrder::Little
    });

    let labels: Vec<&str> = args.keys.iter().map(|k| k.trim()).collect();
    let (labels, raw_keys) = encode_labels(args.kind, &labels, &encoder);
    let key_refs: Vec<&[u8]> = raw_keys.iter().map(Vec::as_slice).collect();
    let role = match args.kind {
        Kind::Example => StoreRole::Examples,
        Kind::Comm => StoreRole::CommFeats,
    };
    let read = bulk_get(&store, role, &key_refs, MissPolicy::Skip)?;

    println!(
        "{} keys from {} ({} missing)\n",
        read.len(),
        args.db.display(),
        read.misses()
    );
    for (i, label) in labels.iter().enumerate() {
        let Some(bytes) = read.get(i) else {
            print!("{}", render_miss(&format!("{label} ({})", hex_key(key_refs[i]))));
            continue;
        };
        let rendered = match args.kind {
            Kind::Example => parse_example(bytes).map(|v| render_example(label, &v, vocab.as_ref())),
            Kind::Comm => {
                parse_comm_feature(bytes).map(|v| render_comm_feature(label, &v, vocab.as_ref()))
            }
        };
        match rendered {
            Ok(text) => println!("{text}"),
            Err(e) => warn!("{label}: {e}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_example_label_does_not_abort() {
        let encoder = KeyEncoder::default();
        let (labels, keys) = encode_labels(Kind::Example, &["7", "abc", "42"], &encoder);
        assert_eq!(labels, vec!["7", "42"]);
        assert_eq!(keys, vec![vec![7, 0, 0, 0], vec![42, 0, 0, 0]]);
    }

    #[test]
    fn test_comm_labels_kept_verbatim() {
        let encoder = KeyEncoder::default();
        let (labels, keys) = encode_labels(Kind::Comm, &["9f0c2a", "abc"], &encoder);
        assert_eq!(labels, vec!["9f0c2a", "abc"]);
        assert_eq!(keys, vec![b"9f0c2a".to_vec(), b"abc".to_vec()]);
    }
}
