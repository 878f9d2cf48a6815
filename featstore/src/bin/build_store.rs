//! Store builder binary: loads raw sample files into the examples and
//! common-features stores and writes the vocabulary.
//!
//! ## Input
//!
//! - common data: one `comm_ref,feat_num,features` line per common record
//! - examples data: one `example_id,y,z,comm_ref,feat_num,features` line per example
//!
//! ## Output
//!
//! - two RocksDB stores (common features keyed by reference, examples keyed
//!   by encoded ID)
//! - the vocabulary file built from every feature seen in both inputs
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin build_store -- \
//!     --common-data raw/common.csv --examples-data raw/skeleton.csv \
//!     --common-db db/comm_feats --examples-db db/examples --vocab db/vocab.bin
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;
use indicatif::{HumanBytes, HumanCount, HumanDuration, ProgressBar, ProgressStyle};
use tracing::info;

use featstore::builder::{FieldStats, IngestSummary, RecordKind, ingest};
use featstore::keys::KeyEncoder;
use featstore::store::StoreWriter;
use featstore::vocab::write_vocabulary;
use featstore::{FieldEncoding, KeyByteOrder, StoreOptions};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Build the examples/common-features stores and vocabulary from raw samples")]
struct Args {
    /// Path to the raw common-features data.
    #[arg(long)]
    common_data: PathBuf,

    /// Path to the raw examples data.
    #[arg(long)]
    examples_data: PathBuf,

    /// Output path of the common-features store.
    #[arg(long)]
    common_db: PathBuf,

    /// Output path of the examples store.
    #[arg(long)]
    examples_db: PathBuf,

    /// Output path of the vocabulary file.
    #[arg(long)]
    vocab: PathBuf,

    /// Records per write batch.
    #[arg(long, default_value_t = 10_000)]
    batch: usize,

    /// Store field and feature identifiers as their raw tokens instead of
    /// canonical integers.
    #[arg(long, default_value_t = false)]
    token_fields: bool,

    /// Encode example keys big-endian.
    #[arg(long, default_value_t = false)]
    big_endian_keys: bool,
}

// ============================================================================

fn load(
    data: &Path,
    db: &Path,
    kind: RecordKind,
    args: &Args,
    keys: &KeyEncoder,
    stats: &mut FieldStats,
) -> Result<IngestSummary, Box<dyn std::error::Error>> {
    let file = File::open(data)?;
    let total_bytes = file.metadata()?.len();

    let pb = ProgressBar::new(total_bytes);
    pb.set_style(
        ProgressStyle::with_template(
            "  Loading    {bar:40.cyan/blue} {bytes}/{total_bytes} [{elapsed_precise} elapsed, ETA {eta_precise}]",
        )?
        .progress_chars("##-"),
    );

    let encoding = if args.token_fields {
        FieldEncoding::Token
    } else {
        FieldEncoding::Numeric
    };
    let options = StoreOptions::default();
    let mut writer = StoreWriter::create(db, &options, args.batch)?;
    let summary = ingest(
        BufReader::new(file),
        kind,
        encoding,
        keys,
        stats,
        &mut writer,
        |n| pb.inc(n),
    )?;
    let bytes = writer.bytes();
    writer.finish()?;
    pb.finish_and_clear();

    info!(
        "  {} -> {}: {} records ({}), {} lines skipped",
        data.display(),
        db.display(),
        HumanCount(summary.written),
        HumanBytes(bytes),
        summary.skipped
    );
    Ok(summary)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let keys = KeyEncoder::new(if args.big_endian_keys {
        KeyByteOrder::Big
    } else {
        KeyByteOrder::Little
    });

    info!("Common data:   {}", args.common_data.display());
    info!("Examples data: {}", args.examples_data.display());
    info!("Common db:     {}", args.common_db.display());
    info!("Examples db:   {}", args.examples_db.display());
    info!("Vocab:         {}", args.vocab.display());

    let start = Instant::now();
    let mut stats = FieldStats::new();

    info!("Step 1: Loading common features...");
    load(
        &args.common_data,
        &args.common_db,
        RecordKind::Common,
        &args,
        &keys,
        &mut stats,
    )?;

    info!("Step 2: Loading examples...");
    load(
        &args.examples_data,
        &args.examples_db,
        RecordKind::Example,
        &args,
        &keys,
        &mut stats,
    )?;

    info!("Step 3: Writing vocabulary...");
    let observations = stats.observations();
    let (entries, infos) = stats.into_vocabulary();
    write_vocabulary(&args.vocab, &entries, &infos)?;
    info!(
        "  {} entries across {} fields from {} observations",
        HumanCount(entries.len() as u64),
        infos.len(),
        HumanCount(observations)
    );

    info!("Done in {}", HumanDuration(start.elapsed()));
    Ok(())
}
