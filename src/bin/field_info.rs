//! Print per-field statistics of a vocabulary file.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin field_info -- --vocab db/vocab.bin
//! ```

use std::path::PathBuf;

use clap::Parser;

use ccpfeed::report::render_field_info;

#[derive(Parser, Debug)]
#[command(about = "Print field statistics from a vocabulary file")]
struct Args {
    /// Path to the vocabulary file.
    #[arg(long)]
    vocab: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let cols = featstore::field_info(&args.vocab)?;
    print!("{}", render_field_info(&args.vocab.display().to_string(), &cols));
    Ok(())
}
