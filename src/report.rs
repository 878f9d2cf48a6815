//! Human-readable rendering of stored records and vocabulary statistics.

use std::fmt::Write;

use featstore::record::{CommFeatureView, ExampleView, FeatureList};
use featstore::vocab::{FieldInfoColumns, Vocabulary};

const RULE: &str = "══════════════════════════════════════════════════════════════";

fn header(out: &mut String, title: &str) {
    let _ = writeln!(out, "╔{RULE}╗");
    let _ = writeln!(out, "║  {title}");
    let _ = writeln!(out, "╠{RULE}╣");
}

fn footer(out: &mut String) {
    let _ = writeln!(out, "╚{RULE}╝");
}

fn feature_rows(out: &mut String, features: &FeatureList<'_>, vocab: Option<&Vocabulary>) {
    if features.is_empty() {
        let _ = writeln!(out, "║    (no features)");
        return;
    }
    for (i, f) in features.iter().enumerate() {
        let _ = write!(
            out,
            "║    [{i:>3}] field {:>8}  feat {:>10}  value {:>10.4}",
            f.field.0, f.feat.0, f.value
        );
        if let Some(vocab) = vocab {
            let _ = write!(out, "  -> vocab {}", vocab.remap(f.field, f.feat).0);
        }
        out.push('\n');
    }
}

/// Render one example record. With `vocab`, each feature also shows its
/// remapped vocabulary ID.
pub fn render_example(key: &str, view: &ExampleView<'_>, vocab: Option<&Vocabulary>) -> String {
    let mut out = String::new();
    header(&mut out, &format!("Example {key}"));
    let _ = writeln!(out, "║  example_id: {:>10}", view.example_id().0);
    let _ = writeln!(out, "║  y / z:      {:>5} / {}", view.y(), view.z());
    let comm_ref = if view.comm_ref().is_empty() {
        "(none)"
    } else {
        view.comm_ref()
    };
    let _ = writeln!(out, "║  comm_ref:   {comm_ref}");
    let _ = writeln!(out, "║  encoding:   {:?}", view.encoding());
    let _ = writeln!(
        out,
        "║  features:   {} stored, {} declared",
        view.features().len(),
        view.feat_num()
    );
    feature_rows(&mut out, view.features(), vocab);
    footer(&mut out);
    out
}

/// Render one common-feature record.
pub fn render_comm_feature(
    key: &str,
    view: &CommFeatureView<'_>,
    vocab: Option<&Vocabulary>,
) -> String {
    let mut out = String::new();
    header(&mut out, &format!("Common features {key}"));
    let _ = writeln!(out, "║  comm_ref:   {}", view.comm_ref());
    let _ = writeln!(out, "║  encoding:   {:?}", view.encoding());
    let _ = writeln!(
        out,
        "║  features:   {} stored, {} declared",
        view.features().len(),
        view.feat_num()
    );
    feature_rows(&mut out, view.features(), vocab);
    footer(&mut out);
    out
}

pub fn render_miss(key: &str) -> String {
    format!("  {key}: not found\n")
}

pub fn render_invalid(key: &str) -> String {
    format!("  {key}: invalid key\n")
}

/// Render the diagnostic field table with a totals row.
pub fn render_field_info(source: &str, cols: &FieldInfoColumns) -> String {
    let mut out = String::new();
    header(&mut out, &format!("Vocabulary: {source}"));
    let _ = writeln!(out, "║  {:>10}  {:>10}  {:>14}", "field", "slots", "counts");
    for i in 0..cols.len() {
        let _ = writeln!(
            out,
            "║  {:>10}  {:>10}  {:>14}",
            cols.field_ids[i], cols.slots[i], cols.counts[i]
        );
    }
    let slots: i64 = cols.slots.iter().sum();
    let counts: i64 = cols.counts.iter().sum();
    let _ = writeln!(out, "╠{RULE}╣");
    let _ = writeln!(out, "║  {:>10}  {slots:>10}  {counts:>14}", format!("{} fields", cols.len()));
    footer(&mut out);
    out
}
