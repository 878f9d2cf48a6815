//! Per-example merge of own and common features into one fixed-width row.

use crate::record::{CommFeatureView, ExampleView, FeatureList};
use crate::vocab::Vocabulary;

/// Mutable slots of one output row. All three slices have `max_feats` entries.
pub struct RowSlots<'a> {
    pub field_ids: &'a mut [i64],
    pub feat_ids: &'a mut [i64],
    pub values: &'a mut [f32],
}

impl<'a> RowSlots<'a> {
    pub fn new(field_ids: &'a mut [i64], feat_ids: &'a mut [i64], values: &'a mut [f32]) -> Self {
        debug_assert_eq!(field_ids.len(), feat_ids.len());
        debug_assert_eq!(field_ids.len(), values.len());
        Self {
            field_ids,
            feat_ids,
            values,
        }
    }

    pub fn max_feats(&self) -> usize {
        self.field_ids.len()
    }

    #[inline]
    fn write(&mut self, slot: usize, features: &FeatureList<'_>, i: usize, vocab: &Vocabulary) {
        let f = features.get(i);
        self.field_ids[slot] = i64::from(f.field.0);
        self.feat_ids[slot] = i64::from(vocab.remap(f.field, f.feat).0);
        self.values[slot] = f.value;
    }

    fn zero_from(&mut self, start: usize) {
        self.field_ids[start..].fill(0);
        self.feat_ids[start..].fill(0);
        self.values[start..].fill(0.0);
    }
}

/// Fill `row` with the example's own features followed by its common
/// features, truncated to `row.max_feats()`, and zero the rest.
///
/// Own features always take the prefix. The common list only contributes
/// whatever budget is left, so truncation drops its tail first. Returns the
/// number of populated slots.
pub fn merge_into(
    example: &ExampleView<'_>,
    common: Option<&CommFeatureView<'_>>,
    vocab: &Vocabulary,
    mut row: RowSlots<'_>,
) -> usize {
    let max_feats = row.max_feats();
    let own = example.features();
    let own_len = own.len().min(max_feats);

    for i in 0..own_len {
        row.write(i, own, i, vocab);
    }

    let mut len = own_len;
    if let Some(common) = common {
        let shared = common.features();
        let cap = max_feats.min(own.len() + shared.len());
        while len < cap {
            row.write(len, shared, len - own_len, vocab);
            len += 1;
        }
    }

    row.zero_from(len);
    len
}

/// Zero an entire row, used for examples that were skipped.
pub fn clear_row(mut row: RowSlots<'_>) {
    row.zero_from(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ExampleId, FeatKey, Feature, FieldKey, VocabId};
    use crate::record::{
        CommFeatureRecord, ExampleRecord, RecordFeatures, parse_comm_feature, parse_example,
    };
    use crate::vocab::{FieldInfo, VocabEntry};

    struct Row {
        field_ids: Vec<i64>,
        feat_ids: Vec<i64>,
        values: Vec<f32>,
    }

    impl Row {
        fn new(max_feats: usize) -> Self {
            // Pre-fill with garbage so zero-fill is actually checked.
            Self {
                field_ids: vec![-1; max_feats],
                feat_ids: vec![-1; max_feats],
                values: vec![-1.0; max_feats],
            }
        }

        fn slots(&mut self) -> RowSlots<'_> {
            RowSlots::new(&mut self.field_ids, &mut self.feat_ids, &mut self.values)
        }
    }

    fn vocab() -> Vocabulary {
        // Field 100 features map to feat + 1000; field 200 is unknown.
        let entries = (0..20).map(|feat| VocabEntry {
            field: FieldKey(100),
            feat: FeatKey(feat),
            vocab_id: VocabId(feat + 1000),
            counts: 1,
        });
        let infos = [FieldInfo {
            field: FieldKey(100),
            slots: 20,
            counts: 20,
        }];
        Vocabulary::from_parts(entries, infos)
    }

    fn example_bytes(feats: &[Feature], comm_ref: &str) -> Vec<u8> {
        ExampleRecord {
            example_id: ExampleId(1),
            y: 1,
            z: 0,
            comm_ref: comm_ref.to_string(),
            feat_num: feats.len() as u16,
            features: RecordFeatures::Numeric(feats.to_vec()),
        }
        .encode()
        .unwrap()
    }

    fn comm_bytes(feats: &[Feature]) -> Vec<u8> {
        CommFeatureRecord {
            comm_ref: "c".to_string(),
            feat_num: feats.len() as u16,
            features: RecordFeatures::Numeric(feats.to_vec()),
        }
        .encode()
        .unwrap()
    }

    fn own(n: u32) -> Vec<Feature> {
        (0..n).map(|i| Feature::new(100, i, i as f32 + 0.5)).collect()
    }

    fn shared(n: u32) -> Vec<Feature> {
        (0..n).map(|i| Feature::new(100, 10 + i, -(i as f32))).collect()
    }

    fn run(own_feats: &[Feature], comm_feats: Option<&[Feature]>, max_feats: usize) -> (usize, Row) {
        let vocab = vocab();
        let ex_bytes = example_bytes(own_feats, "c");
        let example = parse_example(&ex_bytes).unwrap();
        let cm_bytes = comm_feats.map(comm_bytes);
        let common = cm_bytes.as_deref().map(|b| parse_comm_feature(b).unwrap());
        let mut row = Row::new(max_feats);
        let len = merge_into(&example, common.as_ref(), &vocab, row.slots());
        (len, row)
    }

    fn assert_zero_tail(row: &Row, from: usize) {
        assert!(row.field_ids[from..].iter().all(|&v| v == 0));
        assert!(row.feat_ids[from..].iter().all(|&v| v == 0));
        assert!(row.values[from..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_own_only_fits() {
        let feats = own(3);
        let (len, row) = run(&feats, None, 5);
        assert_eq!(len, 3);
        for (i, f) in feats.iter().enumerate() {
            assert_eq!(row.field_ids[i], 100);
            assert_eq!(row.feat_ids[i], i64::from(f.feat.0) + 1000);
            assert_eq!(row.values[i], f.value);
        }
        assert_zero_tail(&row, 3);
    }

    #[test]
    fn test_empty_example_no_common() {
        let (len, row) = run(&[], None, 4);
        assert_eq!(len, 0);
        assert_zero_tail(&row, 0);
    }

    #[test]
    fn test_common_appended_after_own() {
        let (len, row) = run(&own(2), Some(&shared(2)), 6);
        assert_eq!(len, 4);
        assert_eq!(&row.feat_ids[..4], &[1000, 1001, 1010, 1011]);
        assert_eq!(&row.values[..4], &[0.5, 1.5, 0.0, -1.0]);
        assert_zero_tail(&row, 4);
    }

    #[test]
    fn test_truncation_drops_common_tail() {
        // 2 own + 4 common into 5 slots: first 3 common survive.
        let (len, row) = run(&own(2), Some(&shared(4)), 5);
        assert_eq!(len, 5);
        assert_eq!(&row.feat_ids[..], &[1000, 1001, 1010, 1011, 1012]);
    }

    #[test]
    fn test_own_features_fill_budget() {
        let (len, row) = run(&own(7), Some(&shared(3)), 5);
        assert_eq!(len, 5);
        assert_eq!(&row.feat_ids[..], &[1000, 1001, 1002, 1003, 1004]);
    }

    #[test]
    fn test_common_only() {
        let (len, row) = run(&[], Some(&shared(2)), 3);
        assert_eq!(len, 2);
        assert_eq!(&row.feat_ids[..2], &[1010, 1011]);
        assert_zero_tail(&row, 2);
    }

    #[test]
    fn test_unknown_pair_remaps_to_zero() {
        let feats = vec![Feature::new(200, 3, 2.0), Feature::new(100, 99, 1.0)];
        let (len, row) = run(&feats, None, 3);
        assert_eq!(len, 2);
        // field id is still written, only the feature id is unknown
        assert_eq!(&row.field_ids[..2], &[200, 100]);
        assert_eq!(&row.feat_ids[..2], &[0, 0]);
        assert_eq!(&row.values[..2], &[2.0, 1.0]);
    }

    #[test]
    fn test_len_never_exceeds_max_feats() {
        for own_n in 0..6 {
            for comm_n in 0..6 {
                for max_feats in 1..8 {
                    let (len, _) = run(&own(own_n), Some(&shared(comm_n)), max_feats);
                    assert_eq!(len, max_feats.min((own_n + comm_n) as usize));
                }
            }
        }
    }

    #[test]
    fn test_clear_row() {
        let mut row = Row::new(3);
        clear_row(row.slots());
        assert_zero_tail(&row, 0);
    }
}
