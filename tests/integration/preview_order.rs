//! Preview composition is independent of the order fragments arrive in.

use proptest::prelude::*;
use vitae::preview::{FeatureOrder, PreviewMerger, DEFAULT_FEATURE_ORDER};
use vitae::types::FeatureId;

const BASE: &str = "<html><head></head><body><main>cv</main></body></html>";

fn fragment_for(id: &str) -> String {
    format!("<div class=\"{id}\">{id}</div>")
}

fn feature_pool() -> Vec<String> {
    let mut pool: Vec<String> = DEFAULT_FEATURE_ORDER.iter().map(|s| s.to_string()).collect();
    pool.push("cover-letter".to_string());
    pool.push("badges".to_string());
    pool
}

proptest! {
    #[test]
    fn arrival_order_does_not_change_the_document(
        picked in proptest::sample::subsequence(feature_pool(), 0..=8)
            .prop_shuffle()
    ) {
        let mut sorted_merger = PreviewMerger::new(BASE, FeatureOrder::default());
        let mut canonical = picked.clone();
        canonical.sort();
        for id in &canonical {
            sorted_merger.apply(&FeatureId::from(id.as_str()), &fragment_for(id));
        }

        let mut arrival_merger = PreviewMerger::new(BASE, FeatureOrder::default());
        for id in &picked {
            arrival_merger.apply(&FeatureId::from(id.as_str()), &fragment_for(id));
        }

        prop_assert_eq!(sorted_merger.html(), arrival_merger.html());
        prop_assert_eq!(
            arrival_merger.preview().applied_feature_ids.len(),
            picked.len()
        );
    }

    #[test]
    fn reapplying_a_feature_is_a_no_op(
        picked in proptest::sample::subsequence(feature_pool(), 1..=8)
    ) {
        let mut merger = PreviewMerger::new(BASE, FeatureOrder::default());
        for id in &picked {
            merger.apply(&FeatureId::from(id.as_str()), &fragment_for(id));
        }
        let before = merger.html().to_string();
        let first = FeatureId::from(picked[0].as_str());
        prop_assert!(!merger.apply(&first, "<p>replacement</p>"));
        prop_assert_eq!(merger.html(), before.as_str());
    }
}

#[test]
fn unknown_features_follow_known_ones() {
    let mut merger = PreviewMerger::new(BASE, FeatureOrder::default());
    merger.apply(&"badges".into(), "<b>badges</b>");
    merger.apply(&"portfolio".into(), "<b>portfolio</b>");
    merger.apply(&"podcast".into(), "<b>podcast</b>");
    let html = merger.html();
    let podcast = html.find("data-feature=\"podcast\"").unwrap();
    let portfolio = html.find("data-feature=\"portfolio\"").unwrap();
    let badges = html.find("data-feature=\"badges\"").unwrap();
    assert!(podcast < portfolio && portfolio < badges);
}
