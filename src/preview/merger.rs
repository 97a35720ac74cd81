//! Incremental merge of completed feature fragments into the base document.
//!
//! Fragments arrive in completion order, which is arbitrary. The rendered
//! document is always a pure function of the base and the applied set, laid
//! out in declared feature order, so arrival order never shows in the output
//! and re-applying a fragment changes nothing.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::preview::order::{FeatureOrder, DEFAULT_FEATURE_ORDER};
use crate::preview::sandbox::sandbox_document;
use crate::progress::ProgressState;
use crate::types::FeatureId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Placement order of fragments; unlisted features go last
    #[serde(default = "default_feature_order")]
    pub feature_order: Vec<String>,

    /// Strip scripts and disable controls in the rendered preview
    #[serde(default = "default_sandbox")]
    pub sandbox: bool,
}

fn default_feature_order() -> Vec<String> {
    DEFAULT_FEATURE_ORDER.iter().map(|s| s.to_string()).collect()
}

fn default_sandbox() -> bool {
    true
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            feature_order: default_feature_order(),
            sandbox: default_sandbox(),
        }
    }
}

impl PreviewConfig {
    pub fn order(&self) -> FeatureOrder {
        FeatureOrder::new(self.feature_order.iter().map(|id| FeatureId::from(id.as_str())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedPreview {
    pub base_document: String,
    pub applied_feature_ids: BTreeSet<FeatureId>,
    pub html: String,
}

pub struct PreviewMerger {
    order: FeatureOrder,
    sandbox: bool,
    fragments: HashMap<FeatureId, String>,
    preview: MergedPreview,
}

impl PreviewMerger {
    pub fn new(base_document: impl Into<String>, order: FeatureOrder) -> Self {
        let mut merger = Self {
            order,
            sandbox: true,
            fragments: HashMap::new(),
            preview: MergedPreview {
                base_document: base_document.into(),
                applied_feature_ids: BTreeSet::new(),
                html: String::new(),
            },
        };
        merger.render();
        merger
    }

    pub fn from_config(base_document: impl Into<String>, config: &PreviewConfig) -> Self {
        let mut merger = Self::new(base_document, config.order());
        if !config.sandbox {
            merger.sandbox = false;
            merger.render();
        }
        merger
    }

    pub fn preview(&self) -> &MergedPreview {
        &self.preview
    }

    pub fn html(&self) -> &str {
        &self.preview.html
    }

    pub fn is_applied(&self, feature_id: &FeatureId) -> bool {
        self.preview.applied_feature_ids.contains(feature_id)
    }

    /// Fold one fragment in. Returns false, leaving the output untouched, when
    /// the feature was already applied.
    pub fn apply(&mut self, feature_id: &FeatureId, fragment: &str) -> bool {
        if self.is_applied(feature_id) {
            if self.fragments.get(feature_id).map(String::as_str) != Some(fragment) {
                warn!(feature = %feature_id, "ignoring different fragment for applied feature");
            }
            return false;
        }
        self.fragments.insert(feature_id.clone(), fragment.to_string());
        self.preview.applied_feature_ids.insert(feature_id.clone());
        self.render();
        debug!(
            feature = %feature_id,
            applied = self.preview.applied_feature_ids.len(),
            "fragment merged into preview"
        );
        true
    }

    /// Apply every completed fragment in `state` not merged yet. Returns the
    /// newly applied features.
    pub fn apply_completed(&mut self, state: &ProgressState) -> Vec<FeatureId> {
        let mut added = Vec::new();
        for (feature_id, fragment) in state.completed_fragments() {
            if self.is_applied(feature_id) {
                continue;
            }
            self.fragments.insert(feature_id.clone(), fragment.to_string());
            self.preview.applied_feature_ids.insert(feature_id.clone());
            added.push(feature_id.clone());
        }
        if !added.is_empty() {
            self.render();
            debug!(added = added.len(), "completed fragments merged into preview");
        }
        added
    }

    /// Swap the base document and re-render with the fragments already applied.
    pub fn reset_base(&mut self, base_document: impl Into<String>) {
        self.preview.base_document = base_document.into();
        self.render();
    }

    fn render(&mut self) {
        let mut ids: Vec<FeatureId> = self.preview.applied_feature_ids.iter().cloned().collect();
        self.order.sort(&mut ids);

        let sections: String = ids
            .iter()
            .filter_map(|id| {
                self.fragments
                    .get(id)
                    .map(|fragment| section(id, fragment))
            })
            .collect();

        let composed = insert_before_body_end(&self.preview.base_document, &sections);
        self.preview.html = if self.sandbox {
            sandbox_document(&composed)
        } else {
            composed
        };
    }
}

fn section(feature_id: &FeatureId, fragment: &str) -> String {
    format!(
        "<section data-feature=\"{}\">{}</section>\n",
        escape_attr(feature_id.as_str()),
        fragment
    )
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

fn insert_before_body_end(base: &str, sections: &str) -> String {
    if sections.is_empty() {
        return base.to_string();
    }
    // ASCII lowercasing keeps byte offsets aligned with `base`.
    match base.to_ascii_lowercase().rfind("</body") {
        Some(at) => {
            let mut out = String::with_capacity(base.len() + sections.len());
            out.push_str(&base[..at]);
            out.push_str(sections);
            out.push_str(&base[at..]);
            out
        }
        None => format!("{base}{sections}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FeatureRecord, Job};
    use crate::progress::ProgressAggregator;
    use crate::types::JobId;

    const BASE: &str = "<html><head></head><body><h1>CV</h1></body></html>";

    fn merger(order: &str) -> PreviewMerger {
        PreviewMerger::new(BASE, FeatureOrder::parse(order))
    }

    #[test]
    fn fragments_land_in_declared_order() {
        let mut merger = merger("podcast,skills-viz");
        assert!(merger.apply(&"skills-viz".into(), "<div id=\"skills\"></div>"));
        assert!(merger.apply(&"podcast".into(), "<div id=\"podcast\"></div>"));
        let html = merger.html();
        let podcast = html.find("id=\"podcast\"").unwrap();
        let skills = html.find("id=\"skills\"").unwrap();
        assert!(podcast < skills);
        assert!(html.find("<h1>CV</h1>").unwrap() < podcast);
        assert!(skills < html.find("</body>").unwrap());
    }

    #[test]
    fn applying_twice_is_a_no_op() {
        let mut merger = merger("a");
        merger.apply(&"a".into(), "<p>a</p>");
        let once = merger.html().to_string();
        assert!(!merger.apply(&"a".into(), "<p>a</p>"));
        assert!(!merger.apply(&"a".into(), "<p>changed</p>"));
        assert_eq!(merger.html(), once);
    }

    #[test]
    fn output_is_sandboxed() {
        let mut merger = merger("a");
        merger.apply(&"a".into(), "<button onclick=\"go()\">Play</button><script>x()</script>");
        let html = merger.html();
        assert!(!html.contains("<script>"));
        assert!(!html.contains("onclick"));
        assert!(html.contains("<button disabled>Play</button>"));
        assert!(html.contains("script-src 'none'"));
    }

    #[test]
    fn fragment_handlers_never_reach_the_preview() {
        let mut merger = merger("a");
        merger.apply(&"a".into(), "<svg/onload=alert(1)><img src=x/onerror=alert(2)><a href=\"jav&#x61;script:x()\">go</a>");
        let html = merger.html();
        assert!(!html.contains("onload"));
        assert!(!html.contains("onerror"));
        assert!(!html.contains("script:"));
    }

    #[test]
    fn base_without_body_gets_fragments_appended() {
        let mut merger = PreviewMerger::from_config(
            "<p>cv</p>",
            &PreviewConfig {
                feature_order: vec!["a".into()],
                sandbox: false,
            },
        );
        merger.apply(&"a".into(), "<p>a</p>");
        assert_eq!(merger.html(), "<p>cv</p><section data-feature=\"a\"><p>a</p></section>\n");
    }

    #[test]
    fn reset_base_keeps_applied_fragments() {
        let mut merger = merger("a");
        merger.apply(&"a".into(), "<p>a</p>");
        merger.reset_base("<body><h2>v2</h2></body>");
        assert!(merger.html().contains("<h2>v2</h2><section data-feature=\"a\">"));
        assert!(merger.is_applied(&"a".into()));
    }

    #[test]
    fn apply_completed_folds_aggregator_output() {
        let mut job = Job::new(JobId::from("j"), BASE, vec!["x".into(), "y".into()]);
        job.features.insert("y".into(), FeatureRecord::completed("<p>y</p>"));
        let mut aggregator = ProgressAggregator::new();
        let mut merger = merger("x,y");

        let added = merger.apply_completed(&aggregator.apply(&job));
        assert_eq!(added, vec![FeatureId::from("y")]);

        job.features.insert("x".into(), FeatureRecord::completed("<p>x</p>"));
        let added = merger.apply_completed(&aggregator.apply(&job));
        assert_eq!(added, vec![FeatureId::from("x")]);
        assert!(merger.html().find("<p>x</p>").unwrap() < merger.html().find("<p>y</p>").unwrap());
        assert!(merger.apply_completed(&aggregator.apply(&job)).is_empty());
    }
}
