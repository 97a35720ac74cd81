//! Sandboxed preview document assembled from completed feature fragments.

pub mod merger;
pub mod order;
pub mod sandbox;

pub use merger::{MergedPreview, PreviewConfig, PreviewMerger};
pub use order::{FeatureOrder, DEFAULT_FEATURE_ORDER};
pub use sandbox::{sandbox_document, sanitize};
