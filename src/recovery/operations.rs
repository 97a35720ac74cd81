//! Catalog of the remote operations the pipeline wraps, with per-operation
//! retry tuning.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OperationError;
use crate::recovery::checkpoint::CheckpointType;
use crate::recovery::orchestrator::{
    RecoveryContext, RecoveryOptions, RecoveryOrchestrator, RecoveryResult,
};
use crate::recovery::retry::RetryConfig;
use crate::types::{FeatureId, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateJob,
    IngestFile,
    ParseDocument,
    GenerateRecommendations,
    ApplyRecommendations,
    GeneratePreview,
    GeneratePodcast,
    GenerateVideo,
    GenerateTimeline,
    GenerateSkillsChart,
    GeneratePortfolio,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::CreateJob => "create_job",
            OperationKind::IngestFile => "ingest_file",
            OperationKind::ParseDocument => "parse_document",
            OperationKind::GenerateRecommendations => "generate_recommendations",
            OperationKind::ApplyRecommendations => "apply_recommendations",
            OperationKind::GeneratePreview => "generate_preview",
            OperationKind::GeneratePodcast => "generate_podcast",
            OperationKind::GenerateVideo => "generate_video",
            OperationKind::GenerateTimeline => "generate_timeline",
            OperationKind::GenerateSkillsChart => "generate_skills_chart",
            OperationKind::GeneratePortfolio => "generate_portfolio",
        }
    }

    /// Audio/video generation: slow and costly per attempt.
    pub fn is_media(self) -> bool {
        matches!(
            self,
            OperationKind::GeneratePodcast | OperationKind::GenerateVideo
        )
    }

    /// Generation operation behind a feature id, when it is a known one.
    pub fn for_feature(feature_id: &FeatureId) -> Option<Self> {
        match feature_id.as_str() {
            "podcast" => Some(OperationKind::GeneratePodcast),
            "video" => Some(OperationKind::GenerateVideo),
            "timeline" => Some(OperationKind::GenerateTimeline),
            "skills-viz" | "skills-chart" => Some(OperationKind::GenerateSkillsChart),
            "portfolio" => Some(OperationKind::GeneratePortfolio),
            _ => None,
        }
    }

    pub fn profile(self) -> OperationProfile {
        let (max_retries, retry, checkpoint_type) = match self {
            OperationKind::CreateJob => (3, RetryConfig::default(), None),
            OperationKind::IngestFile => (3, RetryConfig::default(), Some(CheckpointType::FileUploaded)),
            OperationKind::ParseDocument => (
                3,
                RetryConfig::default(),
                Some(CheckpointType::ParsingCompleted),
            ),
            OperationKind::GenerateRecommendations => (
                3,
                RetryConfig::default(),
                Some(CheckpointType::AnalysisCompleted),
            ),
            OperationKind::ApplyRecommendations => (
                2,
                RetryConfig::default(),
                Some(CheckpointType::ImprovementsApplied),
            ),
            OperationKind::GeneratePreview => (
                5,
                RetryConfig::preview(),
                Some(CheckpointType::PreviewGenerated),
            ),
            OperationKind::GeneratePodcast | OperationKind::GenerateVideo => (
                2,
                RetryConfig::media(),
                Some(CheckpointType::FeatureCompleted),
            ),
            OperationKind::GenerateTimeline
            | OperationKind::GenerateSkillsChart
            | OperationKind::GeneratePortfolio => (
                3,
                RetryConfig::default(),
                Some(CheckpointType::FeatureCompleted),
            ),
        };
        OperationProfile {
            kind: self,
            max_retries,
            retry,
            checkpoint_type,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperationProfile {
    pub kind: OperationKind,
    pub max_retries: u32,
    pub retry: RetryConfig,
    pub checkpoint_type: Option<CheckpointType>,
}

impl OperationProfile {
    pub fn options(&self) -> RecoveryOptions {
        RecoveryOptions::default()
            .with_max_retries(self.max_retries)
            .with_retry_config(self.retry)
    }

    pub fn context(&self, job_id: JobId, data: Option<Value>) -> RecoveryContext {
        let context = RecoveryContext::new(self.kind.as_str(), job_id);
        match self.checkpoint_type {
            Some(checkpoint_type) => context.with_checkpoint(checkpoint_type, data),
            None => context,
        }
    }
}

impl RecoveryOrchestrator {
    /// Run a catalogued operation with its profile's tuning.
    pub async fn run<T, F, Fut>(
        &self,
        kind: OperationKind,
        job_id: JobId,
        data: Option<Value>,
        operation: F,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let profile = kind.profile();
        let context = profile.context(job_id, data);
        self.execute_with_recovery(operation, &context, &profile.options())
            .await
    }
}
