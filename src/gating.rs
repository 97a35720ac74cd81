//! Closed set of gating conditions for steps and features.
//!
//! Rules are plain data (`{"kind": "featureCompleted", "id": "podcast"}`) and
//! evaluated by a match over the variants; nothing is interpreted as code.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::job::{FeatureStatus, Job, JobStatus};
use crate::recovery::checkpoint::{Checkpoint, CheckpointType};
use crate::types::FeatureId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Condition {
    StepCompleted { step: String },
    FeatureEnabled { id: FeatureId },
    FeatureCompleted { id: FeatureId },
    JobStatus { status: JobStatus },
    CheckpointReached { checkpoint: CheckpointType },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
    Always,
}

/// Facts a condition is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct GateContext {
    completed_steps: BTreeSet<String>,
    enabled_features: BTreeSet<FeatureId>,
    completed_features: BTreeSet<FeatureId>,
    job_status: Option<JobStatus>,
    checkpoints: HashSet<CheckpointType>,
}

impl GateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selected features count as enabled; completed records as completed.
    pub fn from_job(job: &Job) -> Self {
        Self::new().with_job(job)
    }

    pub fn with_job(mut self, job: &Job) -> Self {
        self.job_status = Some(job.status);
        self.enabled_features.extend(job.tracked_features());
        self.completed_features.extend(
            job.features
                .iter()
                .filter(|(_, record)| record.status == FeatureStatus::Completed)
                .map(|(id, _)| id.clone()),
        );
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.completed_steps.insert(step.into());
        self
    }

    pub fn with_feature_enabled(mut self, id: FeatureId) -> Self {
        self.enabled_features.insert(id);
        self
    }

    pub fn with_checkpoints<'a, I>(mut self, checkpoints: I) -> Self
    where
        I: IntoIterator<Item = &'a Checkpoint>,
    {
        self.checkpoints
            .extend(checkpoints.into_iter().map(|c| c.checkpoint_type));
        self
    }
}

impl Condition {
    pub fn from_json(raw: &str) -> Result<Self, ApiError> {
        serde_json::from_str(raw)
            .map_err(|e| ApiError::InvalidArgument(format!("invalid condition: {e}")))
    }

    pub fn evaluate(&self, ctx: &GateContext) -> bool {
        match self {
            Condition::StepCompleted { step } => ctx.completed_steps.contains(step),
            Condition::FeatureEnabled { id } => ctx.enabled_features.contains(id),
            Condition::FeatureCompleted { id } => ctx.completed_features.contains(id),
            Condition::JobStatus { status } => ctx.job_status == Some(*status),
            Condition::CheckpointReached { checkpoint } => ctx.checkpoints.contains(checkpoint),
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(ctx)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(ctx)),
            Condition::Not { condition } => !condition.evaluate(ctx),
            Condition::Always => true,
        }
    }
}
