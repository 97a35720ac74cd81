//! CLI route: run context and the single command dispatch table.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::cli::help::command_name;
use crate::cli::output::to_json;
use crate::cli::parse::{AttemptCommands, CheckpointCommands, Commands, ConfigCommands};
use crate::cli::presentation::{
    format_attempts_text, format_checkpoint_detail, format_checkpoints_text,
    format_simulation_text,
};
use crate::config::{ConfigLoader, VitaeConfig};
use crate::error::{sled_to_storage, ApiError, OperationError, StorageError};
use crate::feed::{MemoryJobFeed, SubscriptionHub};
use crate::gating::{Condition, GateContext};
use crate::job::{FeatureRecord, Job, JobStatus};
use crate::pipeline::JobPipeline;
use crate::preview::{FeatureOrder, PreviewConfig, PreviewMerger};
use crate::progress::CompletionOutcome;
use crate::recovery::checkpoint::{CheckpointStore, CheckpointType};
use crate::recovery::operations::OperationKind;
use crate::recovery::orchestrator::{
    RecoveryContext, RecoveryOptions, RecoveryOrchestrator, RecoveryResult,
};
use crate::recovery::telemetry::{AttemptEventType, AttemptLog, AttemptSink, AttemptStore};
use crate::types::{now_millis, FeatureId, JobId};

/// How long `simulate` waits for the feed to settle after the last update.
const SIMULATION_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-invocation state: configuration plus the opened stores.
pub struct RunContext {
    workspace_root: PathBuf,
    config: VitaeConfig,
    checkpoints: CheckpointStore,
    attempts: Option<Arc<AttemptStore>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureRow {
    pub feature: String,
    pub status: String,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub job_id: String,
    pub outcome: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub completion_rate: f64,
    pub features: Vec<FeatureRow>,
    pub applied_order: Vec<String>,
    pub preview_bytes: usize,
    pub preview_path: Option<String>,
}

struct SimulationRequest<'a> {
    features: &'a [String],
    fail: &'a [String],
    debounce_ms: Option<u64>,
    job: Option<&'a str>,
}

impl RunContext {
    /// Load configuration (with `config_path` layered on top) and open the
    /// workspace store.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, ApiError> {
        let config = ConfigLoader::load_with_override(&workspace_root, config_path.as_deref())?;
        Self::with_config(workspace_root, config)
    }

    pub fn with_config(workspace_root: PathBuf, config: VitaeConfig) -> Result<Self, ApiError> {
        let data_dir = config.storage.resolve_data_dir(&workspace_root);
        std::fs::create_dir_all(&data_dir).map_err(StorageError::IoError)?;
        let db = sled::open(&data_dir).map_err(sled_to_storage)?;
        debug!(data_dir = %data_dir.display(), "opened workspace store");

        let checkpoints = CheckpointStore::sled(db.clone(), config.checkpoints)?;
        let attempts = if config.storage.attempt_log {
            Some(Arc::new(AttemptStore::new(db)?))
        } else {
            None
        };
        Ok(Self {
            workspace_root,
            config,
            checkpoints,
            attempts,
        })
    }

    pub fn config(&self) -> &VitaeConfig {
        &self.config
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn orchestrator(&self) -> RecoveryOrchestrator {
        let log = match &self.attempts {
            Some(store) => AttemptLog::new(store.clone()),
            None => AttemptLog::disabled(),
        };
        RecoveryOrchestrator::new(self.checkpoints.clone(), log)
            .with_policy(self.config.retry.policy(), self.config.retry.defaults)
    }

    pub fn execute(&self, command: &Commands) -> Result<String, ApiError> {
        let name = command_name(command);
        info!(command = %name, "executing command");
        match command {
            Commands::Checkpoints { command } => self.handle_checkpoints(command),
            Commands::Attempts { command } => self.handle_attempts(command),
            Commands::Merge {
                base,
                fragments,
                order,
                no_sandbox,
                output,
            } => self.handle_merge(base, fragments, order.as_deref(), *no_sandbox, output.as_deref()),
            Commands::Simulate {
                features,
                fail,
                debounce_ms,
                job,
                output,
                format,
            } => {
                let request = SimulationRequest {
                    features,
                    fail,
                    debounce_ms: *debounce_ms,
                    job: job.as_deref(),
                };
                self.handle_simulate(request, output.as_deref(), format)
            }
            Commands::Gate {
                job,
                condition,
                steps,
            } => self.handle_gate(job, condition, steps),
            Commands::Config { command } => self.handle_config(command),
        }
    }

    fn handle_checkpoints(&self, command: &CheckpointCommands) -> Result<String, ApiError> {
        match command {
            CheckpointCommands::List { job, format } => {
                let checkpoints = self.checkpoints.list_for_job(&JobId::from(job.as_str()));
                if format == "json" {
                    to_json(&checkpoints)
                } else {
                    Ok(format_checkpoints_text(job, &checkpoints))
                }
            }
            CheckpointCommands::Latest {
                job,
                checkpoint_type,
            } => {
                let parsed = CheckpointType::parse(checkpoint_type).ok_or_else(|| {
                    ApiError::InvalidArgument(format!(
                        "unknown checkpoint type '{checkpoint_type}' (expected one of: {})",
                        CheckpointType::ALL
                            .iter()
                            .map(|t| t.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ))
                })?;
                match self.checkpoints.latest(&JobId::from(job.as_str()), parsed) {
                    Some(checkpoint) => Ok(format_checkpoint_detail(&checkpoint)),
                    None => Err(ApiError::StorageError(StorageError::CheckpointNotFound(
                        format!("{job}/{parsed}"),
                    ))),
                }
            }
            CheckpointCommands::Cleanup => {
                let removed = self.checkpoints.cleanup_expired();
                let pruned = match &self.attempts {
                    Some(store) => store.prune(self.checkpoints.retention_ms(), now_millis())?,
                    None => 0,
                };
                Ok(format!(
                    "Removed {removed} expired checkpoints and attempt logs of {pruned} idle jobs."
                ))
            }
        }
    }

    fn handle_attempts(&self, command: &AttemptCommands) -> Result<String, ApiError> {
        let Some(store) = &self.attempts else {
            return Ok("Attempt logging is disabled (storage.attempt_log = false).".to_string());
        };
        match command {
            AttemptCommands::List { job, format } => {
                let events = store.read_events(&JobId::from(job.as_str()))?;
                if format == "json" {
                    to_json(&events)
                } else {
                    Ok(format_attempts_text(job, &events))
                }
            }
            AttemptCommands::Prune { max_age_hours } => {
                let max_age_ms = max_age_hours.saturating_mul(60 * 60 * 1000);
                let pruned = store.prune(max_age_ms, now_millis())?;
                Ok(format!("Pruned attempt logs of {pruned} jobs."))
            }
        }
    }

    fn handle_merge(
        &self,
        base: &Path,
        fragments: &[String],
        order: Option<&str>,
        no_sandbox: bool,
        output: Option<&Path>,
    ) -> Result<String, ApiError> {
        let base_document = read_file(base)?;
        let feature_order = match order {
            Some(list) => FeatureOrder::parse(list)
                .declared()
                .iter()
                .map(|id| id.to_string())
                .collect(),
            None => self.config.preview.feature_order.clone(),
        };
        let preview_config = PreviewConfig {
            feature_order,
            sandbox: self.config.preview.sandbox && !no_sandbox,
        };
        let mut merger = PreviewMerger::from_config(base_document, &preview_config);

        for spec in fragments {
            let (feature, path) = parse_fragment_spec(spec)?;
            let fragment = read_file(Path::new(path))?;
            if !merger.apply(&FeatureId::from(feature), &fragment) {
                debug!(feature, "duplicate fragment ignored");
            }
        }

        match output {
            Some(path) => {
                std::fs::write(path, merger.html()).map_err(StorageError::IoError)?;
                Ok(format!(
                    "Merged {} fragments into {}",
                    merger.preview().applied_feature_ids.len(),
                    path.display()
                ))
            }
            None => Ok(merger.html().to_string()),
        }
    }

    fn handle_simulate(
        &self,
        request: SimulationRequest<'_>,
        output: Option<&Path>,
        format: &str,
    ) -> Result<String, ApiError> {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| ApiError::RuntimeUnavailable(format!("Failed to create runtime: {e}")))?;
        let (mut summary, html) = rt.block_on(self.run_simulation(request))?;
        if let Some(path) = output {
            std::fs::write(path, &html).map_err(StorageError::IoError)?;
            summary.preview_path = Some(path.display().to_string());
        }
        if format == "json" {
            to_json(&summary)
        } else {
            Ok(format_simulation_text(&summary))
        }
    }

    async fn run_simulation(
        &self,
        request: SimulationRequest<'_>,
    ) -> Result<(SimulationSummary, String), ApiError> {
        let job_id = JobId::new(
            request
                .job
                .map(str::to_string)
                .unwrap_or_else(|| format!("sim-{}", uuid::Uuid::new_v4().simple())),
        );
        let features: Vec<FeatureId> = request
            .features
            .iter()
            .map(|f| FeatureId::from(f.as_str()))
            .collect();

        let feed = MemoryJobFeed::new();
        let hub = SubscriptionHub::new(Arc::new(feed.clone()), self.config.subscriptions);
        let orchestrator = self.orchestrator();
        let mut subscribe = hub.default_subscribe_config();
        if let Some(ms) = request.debounce_ms {
            subscribe.debounce = Duration::from_millis(ms);
        }

        let base = "<!DOCTYPE html><html><head><title>CV</title></head><body><main><h1>Curriculum Vitae</h1></main></body></html>";
        let created = orchestrator
            .run(OperationKind::CreateJob, job_id.clone(), None, || {
                feed.publish(Job::new(job_id.clone(), base, features.clone()));
                async { Ok::<(), OperationError>(()) }
            })
            .await;
        if let RecoveryResult::Failure(failure) = created {
            return Err(ApiError::OperationFailed(failure.original_error));
        }

        let pipeline = JobPipeline::start(
            &hub,
            self.checkpoints.clone(),
            job_id.clone(),
            &self.config.preview,
            subscribe,
            None,
        );

        let mut rows = Vec::new();
        for feature in &features {
            let started_at = now_millis();
            feed.update(&job_id, |job| {
                job.status = JobStatus::Generating;
                job.current_stage = format!("generating {feature}");
                let mut record = FeatureRecord::processing(0);
                record.started_at_ms = Some(started_at);
                job.features.insert(feature.clone(), record);
            });

            let fails = request.fail.iter().any(|f| f == feature.as_str());
            let result = self.generate_feature(&orchestrator, &job_id, feature, fails).await;
            let row = match result {
                RecoveryResult::Success { data, attempts, .. } => {
                    feed.update(&job_id, |job| {
                        let mut record = FeatureRecord::completed(data);
                        record.started_at_ms = Some(started_at);
                        record.completed_at_ms = Some(now_millis());
                        job.features.insert(feature.clone(), record);
                    });
                    FeatureRow {
                        feature: feature.to_string(),
                        status: "completed".to_string(),
                        attempts,
                        error: None,
                    }
                }
                RecoveryResult::Failure(failure) => {
                    let message = failure.original_error.to_string();
                    feed.update(&job_id, |job| {
                        let mut record =
                            FeatureRecord::failed(message.clone(), failure.is_retryable, failure.attempt);
                        record.started_at_ms = Some(started_at);
                        job.features.insert(feature.clone(), record);
                    });
                    FeatureRow {
                        feature: feature.to_string(),
                        status: "failed".to_string(),
                        attempts: failure.attempt,
                        error: Some(message),
                    }
                }
            };
            rows.push(row);
        }

        let any_completed = rows.iter().any(|r| r.status == "completed");
        feed.update(&job_id, |job| {
            job.status = if any_completed {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            job.current_progress = 100;
            job.current_stage = "done".to_string();
        });

        let state = tokio::time::timeout(SIMULATION_SETTLE_TIMEOUT, pipeline.finished())
            .await
            .ok()
            .flatten()
            .ok_or_else(|| {
                ApiError::OperationFailed(OperationError::Timeout(
                    "job feed did not settle".to_string(),
                ))
            })?;
        let preview = pipeline.preview().borrow().clone();
        pipeline.cancel();

        let mut applied: Vec<FeatureId> = preview.applied_feature_ids.iter().cloned().collect();
        self.config.preview.order().sort(&mut applied);

        let outcome = match state.outcome() {
            CompletionOutcome::InProgress => "in_progress",
            CompletionOutcome::Full => "full",
            CompletionOutcome::Partial { .. } => "partial",
            CompletionOutcome::Failed => "failed",
        };
        let summary = SimulationSummary {
            job_id: job_id.to_string(),
            outcome: outcome.to_string(),
            total: state.counts.total,
            completed: state.counts.completed,
            failed: state.counts.failed,
            completion_rate: state.completion_rate,
            features: rows,
            applied_order: applied.iter().map(|id| id.to_string()).collect(),
            preview_bytes: preview.html.len(),
            preview_path: None,
        };
        Ok((summary, preview.html))
    }

    async fn generate_feature(
        &self,
        orchestrator: &RecoveryOrchestrator,
        job_id: &JobId,
        feature: &FeatureId,
        fails: bool,
    ) -> RecoveryResult<String> {
        let operation = || {
            let outcome = if fails {
                Err(OperationError::Validation(format!(
                    "{feature} generation rejected the input"
                )))
            } else {
                Ok(sample_fragment(feature))
            };
            async move { outcome }
        };
        let data = Some(json!({ "feature": feature.as_str() }));
        match OperationKind::for_feature(feature) {
            Some(kind) => orchestrator.run(kind, job_id.clone(), data, operation).await,
            None => {
                let context = RecoveryContext::new(format!("generate_{feature}"), job_id.clone())
                    .with_checkpoint(CheckpointType::FeatureCompleted, data);
                orchestrator
                    .execute_with_recovery(operation, &context, &RecoveryOptions::default())
                    .await
            }
        }
    }

    fn handle_gate(&self, job: &str, condition: &str, steps: &[String]) -> Result<String, ApiError> {
        let condition = Condition::from_json(condition)?;
        let job_id = JobId::from(job);
        let checkpoints = self.checkpoints.list_for_job(&job_id);
        let mut context = GateContext::new().with_checkpoints(&checkpoints);
        if let Some(store) = &self.attempts {
            for event in store.read_events(&job_id)? {
                if event.event_type == AttemptEventType::AttemptSucceeded {
                    context = context.with_step(event.operation);
                }
            }
        }
        for step in steps {
            context = context.with_step(step.clone());
        }
        let open = condition.evaluate(&context);
        debug!(job_id = %job_id, open, "gate evaluated");
        Ok(if open { "open" } else { "closed" }.to_string())
    }

    fn handle_config(&self, command: &ConfigCommands) -> Result<String, ApiError> {
        match command {
            ConfigCommands::Show => toml::to_string_pretty(&self.config)
                .map_err(|e| ApiError::ConfigError(format!("Failed to render config: {e}"))),
            ConfigCommands::Validate => match self.config.validate() {
                Ok(()) => Ok(format!(
                    "Configuration is valid (environment: {}).",
                    crate::config::environment_name()
                )),
                Err(errors) => Err(ApiError::ConfigError(
                    errors
                        .iter()
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join("\n"),
                )),
            },
        }
    }
}

fn parse_fragment_spec(spec: &str) -> Result<(&str, &str), ApiError> {
    match spec.split_once('=') {
        Some((feature, path)) if !feature.trim().is_empty() && !path.trim().is_empty() => {
            Ok((feature.trim(), path.trim()))
        }
        _ => Err(ApiError::InvalidArgument(format!(
            "fragment must be FEATURE=PATH, got '{spec}'"
        ))),
    }
}

fn read_file(path: &Path) -> Result<String, ApiError> {
    std::fs::read_to_string(path).map_err(|e| {
        ApiError::InvalidArgument(format!("cannot read {}: {e}", path.display()))
    })
}

fn sample_fragment(feature: &FeatureId) -> String {
    format!(
        "<div id=\"{feature}\" class=\"feature\"><h2>{feature}</h2><button onclick=\"play('{feature}')\">Open</button></div>"
    )
}
