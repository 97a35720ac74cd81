//! Recovery domain: retry policy, checkpoints, attempt telemetry and the
//! orchestrator that ties them together.

pub mod checkpoint;
pub mod instability;
pub mod operations;
pub mod orchestrator;
pub mod retry;
pub mod telemetry;

pub use checkpoint::{
    Checkpoint, CheckpointBackend, CheckpointConfig, CheckpointStore, CheckpointType,
    MemoryCheckpointBackend, SledCheckpointBackend,
};
pub use instability::{InfrastructureReset, InstabilityConfig, InstabilityMonitor, ResetOutcome};
pub use operations::{OperationKind, OperationProfile};
pub use orchestrator::{
    RecoveryContext, RecoveryFailure, RecoveryOptions, RecoveryOrchestrator, RecoveryResult,
};
pub use retry::{next_delay, Classification, FailureClass, RetryConfig, RetryPolicy};
pub use telemetry::{
    AttemptEnvelope, AttemptEvent, AttemptEventType, AttemptLog, AttemptSink, AttemptStore,
    MemoryAttemptSink,
};
