//! Per-feature state machine.
//!
//! `pending -> processing -> {completed | failed}`, `failed -> retrying ->
//! processing`. Completed and non-retryable failed records are absorbing.
//! The hub coalesces payloads, so forward jumps (pending straight to
//! completed) are legal; only moves out of an absorbing state or back to
//! pending are rejected.

use crate::job::{FeatureRecord, FeatureStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First observation of the feature.
    Initial,
    /// Same status, possibly new progress.
    Unchanged,
    Advanced,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    LeavesAbsorbingState,
    BackToPending,
    FragmentChanged,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::LeavesAbsorbingState => "leaves_absorbing_state",
            RejectReason::BackToPending => "back_to_pending",
            RejectReason::FragmentChanged => "fragment_changed",
        }
    }
}

impl Transition {
    pub fn is_accepted(self) -> bool {
        !matches!(self, Transition::Rejected(_))
    }
}

/// Check whether `next` may replace `previous`.
pub fn check_transition(previous: Option<&FeatureRecord>, next: &FeatureRecord) -> Transition {
    let Some(previous) = previous else {
        return Transition::Initial;
    };
    let from = previous.status;
    let to = next.status;

    if from == FeatureStatus::Completed {
        if to != FeatureStatus::Completed {
            return Transition::Rejected(RejectReason::LeavesAbsorbingState);
        }
        if previous.html_fragment.is_some() && next.html_fragment != previous.html_fragment {
            return Transition::Rejected(RejectReason::FragmentChanged);
        }
        return Transition::Unchanged;
    }
    if previous.is_terminal_failure() {
        return if to == FeatureStatus::Failed {
            Transition::Unchanged
        } else {
            Transition::Rejected(RejectReason::LeavesAbsorbingState)
        };
    }
    if from == to {
        return Transition::Unchanged;
    }
    if to == FeatureStatus::Pending {
        return Transition::Rejected(RejectReason::BackToPending);
    }
    Transition::Advanced
}
