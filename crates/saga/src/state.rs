//! Saga state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle of one order's fulfillment saga.
///
/// ```text
/// NotStarted ──► Running ──┬──────────────────► Completed
///                          └──► Compensating ──► Failed
/// ```
///
/// `Completed` means the forward flow finished (the order is paid or done);
/// `Failed` means the order was rolled back or abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    #[default]
    NotStarted,
    Running,
    Compensating,
    Completed,
    Failed,
}

impl SagaState {
    /// Returns true while the saga still owes work and must be resumed after a crash.
    pub fn needs_resume(&self) -> bool {
        matches!(self, SagaState::Running | SagaState::Compensating)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::NotStarted => "not_started",
            SagaState::Running => "running",
            SagaState::Compensating => "compensating",
            SagaState::Completed => "completed",
            SagaState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
