//! Per-operation state machine.
//!
//! ```text
//! Received -> Validating -> Connecting -> Executing -> Streaming -> Terminated
//!                 |             |             |___________________^
//!                 |_____________|___________________________________^ (Error)
//! ```

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancellation::RequestId;
use crate::error::OperationError;
use crate::obs;

/// Which façade entry point started the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    GetBuild,
    RunTask,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::GetBuild => "get_build",
            OperationKind::RunTask => "run_task",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
    Cancelled,
}

impl Outcome {
    pub fn of<T>(result: &Result<T, OperationError>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(err) if err.is_cancelled() => Outcome::Cancelled,
            Err(_) => Outcome::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Received,
    Validating,
    Connecting,
    Executing,
    Streaming,
    Terminated(Outcome),
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Received => "received",
            OperationState::Validating => "validating",
            OperationState::Connecting => "connecting",
            OperationState::Executing => "executing",
            OperationState::Streaming => "streaming",
            OperationState::Terminated(Outcome::Success) => "terminated(success)",
            OperationState::Terminated(Outcome::Error) => "terminated(error)",
            OperationState::Terminated(Outcome::Cancelled) => "terminated(cancelled)",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Terminated(_))
    }

    /// Whether `self -> next` is allowed.
    pub fn can_transition_to(&self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Received, Validating)
                | (Validating, Connecting)
                | (Validating, Terminated(Outcome::Error))
                | (Connecting, Executing)
                | (Connecting, Terminated(Outcome::Error))
                | (Executing, Streaming)
                | (Executing, Terminated(_))
                | (Streaming, Terminated(_))
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal operation transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: OperationState,
    pub to: OperationState,
}

/// Tracks one operation from receipt to its terminal state.
#[derive(Debug)]
pub struct OperationLifecycle {
    request_id: RequestId,
    kind: OperationKind,
    state: OperationState,
    started: Instant,
}

impl OperationLifecycle {
    pub fn new(request_id: RequestId, kind: OperationKind, project_dir: &str) -> Self {
        obs::emit_operation_started(request_id.as_str(), kind.as_str(), project_dir);
        Self {
            request_id,
            kind,
            state: OperationState::Received,
            started: Instant::now(),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn advance(&mut self, next: OperationState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        obs::emit_operation_transition(self.request_id.as_str(), self.state.as_str(), next.as_str());
        self.state = next;
        Ok(())
    }

    /// Move to the terminal state matching `result`.
    ///
    /// `streamed` records whether any event reached the caller, which puts
    /// an executing operation through `Streaming` first.
    pub fn terminate<T>(
        &mut self,
        result: &Result<T, OperationError>,
        streamed: bool,
        events: u64,
    ) -> Result<Outcome, TransitionError> {
        if streamed && self.state == OperationState::Executing {
            self.advance(OperationState::Streaming)?;
        }
        let outcome = Outcome::of(result);
        self.advance(OperationState::Terminated(outcome))?;

        let error = result.as_ref().err().map(OperationError::structured);
        obs::emit_operation_finished(
            self.request_id.as_str(),
            self.state.as_str(),
            self.started.elapsed().as_millis() as u64,
            events,
            error.as_ref(),
        );
        Ok(outcome)
    }
}
