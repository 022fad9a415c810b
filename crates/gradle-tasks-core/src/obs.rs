//! Structured lifecycle events for operations.
//!
//! Each operation runs inside a `gradle.operation` span carrying its request
//! id and kind; the emitters below log the lifecycle points with a stable
//! `event` field so JSON logs can be filtered on it.

use tracing::{info, warn};

use crate::error::StructuredError;

/// Span wrapping one operation from validation to its terminal message.
pub fn operation_span(request_id: &str, kind: &str) -> tracing::Span {
    tracing::info_span!("gradle.operation", request_id = %request_id, kind = %kind)
}

/// Emit event: operation accepted.
pub fn emit_operation_started(request_id: &str, kind: &str, project_dir: &str) {
    info!(
        event = "operation.started",
        request_id = %request_id,
        kind = %kind,
        project_dir = %project_dir,
    );
}

pub fn emit_operation_transition(request_id: &str, from: &str, to: &str) {
    tracing::debug!(
        event = "operation.transition",
        request_id = %request_id,
        from = %from,
        to = %to,
    );
}

/// Emit event: terminal state reached.
///
/// `error` is `None` on success; otherwise it is logged as a JSON object so
/// the kind and message stay together.
pub fn emit_operation_finished(
    request_id: &str,
    outcome: &str,
    duration_ms: u64,
    events: u64,
    error: Option<&StructuredError>,
) {
    match error {
        None => info!(
            event = "operation.finished",
            request_id = %request_id,
            outcome = %outcome,
            duration_ms = duration_ms,
            events = events,
        ),
        Some(err) => warn!(
            event = "operation.finished",
            request_id = %request_id,
            outcome = %outcome,
            duration_ms = duration_ms,
            events = events,
            error_kind = %err.kind,
            error = %serde_json::to_string(err).unwrap_or_else(|_| err.message.clone()),
        ),
    }
}

/// Emit event: cancellation asked for, by a client or by the server itself.
pub fn emit_cancel_requested(request_id: &str, reason: &str, running: bool) {
    info!(
        event = "cancel.requested",
        request_id = %request_id,
        reason = %reason,
        running = running,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_emitters_without_subscriber() {
        let span = operation_span("req-1", "run_task");
        let _entered = span.enter();
        emit_operation_started("req-1", "run_task", "/tmp/p");
        emit_operation_transition("req-1", "received", "validating");
        let err = StructuredError {
            kind: ErrorKind::Execution,
            message: "exit 1".into(),
        };
        emit_operation_finished("req-1", "error", 12, 3, Some(&err));
        emit_operation_finished("req-1", "success", 4, 0, None);
        emit_cancel_requested("req-1", "client", true);
    }
}
