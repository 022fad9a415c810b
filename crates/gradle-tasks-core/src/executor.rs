//! Runs one engine operation on a dedicated worker task.
//!
//! The worker owns the [`Connection`] for the duration of the engine call and
//! hands it back when the call returns. Meanwhile the calling task watches the
//! caller's stream: if the caller disconnects, the operation's controller is
//! signaled and the worker is still awaited so the engine can unwind.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cancellation::CancellationController;
use crate::connection::Connection;
use crate::engine::{EngineConnection, EngineResult, Invocation};
use crate::error::{OperationError, Phase};
use crate::sink::{EventSink, OperationPayload, OperationResult};

/// The engine call to make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationSpec {
    FetchEnvironment,
    FetchProjectModel,
    RunTask {
        tasks: Vec<String>,
        arguments: Vec<String>,
        java_debug_port: Option<u16>,
    },
}

impl OperationSpec {
    pub fn name(&self) -> &'static str {
        match self {
            OperationSpec::FetchEnvironment => "fetch_environment",
            OperationSpec::FetchProjectModel => "fetch_project_model",
            OperationSpec::RunTask { .. } => "run_task",
        }
    }

    fn java_debug_port(&self) -> Option<u16> {
        match self {
            OperationSpec::RunTask {
                java_debug_port, ..
            } => *java_debug_port,
            _ => None,
        }
    }
}

async fn call_engine(
    conn: &mut dyn EngineConnection,
    spec: OperationSpec,
    invocation: Invocation,
) -> EngineResult<OperationPayload> {
    match spec {
        OperationSpec::FetchEnvironment => conn
            .build_environment(invocation)
            .await
            .map(OperationPayload::Environment),
        OperationSpec::FetchProjectModel => conn
            .project_model(invocation)
            .await
            .map(OperationPayload::ProjectModel),
        OperationSpec::RunTask {
            tasks, arguments, ..
        } => conn
            .run_tasks(invocation, &tasks, &arguments)
            .await
            .map(|()| OperationPayload::TasksCompleted),
    }
}

/// Run `spec` against `conn`.
///
/// The connection comes back unless the worker panicked, in which case it
/// was dropped during unwinding and the result is an internal error.
pub async fn execute(
    mut conn: Connection,
    spec: OperationSpec,
    controller: &CancellationController,
    sink: &EventSink,
) -> (Option<Connection>, OperationResult) {
    if controller.is_cancelled() {
        debug!(operation = spec.name(), "cancelled before the engine was invoked");
        return (Some(conn), Err(OperationError::cancelled()));
    }

    let config = conn.config();
    let invocation = Invocation {
        jvm_arguments: config.jvm_arguments.clone(),
        java_home: config.java_home.clone(),
        color_output: config.color_output,
        java_debug_port: spec.java_debug_port(),
        cancellation: controller.token(),
        listener: Arc::new(sink.clone()),
    };

    debug!(operation = spec.name(), connection = conn.id(), "starting engine call");
    let mut worker = tokio::spawn(async move {
        let result = call_engine(conn.engine_mut(), spec, invocation).await;
        (conn, result)
    });

    let joined = tokio::select! {
        joined = &mut worker => joined,
        _ = sink.closed() => {
            if controller.cancel() {
                info!(reason = "caller disconnected", "cancelling operation");
            }
            worker.await
        }
    };

    match joined {
        Ok((conn, Ok(payload))) => (Some(conn), Ok(payload)),
        Ok((conn, Err(err))) => {
            let mapped = OperationError::from_engine(err, Phase::Executing, controller.is_cancelled());
            (Some(conn), Err(mapped))
        }
        Err(join) => (None, Err(OperationError::from_join(join))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, RawBuildConfig};
    use crate::connection::ConnectionProvider;
    use crate::error::ErrorKind;
    use crate::fakes::{EngineCall, FakeBehavior, FakeEngine, ScriptedEvent};
    use crate::sink::{OperationEvent, StreamItem};
    use std::time::Duration;

    async fn connect(engine: &FakeEngine) -> (ConnectionProvider, Connection) {
        let provider = ConnectionProvider::new(Arc::new(engine.clone()));
        let config = resolve(&RawBuildConfig {
            jvm_arguments: "-Xmx64m -Xms64m".into(),
            ..RawBuildConfig::wrapper("/tmp/p")
        })
        .unwrap();
        let conn = provider.acquire(&config).await.unwrap();
        (provider, conn)
    }

    #[tokio::test]
    async fn test_run_task_streams_events_and_forwards_jvm_arguments() {
        let engine = FakeEngine::new().with_events(vec![
            ScriptedEvent::Progress("Task :build".into()),
            ScriptedEvent::Stdout("hello\n".into()),
        ]);
        let (provider, conn) = connect(&engine).await;
        let (sink, mut rx) = EventSink::channel(8);
        let controller = CancellationController::new();

        let spec = OperationSpec::RunTask {
            tasks: vec!["build".into()],
            arguments: vec!["--info".into()],
            java_debug_port: Some(5005),
        };
        let (conn, result) = execute(conn, spec, &controller, &sink).await;
        assert_eq!(result, Ok(OperationPayload::TasksCompleted));
        provider.release(conn.unwrap()).await;

        assert!(matches!(
            rx.recv().await,
            Some(StreamItem::Event(OperationEvent::Progress(p))) if p.display_name == "Task :build"
        ));
        assert!(matches!(
            rx.recv().await,
            Some(StreamItem::Event(OperationEvent::Output(_)))
        ));
        assert!(engine.calls().contains(&EngineCall::RunTasks {
            tasks: vec!["build".into()],
            arguments: vec!["--info".into()],
            jvm_arguments: vec!["-Xmx64m -Xms64m".into()],
            java_debug_port: Some(5005),
        }));
    }

    #[tokio::test]
    async fn test_pre_cancelled_never_invokes_engine() {
        let engine = FakeEngine::new();
        let (provider, conn) = connect(&engine).await;
        let (sink, _rx) = EventSink::channel(8);
        let controller = CancellationController::new();
        controller.cancel();

        let (conn, result) =
            execute(conn, OperationSpec::FetchProjectModel, &controller, &sink).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
        provider.release(conn.unwrap()).await;
        assert_eq!(engine.count(|c| matches!(c, EngineCall::ProjectModel { .. })), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_running() {
        let engine = FakeEngine::new().with_behavior(FakeBehavior::WaitForCancel);
        let (provider, conn) = connect(&engine).await;
        let (sink, _rx) = EventSink::channel(8);
        let controller = CancellationController::new();

        let canceller = {
            let engine = engine.clone();
            let controller = controller.clone();
            tokio::spawn(async move {
                engine.wait_for_started(1).await;
                controller.cancel();
            })
        };
        let (conn, result) =
            execute(conn, OperationSpec::FetchEnvironment, &controller, &sink).await;
        canceller.await.unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
        provider.release(conn.unwrap()).await;
        assert_eq!(provider.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_failure_after_cancel_maps_to_cancelled() {
        let engine =
            FakeEngine::new().with_behavior(FakeBehavior::FailOnCancel("interrupted".into()));
        let (_provider, conn) = connect(&engine).await;
        let (sink, _rx) = EventSink::channel(8);
        let controller = CancellationController::new();

        let trigger = controller.clone();
        let waiter = engine.clone();
        tokio::spawn(async move {
            waiter.wait_for_started(1).await;
            trigger.cancel();
        });
        let (_conn, result) =
            execute(conn, OperationSpec::FetchProjectModel, &controller, &sink).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_engine_failure_is_execution_error() {
        let engine = FakeEngine::new().with_behavior(FakeBehavior::Fail("compile failed".into()));
        let (_provider, conn) = connect(&engine).await;
        let (sink, _rx) = EventSink::channel(8);
        let (_conn, result) = execute(
            conn,
            OperationSpec::RunTask {
                tasks: vec!["build".into()],
                arguments: vec![],
                java_debug_port: None,
            },
            &CancellationController::new(),
            &sink,
        )
        .await;
        assert_eq!(result, Err(OperationError::Execution("compile failed".into())));
    }

    #[tokio::test]
    async fn test_panicking_worker_is_internal_and_loses_connection() {
        let engine = FakeEngine::new().with_behavior(FakeBehavior::Panic);
        let (provider, conn) = connect(&engine).await;
        let (sink, _rx) = EventSink::channel(8);
        let (conn, result) = execute(
            conn,
            OperationSpec::FetchEnvironment,
            &CancellationController::new(),
            &sink,
        )
        .await;
        assert!(conn.is_none());
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Internal);
        assert_eq!(provider.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_caller_disconnect_cancels_engine() {
        let engine = FakeEngine::new().with_behavior(FakeBehavior::WaitForCancel);
        let (_provider, conn) = connect(&engine).await;
        let (sink, rx) = EventSink::channel(8);
        let controller = CancellationController::new();

        let waiter = engine.clone();
        tokio::spawn(async move {
            waiter.wait_for_started(1).await;
            drop(rx);
        });
        let (_conn, result) = tokio::time::timeout(
            Duration::from_secs(5),
            execute(conn, OperationSpec::FetchEnvironment, &controller, &sink),
        )
        .await
        .expect("disconnect should stop the engine");
        assert!(controller.is_cancelled());
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    }
}
