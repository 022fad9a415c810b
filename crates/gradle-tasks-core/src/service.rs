//! Protocol-independent service façade.
//!
//! [`BuildService`] is what a transport calls into. Streaming operations
//! (`get_build`, `run_task`) return an [`OperationStream`] immediately; the
//! operation is validated and registered synchronously, so a cancel request
//! sent right after the call returns always finds it. The rest runs on its own
//! task.
//!
//! Before the terminal message is written the connection is released and the
//! request id unregistered, so a caller that sees the end of its stream can
//! reuse the id straight away.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, Instrument};

use crate::cancellation::{CancellationController, CancellationRegistry, Registration, RequestId};
use crate::config::{resolve, resolve_debug_port, BuildConfig, RawBuildConfig, ValidationError};
use crate::connection::{Connection, ConnectionProvider};
use crate::engine::{DaemonInfo, Engine};
use crate::error::{OperationError, Phase};
use crate::executor::{execute, OperationSpec};
use crate::lifecycle::{OperationKind, OperationLifecycle, OperationState};
use crate::obs;
use crate::sink::{EventSink, OperationEvent, OperationPayload, OperationResult, OperationStream};

/// Default bound of each operation's outbound channel.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub stream_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetBuildRequest {
    /// Blank asks the server to generate one.
    pub request_id: String,
    pub config: RawBuildConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTaskRequest {
    pub request_id: String,
    pub config: RawBuildConfig,
    pub tasks: Vec<String>,
    pub arguments: Vec<String>,
    /// Attach the task's JVMs to a debugger listening on `java_debug_port`.
    pub java_debug: bool,
    /// Checked only when `java_debug` is set.
    pub java_debug_port: i32,
}

/// Reply to a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReply {
    pub message: String,
    /// Whether anything was running to cancel.
    pub running: bool,
}

/// What a request asks for, before validation.
enum Plan {
    GetBuild,
    RunTask {
        tasks: Vec<String>,
        arguments: Vec<String>,
        java_debug: bool,
        java_debug_port: i32,
    },
}

/// Validated work for an admitted operation.
enum Job {
    GetBuild,
    RunTask(OperationSpec),
}

impl Plan {
    fn validate(self) -> Result<Job, ValidationError> {
        match self {
            Plan::GetBuild => Ok(Job::GetBuild),
            Plan::RunTask {
                tasks,
                arguments,
                java_debug,
                java_debug_port,
            } => {
                if tasks.is_empty() {
                    return Err(ValidationError::MissingTask);
                }
                Ok(Job::RunTask(OperationSpec::RunTask {
                    tasks,
                    arguments,
                    java_debug_port: resolve_debug_port(java_debug, java_debug_port)?,
                }))
            }
        }
    }
}

struct Inner {
    provider: ConnectionProvider,
    builds: CancellationRegistry,
    tasks: CancellationRegistry,
    config: ServiceConfig,
}

/// Entry points for every RPC. Cheap to clone.
#[derive(Clone)]
pub struct BuildService {
    inner: Arc<Inner>,
}

impl BuildService {
    pub fn new(engine: Arc<dyn Engine>, config: ServiceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider: ConnectionProvider::new(engine),
                builds: CancellationRegistry::new(),
                tasks: CancellationRegistry::new(),
                config,
            }),
        }
    }

    fn registry(&self, kind: OperationKind) -> &CancellationRegistry {
        match kind {
            OperationKind::GetBuild => &self.inner.builds,
            OperationKind::RunTask => &self.inner.tasks,
        }
    }

    // -----------------------------------------------------------------------
    // Streaming operations
    // -----------------------------------------------------------------------

    /// Stream the build environment, then the project model.
    pub fn get_build(&self, request: GetBuildRequest) -> OperationStream {
        self.start(
            OperationKind::GetBuild,
            &request.request_id,
            request.config,
            Plan::GetBuild,
        )
    }

    /// Run tasks, streaming progress and output.
    pub fn run_task(&self, request: RunTaskRequest) -> OperationStream {
        let tasks = request
            .tasks
            .into_iter()
            .filter(|task| !task.trim().is_empty())
            .collect();
        self.start(
            OperationKind::RunTask,
            &request.request_id,
            request.config,
            Plan::RunTask {
                tasks,
                arguments: request.arguments,
                java_debug: request.java_debug,
                java_debug_port: request.java_debug_port,
            },
        )
    }

    fn start(
        &self,
        kind: OperationKind,
        request_id: &str,
        raw: RawBuildConfig,
        plan: Plan,
    ) -> OperationStream {
        let (sink, stream) = EventSink::channel(self.inner.config.stream_buffer);
        let id = RequestId::from_client(request_id);
        let span = obs::operation_span(id.as_str(), kind.as_str());

        let (mut op, admitted) = span.in_scope(|| {
            let mut op = OperationLifecycle::new(id, kind, &raw.project_dir);
            let admitted = self.admit(&mut op, &raw, plan);
            (op, admitted)
        });

        let this = self.clone();
        tokio::spawn(
            async move {
                let result = match admitted {
                    Ok((config, registration, job)) => {
                        this.run(&mut op, config, registration, job, &sink).await
                    }
                    Err(err) => Err(err),
                };
                if let Err(err) = op.terminate(&result, sink.has_streamed(), sink.delivered()) {
                    error!(error = %err, "operation lifecycle out of order");
                }
                sink.complete(result).await;
            }
            .instrument(span),
        );
        stream
    }

    /// Validate and register. Nothing here touches the engine.
    fn admit(
        &self,
        op: &mut OperationLifecycle,
        raw: &RawBuildConfig,
        plan: Plan,
    ) -> Result<(BuildConfig, Registration, Job), OperationError> {
        advance(op, OperationState::Validating);
        let config = resolve(raw)?;
        let job = plan.validate()?;
        let registration = self.registry(op.kind()).register(op.request_id().clone())?;
        advance(op, OperationState::Connecting);
        Ok((config, registration, job))
    }

    async fn run(
        &self,
        op: &mut OperationLifecycle,
        config: BuildConfig,
        registration: Registration,
        job: Job,
        sink: &EventSink,
    ) -> OperationResult {
        let provider = &self.inner.provider;
        let conn = match provider.acquire(&config).await {
            Ok(conn) => conn,
            Err(err) => return Err(OperationError::from_engine(err, Phase::Connecting, false)),
        };
        advance(op, OperationState::Executing);

        let controller = registration.controller();
        let (conn, result) = match job {
            Job::GetBuild => fetch_build(conn, controller, sink).await,
            Job::RunTask(spec) => execute(conn, spec, controller, sink).await,
        };

        if let Some(conn) = conn {
            provider.release(conn).await;
        }
        drop(registration);
        result
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    pub fn cancel_get_build(&self, request_id: &str) -> CancelReply {
        let running = self.inner.builds.signal(&RequestId(request_id.to_string()));
        obs::emit_cancel_requested(request_id, "client", running);
        CancelReply {
            message: if running {
                "Cancel build requested".to_string()
            } else {
                "Build is not running".to_string()
            },
            running,
        }
    }

    pub fn cancel_run_task(&self, request_id: &str) -> CancelReply {
        let running = self.inner.tasks.signal(&RequestId(request_id.to_string()));
        obs::emit_cancel_requested(request_id, "client", running);
        CancelReply {
            message: if running {
                "Cancel task requested".to_string()
            } else {
                "Task is not running".to_string()
            },
            running,
        }
    }

    pub fn cancel_get_builds(&self) -> CancelReply {
        let count = self.inner.builds.cancel_all();
        info!(event = "cancel.all", kind = "get_build", count, "cancelling builds");
        CancelReply {
            message: format!("Cancel requested for {count} build(s)"),
            running: count > 0,
        }
    }

    pub fn cancel_run_tasks(&self) -> CancelReply {
        let count = self.inner.tasks.cancel_all();
        info!(event = "cancel.all", kind = "run_task", count, "cancelling tasks");
        CancelReply {
            message: format!("Cancel requested for {count} task(s)"),
            running: count > 0,
        }
    }

    // -----------------------------------------------------------------------
    // Daemon management
    // -----------------------------------------------------------------------

    async fn connect_wrapper(&self, project_dir: &str) -> Result<Connection, OperationError> {
        let config = resolve(&RawBuildConfig::wrapper(project_dir))?;
        self.inner
            .provider
            .acquire(&config)
            .await
            .map_err(|err| OperationError::from_engine(err, Phase::Connecting, false))
    }

    pub async fn daemons_status(&self, project_dir: &str) -> Result<Vec<DaemonInfo>, OperationError> {
        let mut conn = self.connect_wrapper(project_dir).await?;
        let result = conn.engine_mut().daemons_status().await;
        self.inner.provider.release(conn).await;
        result.map_err(|err| OperationError::from_engine(err, Phase::Executing, false))
    }

    pub async fn stop_daemons(&self, project_dir: &str) -> Result<String, OperationError> {
        let mut conn = self.connect_wrapper(project_dir).await?;
        let result = conn.engine_mut().stop_daemons().await;
        self.inner.provider.release(conn).await;
        result.map_err(|err| OperationError::from_engine(err, Phase::Executing, false))?;
        info!(project_dir, "stopped daemons");
        Ok("Stopped daemons".to_string())
    }

    pub async fn stop_daemon(&self, pid: &str) -> Result<String, OperationError> {
        let parsed: u32 = pid
            .trim()
            .parse()
            .map_err(|_| ValidationError::InvalidPid(pid.to_string()))?;
        self.inner
            .provider
            .engine()
            .stop_daemon(parsed)
            .await
            .map_err(|err| OperationError::from_engine(err, Phase::Executing, false))?;
        Ok(format!("Killed daemon with PID {parsed}"))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Signal every in-flight operation. Returns how many were signaled.
    pub fn shutdown(&self) -> usize {
        let count = self.inner.builds.cancel_all() + self.inner.tasks.cancel_all();
        info!(event = "service.shutdown", cancelled = count, "cancelling in-flight operations");
        count
    }

    /// Wait until no operation holds a connection or a request id.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            let mut tick = tokio::time::interval(Duration::from_millis(25));
            loop {
                tick.tick().await;
                if self.is_idle() {
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    pub fn is_idle(&self) -> bool {
        self.open_connections() == 0 && self.builds_in_flight() == 0 && self.tasks_in_flight() == 0
    }

    pub fn open_connections(&self) -> usize {
        self.inner.provider.open_connections()
    }

    pub fn builds_in_flight(&self) -> usize {
        self.inner.builds.len()
    }

    pub fn tasks_in_flight(&self) -> usize {
        self.inner.tasks.len()
    }
}

fn advance(op: &mut OperationLifecycle, next: OperationState) {
    if let Err(err) = op.advance(next) {
        error!(error = %err, "operation lifecycle out of order");
    }
}

/// Environment first (streamed as an event), then the project model.
async fn fetch_build(
    conn: Connection,
    controller: &CancellationController,
    sink: &EventSink,
) -> (Option<Connection>, OperationResult) {
    let (conn, result) = execute(conn, OperationSpec::FetchEnvironment, controller, sink).await;
    match (conn, result) {
        (Some(conn), Ok(OperationPayload::Environment(environment))) => {
            sink.emit(OperationEvent::Environment(environment)).await;
            execute(conn, OperationSpec::FetchProjectModel, controller, sink).await
        }
        (conn, Err(err)) => (conn, Err(err)),
        (conn, Ok(other)) => (
            conn,
            Err(OperationError::Internal(format!(
                "unexpected environment payload: {other:?}"
            ))),
        ),
    }
}
