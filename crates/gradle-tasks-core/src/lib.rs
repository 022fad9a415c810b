//! gradle-tasks core: connection, execution, streaming and cancellation
//!
//! Turns a blocking, callback-driven build engine into concurrent,
//! cancellable operations whose progress and output stream back to one
//! caller each.
//!
//! ## Key Components
//!
//! - `config::resolve`: validates a raw build configuration
//! - `ConnectionProvider`: opens and closes per-operation engine connections
//! - `CancellationRegistry`: request id to cancellation controller
//! - `executor::execute`: runs one engine call on a worker task
//! - `EventSink`: ordered, single-writer bridge onto a caller's stream
//! - `BuildService`: the façade transports call into

pub mod cancellation;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fakes;
pub mod lifecycle;
pub mod obs;
pub mod service;
pub mod sink;
pub mod telemetry;

pub use cancellation::{
    CancellationController, CancellationRegistry, CancellationToken, Registration, RegistryError,
    RequestId,
};
pub use config::{
    resolve, resolve_debug_port, BuildConfig, RawBuildConfig, ValidationError, VersionPolicy,
};
pub use connection::{Connection, ConnectionProvider};
pub use engine::cli::GradleCli;
pub use engine::{
    BuildEnvironment, DaemonInfo, DaemonStatus, Engine, EngineConnection, EngineConnector,
    EngineError, EngineResult, GradleEnvironment, GradleProject, GradleTask, Invocation,
    InvocationListener, JavaEnvironment, OutputChannel, OutputChunk, ProgressEvent,
};
pub use error::{ErrorKind, OperationError, StructuredError};
pub use executor::{execute, OperationSpec};
pub use lifecycle::{OperationKind, OperationLifecycle, OperationState, Outcome};
pub use service::{
    BuildService, CancelReply, GetBuildRequest, RunTaskRequest, ServiceConfig,
    DEFAULT_STREAM_BUFFER,
};
pub use sink::{
    EventSink, OperationEvent, OperationPayload, OperationResult, OperationStream, StreamItem,
};
