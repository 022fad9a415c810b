//! Build engine capability.
//!
//! The server never evaluates builds itself; it drives an [`Engine`] through
//! the narrow interface below. Configuration is applied to a fresh
//! [`EngineConnector`] step by step, mirroring how a Gradle connector is
//! configured, and `connect` yields an [`EngineConnection`] used for exactly
//! one operation.
//!
//! # Implementations
//!
//! - [`cli::GradleCli`]: drives the Gradle wrapper or a distribution's
//!   command line as a child process
//! - [`crate::fakes::FakeEngine`]: in-memory engine that records every call

pub mod cli;
pub mod parse;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationToken;

/// Failures reported by an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("could not connect to Gradle: {0}")]
    Connect(String),

    #[error("{0}")]
    Failed(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A single progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub display_name: String,
    pub description: String,
}

impl ProgressEvent {
    pub fn now(display_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            display_name: display_name.into(),
            description: description.into(),
        }
    }
}

/// Which process stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

/// Raw bytes written by the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub channel: OutputChannel,
    pub bytes: Vec<u8>,
}

impl OutputChunk {
    pub fn stdout(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: OutputChannel::Stdout,
            bytes: bytes.into(),
        }
    }

    pub fn stderr(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: OutputChannel::Stderr,
            bytes: bytes.into(),
        }
    }
}

/// Receives progress and output while an engine call runs.
///
/// Calls may arrive from several tasks at once; implementations serialize.
#[async_trait]
pub trait InvocationListener: Send + Sync {
    async fn on_progress(&self, event: ProgressEvent);

    async fn on_output(&self, chunk: OutputChunk);
}

/// Per-call settings shared by every engine operation.
#[derive(Clone)]
pub struct Invocation {
    pub jvm_arguments: Vec<String>,
    pub java_home: Option<PathBuf>,
    pub color_output: bool,
    /// Local port of a debugger the build's JVMs attach to over JDWP.
    pub java_debug_port: Option<u16>,
    pub cancellation: CancellationToken,
    pub listener: Arc<dyn InvocationListener>,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("jvm_arguments", &self.jvm_arguments)
            .field("java_home", &self.java_home)
            .field("color_output", &self.color_output)
            .field("java_debug_port", &self.java_debug_port)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradleEnvironment {
    pub user_home: Option<PathBuf>,
    pub gradle_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JavaEnvironment {
    pub java_home: Option<PathBuf>,
    pub jvm_arguments: Vec<String>,
}

/// Environment the build runs in, as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEnvironment {
    pub gradle: GradleEnvironment,
    pub java: JavaEnvironment,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradleTask {
    pub name: String,
    /// Fully qualified path, e.g. `:app:build`.
    pub path: String,
    pub group: Option<String>,
    pub description: Option<String>,
    /// Path of the owning project, e.g. `:app`.
    pub project: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradleProject {
    pub name: String,
    /// Project path; `:` for the root project.
    pub path: String,
    pub description: Option<String>,
    pub build_file: Option<PathBuf>,
    pub tasks: Vec<GradleTask>,
    pub children: Vec<GradleProject>,
}

impl GradleProject {
    /// Total number of tasks in this project and all descendants.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
            + self
                .children
                .iter()
                .map(GradleProject::task_count)
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    Idle,
    Busy,
    Stopped,
    Stopping,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub pid: String,
    pub status: DaemonStatus,
    pub info: String,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Entry point to a build engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Start configuring a new connection.
    fn new_connector(&self) -> Box<dyn EngineConnector>;

    /// Terminate a single daemon process by pid.
    async fn stop_daemon(&self, pid: u32) -> EngineResult<()>;
}

/// Builder for one engine connection. Methods are called in a fixed order:
/// project directory, user home (when set), version policy, then `connect`.
#[async_trait]
pub trait EngineConnector: Send {
    fn for_project_directory(&mut self, dir: &Path);

    fn use_gradle_user_home_dir(&mut self, dir: &Path);

    /// Use the version pinned by the project wrapper.
    fn use_build_distribution(&mut self);

    fn use_gradle_version(&mut self, version: &str);

    fn use_installation(&mut self, dir: &Path);

    async fn connect(self: Box<Self>) -> EngineResult<Box<dyn EngineConnection>>;
}

/// A connected engine handle. Not shared between operations.
#[async_trait]
pub trait EngineConnection: Send {
    async fn build_environment(&mut self, invocation: Invocation) -> EngineResult<BuildEnvironment>;

    async fn project_model(&mut self, invocation: Invocation) -> EngineResult<GradleProject>;

    async fn run_tasks(
        &mut self,
        invocation: Invocation,
        tasks: &[String],
        arguments: &[String],
    ) -> EngineResult<()>;

    async fn daemons_status(&mut self) -> EngineResult<Vec<DaemonInfo>>;

    async fn stop_daemons(&mut self) -> EngineResult<()>;

    /// Release engine resources. Called exactly once.
    async fn close(&mut self);
}
