//! In-memory engine for tests.
//!
//! [`FakeEngine`] satisfies the engine capability traits without spawning
//! anything. Every connector step and engine call is appended to a shared
//! log so tests can assert what the core asked the engine to do, and in
//! which order.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::engine::{
    BuildEnvironment, DaemonInfo, Engine, EngineConnection, EngineConnector, EngineError,
    EngineResult, GradleEnvironment, GradleProject, GradleTask, Invocation, OutputChunk,
    ProgressEvent,
};

/// One recorded interaction with the fake engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    ForProjectDirectory(PathBuf),
    UseGradleUserHome(PathBuf),
    UseBuildDistribution,
    UseGradleVersion(String),
    UseInstallation(PathBuf),
    Connect,
    BuildEnvironment {
        jvm_arguments: Vec<String>,
        java_home: Option<PathBuf>,
        color_output: bool,
    },
    ProjectModel {
        jvm_arguments: Vec<String>,
    },
    RunTasks {
        tasks: Vec<String>,
        arguments: Vec<String>,
        jvm_arguments: Vec<String>,
        java_debug_port: Option<u16>,
    },
    DaemonsStatus,
    StopDaemons,
    StopDaemon(u32),
    Close,
}

/// Events replayed to the listener at the start of every engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedEvent {
    Progress(String),
    Stdout(String),
    Stderr(String),
}

/// How engine calls finish once scripted events have been replayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FakeBehavior {
    #[default]
    Succeed,
    /// Return [`EngineError::Failed`] with the message.
    Fail(String),
    /// Block until the invocation is cancelled, then report cancellation.
    WaitForCancel,
    /// Block until cancelled, then fail with an unrelated error.
    FailOnCancel(String),
    /// Panic inside the engine call.
    Panic,
}

#[derive(Debug, Clone)]
struct FakeSettings {
    connect_error: Option<String>,
    behavior: FakeBehavior,
    events: Vec<ScriptedEvent>,
    environment: BuildEnvironment,
    project: GradleProject,
    daemons: Vec<DaemonInfo>,
}

impl Default for FakeSettings {
    fn default() -> Self {
        Self {
            connect_error: None,
            behavior: FakeBehavior::Succeed,
            events: Vec::new(),
            environment: BuildEnvironment {
                gradle: GradleEnvironment {
                    user_home: None,
                    gradle_version: "8.5".to_string(),
                },
                ..BuildEnvironment::default()
            },
            project: GradleProject {
                name: "fake".to_string(),
                path: ":".to_string(),
                tasks: vec![GradleTask {
                    name: "build".to_string(),
                    path: ":build".to_string(),
                    group: Some("build".to_string()),
                    description: Some("Assembles and tests this project.".to_string()),
                    project: ":".to_string(),
                }],
                ..GradleProject::default()
            },
            daemons: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    calls: Mutex<Vec<EngineCall>>,
    settings: Mutex<FakeSettings>,
    started: watch::Sender<usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Recording engine. Clones share the same call log and settings.
#[derive(Debug, Clone)]
pub struct FakeEngine {
    shared: Arc<Shared>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        let (started, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                calls: Mutex::new(Vec::new()),
                settings: Mutex::new(FakeSettings::default()),
                started,
            }),
        }
    }

    pub fn with_connect_error(self, message: impl Into<String>) -> Self {
        lock(&self.shared.settings).connect_error = Some(message.into());
        self
    }

    pub fn with_behavior(self, behavior: FakeBehavior) -> Self {
        self.set_behavior(behavior);
        self
    }

    pub fn with_events(self, events: Vec<ScriptedEvent>) -> Self {
        lock(&self.shared.settings).events = events;
        self
    }

    pub fn with_environment(self, environment: BuildEnvironment) -> Self {
        lock(&self.shared.settings).environment = environment;
        self
    }

    pub fn with_project(self, project: GradleProject) -> Self {
        lock(&self.shared.settings).project = project;
        self
    }

    pub fn with_daemons(self, daemons: Vec<DaemonInfo>) -> Self {
        lock(&self.shared.settings).daemons = daemons;
        self
    }

    /// Change the behavior of calls made from now on.
    pub fn set_behavior(&self, behavior: FakeBehavior) {
        lock(&self.shared.settings).behavior = behavior;
    }

    /// Snapshot of every recorded call.
    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.shared.calls).clone()
    }

    pub fn count(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        lock(&self.shared.calls).iter().filter(|c| predicate(c)).count()
    }

    /// Wait until at least `n` engine calls have started running.
    pub async fn wait_for_started(&self, n: usize) {
        let mut rx = self.shared.started.subscribe();
        let _ = rx.wait_for(|started| *started >= n).await;
    }

    fn record(&self, call: EngineCall) {
        lock(&self.shared.calls).push(call);
    }

    fn settings(&self) -> FakeSettings {
        lock(&self.shared.settings).clone()
    }

    async fn play(&self, invocation: &Invocation) -> EngineResult<()> {
        let settings = self.settings();
        for event in settings.events {
            match event {
                ScriptedEvent::Progress(name) => {
                    invocation
                        .listener
                        .on_progress(ProgressEvent::now(name.clone(), name))
                        .await
                }
                ScriptedEvent::Stdout(text) => {
                    invocation.listener.on_output(OutputChunk::stdout(text)).await
                }
                ScriptedEvent::Stderr(text) => {
                    invocation.listener.on_output(OutputChunk::stderr(text)).await
                }
            }
        }
        self.shared.started.send_modify(|started| *started += 1);

        match settings.behavior {
            FakeBehavior::Succeed => Ok(()),
            FakeBehavior::Fail(message) => Err(EngineError::Failed(message)),
            FakeBehavior::WaitForCancel => {
                invocation.cancellation.cancelled().await;
                Err(EngineError::Cancelled)
            }
            FakeBehavior::FailOnCancel(message) => {
                invocation.cancellation.cancelled().await;
                Err(EngineError::Failed(message))
            }
            FakeBehavior::Panic => panic!("fake engine panicked"),
        }
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn new_connector(&self) -> Box<dyn EngineConnector> {
        Box::new(FakeConnector {
            engine: self.clone(),
        })
    }

    async fn stop_daemon(&self, pid: u32) -> EngineResult<()> {
        self.record(EngineCall::StopDaemon(pid));
        Ok(())
    }
}

struct FakeConnector {
    engine: FakeEngine,
}

#[async_trait]
impl EngineConnector for FakeConnector {
    fn for_project_directory(&mut self, dir: &Path) {
        self.engine
            .record(EngineCall::ForProjectDirectory(dir.to_path_buf()));
    }

    fn use_gradle_user_home_dir(&mut self, dir: &Path) {
        self.engine
            .record(EngineCall::UseGradleUserHome(dir.to_path_buf()));
    }

    fn use_build_distribution(&mut self) {
        self.engine.record(EngineCall::UseBuildDistribution);
    }

    fn use_gradle_version(&mut self, version: &str) {
        self.engine
            .record(EngineCall::UseGradleVersion(version.to_string()));
    }

    fn use_installation(&mut self, dir: &Path) {
        self.engine
            .record(EngineCall::UseInstallation(dir.to_path_buf()));
    }

    async fn connect(self: Box<Self>) -> EngineResult<Box<dyn EngineConnection>> {
        self.engine.record(EngineCall::Connect);
        match self.engine.settings().connect_error {
            Some(message) => Err(EngineError::Connect(message)),
            None => Ok(Box::new(FakeConnection {
                engine: self.engine,
            })),
        }
    }
}

struct FakeConnection {
    engine: FakeEngine,
}

#[async_trait]
impl EngineConnection for FakeConnection {
    async fn build_environment(&mut self, invocation: Invocation) -> EngineResult<BuildEnvironment> {
        self.engine.record(EngineCall::BuildEnvironment {
            jvm_arguments: invocation.jvm_arguments.clone(),
            java_home: invocation.java_home.clone(),
            color_output: invocation.color_output,
        });
        self.engine.play(&invocation).await?;
        Ok(self.engine.settings().environment)
    }

    async fn project_model(&mut self, invocation: Invocation) -> EngineResult<GradleProject> {
        self.engine.record(EngineCall::ProjectModel {
            jvm_arguments: invocation.jvm_arguments.clone(),
        });
        self.engine.play(&invocation).await?;
        Ok(self.engine.settings().project)
    }

    async fn run_tasks(
        &mut self,
        invocation: Invocation,
        tasks: &[String],
        arguments: &[String],
    ) -> EngineResult<()> {
        self.engine.record(EngineCall::RunTasks {
            tasks: tasks.to_vec(),
            arguments: arguments.to_vec(),
            jvm_arguments: invocation.jvm_arguments.clone(),
            java_debug_port: invocation.java_debug_port,
        });
        self.engine.play(&invocation).await
    }

    async fn daemons_status(&mut self) -> EngineResult<Vec<DaemonInfo>> {
        self.engine.record(EngineCall::DaemonsStatus);
        Ok(self.engine.settings().daemons)
    }

    async fn stop_daemons(&mut self) -> EngineResult<()> {
        self.engine.record(EngineCall::StopDaemons);
        Ok(())
    }

    async fn close(&mut self) {
        self.engine.record(EngineCall::Close);
    }
}
