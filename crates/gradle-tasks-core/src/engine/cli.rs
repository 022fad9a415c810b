//! Gradle engine backed by the Gradle command line.
//!
//! Each engine call spawns the project's `gradlew` (or a resolved
//! distribution's `bin/gradle`) as a child process, forwards its output line
//! by line to the invocation listener and derives progress events from the
//! console's `> Task` lines. Cancellation kills the client process and waits
//! for it to exit before returning.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::parse::{
    parse_daemon_status_report, parse_gradle_version, parse_jvm_line, parse_task_report,
    progress_from_line,
};
use super::{
    BuildEnvironment, DaemonInfo, Engine, EngineConnection, EngineConnector, EngineError,
    EngineResult, GradleEnvironment, GradleProject, Invocation, InvocationListener,
    JavaEnvironment, OutputChannel, OutputChunk,
};

/// Lines of stderr kept for failure messages.
const ERROR_TAIL_LINES: usize = 20;

fn executable(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.bat")
    } else {
        name.to_string()
    }
}

/// Default Gradle user home (`~/.gradle`).
pub fn default_user_home() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".gradle"))
}

/// Real engine: runs Gradle as a child process.
///
/// A requested Gradle version must already be unpacked in the user home's
/// wrapper distribution cache (`wrapper/dists`); unlike the wrapper itself,
/// this engine never downloads a distribution.
#[derive(Debug, Clone, Default)]
pub struct GradleCli;

impl GradleCli {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Engine for GradleCli {
    fn new_connector(&self) -> Box<dyn EngineConnector> {
        Box::new(CliConnector::default())
    }

    async fn stop_daemon(&self, pid: u32) -> EngineResult<()> {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("taskkill");
            cmd.args(["/PID", &pid.to_string(), "/F"]);
            cmd
        } else {
            let mut cmd = Command::new("kill");
            cmd.arg(pid.to_string());
            cmd
        };
        let output = cmd.output().await?;
        if output.status.success() {
            info!(pid, "stopped daemon");
            Ok(())
        } else {
            Err(EngineError::Failed(format!(
                "unable to stop daemon with PID {pid}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Distribution {
    #[default]
    Wrapper,
    Version(String),
    Installation(PathBuf),
}

#[derive(Debug, Default)]
struct CliConnector {
    project_dir: Option<PathBuf>,
    user_home: Option<PathBuf>,
    distribution: Distribution,
}

impl CliConnector {
    async fn locate_program(&self, project_dir: &Path) -> EngineResult<PathBuf> {
        match &self.distribution {
            Distribution::Wrapper => {
                let script = project_dir.join(executable("gradlew"));
                if tokio::fs::metadata(&script).await.is_ok() {
                    Ok(script)
                } else {
                    Err(EngineError::Connect(format!(
                        "no Gradle wrapper found in {}",
                        project_dir.display()
                    )))
                }
            }
            Distribution::Installation(dir) => {
                let program = dir.join("bin").join(executable("gradle"));
                if tokio::fs::metadata(&program).await.is_ok() {
                    Ok(program)
                } else {
                    Err(EngineError::Connect(format!(
                        "{} is not a Gradle installation",
                        dir.display()
                    )))
                }
            }
            Distribution::Version(version) => {
                let home = self
                    .user_home
                    .clone()
                    .or_else(default_user_home)
                    .ok_or_else(|| {
                        EngineError::Connect("cannot determine Gradle user home".to_string())
                    })?;
                find_distribution(&home, version).await.ok_or_else(|| {
                    EngineError::Connect(format!(
                        "Gradle {version} is not in the distribution cache under {}; \
                         versions are not downloaded on demand, use the wrapper or an installation",
                        home.join("wrapper").join("dists").display()
                    ))
                })
            }
        }
    }
}

/// Look for `gradle-<version>-{bin,all}/<hash>/gradle-<version>/bin/gradle`
/// under the user home's wrapper distribution cache.
async fn find_distribution(user_home: &Path, version: &str) -> Option<PathBuf> {
    for flavor in ["bin", "all"] {
        let dists = user_home
            .join("wrapper")
            .join("dists")
            .join(format!("gradle-{version}-{flavor}"));
        let Ok(mut entries) = tokio::fs::read_dir(&dists).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let program = entry
                .path()
                .join(format!("gradle-{version}"))
                .join("bin")
                .join(executable("gradle"));
            if tokio::fs::metadata(&program).await.is_ok() {
                return Some(program);
            }
        }
    }
    None
}

#[async_trait]
impl EngineConnector for CliConnector {
    fn for_project_directory(&mut self, dir: &Path) {
        self.project_dir = Some(dir.to_path_buf());
    }

    fn use_gradle_user_home_dir(&mut self, dir: &Path) {
        self.user_home = Some(dir.to_path_buf());
    }

    fn use_build_distribution(&mut self) {
        self.distribution = Distribution::Wrapper;
    }

    fn use_gradle_version(&mut self, version: &str) {
        self.distribution = Distribution::Version(version.to_string());
    }

    fn use_installation(&mut self, dir: &Path) {
        self.distribution = Distribution::Installation(dir.to_path_buf());
    }

    async fn connect(self: Box<Self>) -> EngineResult<Box<dyn EngineConnection>> {
        let project_dir = self
            .project_dir
            .clone()
            .ok_or_else(|| EngineError::Connect("no project directory set".to_string()))?;

        let is_dir = tokio::fs::metadata(&project_dir)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(EngineError::Connect(format!(
                "project directory {} does not exist",
                project_dir.display()
            )));
        }

        let program = self.locate_program(&project_dir).await?;
        debug!(program = %program.display(), "resolved Gradle executable");

        Ok(Box::new(CliConnection {
            program,
            project_dir,
            user_home: self.user_home,
        }))
    }
}

struct Captured {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

fn failure(action: &str, captured: &Captured) -> EngineError {
    let stderr = String::from_utf8_lossy(&captured.stderr);
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let tail = lines[lines.len().saturating_sub(ERROR_TAIL_LINES)..].join("\n");
    if tail.is_empty() {
        EngineError::Failed(format!("{action} failed: Gradle exited with {}", captured.status))
    } else {
        EngineError::Failed(format!("{action} failed: {tail}"))
    }
}

/// Forward one process stream to the listener, line by line.
async fn pump<R>(
    reader: Option<R>,
    channel: OutputChannel,
    listener: Arc<dyn InvocationListener>,
    capture: bool,
) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(Vec::new());
    };
    let mut reader = BufReader::new(reader);
    let mut captured = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if channel == OutputChannel::Stdout {
            if let Some(event) = progress_from_line(&String::from_utf8_lossy(&line)) {
                listener.on_progress(event).await;
            }
        }
        if capture {
            captured.extend_from_slice(&line);
        }
        listener
            .on_output(OutputChunk {
                channel,
                bytes: line.clone(),
            })
            .await;
    }
    Ok(captured)
}

struct CliConnection {
    program: PathBuf,
    project_dir: PathBuf,
    user_home: Option<PathBuf>,
}

/// Console style passed to Gradle.
///
/// Anything whose output is parsed runs with the plain console; only task
/// runs may ask for rich, colored output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Console {
    Plain,
    Rich,
}

impl Console {
    fn arg(self) -> &'static str {
        match self {
            Console::Plain => "--console=plain",
            Console::Rich => "--console=rich",
        }
    }
}

/// `JAVA_TOOL_OPTIONS` value that attaches a JVM to a listening debugger.
fn jdwp_agent(port: u16) -> String {
    format!("-agentlib:jdwp=transport=dt_socket,server=n,suspend=y,address=localhost:{port}")
}

impl CliConnection {
    fn command(&self, invocation: Option<&Invocation>, console: Console) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(&self.project_dir)
            .arg("--project-dir")
            .arg(&self.project_dir);
        if let Some(home) = &self.user_home {
            cmd.arg("--gradle-user-home").arg(home);
        }
        if let Some(invocation) = invocation {
            if !invocation.jvm_arguments.is_empty() {
                cmd.arg(format!(
                    "-Dorg.gradle.jvmargs={}",
                    invocation.jvm_arguments.join(" ")
                ));
            }
            if let Some(java_home) = &invocation.java_home {
                cmd.arg(format!("-Dorg.gradle.java.home={}", java_home.display()));
            }
            if let Some(port) = invocation.java_debug_port {
                cmd.env("JAVA_TOOL_OPTIONS", jdwp_agent(port));
            }
        }
        cmd.arg(console.arg())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run to completion, capturing output without streaming it.
    async fn run_quiet(&self, cmd: &mut Command) -> EngineResult<Captured> {
        let output = cmd.output().await?;
        Ok(Captured {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Run while streaming output to the invocation listener.
    ///
    /// On cancellation the child is killed and reaped before returning
    /// [`EngineError::Cancelled`].
    async fn run_streaming(
        &self,
        mut cmd: Command,
        invocation: &Invocation,
        capture_stdout: bool,
    ) -> EngineResult<Captured> {
        if invocation.cancellation.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut child = cmd.spawn()?;
        debug!(pid = child.id(), "spawned Gradle");

        let stdout = tokio::spawn(pump(
            child.stdout.take(),
            OutputChannel::Stdout,
            invocation.listener.clone(),
            capture_stdout,
        ));
        let stderr = tokio::spawn(pump(
            child.stderr.take(),
            OutputChannel::Stderr,
            invocation.listener.clone(),
            true,
        ));

        let cancelled = tokio::select! {
            status = child.wait() => {
                status?;
                false
            }
            _ = invocation.cancellation.cancelled() => true,
        };
        if cancelled {
            info!(pid = child.id(), "cancelling Gradle invocation");
            if let Err(err) = child.start_kill() {
                warn!(error = %err, "failed to kill Gradle process");
            }
        }
        let status = child.wait().await?;

        let join = |err: tokio::task::JoinError| EngineError::Failed(err.to_string());
        let stdout = stdout.await.map_err(join)??;
        let stderr = stderr.await.map_err(join)??;

        if cancelled {
            return Err(EngineError::Cancelled);
        }
        Ok(Captured {
            status,
            stdout,
            stderr,
        })
    }

    fn project_name(&self) -> String {
        self.project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string())
    }

    fn build_file(&self) -> Option<PathBuf> {
        ["build.gradle.kts", "build.gradle"]
            .iter()
            .map(|name| self.project_dir.join(name))
            .find(|path| path.is_file())
    }
}

#[async_trait]
impl EngineConnection for CliConnection {
    async fn build_environment(&mut self, invocation: Invocation) -> EngineResult<BuildEnvironment> {
        let mut cmd = self.command(Some(&invocation), Console::Plain);
        cmd.arg("--version");
        let captured = tokio::select! {
            captured = self.run_quiet(&mut cmd) => captured?,
            _ = invocation.cancellation.cancelled() => return Err(EngineError::Cancelled),
        };
        if !captured.status.success() {
            return Err(failure("reading the build environment", &captured));
        }
        let stdout = String::from_utf8_lossy(&captured.stdout);
        let gradle_version = parse_gradle_version(&stdout).ok_or_else(|| {
            EngineError::Failed("unable to determine the Gradle version".to_string())
        })?;
        debug!(gradle = %gradle_version, jvm = ?parse_jvm_line(&stdout), "read build environment");

        Ok(BuildEnvironment {
            gradle: GradleEnvironment {
                user_home: self.user_home.clone().or_else(default_user_home),
                gradle_version,
            },
            java: JavaEnvironment {
                java_home: invocation
                    .java_home
                    .clone()
                    .or_else(|| std::env::var_os("JAVA_HOME").map(PathBuf::from)),
                jvm_arguments: invocation.jvm_arguments.clone(),
            },
        })
    }

    async fn project_model(&mut self, invocation: Invocation) -> EngineResult<GradleProject> {
        let mut cmd = self.command(Some(&invocation), Console::Plain);
        cmd.args(["tasks", "--all"]);
        let captured = self.run_streaming(cmd, &invocation, true).await?;
        if !captured.status.success() {
            return Err(failure("loading the project model", &captured));
        }
        let mut project = parse_task_report(
            &String::from_utf8_lossy(&captured.stdout),
            &self.project_name(),
        );
        project.build_file = self.build_file();
        Ok(project)
    }

    async fn run_tasks(
        &mut self,
        invocation: Invocation,
        tasks: &[String],
        arguments: &[String],
    ) -> EngineResult<()> {
        let console = if invocation.color_output {
            Console::Rich
        } else {
            Console::Plain
        };
        let mut cmd = self.command(Some(&invocation), console);
        cmd.args(tasks).args(arguments);
        let captured = self.run_streaming(cmd, &invocation, false).await?;
        if captured.status.success() {
            Ok(())
        } else {
            Err(failure(&format!("task {}", tasks.join(" ")), &captured))
        }
    }

    async fn daemons_status(&mut self) -> EngineResult<Vec<DaemonInfo>> {
        let mut cmd = self.command(None, Console::Plain);
        cmd.arg("--status");
        let captured = self.run_quiet(&mut cmd).await?;
        if !captured.status.success() {
            return Err(failure("reading daemon status", &captured));
        }
        Ok(parse_daemon_status_report(&String::from_utf8_lossy(
            &captured.stdout,
        )))
    }

    async fn stop_daemons(&mut self) -> EngineResult<()> {
        let mut cmd = self.command(None, Console::Plain);
        cmd.arg("--stop");
        let captured = self.run_quiet(&mut cmd).await?;
        if captured.status.success() {
            Ok(())
        } else {
            Err(failure("stopping daemons", &captured))
        }
    }

    async fn close(&mut self) {
        debug!(project = %self.project_dir.display(), "closing Gradle connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_missing_project_dir() {
        let mut connector = GradleCli::new().new_connector();
        connector.for_project_directory(Path::new("/definitely/not/a/project"));
        connector.use_build_distribution();
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, EngineError::Connect(msg) if msg.contains("does not exist")));
    }

    #[tokio::test]
    async fn test_connect_without_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        let mut connector = GradleCli::new().new_connector();
        connector.for_project_directory(dir.path());
        connector.use_build_distribution();
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, EngineError::Connect(msg) if msg.contains("no Gradle wrapper")));
    }

    #[tokio::test]
    async fn test_connect_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let mut connector = GradleCli::new().new_connector();
        connector.for_project_directory(dir.path());
        connector.use_gradle_user_home_dir(home.path());
        connector.use_gradle_version("6.3");
        let err = connector.connect().await.err().unwrap();
        let EngineError::Connect(msg) = err else {
            panic!("expected a connect error");
        };
        assert!(msg.contains("Gradle 6.3"));
        assert!(msg.contains("not downloaded"));
    }

    #[tokio::test]
    async fn test_find_distribution_in_wrapper_cache() {
        let home = tempfile::tempdir().unwrap();
        let bin = home
            .path()
            .join("wrapper/dists/gradle-6.3-bin/abc123/gradle-6.3/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join(executable("gradle")), "").unwrap();

        let found = find_distribution(home.path(), "6.3").await.unwrap();
        assert!(found.ends_with(format!("gradle-6.3/bin/{}", executable("gradle"))));
        assert!(find_distribution(home.path(), "7.0").await.is_none());
    }

    fn connection() -> CliConnection {
        CliConnection {
            program: PathBuf::from("/tmp/p/gradlew"),
            project_dir: PathBuf::from("/tmp/p"),
            user_home: None,
        }
    }

    fn invocation(color_output: bool, java_debug_port: Option<u16>) -> Invocation {
        struct Ignore;

        #[async_trait]
        impl InvocationListener for Ignore {
            async fn on_progress(&self, _event: crate::engine::ProgressEvent) {}
            async fn on_output(&self, _chunk: OutputChunk) {}
        }

        Invocation {
            jvm_arguments: vec!["-Xmx64m -Xms64m".into()],
            java_home: None,
            color_output,
            java_debug_port,
            cancellation: crate::cancellation::CancellationController::new().token(),
            listener: Arc::new(Ignore),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn tool_options(cmd: &Command) -> Option<String> {
        cmd.as_std()
            .get_envs()
            .find(|(key, _)| key.to_str() == Some("JAVA_TOOL_OPTIONS"))
            .and_then(|(_, value)| value.map(|v| v.to_string_lossy().into_owned()))
    }

    #[test]
    fn test_console_style_is_explicit() {
        let conn = connection();
        let colored = invocation(true, None);
        let plain = args(&conn.command(Some(&colored), Console::Plain));
        assert!(plain.contains(&"--console=plain".to_string()));
        assert!(!plain.contains(&"--console=rich".to_string()));
        assert!(plain.contains(&"-Dorg.gradle.jvmargs=-Xmx64m -Xms64m".to_string()));

        let rich = args(&conn.command(Some(&colored), Console::Rich));
        assert!(rich.contains(&"--console=rich".to_string()));

        let daemon = args(&conn.command(None, Console::Plain));
        assert!(daemon.contains(&"--console=plain".to_string()));
    }

    #[test]
    fn test_debug_port_sets_jdwp_agent() {
        let conn = connection();
        let cmd = conn.command(Some(&invocation(false, Some(5005))), Console::Plain);
        assert_eq!(
            tool_options(&cmd).as_deref(),
            Some("-agentlib:jdwp=transport=dt_socket,server=n,suspend=y,address=localhost:5005")
        );
        let cmd = conn.command(Some(&invocation(false, None)), Console::Plain);
        assert!(tool_options(&cmd).is_none());
    }

    #[tokio::test]
    async fn test_connect_with_wrapper_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(executable("gradlew")), "").unwrap();
        let mut connector = GradleCli::new().new_connector();
        connector.for_project_directory(dir.path());
        connector.use_build_distribution();
        assert!(connector.connect().await.is_ok());
    }
}
