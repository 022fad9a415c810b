//! Mapping between core values and protobuf messages.
//!
//! Everything here is pure so the wire shape can be tested without a server.

use std::path::Path;

use gradle_tasks_core::{
    BuildEnvironment, DaemonInfo, DaemonStatus, GradleProject, GradleTask, OperationError,
    OperationEvent, OperationPayload, OutputChannel, OutputChunk, ProgressEvent, RawBuildConfig,
    StreamItem, ValidationError,
};
use tonic::Status;

use crate::proto::v1 as pb;

/// Message of the terminal `RunTaskResult`.
pub const TASK_COMPLETED: &str = "Task completed";

/// Wire request fields to the core's raw configuration.
///
/// A missing `GradleConfig` is treated as all defaults. Colored output is on
/// when either the config or the request asks for it.
pub fn raw_config(
    project_dir: String,
    config: Option<pb::GradleConfig>,
    show_output_colors: bool,
) -> RawBuildConfig {
    let config = config.unwrap_or_default();
    RawBuildConfig {
        project_dir,
        user_home: config.user_home,
        wrapper_enabled: config.wrapper_enabled,
        version: config.version,
        installation: config.installation,
        jvm_arguments: config.jvm_arguments,
        java_home: config.java_home,
        color_output: config.color_output || show_output_colors,
    }
}

fn path_string(path: Option<&Path>) -> String {
    path.map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn progress(event: ProgressEvent) -> pb::Progress {
    pb::Progress {
        timestamp_millis: event.timestamp.timestamp_millis(),
        display_name: event.display_name,
        description: event.description,
    }
}

pub fn output(chunk: OutputChunk) -> pb::Output {
    let output_type = match chunk.channel {
        OutputChannel::Stdout => pb::OutputType::Stdout,
        OutputChannel::Stderr => pb::OutputType::Stderr,
    };
    pb::Output {
        output_type: output_type as i32,
        output_bytes: chunk.bytes,
    }
}

pub fn environment(env: BuildEnvironment) -> pb::Environment {
    pb::Environment {
        gradle_environment: Some(pb::GradleEnvironment {
            gradle_user_home: path_string(env.gradle.user_home.as_deref()),
            gradle_version: env.gradle.gradle_version,
        }),
        java_environment: Some(pb::JavaEnvironment {
            java_home: path_string(env.java.java_home.as_deref()),
            jvm_args: env.java.jvm_arguments,
        }),
    }
}

fn task(task: GradleTask) -> pb::GradleTask {
    pb::GradleTask {
        name: task.name,
        path: task.path,
        group: task.group.unwrap_or_default(),
        description: task.description.unwrap_or_default(),
        project: task.project,
    }
}

pub fn project(project: GradleProject) -> pb::GradleProject {
    pb::GradleProject {
        name: project.name,
        path: project.path,
        description: project.description.unwrap_or_default(),
        build_file: path_string(project.build_file.as_deref()),
        tasks: project.tasks.into_iter().map(task).collect(),
        projects: project.children.into_iter().map(self::project).collect(),
    }
}

pub fn daemon(info: DaemonInfo) -> pb::DaemonInfo {
    let status = match info.status {
        DaemonStatus::Idle => pb::DaemonStatus::Idle,
        DaemonStatus::Busy => pb::DaemonStatus::Busy,
        DaemonStatus::Stopped => pb::DaemonStatus::Stopped,
        DaemonStatus::Stopping => pb::DaemonStatus::Stopping,
        DaemonStatus::Canceled => pb::DaemonStatus::Canceled,
    };
    pb::DaemonInfo {
        pid: info.pid,
        status: status as i32,
        info: info.info,
    }
}

/// gRPC status for a failed operation.
///
/// A missing version is reported as `INTERNAL`; existing clients match on
/// that code together with the message.
pub fn status(err: &OperationError) -> Status {
    let message = err.to_string();
    match err {
        OperationError::Validation(ValidationError::MissingVersion) => Status::internal(message),
        OperationError::Validation(_) => Status::invalid_argument(message),
        OperationError::Connection(_) => Status::unavailable(message),
        OperationError::Execution(_) => Status::unknown(message),
        OperationError::Cancelled(_) => Status::cancelled(message),
        OperationError::Internal(_) => Status::internal(message),
    }
}

/// One core stream item as a `GetBuild` reply.
pub fn get_build_item(item: StreamItem) -> Option<Result<pb::GetBuildReply, Status>> {
    use pb::get_build_reply::Kind;

    let kind = match item {
        StreamItem::Event(OperationEvent::Progress(event)) => Kind::Progress(progress(event)),
        StreamItem::Event(OperationEvent::Output(chunk)) => Kind::Output(output(chunk)),
        StreamItem::Event(OperationEvent::Environment(env)) => Kind::Environment(environment(env)),
        StreamItem::Terminal(Ok(OperationPayload::ProjectModel(model))) => {
            Kind::GetBuildResult(pb::GetBuildResult {
                project: Some(project(model)),
            })
        }
        StreamItem::Terminal(Ok(other)) => {
            return Some(Err(Status::internal(format!(
                "unexpected GetBuild result: {other:?}"
            ))))
        }
        StreamItem::Terminal(Err(err)) => return Some(Err(status(&err))),
    };
    Some(Ok(pb::GetBuildReply { kind: Some(kind) }))
}

/// One core stream item as a `RunTask` reply. Environment events are not
/// part of the `RunTask` stream and are skipped.
pub fn run_task_item(item: StreamItem) -> Option<Result<pb::RunTaskReply, Status>> {
    use pb::run_task_reply::Kind;

    let kind = match item {
        StreamItem::Event(OperationEvent::Progress(event)) => Kind::Progress(progress(event)),
        StreamItem::Event(OperationEvent::Output(chunk)) => Kind::Output(output(chunk)),
        StreamItem::Event(OperationEvent::Environment(_)) => return None,
        StreamItem::Terminal(Ok(OperationPayload::TasksCompleted)) => {
            Kind::RunTaskResult(pb::RunTaskResult {
                message: TASK_COMPLETED.to_string(),
            })
        }
        StreamItem::Terminal(Ok(other)) => {
            return Some(Err(Status::internal(format!(
                "unexpected RunTask result: {other:?}"
            ))))
        }
        StreamItem::Terminal(Err(err)) => return Some(Err(status(&err))),
    };
    Some(Ok(pb::RunTaskReply { kind: Some(kind) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradle_tasks_core::{GradleEnvironment, JavaEnvironment};
    use std::path::PathBuf;
    use tonic::Code;

    #[test]
    fn test_raw_config_defaults_when_missing() {
        let raw = raw_config("/tmp/p".into(), None, false);
        assert_eq!(raw.project_dir, "/tmp/p");
        assert!(!raw.wrapper_enabled);
        assert!(raw.version.is_empty());
    }

    #[test]
    fn test_raw_config_copies_fields() {
        let raw = raw_config(
            "/tmp/p".into(),
            Some(pb::GradleConfig {
                user_home: "/home/me/.gradle".into(),
                wrapper_enabled: false,
                version: "6.3".into(),
                jvm_arguments: "-Xmx64m -Xms64m".into(),
                ..pb::GradleConfig::default()
            }),
            true,
        );
        assert_eq!(raw.user_home, "/home/me/.gradle");
        assert_eq!(raw.version, "6.3");
        assert_eq!(raw.jvm_arguments, "-Xmx64m -Xms64m");
        assert!(raw.color_output);
    }

    #[test]
    fn test_status_codes() {
        let missing = status(&ValidationError::MissingVersion.into());
        assert_eq!(missing.code(), Code::Internal);
        assert_eq!(missing.message(), "Gradle version is required");

        assert_eq!(
            status(&ValidationError::MissingProjectDir.into()).code(),
            Code::InvalidArgument
        );
        assert_eq!(
            status(&OperationError::Connection("down".into())).code(),
            Code::Unavailable
        );
        assert_eq!(
            status(&OperationError::Execution("exit 1".into())).code(),
            Code::Unknown
        );
        assert_eq!(status(&OperationError::cancelled()).code(), Code::Cancelled);
        assert_eq!(
            status(&OperationError::Internal("panic".into())).code(),
            Code::Internal
        );
    }

    #[test]
    fn test_project_tree_flattens_optionals() {
        let model = GradleProject {
            name: "demo".into(),
            path: ":".into(),
            build_file: Some(PathBuf::from("/tmp/p/build.gradle")),
            tasks: vec![GradleTask {
                name: "build".into(),
                path: ":build".into(),
                group: None,
                description: Some("Assembles".into()),
                project: ":".into(),
            }],
            children: vec![GradleProject {
                name: "app".into(),
                path: ":app".into(),
                ..GradleProject::default()
            }],
            ..GradleProject::default()
        };
        let message = project(model);
        assert_eq!(message.build_file, "/tmp/p/build.gradle");
        assert_eq!(message.tasks[0].group, "");
        assert_eq!(message.tasks[0].description, "Assembles");
        assert_eq!(message.projects[0].path, ":app");
    }

    #[test]
    fn test_environment_message() {
        let env = environment(BuildEnvironment {
            gradle: GradleEnvironment {
                user_home: None,
                gradle_version: "8.5".into(),
            },
            java: JavaEnvironment {
                java_home: Some(PathBuf::from("/usr/lib/jvm/17")),
                jvm_arguments: vec!["-Xmx64m -Xms64m".into()],
            },
        });
        let gradle = env.gradle_environment.unwrap();
        assert_eq!(gradle.gradle_version, "8.5");
        assert_eq!(gradle.gradle_user_home, "");
        assert_eq!(env.java_environment.unwrap().jvm_args, vec!["-Xmx64m -Xms64m"]);
    }

    #[test]
    fn test_run_task_stream_items() {
        let out = run_task_item(StreamItem::Event(OperationEvent::Output(OutputChunk::stderr(
            "oops",
        ))))
        .unwrap()
        .unwrap();
        let Some(pb::run_task_reply::Kind::Output(output)) = out.kind else {
            panic!("expected output");
        };
        assert_eq!(output.output_type, pb::OutputType::Stderr as i32);
        assert_eq!(output.output_bytes, b"oops");

        assert!(run_task_item(StreamItem::Event(OperationEvent::Environment(
            BuildEnvironment::default()
        )))
        .is_none());

        let done = run_task_item(StreamItem::Terminal(Ok(OperationPayload::TasksCompleted)))
            .unwrap()
            .unwrap();
        assert!(matches!(
            done.kind,
            Some(pb::run_task_reply::Kind::RunTaskResult(r)) if r.message == TASK_COMPLETED
        ));

        let err = run_task_item(StreamItem::Terminal(Err(OperationError::cancelled())))
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
    }

    #[test]
    fn test_daemon_status_mapping() {
        let message = daemon(DaemonInfo {
            pid: "4242".into(),
            status: DaemonStatus::Busy,
            info: "8.5".into(),
        });
        assert_eq!(message.status, pb::DaemonStatus::Busy as i32);
        assert_eq!(message.pid, "4242");
    }
}
