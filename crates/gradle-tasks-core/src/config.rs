//! Build configuration resolution.
//!
//! Turns the loosely-typed configuration carried by a request into an
//! immutable [`BuildConfig`]. Resolution is pure: it never touches the
//! filesystem, so whether the project directory actually exists is left to
//! the engine at connect time.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration exactly as received from a client.
///
/// Empty strings are treated as "not set", matching protobuf3 defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBuildConfig {
    pub project_dir: String,
    pub user_home: String,
    pub wrapper_enabled: bool,
    pub version: String,
    pub installation: String,
    pub jvm_arguments: String,
    pub java_home: String,
    pub color_output: bool,
}

impl RawBuildConfig {
    /// Wrapper-based configuration for `project_dir` with everything else unset.
    pub fn wrapper(project_dir: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            wrapper_enabled: true,
            ..Self::default()
        }
    }
}

/// How the engine chooses which Gradle distribution to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    /// Version pinned by the project's `gradlew`.
    UseWrapper,
    /// An explicit Gradle version, e.g. `"6.3"`.
    UseVersion(String),
    /// A local Gradle installation directory.
    UseInstallation(PathBuf),
}

impl std::fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionPolicy::UseWrapper => write!(f, "wrapper"),
            VersionPolicy::UseVersion(v) => write!(f, "version {v}"),
            VersionPolicy::UseInstallation(p) => write!(f, "installation {}", p.display()),
        }
    }
}

/// Validated, immutable build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub project_dir: PathBuf,
    pub user_home: Option<PathBuf>,
    pub version_policy: VersionPolicy,
    /// Opaque, ordered tokens forwarded to the engine untouched.
    pub jvm_arguments: Vec<String>,
    pub java_home: Option<PathBuf>,
    pub color_output: bool,
}

/// Reasons a [`RawBuildConfig`] is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Gradle version is required")]
    MissingVersion,

    #[error("project directory is required")]
    MissingProjectDir,

    #[error("request id {0} is already in use")]
    DuplicateRequestId(String),

    #[error("at least one task name is required")]
    MissingTask,

    #[error("invalid daemon PID: {0}")]
    InvalidPid(String),

    #[error("invalid debug port: {0}")]
    InvalidDebugPort(i32),
}

/// Trimmed value, or `None` when blank.
fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Port a debugger listens on when a task runs with `java_debug` set.
///
/// `None` when debugging is off; the port is ignored in that case.
pub fn resolve_debug_port(java_debug: bool, port: i32) -> Result<Option<u16>, ValidationError> {
    if !java_debug {
        return Ok(None);
    }
    match u16::try_from(port) {
        Ok(port) if port != 0 => Ok(Some(port)),
        _ => Err(ValidationError::InvalidDebugPort(port)),
    }
}

/// Validate and normalize a raw configuration.
///
/// With the wrapper disabled an explicit version wins over an installation
/// path; when neither is given the request fails with
/// [`ValidationError::MissingVersion`] rather than falling back to a default.
pub fn resolve(raw: &RawBuildConfig) -> Result<BuildConfig, ValidationError> {
    let project_dir = non_empty(&raw.project_dir)
        .map(PathBuf::from)
        .ok_or(ValidationError::MissingProjectDir)?;

    let version_policy = if raw.wrapper_enabled {
        VersionPolicy::UseWrapper
    } else if let Some(version) = non_empty(&raw.version) {
        VersionPolicy::UseVersion(version.to_string())
    } else if let Some(installation) = non_empty(&raw.installation) {
        VersionPolicy::UseInstallation(PathBuf::from(installation))
    } else {
        return Err(ValidationError::MissingVersion);
    };

    // kept byte for byte, surrounding whitespace included
    let jvm_arguments = if raw.jvm_arguments.trim().is_empty() {
        Vec::new()
    } else {
        vec![raw.jvm_arguments.clone()]
    };

    Ok(BuildConfig {
        project_dir,
        user_home: non_empty(&raw.user_home).map(PathBuf::from),
        version_policy,
        jvm_arguments,
        java_home: non_empty(&raw.java_home).map(PathBuf::from),
        color_output: raw.color_output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wrapper_enabled_resolves() {
        let config = resolve(&RawBuildConfig::wrapper("/tmp/p")).unwrap();
        assert_eq!(config.project_dir, PathBuf::from("/tmp/p"));
        assert_eq!(config.version_policy, VersionPolicy::UseWrapper);
        assert!(config.user_home.is_none());
        assert!(config.jvm_arguments.is_empty());
    }

    #[test]
    fn test_missing_version_message_is_stable() {
        let raw = RawBuildConfig {
            project_dir: "/tmp/p".into(),
            ..RawBuildConfig::default()
        };
        let err = resolve(&raw).unwrap_err();
        assert_eq!(err, ValidationError::MissingVersion);
        assert_eq!(err.to_string(), "Gradle version is required");
    }

    #[test]
    fn test_explicit_version_selected() {
        let raw = RawBuildConfig {
            project_dir: "/tmp/p".into(),
            version: "6.3".into(),
            ..RawBuildConfig::default()
        };
        let config = resolve(&raw).unwrap();
        assert_eq!(config.version_policy, VersionPolicy::UseVersion("6.3".into()));
    }

    #[test]
    fn test_installation_selected_when_no_version() {
        let raw = RawBuildConfig {
            project_dir: "/tmp/p".into(),
            installation: "/opt/gradle-8.5".into(),
            ..RawBuildConfig::default()
        };
        let config = resolve(&raw).unwrap();
        assert_eq!(
            config.version_policy,
            VersionPolicy::UseInstallation(PathBuf::from("/opt/gradle-8.5"))
        );
    }

    #[test]
    fn test_version_wins_over_installation() {
        let raw = RawBuildConfig {
            project_dir: "/tmp/p".into(),
            version: "7.6".into(),
            installation: "/opt/gradle-8.5".into(),
            ..RawBuildConfig::default()
        };
        let config = resolve(&raw).unwrap();
        assert_eq!(config.version_policy, VersionPolicy::UseVersion("7.6".into()));
    }

    #[test]
    fn test_empty_project_dir_rejected() {
        let err = resolve(&RawBuildConfig::wrapper("  ")).unwrap_err();
        assert_eq!(err, ValidationError::MissingProjectDir);
    }

    #[test]
    fn test_jvm_arguments_kept_as_single_token() {
        let raw = RawBuildConfig {
            jvm_arguments: "-Xmx64m -Xms64m".into(),
            ..RawBuildConfig::wrapper("/tmp/p")
        };
        let config = resolve(&raw).unwrap();
        assert_eq!(config.jvm_arguments, vec!["-Xmx64m -Xms64m".to_string()]);
    }

    #[test]
    fn test_optional_paths() {
        let raw = RawBuildConfig {
            user_home: "/home/me/.gradle".into(),
            java_home: "/usr/lib/jvm/17".into(),
            color_output: true,
            ..RawBuildConfig::wrapper("/tmp/p")
        };
        let config = resolve(&raw).unwrap();
        assert_eq!(config.user_home, Some(PathBuf::from("/home/me/.gradle")));
        assert_eq!(config.java_home, Some(PathBuf::from("/usr/lib/jvm/17")));
        assert!(config.color_output);
    }

    #[test]
    fn test_paths_are_trimmed_but_jvm_arguments_are_not() {
        let raw = RawBuildConfig {
            project_dir: " /tmp/p\n".into(),
            user_home: "\t/home/me/.gradle ".into(),
            wrapper_enabled: false,
            installation: " /opt/gradle-8.5 ".into(),
            java_home: " /usr/lib/jvm/17".into(),
            jvm_arguments: " -Xmx64m ".into(),
            ..RawBuildConfig::default()
        };
        let config = resolve(&raw).unwrap();
        assert_eq!(config.project_dir, PathBuf::from("/tmp/p"));
        assert_eq!(config.user_home, Some(PathBuf::from("/home/me/.gradle")));
        assert_eq!(
            config.version_policy,
            VersionPolicy::UseInstallation(PathBuf::from("/opt/gradle-8.5"))
        );
        assert_eq!(config.java_home, Some(PathBuf::from("/usr/lib/jvm/17")));
        assert_eq!(config.jvm_arguments, vec![" -Xmx64m ".to_string()]);
    }

    #[test]
    fn test_debug_port() {
        assert_eq!(resolve_debug_port(false, 0), Ok(None));
        assert_eq!(resolve_debug_port(false, -3), Ok(None));
        assert_eq!(resolve_debug_port(true, 5005), Ok(Some(5005)));
        assert_eq!(
            resolve_debug_port(true, 0),
            Err(ValidationError::InvalidDebugPort(0))
        );
        assert_eq!(
            resolve_debug_port(true, 70000),
            Err(ValidationError::InvalidDebugPort(70000))
        );
    }

    proptest! {
        #[test]
        fn prop_wrapper_disabled_without_version_always_fails(
            dir in "/[a-z]{1,12}",
            home in "[a-z/]{0,12}",
            jvm in "[ -~]{0,24}",
        ) {
            let raw = RawBuildConfig {
                project_dir: dir,
                user_home: home,
                jvm_arguments: jvm,
                wrapper_enabled: false,
                ..RawBuildConfig::default()
            };
            prop_assert_eq!(resolve(&raw), Err(ValidationError::MissingVersion));
        }

        #[test]
        fn prop_wrapper_enabled_keeps_project_dir(
            dir in "/[a-z]{1,12}(/[a-z]{1,8}){0,3}",
            home in proptest::option::of("/[a-z]{1,12}"),
        ) {
            let raw = RawBuildConfig {
                project_dir: dir.clone(),
                user_home: home.clone().unwrap_or_default(),
                ..RawBuildConfig::wrapper("")
            };
            let config = resolve(&raw).unwrap();
            prop_assert_eq!(config.project_dir, PathBuf::from(dir));
            prop_assert_eq!(config.user_home, home.map(PathBuf::from));
            prop_assert_eq!(config.version_policy, VersionPolicy::UseWrapper);
        }

        #[test]
        fn prop_jvm_arguments_forwarded_verbatim(jvm in "-[A-Za-z0-9=: -]{1,40}") {
            let raw = RawBuildConfig {
                jvm_arguments: jvm.clone(),
                ..RawBuildConfig::wrapper("/tmp/p")
            };
            let config = resolve(&raw).unwrap();
            prop_assert_eq!(config.jvm_arguments, vec![jvm]);
        }

        #[test]
        fn prop_resolution_is_deterministic(
            dir in "/[a-z]{1,12}",
            wrapper in any::<bool>(),
            version in "[0-9]{0,1}(\\.[0-9]){0,2}",
        ) {
            let raw = RawBuildConfig {
                project_dir: dir,
                wrapper_enabled: wrapper,
                version,
                ..RawBuildConfig::default()
            };
            prop_assert_eq!(resolve(&raw), resolve(&raw));
        }
    }
}
