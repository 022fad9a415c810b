//! Parsers for Gradle command-line output.
//!
//! All functions here are pure; the CLI engine captures process output and
//! hands the text over. ANSI styling is stripped first, so a rich console
//! parses the same as a plain one.

use std::collections::BTreeMap;

use super::{DaemonInfo, DaemonStatus, GradleProject, GradleTask, ProgressEvent};

/// `text` with ANSI escape sequences removed.
pub fn plain_text(text: &str) -> String {
    String::from_utf8_lossy(&strip_ansi_escapes::strip(text)).into_owned()
}

/// Extract the Gradle version from `gradle --version` output.
pub fn parse_gradle_version(output: &str) -> Option<String> {
    plain_text(output).lines().find_map(|line| {
        line.trim()
            .strip_prefix("Gradle ")
            .map(|v| v.trim().to_string())
            .filter(|v| v.chars().next().is_some_and(|c| c.is_ascii_digit()))
    })
}

/// Extract the `JVM:` line from `gradle --version` output.
pub fn parse_jvm_line(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("JVM:").map(|v| v.trim().to_string()))
}

/// Turn a console line into a progress event when it announces build progress.
pub fn progress_from_line(line: &str) -> Option<ProgressEvent> {
    let line = plain_text(line);
    let rest = line.trim_end().strip_prefix("> ")?;
    let is_progress = ["Task ", "Configure project", "Transform ", "Resolve "]
        .iter()
        .any(|prefix| rest.starts_with(prefix));
    if !is_progress {
        return None;
    }
    let display_name = match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
        ["Task", path, ..] => format!("Task {path}"),
        _ => rest.to_string(),
    };
    Some(ProgressEvent::now(display_name, rest))
}

fn root_project_name(line: &str) -> Option<String> {
    let start = line.find("root project '")? + "root project '".len();
    let end = line[start..].find('\'')? + start;
    Some(line[start..end].to_string())
}

fn is_underline(line: &str) -> bool {
    !line.is_empty() && line.chars().all(|c| c == '-')
}

/// Split `app:lib:compileJava` into (`:app:lib`, `compileJava`).
fn split_task_path(qualified: &str) -> (String, String) {
    let trimmed = qualified.trim_start_matches(':');
    match trimmed.rsplit_once(':') {
        Some((project, name)) => (format!(":{project}"), name.to_string()),
        None => (":".to_string(), trimmed.to_string()),
    }
}

fn task_path(project: &str, name: &str) -> String {
    if project == ":" {
        format!(":{name}")
    } else {
        format!("{project}:{name}")
    }
}

/// Parse `gradle tasks --all` output into a project tree.
///
/// `fallback_name` names the root project when the header is missing.
pub fn parse_task_report(output: &str, fallback_name: &str) -> GradleProject {
    let output = plain_text(output);
    let lines: Vec<&str> = output.lines().collect();
    let mut root_name = fallback_name.to_string();
    let mut tasks_by_project: BTreeMap<String, Vec<GradleTask>> = BTreeMap::new();
    let mut group: Option<String> = None;
    let mut in_rules = false;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim_end();
        let next = lines.get(i + 1).map(|l| l.trim_end()).unwrap_or("");

        if let Some(name) = root_project_name(line) {
            root_name = name;
            i += 1;
            continue;
        }
        if line.starts_with("To see ") || line.starts_with("BUILD ") {
            break;
        }
        if !line.is_empty() && !is_underline(line) && is_underline(next) {
            let heading = line.trim();
            in_rules = heading == "Rules";
            group = heading
                .strip_suffix(" tasks")
                .map(|g| g.to_lowercase())
                .filter(|g| g != "other");
            i += 2;
            continue;
        }
        if line.is_empty() || is_underline(line) || in_rules || line.starts_with(' ') {
            i += 1;
            continue;
        }

        let (qualified, description) = match line.split_once(" - ") {
            Some((name, desc)) => (name.trim(), Some(desc.trim().to_string())),
            None => (line.trim(), None),
        };
        if qualified.contains(char::is_whitespace) {
            i += 1;
            continue;
        }
        let (project, name) = split_task_path(qualified);
        tasks_by_project
            .entry(project.clone())
            .or_default()
            .push(GradleTask {
                path: task_path(&project, &name),
                name,
                group: group.clone(),
                description,
                project,
            });
        i += 1;
    }

    build_tree(root_name, tasks_by_project)
}

fn build_tree(root_name: String, mut tasks: BTreeMap<String, Vec<GradleTask>>) -> GradleProject {
    // every ancestor of a project with tasks must exist as a node
    let mut paths: Vec<String> = tasks.keys().cloned().collect();
    for path in tasks.keys() {
        let segments: Vec<&str> = path.trim_start_matches(':').split(':').collect();
        for depth in 1..segments.len() {
            paths.push(format!(":{}", segments[..depth].join(":")));
        }
    }
    paths.sort();
    paths.dedup();

    fn node(
        path: &str,
        name: String,
        paths: &[String],
        tasks: &mut BTreeMap<String, Vec<GradleTask>>,
    ) -> GradleProject {
        let prefix = if path == ":" {
            ":".to_string()
        } else {
            format!("{path}:")
        };
        let children = paths
            .iter()
            .filter(|p| p.as_str() != ":" && p.starts_with(&prefix))
            .filter(|p| !p[prefix.len()..].contains(':'))
            .map(|child| {
                let child_name = child.rsplit(':').next().unwrap_or(child).to_string();
                node(child, child_name, paths, tasks)
            })
            .collect();
        GradleProject {
            name,
            path: path.to_string(),
            description: None,
            build_file: None,
            tasks: tasks.remove(path).unwrap_or_default(),
            children,
        }
    }

    node(":", root_name, &paths, &mut tasks)
}

fn parse_daemon_status(value: &str) -> Option<DaemonStatus> {
    match value.to_ascii_uppercase().as_str() {
        "IDLE" => Some(DaemonStatus::Idle),
        "BUSY" => Some(DaemonStatus::Busy),
        "STOPPED" => Some(DaemonStatus::Stopped),
        "STOPPING" => Some(DaemonStatus::Stopping),
        "CANCELED" | "CANCELLED" => Some(DaemonStatus::Canceled),
        _ => None,
    }
}

/// Parse `gradle --status` output.
pub fn parse_daemon_status_report(output: &str) -> Vec<DaemonInfo> {
    plain_text(output)
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?;
            if !pid.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let status = parse_daemon_status(parts.next()?)?;
            Some(DaemonInfo {
                pid: pid.to_string(),
                status,
                info: parts.collect::<Vec<_>>().join(" "),
            })
        })
        .collect()
}
