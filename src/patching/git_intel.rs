//! Git intelligence: run configured git commands at compile time and embed
//! the output in the template, so the provider LLM never re-runs git
//! archaeology at runtime.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use super::GitIntelligence;

/// Per-command timeout.
pub const GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Output cap per command (bytes).
pub const MAX_OUTPUT_LENGTH: usize = 2048;

/// True when `path` is itself the root of a git repository — not merely a
/// subdirectory of one.
pub async fn is_git_repo(path: &Path) -> bool {
    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();
    let output = match tokio::time::timeout(GIT_COMMAND_TIMEOUT, output).await {
        Ok(Ok(output)) => output,
        _ => return false,
    };
    if !output.status.success() {
        return false;
    }
    let git_root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let git_root = Path::new(&git_root)
        .canonicalize()
        .unwrap_or_else(|_| git_root.clone().into());
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    git_root == target
}

fn substitute_variables(command: &str, variables: &[(&str, String)]) -> String {
    let mut out = command.to_string();
    for (name, value) in variables {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
        out = out.replace(&format!("{{{{ {name} }}}}"), value);
    }
    out
}

/// Run one git command (through the shell, so pipes work) with the timeout
/// and the output cap. Failures come back as parenthesized messages rather
/// than errors — a broken command must not fail compilation.
pub async fn run_git_command(
    command: &str,
    cwd: &Path,
    variables: &[(&str, String)],
) -> String {
    let command = substitute_variables(command, variables);
    debug!("Running git command: {command} (cwd={})", cwd.display());

    let output = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = match tokio::time::timeout(GIT_COMMAND_TIMEOUT, output).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("Git command failed: {command} - {e}");
            return format!("(command error: {e})");
        }
        Err(_) => {
            warn!("Git command timed out: {command}");
            return "(command timed out)".to_string();
        }
    };

    let mut stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.len() > MAX_OUTPUT_LENGTH {
        let mut cut = MAX_OUTPUT_LENGTH;
        while !stdout.is_char_boundary(cut) {
            cut -= 1;
        }
        stdout.truncate(cut);
        stdout.push_str("\n... (truncated)");
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            return format!("(command failed: {stderr})");
        }
    }

    if stdout.is_empty() {
        "(no output)".to_string()
    } else {
        stdout
    }
}

/// Run all configured commands and format the results inside the marker tag,
/// prefixed with a do-not-rerun warning. Non-repos get a stub instead.
pub async fn extract_git_intelligence(
    config: &GitIntelligence,
    project_root: &Path,
    variables: &[(&str, String)],
) -> String {
    if !config.enabled {
        return String::new();
    }

    let marker = &config.embed_marker;
    let mut parts = vec![format!("<{marker}>")];

    if !is_git_repo(project_root).await {
        debug!("Project is not a git repository root: {}", project_root.display());
        parts.push(config.no_git_message.clone());
        parts.push(format!("</{marker}>"));
        return parts.join("\n");
    }

    parts.push(
        "Git intelligence extracted at compile time. \
         Do NOT run additional git commands - use this embedded data instead."
            .to_string(),
    );
    parts.push(String::new());

    for cmd in &config.commands {
        let output = run_git_command(&cmd.command, project_root, variables).await;
        parts.push(format!("### {}", cmd.name));
        parts.push("```".to_string());
        parts.push(output);
        parts.push("```".to_string());
        parts.push(String::new());
    }

    parts.push(format!("</{marker}>"));
    parts.join("\n")
}
