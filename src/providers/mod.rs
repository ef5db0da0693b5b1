//! Uniform contract for launching one LLM CLI subprocess and streaming its
//! JSON line output.
//!
//! Concrete providers differ only in how the prompt is delivered (argv vs
//! stdin), the JSON line schema produced, and how the session ID is
//! extracted from the first init line. Everything else — spawning, line
//! pumping, truncation, timeout kill — is shared.

pub mod stream;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ProviderSettings;
use crate::debug_log::{DebugJsonLogger, MAX_LINE_SIZE};
use crate::errors::ProviderError;
use crate::util::truncate_str;

/// Which external CLI backs a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Claude,
    Codex,
    Gemini,
}

/// How the prompt reaches the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptDelivery {
    Stdin,
    Argv,
}

impl ProviderKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "claude" => Some(ProviderKind::Claude),
            "codex" => Some(ProviderKind::Codex),
            "gemini" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }

    pub fn default_command(&self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Codex => "codex",
            ProviderKind::Gemini => "gemini",
        }
    }

    fn delivery(&self) -> PromptDelivery {
        match self {
            // Codex takes the prompt as the final exec argument.
            ProviderKind::Codex => PromptDelivery::Argv,
            _ => PromptDelivery::Stdin,
        }
    }

    fn base_args(&self, model: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = match self {
            ProviderKind::Claude => vec![
                "--print".into(),
                "--output-format".into(),
                "stream-json".into(),
                "--verbose".into(),
                "--dangerously-skip-permissions".into(),
            ],
            ProviderKind::Codex => vec!["exec".into(), "--json".into()],
            ProviderKind::Gemini => vec!["--output-format".into(), "stream-json".into()],
        };
        if let Some(model) = model {
            args.push("--model".into());
            args.push(model.to_string());
        }
        args
    }
}

/// Outcome of one provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub session_id: Option<String>,
}

/// Invocation knobs beyond the provider settings themselves.
pub struct InvokeOptions {
    /// Working directory for the subprocess.
    pub cwd: Option<PathBuf>,
    /// Called with every raw stdout line (after truncation), in arrival
    /// order. Used to fan lines out to the dashboard bus.
    pub on_line: Option<Box<dyn FnMut(&str) + Send>>,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            on_line: None,
        }
    }
}

/// Truncate a stream line to [`MAX_LINE_SIZE`], appending a marker. Line
/// boundaries are preserved: truncation never merges or splits lines.
fn truncate_line(line: &str) -> String {
    if line.len() <= MAX_LINE_SIZE {
        return line.to_string();
    }
    let marker = format!(" [TRUNCATED: {} bytes]", line.len());
    let mut cut = MAX_LINE_SIZE - marker.len();
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{marker}", &line[..cut])
}

/// Launch the provider subprocess, stream its stdout until EOF, and return
/// the collected result.
///
/// Every stdout line is appended to `debug` (which names its file from the
/// first init line). A timeout SIGKILLs the subprocess and returns
/// [`ProviderError::Timeout`] carrying the partial output; a non-zero exit
/// returns [`ProviderError::ExitCode`] with a stderr preview.
pub async fn invoke(
    settings: &ProviderSettings,
    prompt: &str,
    debug_logger: &mut DebugJsonLogger,
    mut opts: InvokeOptions,
) -> Result<ProviderResult, ProviderError> {
    let kind = ProviderKind::from_name(&settings.provider).ok_or_else(|| {
        ProviderError::SpawnFailed {
            command: settings.provider.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown provider kind '{}'", settings.provider),
            ),
        }
    })?;

    let command_name = settings
        .command
        .clone()
        .unwrap_or_else(|| kind.default_command().to_string());

    let mut args = kind.base_args(settings.model.as_deref());
    if kind.delivery() == PromptDelivery::Argv {
        args.push(prompt.to_string());
    }

    let mut cmd = Command::new(&command_name);
    cmd.args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }

    debug!(provider = %settings.provider, command = %command_name, "Spawning provider");

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| ProviderError::SpawnFailed {
        command: command_name.clone(),
        source: e,
    })?;

    // Deliver the prompt over stdin and close it so the CLI sees EOF.
    if kind.delivery() == PromptDelivery::Stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(ProviderError::Stream)?;
            stdin.shutdown().await.map_err(ProviderError::Stream)?;
        }
    } else {
        drop(child.stdin.take());
    }

    // Pump stderr concurrently so a chatty provider cannot deadlock on a
    // full pipe while we read stdout.
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut collected = String::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
        }
        collected
    });

    let stdout = child.stdout.take().ok_or_else(|| {
        ProviderError::Stream(std::io::Error::other("provider stdout not captured"))
    })?;
    let mut lines = BufReader::new(stdout).lines();

    let timeout = std::time::Duration::from_secs(settings.timeout_secs);
    let mut collected_stdout = String::new();
    let mut session_id: Option<String> = None;

    // Read stdout to EOF, then reap the child — all under one deadline.
    let pump = async {
        while let Some(line) = lines.next_line().await.map_err(ProviderError::Stream)? {
            if line.is_empty() {
                continue;
            }
            let line = truncate_line(&line);
            if session_id.is_none() {
                session_id = stream::extract_session_id(&line);
            }
            debug_logger.append(&line);
            if let Some(on_line) = opts.on_line.as_mut() {
                on_line(&line);
            }
            collected_stdout.push_str(&line);
            collected_stdout.push('\n');
        }
        child.wait().await.map_err(ProviderError::Stream)
    };

    let status = match tokio::time::timeout(timeout, pump).await {
        Ok(result) => result?,
        Err(_) => {
            // Deadline passed: SIGKILL and surface what we captured so far.
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill timed-out provider: {e}");
            }
            let _ = child.wait().await;
            debug_logger.close();
            return Err(ProviderError::Timeout {
                provider: settings.provider.clone(),
                timeout_secs: settings.timeout_secs,
                partial_output: collected_stdout,
            });
        }
    };

    debug_logger.close();
    let stderr_output = stderr_task.await.unwrap_or_default();
    let exit_code = status.code().unwrap_or(-1);
    let duration_ms = start.elapsed().as_millis() as u64;

    debug!(
        provider = %settings.provider,
        exit_code,
        duration_ms,
        session = session_id.as_deref().unwrap_or("-"),
        "Provider finished"
    );

    if exit_code != 0 {
        return Err(ProviderError::ExitCode {
            provider: settings.provider.clone(),
            exit_code,
            stderr_preview: truncate_str(stderr_output.trim(), 500),
        });
    }

    Ok(ProviderResult {
        stdout: collected_stdout,
        stderr: stderr_output,
        exit_code,
        duration_ms,
        session_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::local_now;
    use tempfile::tempdir;

    /// Fake a provider with an executable shell script: the "claude" kind
    /// delivers the prompt over stdin, which the scripts drain.
    #[cfg(unix)]
    fn script_settings(script: &std::path::Path, timeout_secs: u64) -> ProviderSettings {
        ProviderSettings {
            provider: "claude".into(),
            model: None,
            command: Some(script.to_string_lossy().into_owned()),
            timeout_secs,
        }
    }

    #[test]
    fn test_provider_kind_lookup() {
        assert_eq!(ProviderKind::from_name("claude"), Some(ProviderKind::Claude));
        assert_eq!(ProviderKind::from_name("codex"), Some(ProviderKind::Codex));
        assert_eq!(ProviderKind::from_name("gemini"), Some(ProviderKind::Gemini));
        assert_eq!(ProviderKind::from_name("gpt"), None);
    }

    #[test]
    fn test_prompt_delivery_per_kind() {
        assert_eq!(ProviderKind::Claude.delivery(), PromptDelivery::Stdin);
        assert_eq!(ProviderKind::Codex.delivery(), PromptDelivery::Argv);
        assert_eq!(ProviderKind::Gemini.delivery(), PromptDelivery::Stdin);
    }

    #[test]
    fn test_base_args_include_model() {
        let args = ProviderKind::Claude.base_args(Some("opus"));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"opus".to_string()));

        let codex = ProviderKind::Codex.base_args(None);
        assert_eq!(codex, vec!["exec".to_string(), "--json".to_string()]);
    }

    #[test]
    fn test_truncate_line_preserves_short_lines() {
        assert_eq!(truncate_line("short"), "short");
        let long = "y".repeat(MAX_LINE_SIZE + 100);
        let truncated = truncate_line(&long);
        assert_eq!(truncated.len(), MAX_LINE_SIZE);
        assert!(truncated.contains("[TRUNCATED:"));
    }

    #[test]
    fn test_unknown_provider_kind_fails_spawn() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let settings = ProviderSettings {
            provider: "mystery".into(),
            model: None,
            command: None,
            timeout_secs: 5,
        };
        let mut logger = DebugJsonLogger::disabled();
        let result = rt.block_on(invoke(&settings, "hi", &mut logger, InvokeOptions::default()));
        assert!(matches!(result, Err(ProviderError::SpawnFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_captures_stream_and_session() {
        let dir = tempdir().unwrap();
        // Fake provider: ignore stdin, emit an init line and a result line.
        let script = dir.path().join("fake.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\n\
             echo '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"fake-1\"}'\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"done\"}'\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let settings = script_settings(&script, 30);

        let mut logger = DebugJsonLogger::new(dir.path().join("debug"), true, local_now());
        let result = invoke(&settings, "prompt", &mut logger, InvokeOptions::default())
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.session_id.as_deref(), Some("fake-1"));
        assert!(result.stdout.contains("\"result\":\"done\""));
        assert!(logger.path().unwrap().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_nonzero_exit_yields_exit_code_error() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("fail.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho 'boom' >&2\nexit 3\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let settings = script_settings(&script, 30);
        let mut logger = DebugJsonLogger::disabled();
        let err = invoke(&settings, "prompt", &mut logger, InvokeOptions::default())
            .await
            .unwrap_err();
        match err {
            ProviderError::ExitCode {
                exit_code,
                stderr_preview,
                ..
            } => {
                assert_eq!(exit_code, 3);
                assert!(stderr_preview.contains("boom"));
            }
            other => panic!("Expected ExitCode error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_timeout_kills_and_returns_partial() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("slow.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho '{\"type\":\"init\",\"session_id\":\"slow\"}'\nsleep 60\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let settings = script_settings(&script, 1);
        let mut logger = DebugJsonLogger::disabled();
        let start = Instant::now();
        let err = invoke(&settings, "prompt", &mut logger, InvokeOptions::default())
            .await
            .unwrap_err();
        assert!(start.elapsed().as_secs() < 30, "kill must not wait for sleep");
        match err {
            ProviderError::Timeout { partial_output, .. } => {
                assert!(partial_output.contains("slow"));
            }
            other => panic!("Expected Timeout error, got {other:?}"),
        }
    }
}
