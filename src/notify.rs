//! Notification dispatch: fan run events out to pluggable sinks.
//!
//! Sinks are best-effort — a failing webhook or command logs a warning and
//! never disturbs the loop.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::NotificationsConfig;
use crate::timing::format_duration;

/// An event worth telling the outside world about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifyEvent {
    PhaseStarted {
        phase: String,
        story: Option<String>,
    },
    PhaseFinished {
        phase: String,
        story: Option<String>,
        duration_ms: i64,
        success: bool,
    },
    LoopPaused,
    LoopResumed,
    RunFinished {
        summary: String,
        success: bool,
    },
    Error {
        message: String,
    },
}

impl NotifyEvent {
    /// One-line human rendering.
    pub fn render(&self) -> String {
        match self {
            NotifyEvent::PhaseStarted { phase, story } => match story {
                Some(story) => format!("Phase {phase} started for story {story}"),
                None => format!("Phase {phase} started"),
            },
            NotifyEvent::PhaseFinished {
                phase,
                story,
                duration_ms,
                success,
            } => {
                let outcome = if *success { "finished" } else { "FAILED" };
                let duration = format_duration(*duration_ms);
                match story {
                    Some(story) => format!("Phase {phase} {outcome} for story {story} in {duration}"),
                    None => format!("Phase {phase} {outcome} in {duration}"),
                }
            }
            NotifyEvent::LoopPaused => "Loop paused".to_string(),
            NotifyEvent::LoopResumed => "Loop resumed".to_string(),
            NotifyEvent::RunFinished { summary, .. } => summary.clone(),
            NotifyEvent::Error { message } => format!("Error: {message}"),
        }
    }
}

/// A notification destination.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, event: &NotifyEvent) -> anyhow::Result<()>;
}

/// Sink that writes to the tracing log. Always registered.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, event: &NotifyEvent) -> anyhow::Result<()> {
        info!(target: "notify", "{}", event.render());
        Ok(())
    }
}

/// Sink that POSTs the event as JSON to a webhook.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, event: &NotifyEvent) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Sink that runs a shell command with the rendered event as argument.
pub struct CommandSink {
    command: String,
}

impl CommandSink {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[async_trait]
impl NotificationSink for CommandSink {
    fn name(&self) -> &str {
        "command"
    }

    async fn send(&self, event: &NotifyEvent) -> anyhow::Result<()> {
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("BMAD_NOTIFY_EVENT", event.render())
            .env(
                "BMAD_NOTIFY_JSON",
                serde_json::to_string(event).unwrap_or_default(),
            )
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("notification command exited with {status}");
        }
        Ok(())
    }
}

/// Fans events to all configured sinks, swallowing individual failures.
pub struct Notifier {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl Notifier {
    /// Build from config: log sink always, webhook/command when configured.
    pub fn from_config(config: &NotificationsConfig) -> Self {
        let mut sinks: Vec<Box<dyn NotificationSink>> = vec![Box::new(LogSink)];
        if let Some(url) = &config.webhook_url {
            sinks.push(Box::new(WebhookSink::new(url.clone())));
        }
        if let Some(command) = &config.command {
            sinks.push(Box::new(CommandSink::new(command.clone())));
        }
        Self { sinks }
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Dispatch to every sink; failures are warnings only.
    pub async fn dispatch(&self, event: &NotifyEvent) {
        for sink in &self.sinks {
            if let Err(e) = sink.send(event).await {
                warn!("Notification sink '{}' failed: {e}", sink.name());
            }
        }
    }
}
