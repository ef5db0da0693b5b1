//! Typed error hierarchy for the bmad-assist execution kernel.
//!
//! Each subsystem gets its own enum:
//! - `ConfigError` — config loading, merging, and schema validation
//! - `ProviderError` — LLM subprocess launch, timeout, and exit failures
//! - `CompilerError` — workflow compilation, variables, context discovery
//! - `PatchError` — patch application and template-cache failures
//! - `SprintError` — sprint-status parsing and reconciliation
//! - `QaError` — QA plan parsing and execution
//! - `DashboardError` — HTTP-facing failures (mapped to 4xx, never fatal)
//! - `LoopError` — loop-runner level failures (lock, phase dispatch)

use std::path::PathBuf;
use thiserror::Error;

/// A single field-level validation failure, locatable in the config tree.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldError {
    /// Dotted path into the config (e.g. "providers.master.timeout").
    pub loc: String,
    /// Human-readable message.
    pub msg: String,
    /// Machine-matchable kind (e.g. "type_error", "missing", "out_of_range").
    pub kind: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.loc, self.msg, self.kind)
    }
}

/// Errors from config loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration found. Run 'bmad-assist init' to create bmad-assist.yaml")]
    NotFound,

    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Config validation failed with {} error(s)", errors.len())]
    Validation { errors: Vec<FieldError> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConfigError {
    /// Structured validation errors, empty for non-validation variants.
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ConfigError::Validation { errors } => errors,
            _ => &[],
        }
    }
}

/// Classification of a provider exit for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    NonRetriableError,
    RetriableError,
    Timeout,
}

impl ExitStatus {
    /// Map a raw process exit code to a status class.
    ///
    /// Exit code 1 is treated as retriable (transient CLI failures surface
    /// there); anything else non-zero is non-retriable.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => ExitStatus::Success,
            1 => ExitStatus::RetriableError,
            _ => ExitStatus::NonRetriableError,
        }
    }
}

/// Errors from provider subprocess invocation.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to spawn provider process '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Provider '{provider}' exited with code {exit_code}: {stderr_preview}")]
    ExitCode {
        provider: String,
        exit_code: i32,
        stderr_preview: String,
    },

    #[error("Provider '{provider}' timed out after {timeout_secs}s")]
    Timeout {
        provider: String,
        timeout_secs: u64,
        /// Stdout captured before the kill.
        partial_output: String,
    },

    #[error("Provider stream I/O error: {0}")]
    Stream(#[source] std::io::Error),
}

impl ProviderError {
    /// Status class for this failure.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            ProviderError::Timeout { .. } => ExitStatus::Timeout,
            ProviderError::ExitCode { exit_code, .. } => ExitStatus::from_exit_code(*exit_code),
            _ => ExitStatus::NonRetriableError,
        }
    }
}

/// Errors from workflow compilation.
#[derive(Debug, Error)]
pub enum CompilerError {
    #[error(
        "Workflow name cannot be empty\n  How to fix: provide a valid workflow name (e.g. 'create-story')"
    )]
    EmptyWorkflowName,

    #[error(
        "Invalid workflow name: '{0}'\n  How to fix: use lowercase letters, digits, hyphens, underscores only"
    )]
    InvalidWorkflowName(String),

    #[error("Workflow not found: '{0}'\n  Suggestion: check the workflow name against the registry")]
    UnknownWorkflow(String),

    #[error("Failed to read workflow file at {path}: {source}")]
    WorkflowReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workflow parse error: {0}")]
    Parser(String),

    #[error("Variable resolution failed for '{variable}': {message}")]
    Variable { variable: String, message: String },

    #[error("Ambiguous file match for pattern '{pattern}': {candidates:?}")]
    AmbiguousFile {
        pattern: String,
        candidates: Vec<PathBuf>,
    },

    #[error("Prompt exceeds hard token limit: {estimated} > {hard_limit}")]
    TokenBudgetExceeded { estimated: usize, hard_limit: usize },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from patch compilation. These degrade to the uncached workflow
/// and are logged as warnings, never fatal.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Failed to read patch file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid patch file at {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("Patcher LLM produced no <transformed-document> block")]
    MissingTransformedDocument,

    #[error("Transformed document is not well-formed XML: {0}")]
    MalformedOutput(String),

    #[error("Patch validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<String> },

    #[error("Transform success rate below threshold: {succeeded}/{total}")]
    ThresholdNotMet { succeeded: usize, total: usize },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from sprint-status parsing and reconciliation.
#[derive(Debug, Error)]
pub enum SprintError {
    #[error("Failed to read sprint-status at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse sprint-status at {path}: {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Failed to write sprint-status at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Reconciliation cancelled by operator")]
    Cancelled,
}

/// Errors from QA plan parsing and execution.
#[derive(Debug, Error)]
pub enum QaError {
    #[error("Test plan not found at {path}. Run 'bmad-assist qa generate --epic {epic}' first")]
    PlanNotFound { path: PathBuf, epic: String },

    #[error("Test plan is empty: {path}")]
    PlanEmpty { path: PathBuf },

    #[error("No prior run found for epic {epic} to retry from")]
    NoRunToRetry { epic: String },

    #[error("Failed to save QA results at {path}: {source}")]
    SaveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced over HTTP by the dashboard. Mapped to 4xx responses;
/// these never crash the loop.
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("Port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("Path is outside the project root: {0}")]
    PathOutsideProject(PathBuf),

    #[error("Symlinks are not served: {0}")]
    SymlinkRejected(PathBuf),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Import payload too large: {size} bytes (limit {limit})")]
    ImportTooLarge { size: usize, limit: usize },

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

/// Errors from the loop runner itself.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("Another bmad-assist process holds the state lock at {path}")]
    StateLocked { path: PathBuf },

    #[error("Phase {phase} failed for story {story}: {reason}")]
    PhaseFailed {
        phase: String,
        story: String,
        reason: String,
    },

    #[error(
        "Fewer than {required} evaluators succeeded ({succeeded} of {launched}); cannot synthesize"
    )]
    InsufficientReviews {
        required: usize,
        succeeded: usize,
        launched: usize,
    },

    #[error(transparent)]
    State(#[from] anyhow::Error),
}
