use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use bmad_assist::config::{LoadedConfig, load_config};
use bmad_assist::dashboard::events::DashboardEmitter;
use bmad_assist::errors::ConfigError;
use bmad_assist::paths::ProjectPaths;

/// Exit code for configuration errors.
const EXIT_CONFIG_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "bmad-assist")]
#[command(version, about = "Autonomous multi-LLM development orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the project directory.
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a bmad-assist project (idempotent)
    Init,
    /// Run the development loop over the epic backlog
    Run {
        /// Offer the interactive [n]/[i]/[q] prompt between phases
        #[arg(long)]
        debug_step: bool,
    },
    /// Show loop state and detected discrepancies
    Status,
    /// Start the dashboard web server
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = 9600)]
        port: u16,
        /// Fail if the port is busy instead of auto-discovering
        #[arg(long)]
        no_auto_port: bool,
        /// Open the dashboard in the default browser
        #[arg(long)]
        open: bool,
    },
    /// QA plan generation and execution
    Qa {
        #[command(subcommand)]
        command: QaCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum QaCommands {
    /// Generate an E2E test plan for an epic
    Generate {
        #[arg(short, long)]
        epic: String,
    },
    /// Execute an epic's test plan
    Execute {
        #[arg(short, long)]
        epic: String,
        /// Test classes to run: A or all
        #[arg(long, default_value = "A")]
        category: String,
        /// Force batch mode on/off (auto by threshold otherwise)
        #[arg(long)]
        batch: bool,
        #[arg(long, conflicts_with = "batch")]
        no_batch: bool,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Re-run failed/error tests from the latest run
        #[arg(long)]
        retry: bool,
        /// Pin the source run for --retry (run label)
        #[arg(long)]
        retry_run: Option<String>,
        /// Expand --retry selection to skipped tests
        #[arg(long)]
        include_skipped: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the merged configuration (dangerous fields redacted)
    Show,
    /// Validate configuration and report errors
    Validate,
}

/// Set up tracing: stderr always, plus a rolling file log under
/// `.bmad-assist/logs/` for long-running commands. The returned guard must
/// stay alive for the file writer to flush.
fn init_tracing(
    verbose: bool,
    logs_dir: Option<PathBuf>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter).with(stderr_layer);

    match logs_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "bmad-assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn load_project_config(project_root: &std::path::Path) -> Result<LoadedConfig> {
    match load_config(project_root) {
        Ok(loaded) => Ok(loaded),
        Err(e @ ConfigError::NotFound) => {
            eprintln!("{e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
        Err(e) => {
            eprintln!("{e}");
            for field_error in e.field_errors() {
                eprintln!("  - {field_error}");
            }
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Wrappers set BMAD_ORIGINAL_CWD when they re-exec from elsewhere.
    let project_root = match cli.project_dir.clone() {
        Some(dir) => dir
            .canonicalize()
            .context("Failed to resolve project directory")?,
        None => match bmad_assist::paths::original_cwd() {
            Some(cwd) => cwd,
            None => std::env::current_dir().context("Failed to get current directory")?,
        },
    };

    // Long-running commands also log to a file; one-shot commands stay on
    // stderr only.
    let logs_dir = match &cli.command {
        Commands::Run { .. } | Commands::Serve { .. } => {
            Some(ProjectPaths::new(&project_root).logs_dir())
        }
        _ => None,
    };
    let _log_guard = init_tracing(cli.verbose, logs_dir);

    match &cli.command {
        Commands::Init => {
            let result = bmad_assist::init::init_project(&project_root)?;
            if result.created {
                println!("Initialized bmad-assist project at {}", result.tool_dir.display());
            } else {
                println!("Project already initialized at {}", result.tool_dir.display());
            }
            for entry in result.gitignore_added {
                println!("Added '{entry}' to .gitignore");
            }
        }
        Commands::Run { debug_step } => {
            run_loop(&project_root, *debug_step).await?;
        }
        Commands::Status => {
            cmd_status(&project_root)?;
        }
        Commands::Serve {
            host,
            port,
            no_auto_port,
            open,
        } => {
            cmd_serve(&project_root, host, *port, *no_auto_port, *open).await?;
        }
        Commands::Qa { command } => {
            cmd_qa(&project_root, command).await?;
        }
        Commands::Config { command } => {
            cmd_config(&project_root, command)?;
        }
    }

    Ok(())
}

async fn run_loop(project_root: &std::path::Path, debug_step: bool) -> Result<()> {
    use bmad_assist::orchestrator::runner::{LoopRunner, RunOutcome, RunnerOptions};

    let loaded = load_project_config(project_root)?;
    let paths = ProjectPaths::new(project_root);
    let run_id = uuid::Uuid::new_v4().to_string();
    let emitter = DashboardEmitter::from_env(&run_id);

    let debugger = debug_step.then(|| {
        bmad_assist::orchestrator::interactive::InteractiveDebugger::new(
            bmad_assist::orchestrator::interactive::RawTty,
        )
    });

    let mut runner = LoopRunner::new(
        paths,
        loaded,
        emitter,
        RunnerOptions { debug_step },
        debugger,
    );

    match runner.run().await? {
        RunOutcome::Completed => {
            println!("All epics complete.");
            Ok(())
        }
        RunOutcome::Halted { phase, reason } => {
            eprintln!("Loop halted at phase {phase}: {reason}");
            eprintln!("State keeps pointing at the failed phase; a new run resumes there.");
            std::process::exit(1);
        }
        RunOutcome::Interrupted => {
            println!("Interrupted; state saved.");
            Ok(())
        }
        RunOutcome::Quit => {
            println!("Stopped by operator; state saved.");
            Ok(())
        }
    }
}

fn cmd_status(project_root: &std::path::Path) -> Result<()> {
    use bmad_assist::checker::detect_discrepancies;
    use bmad_assist::epics::load_epic_docs;
    use bmad_assist::state::StateStore;

    let loaded = load_project_config(project_root)?;
    let paths = ProjectPaths::new(project_root);
    let store = StateStore::new(paths.state_file());

    let Ok(state) = store.load() else {
        println!("No loop state yet. Run 'bmad-assist run' to start.");
        return Ok(());
    };

    println!(
        "Epic: {}  Story: {}  Phase: {}",
        state
            .current_epic
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".into()),
        state.current_story.as_deref().unwrap_or("-"),
        state
            .current_phase
            .map(|p| p.name().to_string())
            .unwrap_or_else(|| "-".into()),
    );
    println!(
        "Completed: {} stories, {} epics",
        state.completed_stories.len(),
        state.completed_epics.len()
    );

    let epics = load_epic_docs(&paths.epics_dir())?;
    let master = loaded.config.providers.master.display_model();
    let discrepancies = detect_discrepancies(&state, &epics, &paths, &master);
    if discrepancies.is_empty() {
        println!("State and project files are consistent.");
    } else {
        println!("{} discrepancies:", discrepancies.len());
        for discrepancy in discrepancies {
            println!("  - {discrepancy}");
        }
    }
    Ok(())
}

async fn cmd_serve(
    project_root: &std::path::Path,
    host: &str,
    port: u16,
    no_auto_port: bool,
    open_browser: bool,
) -> Result<()> {
    use bmad_assist::dashboard::server::{AppState, find_available_port, serve};

    let loaded = load_project_config(project_root)?;
    let paths = ProjectPaths::new(project_root);

    let port = find_available_port(host, port, !no_auto_port)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let state = AppState::new(paths, loaded);

    if open_browser {
        let url = format!("http://{host}:{port}");
        if let Err(e) = open::that_detached(&url) {
            tracing::warn!("Failed to open browser at {url}: {e}");
        }
    }

    serve(state, host, port).await
}

async fn cmd_qa(project_root: &std::path::Path, command: &QaCommands) -> Result<()> {
    use bmad_assist::handlers::HandlerContext;
    use bmad_assist::qa::executor::{ExecuteOptions, execute_plan};
    use bmad_assist::qa::generator::generate_qa_plan;
    use bmad_assist::qa::parser::parse_test_plan_file;
    use bmad_assist::types::EpicId;

    let loaded = load_project_config(project_root)?;
    let paths = ProjectPaths::new(project_root);
    let ctx = HandlerContext {
        config: loaded.config.clone(),
        paths: paths.clone(),
        emitter: DashboardEmitter::from_env(&uuid::Uuid::new_v4().to_string()),
        debug_enabled: false,
    };

    match command {
        QaCommands::Generate { epic } => {
            let epic = EpicId::parse(epic);
            let path = generate_qa_plan(&ctx, &epic).await?;
            println!("QA plan saved to {}", path.display());
        }
        QaCommands::Execute {
            epic,
            category,
            batch,
            no_batch,
            batch_size,
            retry,
            retry_run,
            include_skipped,
        } => {
            let epic = EpicId::parse(epic);
            let plan_path = paths.qa_plan_file(&epic);
            let plan = parse_test_plan_file(&plan_path, &epic.to_string())?;

            let opts = ExecuteOptions {
                category: category.clone(),
                batch: if *batch {
                    Some(true)
                } else if *no_batch {
                    Some(false)
                } else {
                    None
                },
                batch_threshold: loaded.config.qa.batch_threshold,
                batch_size: batch_size.unwrap_or(loaded.config.qa.batch_size),
                test_timeout_secs: loaded.config.qa.test_timeout_secs,
                retry: *retry,
                retry_run: retry_run.clone(),
                include_skipped: *include_skipped,
                show_progress: true,
            };
            let results = execute_plan(&paths, &epic, &plan, &opts).await?;
            println!("{}", results.summary());
            if results.count(bmad_assist::qa::executor::TestStatus::Fail) > 0
                || results.count(bmad_assist::qa::executor::TestStatus::Error) > 0
            {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn cmd_config(project_root: &std::path::Path, command: &ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let loaded = load_project_config(project_root)?;
            let redacted = bmad_assist::config::redact(&loaded.merged);
            println!("{}", serde_yaml::to_string(&redacted)?);
        }
        ConfigCommands::Validate => {
            let loaded = load_project_config(project_root)?;
            // load_project_config exits on invalid config; getting here
            // means the merged config passed validation.
            println!(
                "Configuration valid ({} evaluator(s), min_reviews={})",
                loaded.config.providers.evaluators.len(),
                loaded.config.min_reviews
            );
        }
    }
    Ok(())
}
