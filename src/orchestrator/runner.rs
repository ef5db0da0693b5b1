//! The loop runner: drives the phase graph over persisted state.
//!
//! One phase executes at a time; state mutates only between phases and every
//! mutation is committed atomically before the next phase starts. The runner
//! holds an advisory lock for the whole run, honors SIGINT/SIGTERM via a
//! shutdown flag checked at phase boundaries, and blocks cooperatively on
//! the pause flag file.

use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::config::{LoadedConfig, write_effective_config_snapshot};
use crate::dashboard::events::DashboardEmitter;
use crate::epics::{EpicDoc, load_epic_docs};
use crate::errors::LoopError;
use crate::handlers::{HandlerContext, handler_for, invoke_master};
use crate::notify::{Notifier, NotifyEvent};
use crate::paths::ProjectPaths;
use crate::sprint::reconciler::{ReconcileOptions, SyncRegistry, reconcile};
use crate::state::{Phase, State, StateStore};
use crate::timing::format_duration;

use super::guardian::{self, FeatureFlags, GuardianDecision};
use super::interactive::{DebugAction, InteractiveDebugger, TerminalInput};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every epic completed.
    Completed,
    /// Guardian halted the loop on a failed phase.
    Halted { phase: Phase, reason: String },
    /// SIGINT/SIGTERM between phases.
    Interrupted,
    /// Operator chose quit in debug mode.
    Quit,
}

/// Runner configuration beyond the project config.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Offer the interactive single-step prompt between phases.
    pub debug_step: bool,
}

pub struct LoopRunner<T: TerminalInput> {
    ctx: HandlerContext,
    loaded: LoadedConfig,
    flags: FeatureFlags,
    store: StateStore,
    sync: Arc<SyncRegistry>,
    notifier: Notifier,
    shutdown: Arc<AtomicBool>,
    opts: RunnerOptions,
    debugger: Option<InteractiveDebugger<T>>,
    /// Held for the life of the run; guards the single-writer contract.
    _lock_file: Option<File>,
}

impl<T: TerminalInput> LoopRunner<T> {
    pub fn new(
        paths: ProjectPaths,
        loaded: LoadedConfig,
        emitter: DashboardEmitter,
        opts: RunnerOptions,
        debugger: Option<InteractiveDebugger<T>>,
    ) -> Self {
        let flags = FeatureFlags::resolve(&loaded.config);
        let ctx = HandlerContext {
            config: loaded.config.clone(),
            paths: paths.clone(),
            emitter,
            debug_enabled: opts.debug_step,
        };
        let store = StateStore::new(paths.state_file());
        let notifier = Notifier::from_config(&loaded.config.notifications);

        let runner = Self {
            ctx,
            loaded,
            flags,
            store,
            sync: Arc::new(SyncRegistry::new()),
            notifier,
            shutdown: Arc::new(AtomicBool::new(false)),
            opts,
            debugger,
            _lock_file: None,
        };
        runner.register_default_sync();
        runner
    }

    /// Flag checked between phases; set by signal handlers and tests.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// The default post-save sync callback runs the reconciler silently.
    fn register_default_sync(&self) {
        let paths = self.ctx.paths.clone();
        let store_path = self.store.path().to_path_buf();
        // High-divergence repair may prompt only when an operator is
        // actually attached; dashboard-driven runs auto-cancel instead.
        let interactive_allowed = {
            use std::io::IsTerminal;
            std::io::stdin().is_terminal()
        };
        let opts = ReconcileOptions {
            divergence_threshold: self.ctx.config.sprint.divergence_threshold,
            interactive_allowed,
            master_model: self.ctx.config.providers.master.display_model(),
        };
        self.sync.register(Box::new(move || {
            let state = StateStore::new(&store_path).load().unwrap_or_default();
            if let Err(e) = reconcile(&paths, &state, &opts) {
                warn!("Sprint-status sync failed: {e}");
            }
        }));
    }

    /// Take the single-writer process lock on the state file.
    fn acquire_lock(&mut self) -> Result<(), LoopError> {
        let lock_path = self.ctx.paths.tool_dir().join("state.lock");
        std::fs::create_dir_all(self.ctx.paths.tool_dir())
            .map_err(|e| LoopError::State(e.into()))?;
        let file = File::create(&lock_path).map_err(|e| LoopError::State(e.into()))?;
        file.try_lock_exclusive()
            .map_err(|_| LoopError::StateLocked { path: lock_path })?;
        self._lock_file = Some(file);
        Ok(())
    }

    fn install_signal_handlers(&self) {
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{SignalKind, signal};
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {e}");
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            info!("Shutdown requested; finishing current phase");
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    /// Load state, or initialize it from sprint-status + epic docs.
    fn load_or_init_state(&self, epics: &[EpicDoc]) -> Result<State> {
        if self.store.exists() {
            return self.store.load();
        }

        let mut state = State::new();
        let sprint = crate::sprint::writer::SprintDoc::load(&self.ctx.paths.sprint_status())
            .unwrap_or_else(|_| crate::sprint::writer::SprintDoc::parse(""));
        for epic in epics {
            for story in &epic.stories {
                let done = sprint
                    .get(
                        crate::sprint::writer::Section::DevelopmentStatus,
                        &story.entry_key(),
                    )
                    .is_some_and(|e| e.value == "done");
                if done {
                    state.completed_stories.push(story.story_key());
                }
            }
            let all_done = !epic.stories.is_empty()
                && epic
                    .stories
                    .iter()
                    .all(|s| state.completed_stories.contains(&s.story_key()));
            if all_done {
                state.completed_epics.push(epic.frontmatter.epic_num.clone());
            }
        }
        info!(
            completed_stories = state.completed_stories.len(),
            "Initialized fresh state from sprint-status + epic docs"
        );
        Ok(state)
    }

    /// Point the cursors at the next pending story. False means the backlog
    /// is exhausted.
    fn position_next_story(&self, state: &mut State, epics: &[EpicDoc]) -> bool {
        for epic in epics {
            let epic_id = &epic.frontmatter.epic_num;
            if state.completed_epics.contains(epic_id) {
                continue;
            }
            for story in &epic.stories {
                let key = story.story_key();
                if state.completed_stories.contains(&key) {
                    continue;
                }
                if state.current_epic.as_ref() != Some(epic_id) {
                    state.current_epic = Some(epic_id.clone());
                    state.epic_started_at = Some(crate::timing::utc_now_naive());
                }
                state.current_story = Some(key);
                state.story_started_at = Some(crate::timing::utc_now_naive());
                return true;
            }
            // Epic declared but everything done: teardown still pending, let
            // the caller run RETROSPECTIVE/QA by selecting it as current.
            if state.current_epic.as_ref() != Some(epic_id) {
                state.current_epic = Some(epic_id.clone());
                state.epic_started_at = Some(crate::timing::utc_now_naive());
            }
            state.current_story = None;
            return true;
        }
        false
    }

    /// Whether the current epic still has stories to run.
    fn epic_has_pending_stories(&self, state: &State, epics: &[EpicDoc]) -> bool {
        let Some(epic_id) = &state.current_epic else {
            return false;
        };
        epics
            .iter()
            .filter(|e| &e.frontmatter.epic_num == epic_id)
            .flat_map(|e| &e.stories)
            .any(|s| !state.completed_stories.contains(&s.story_key()))
    }

    /// Run-once testarch preflight marker, recorded after the first ATDD
    /// phase: which supporting artifacts the project already carries.
    fn testarch_preflight_marker(&self) -> crate::state::TestarchPreflight {
        let root = &self.ctx.paths.project_root;
        crate::state::TestarchPreflight {
            completed_at: crate::timing::utc_now_naive(),
            test_design: root.join("docs/test-design.md").exists(),
            framework: self
                .ctx
                .config
                .testarch
                .as_ref()
                .is_some_and(|t| t.framework.is_some()),
            ci: root.join(".github/workflows").is_dir(),
        }
    }

    /// Block while the pause flag exists. Returns false when shutdown was
    /// requested while paused (stop-while-paused clears the flag).
    async fn wait_if_paused(&self) -> bool {
        let flag = self.ctx.paths.pause_flag();
        if !flag.exists() {
            return true;
        }

        self.ctx.emitter.emit_loop_paused();
        self.notifier.dispatch(&NotifyEvent::LoopPaused).await;
        self.sync.fire();
        info!("Loop paused; remove {} to resume", flag.display());

        while flag.exists() {
            if self.shutdown.load(Ordering::SeqCst) {
                let _ = std::fs::remove_file(&flag);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        self.ctx.emitter.emit_loop_resumed();
        self.notifier.dispatch(&NotifyEvent::LoopResumed).await;
        true
    }

    /// Decide the next phase, advancing story/epic cursors as needed.
    /// `None` means the whole project is complete.
    fn plan_next_phase(&self, state: &mut State, epics: &[EpicDoc]) -> Option<Phase> {
        match state.current_phase {
            None => {
                if !self.position_next_story(state, epics) {
                    return None;
                }
                if state.current_story.is_some() {
                    Some(Phase::CreateStory)
                } else {
                    // Stories done, teardown pending.
                    Some(Phase::Retrospective)
                }
            }
            Some(current) if !state.phase_completed => {
                // Halted or interrupted mid-phase: re-run it.
                Some(current)
            }
            Some(current) => {
                if current == guardian::last_story_phase(&self.flags) {
                    // Story boundary: commit it and either start the next
                    // story or fall through to epic teardown.
                    let story = state.current_story.clone().unwrap_or_default();
                    state.complete_current_story();
                    self.ctx.emitter.emit_story_transition(&story, "completed");
                    self.ctx.emitter.emit_story_status(&story, "done");

                    if self.epic_has_pending_stories(state, epics) {
                        self.position_next_story(state, epics);
                        return Some(Phase::CreateStory);
                    }
                    return guardian::get_next_phase(Some(current), &self.flags);
                }

                match guardian::get_next_phase(Some(current), &self.flags) {
                    Some(next) => Some(next),
                    None => {
                        // Epic teardown finished.
                        let epic = state
                            .current_epic
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default();
                        state.complete_current_epic();
                        state.current_phase = None;
                        self.ctx
                            .emitter
                            .emit_story_transition(&format!("epic-{epic}"), "epic_completed");
                        info!("Epic {epic} complete");

                        if !self.position_next_story(state, epics) {
                            return None;
                        }
                        if state.current_story.is_some() {
                            Some(Phase::CreateStory)
                        } else {
                            Some(Phase::Retrospective)
                        }
                    }
                }
            }
        }
    }

    /// Debug single-stepping between phases. Returns false on quit.
    async fn debug_step(&mut self) -> bool {
        if !self.opts.debug_step {
            return true;
        }
        let Some(debugger) = self.debugger.as_mut() else {
            return true;
        };
        loop {
            match debugger.ask_action() {
                Ok(DebugAction::Next) => return true,
                Ok(DebugAction::Quit) => return false,
                Ok(DebugAction::Interactive) => {
                    match debugger.edit_prompt() {
                        Ok(Some(prompt)) => {
                            if let Err(e) = invoke_master(&self.ctx, &prompt).await {
                                warn!("Interactive prompt failed: {e}");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("Interactive input failed: {e}");
                            return true;
                        }
                    }
                }
                Err(e) => {
                    warn!("Debug prompt unavailable: {e}");
                    return true;
                }
            }
        }
    }

    /// Drive the loop to completion. See the module docs for the contract.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.acquire_lock().map_err(|e| anyhow::anyhow!("{e}"))?;
        self.install_signal_handlers();

        let epics = load_epic_docs(&self.ctx.paths.epics_dir())
            .context("Failed to load epic docs")?;
        if epics.is_empty() {
            anyhow::bail!(
                "No epic docs found under {}",
                self.ctx.paths.epics_dir().display()
            );
        }

        let mut state = self.load_or_init_state(&epics)?;
        write_effective_config_snapshot(&self.ctx.paths, &self.loaded);

        let run_started = std::time::Instant::now();
        let outcome = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.store.save(&mut state)?;
                break RunOutcome::Interrupted;
            }

            if !self.wait_if_paused().await {
                self.store.save(&mut state)?;
                break RunOutcome::Interrupted;
            }

            let Some(phase) = self.plan_next_phase(&mut state, &epics) else {
                state.current_phase = None;
                self.store.save(&mut state)?;
                break RunOutcome::Completed;
            };

            state.start_phase(phase);
            self.store.save(&mut state)?;
            self.ctx.emitter.emit_workflow_status(
                phase.name(),
                state.current_story.as_deref(),
                "started",
            );
            self.notifier
                .dispatch(&NotifyEvent::PhaseStarted {
                    phase: phase.name().to_string(),
                    story: state.current_story.clone(),
                })
                .await;

            debug!(phase = %phase, story = ?state.current_story, "Dispatching phase");
            let handler = handler_for(phase);
            let result = handler.execute(&self.ctx, &state).await;

            let duration_ms = state.phase_elapsed_ms();
            self.notifier
                .dispatch(&NotifyEvent::PhaseFinished {
                    phase: phase.name().to_string(),
                    story: state.current_story.clone(),
                    duration_ms,
                    success: result.success,
                })
                .await;
            self.ctx.emitter.emit_workflow_status(
                phase.name(),
                state.current_story.as_deref(),
                if result.success { "finished" } else { "failed" },
            );

            if guardian::check_anomaly(&result, &state) == GuardianDecision::Halt {
                let reason = result.error.unwrap_or_else(|| "unknown failure".into());
                self.notifier
                    .dispatch(&NotifyEvent::Error {
                        message: format!("Phase {phase} failed: {reason}"),
                    })
                    .await;
                // State keeps pointing at the failed phase so the next run
                // resumes here.
                self.store.save(&mut state)?;
                self.sync.fire();
                break RunOutcome::Halted { phase, reason };
            }

            state.phase_completed = true;
            if phase == Phase::Atdd && state.testarch_preflight.is_none() {
                state.testarch_preflight = Some(self.testarch_preflight_marker());
            }
            self.store.save(&mut state)?;
            self.sync.fire();

            if !self.debug_step().await {
                self.store.save(&mut state)?;
                break RunOutcome::Quit;
            }
        };

        let summary = format!(
            "Run finished ({}): {} stories, {} epics completed in {}",
            outcome_label(&outcome),
            state.completed_stories.len(),
            state.completed_epics.len(),
            format_duration(run_started.elapsed().as_millis() as i64),
        );
        self.notifier
            .dispatch(&NotifyEvent::RunFinished {
                summary,
                success: matches!(outcome, RunOutcome::Completed),
            })
            .await;

        Ok(outcome)
    }
}

fn outcome_label(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Completed => "completed",
        RunOutcome::Halted { .. } => "halted",
        RunOutcome::Interrupted => "interrupted",
        RunOutcome::Quit => "quit",
    }
}
