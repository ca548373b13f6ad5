//! Multi-iteration build loop for one stream.
//!
//! Drives `run_step` until the checklist completes, the agent escalates, the
//! loop stalls, the iteration budget runs out, or the operator cancels. The
//! loop owns the stream's lock for its whole lifetime; every exit path
//! releases it through the guard. Between failed iterations it sleeps an
//! exponentially increasing, cancellable delay, and after repeated
//! consecutive failures it advances through the agent fallback chain.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancelToken, sleep_interruptible};
use crate::core::backoff::retry_delay;
use crate::core::classifier::CompletionSignal;
use crate::io::config::load_config;
use crate::io::invoker::AgentInvoker;
use crate::io::layout::{ConductorPaths, StreamPaths};
use crate::io::ledger::{self, IterationClass, SwitchEvent};
use crate::io::lock::{LockManager, ProcessProbe};
use crate::io::verify::Verifier;
use crate::step::{StepContext, load_checklist, run_step};

/// Failed iterations on one story, with no new distinct error, before the
/// loop declares a stall.
const STALL_WINDOW: usize = 3;

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStop {
    /// Every story is satisfied.
    Complete,
    /// The agent requested human intervention.
    NeedsHuman,
    /// The iteration budget ran out without completion.
    MaxIterations { iterations: u32 },
    /// No observable progress across [`STALL_WINDOW`] iterations.
    Stalled { story_id: String },
    /// Operator cancellation was observed.
    Aborted,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub stream_id: u32,
    pub iterations_run: u32,
    pub stop: BuildStop,
}

/// Caller-supplied options for one loop run.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Override the configured iteration budget.
    pub max_iterations: Option<u32>,
    /// Suppress commits (dry-run commit policy).
    pub dry_run: bool,
}

/// Run the build loop for one stream until a terminal state.
///
/// Structural failures surface as `Err`: a live lock holder
/// (downcastable `LockBusyError`), corrupt state, or git errors. Transient
/// failures never escape; they drive retry, backoff, and agent fallback.
#[instrument(skip_all, fields(stream_id))]
pub fn run_build<I, V, P>(
    root: &Path,
    stream_id: u32,
    invoker: &I,
    verifier: &V,
    probe: P,
    opts: &BuildOptions,
    cancel: CancelToken,
) -> Result<BuildOutcome>
where
    I: AgentInvoker,
    V: Verifier,
    P: ProcessProbe,
{
    let conductor = ConductorPaths::new(root);
    let paths = StreamPaths::new(root, stream_id);
    if !paths.dir.is_dir() {
        return Err(anyhow!("stream {stream_id} does not exist (run `conductor new`)"));
    }
    let config = load_config(&conductor.config_path)
        .with_context(|| format!("load {}", conductor.config_path.display()))?;
    let max_iterations = opts.max_iterations.unwrap_or(config.max_iterations);

    let workspace = if paths.worktree_dir.is_dir() {
        paths.worktree_dir.clone()
    } else {
        root.to_path_buf()
    };
    debug!(workspace = %workspace.display(), "resolved workspace");

    // Acquiring: exactly one live loop per stream. The guard releases on
    // every exit path below, including error returns and panics.
    let lock_manager = LockManager::new(&conductor.locks_dir, probe);
    let _lock = lock_manager.acquire(stream_id)?;
    info!(stream_id, max_iterations, "build loop started");

    let ctx = StepContext {
        paths,
        workspace,
        config: config.clone(),
        dry_run: opts.dry_run,
        cancel: cancel.clone(),
    };

    let backoff_base = Duration::from_millis(config.backoff_base_ms);
    let backoff_cap = Duration::from_millis(config.backoff_cap_ms);

    let mut agent_idx = 0usize;
    let mut consecutive_failures = 0u32;
    // (story_id, added a new distinct error) per failed iteration; cleared on
    // success and on agent switch.
    let mut stall_window: VecDeque<(String, bool)> = VecDeque::new();
    let mut iterations_run = 0u32;

    for iteration in 1..=max_iterations {
        if cancel.is_cancelled() {
            info!("cancellation observed at top of loop");
            return Ok(outcome(stream_id, iterations_run, BuildStop::Aborted));
        }

        // Pre-check: stop on an already-satisfied checklist without invoking
        // the agent.
        let checklist = load_checklist(&ctx)?;
        if checklist.next_open_story().is_none() {
            info!("checklist already satisfied");
            return Ok(outcome(stream_id, iterations_run, BuildStop::Complete));
        }

        let agent = config.agents[agent_idx].clone();
        let report = run_step(&ctx, invoker, verifier, &agent, consecutive_failures)?;
        iterations_run += 1;

        match report.class {
            IterationClass::Escalation => {
                info!(seq = report.seq, "agent escalated");
                return Ok(outcome(stream_id, iterations_run, BuildStop::NeedsHuman));
            }
            IterationClass::Aborted => {
                return Ok(outcome(stream_id, iterations_run, BuildStop::Aborted));
            }
            IterationClass::Success => {
                consecutive_failures = 0;
                stall_window.clear();
                // Completion is a checklist fact, not an agent claim: stop as
                // soon as every story is satisfied. The sentinel, when
                // present, merely agrees.
                if report.all_satisfied {
                    if report.signal == CompletionSignal::Complete {
                        info!(seq = report.seq, "completion sentinel honored");
                    }
                    return Ok(outcome(stream_id, iterations_run, BuildStop::Complete));
                }
            }
            IterationClass::Failure => {
                consecutive_failures += 1;
                stall_window.push_back((report.story_id.clone(), report.new_distinct_error));
                while stall_window.len() > STALL_WINDOW {
                    stall_window.pop_front();
                }

                if iteration < max_iterations {
                    if is_stalled(&stall_window) {
                        warn!(story_id = %report.story_id, "stall detected");
                        return Ok(outcome(
                            stream_id,
                            iterations_run,
                            BuildStop::Stalled {
                                story_id: report.story_id,
                            },
                        ));
                    }

                    if consecutive_failures >= config.switch_threshold {
                        if agent_idx + 1 < config.agents.len() {
                            switch_agent(
                                &ctx,
                                &config.agents[agent_idx].name,
                                &config.agents[agent_idx + 1].name,
                                consecutive_failures,
                                report.seq,
                            )?;
                            agent_idx += 1;
                            consecutive_failures = 0;
                            stall_window.clear();
                        }
                        // With no next agent, keep retrying the current one
                        // until the budget runs out.
                    }

                    let delay = retry_delay(consecutive_failures, backoff_base, backoff_cap);
                    if !delay.is_zero() {
                        debug!(delay_ms = delay.as_millis() as u64, "backoff before retry");
                        if !sleep_interruptible(delay, &cancel) {
                            info!("cancellation observed during backoff");
                            return Ok(outcome(stream_id, iterations_run, BuildStop::Aborted));
                        }
                    }
                }
            }
        }
    }

    info!(iterations_run, "iteration budget exhausted");
    Ok(outcome(
        stream_id,
        iterations_run,
        BuildStop::MaxIterations {
            iterations: iterations_run,
        },
    ))
}

fn outcome(stream_id: u32, iterations_run: u32, stop: BuildStop) -> BuildOutcome {
    BuildOutcome {
        stream_id,
        iterations_run,
        stop,
    }
}

/// No change in target story and no new distinct error across a full window.
fn is_stalled(window: &VecDeque<(String, bool)>) -> bool {
    if window.len() < STALL_WINDOW {
        return false;
    }
    let first = &window[0].0;
    window
        .iter()
        .all(|(story, new_error)| story == first && !new_error)
}

/// Append a fallback switch event to the ledger.
fn switch_agent(
    ctx: &StepContext,
    from_agent: &str,
    to_agent: &str,
    failures: u32,
    iteration: u64,
) -> Result<()> {
    info!(from_agent, to_agent, failures, "switching agent");
    let mut ledger = ledger::load_or_default(&ctx.paths.ledger_path)?;
    ledger.record_switch(SwitchEvent {
        from_agent: from_agent.to_string(),
        to_agent: to_agent.to_string(),
        reason: format!("{failures} consecutive failures"),
        iteration,
        at: Utc::now(),
    });
    ledger::write_ledger(&ctx.paths.ledger_path, &ledger)?;
    Ok(())
}

impl BuildStop {
    /// Stable CLI exit code for this terminal state.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Complete => crate::exit_codes::COMPLETE,
            Self::NeedsHuman => crate::exit_codes::NEEDS_HUMAN,
            Self::MaxIterations { .. } => crate::exit_codes::MAX_ITERATIONS,
            Self::Stalled { .. } => crate::exit_codes::STALLED,
            Self::Aborted => crate::exit_codes::ERROR,
        }
    }
}
