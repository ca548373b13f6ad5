//! Loop-level scenarios driving `run_build` end-to-end against temp git
//! repositories with scripted agents and verifiers.

use conductor::build::{BuildOptions, BuildStop, run_build};
use conductor::cancel::CancelToken;
use conductor::core::checklist::Checklist;
use conductor::io::layout::{ConductorPaths, StreamPaths};
use conductor::io::ledger::{self, IterationClass};
use conductor::io::lock::{LockBusyError, LockManager};
use conductor::test_support::{
    AlwaysAlive, NeverAlive, ScriptedInvoker, ScriptedVerifier, TestRepo, test_config,
};

const TWO_STORIES: &str = "\
- [ ] First story
  - [ ] criterion one
- [ ] Second story
  - [ ] criterion two
";

fn read_checklist(repo: &TestRepo, stream_id: u32) -> Checklist {
    let path = StreamPaths::new(repo.root(), stream_id).checklist_path;
    let contents = std::fs::read_to_string(path).expect("read checklist");
    Checklist::parse(&contents).expect("parse checklist")
}

fn lock_file_exists(repo: &TestRepo, stream_id: u32) -> bool {
    ConductorPaths::new(repo.root())
        .locks_dir
        .join(format!("{stream_id}.lock"))
        .exists()
}

/// Scenario A: two stories, verification always passes. Iteration 1 satisfies
/// story 1 and commits; iteration 2 satisfies story 2, commits, and the agent
/// emits the completion sentinel. The loop returns Complete after exactly two
/// iterations.
#[test]
fn scenario_a_two_stories_complete_in_two_iterations() {
    let repo = TestRepo::new().expect("repo");
    let stream_id = repo.new_stream(TWO_STORIES).expect("stream");

    let invoker =
        ScriptedInvoker::with_outputs(vec!["built story one", "built story two\nLOOP_COMPLETE"])
            .touching("work.txt");
    let verifier = ScriptedVerifier::passing();

    let outcome = run_build(
        repo.root(),
        stream_id,
        &invoker,
        &verifier,
        NeverAlive,
        &BuildOptions::default(),
        CancelToken::new(),
    )
    .expect("build");

    assert_eq!(outcome.stop, BuildStop::Complete);
    assert_eq!(outcome.stop.exit_code(), 0);
    assert_eq!(outcome.iterations_run, 2);
    assert_eq!(invoker.calls(), 2);

    let checklist = read_checklist(&repo, stream_id);
    assert!(checklist.all_satisfied());

    let ledger =
        ledger::load_or_default(&StreamPaths::new(repo.root(), stream_id).ledger_path)
            .expect("ledger");
    assert_eq!(ledger.recent.len(), 2);
    assert!(ledger.recent.iter().all(|r| r.class == IterationClass::Success));
    assert!(ledger.recent.iter().all(|r| r.commit.is_some()));
    assert_eq!(ledger.commits.len(), 2);

    assert!(!lock_file_exists(&repo, stream_id));
}

/// Scenario B: verification always fails, two agents, switch threshold 3.
/// After iteration 3 a switch event is recorded; after six iterations with no
/// success the loop returns MaxIterations.
#[test]
fn scenario_b_agent_switch_then_max_iterations() {
    let repo = TestRepo::new().expect("repo");
    let stream_id = repo.new_stream(TWO_STORIES).expect("stream");
    repo.set_config(&test_config(&["alpha", "beta"]))
        .expect("config");

    let invoker = ScriptedInvoker::with_outputs(vec!["attempt"]);
    let verifier = ScriptedVerifier::failing("error: assertion failed in suite");

    let outcome = run_build(
        repo.root(),
        stream_id,
        &invoker,
        &verifier,
        NeverAlive,
        &BuildOptions {
            max_iterations: Some(6),
            dry_run: false,
        },
        CancelToken::new(),
    )
    .expect("build");

    assert_eq!(outcome.stop, BuildStop::MaxIterations { iterations: 6 });
    assert_eq!(outcome.stop.exit_code(), 3);
    assert_eq!(invoker.calls(), 6);

    let ledger =
        ledger::load_or_default(&StreamPaths::new(repo.root(), stream_id).ledger_path)
            .expect("ledger");
    assert_eq!(ledger.switches.len(), 1);
    let switch = &ledger.switches[0];
    assert_eq!(switch.from_agent, "alpha");
    assert_eq!(switch.to_agent, "beta");
    assert_eq!(switch.iteration, 3);

    // Recent detail covers iterations 2-6; the fallback agent ran 4-6.
    let agents: Vec<&str> = ledger.recent.iter().map(|r| r.agent.as_str()).collect();
    assert_eq!(agents, vec!["alpha", "alpha", "beta", "beta", "beta"]);
}

/// Scenario D: the agent emits NEEDS_HUMAN at iteration 2. The loop returns
/// NeedsHuman immediately, exit code 2, lock released.
#[test]
fn scenario_d_needs_human_escalates_immediately() {
    let repo = TestRepo::new().expect("repo");
    let stream_id = repo.new_stream(TWO_STORIES).expect("stream");

    let invoker = ScriptedInvoker::with_outputs(vec![
        "built story one",
        "NEEDS_HUMAN\nthe API key is missing",
    ])
    .touching("work.txt");
    let verifier = ScriptedVerifier::passing();

    let outcome = run_build(
        repo.root(),
        stream_id,
        &invoker,
        &verifier,
        NeverAlive,
        &BuildOptions::default(),
        CancelToken::new(),
    )
    .expect("build");

    assert_eq!(outcome.stop, BuildStop::NeedsHuman);
    assert_eq!(outcome.stop.exit_code(), 2);
    assert_eq!(outcome.iterations_run, 2);
    assert!(!lock_file_exists(&repo, stream_id));

    let ledger =
        ledger::load_or_default(&StreamPaths::new(repo.root(), stream_id).ledger_path)
            .expect("ledger");
    assert_eq!(ledger.recent.last().expect("record").class, IterationClass::Escalation);
}

/// Termination bound: with maxIterations = N and no completion, escalation,
/// or stall, the agent is invoked at most N times before MaxIterations.
#[test]
fn iteration_budget_bounds_agent_invocations() {
    let repo = TestRepo::new().expect("repo");
    let stream_id = repo.new_stream(TWO_STORIES).expect("stream");

    // Alternate between two distinct errors so stall detection never fires.
    let invoker = ScriptedInvoker::with_outputs(vec!["attempt"]);
    let verifier = ScriptedVerifier::with_outcomes(vec![
        conductor::io::verify::VerifyOutcome::Fail {
            output: "error one".to_string(),
        },
        conductor::io::verify::VerifyOutcome::Fail {
            output: "error two".to_string(),
        },
        conductor::io::verify::VerifyOutcome::Fail {
            output: "error one again, distinct".to_string(),
        },
        conductor::io::verify::VerifyOutcome::Fail {
            output: "error two again, distinct".to_string(),
        },
    ]);

    let outcome = run_build(
        repo.root(),
        stream_id,
        &invoker,
        &verifier,
        NeverAlive,
        &BuildOptions {
            max_iterations: Some(4),
            dry_run: false,
        },
        CancelToken::new(),
    )
    .expect("build");

    assert_eq!(outcome.stop, BuildStop::MaxIterations { iterations: 4 });
    assert_eq!(invoker.calls(), 4);
}

/// Completion requires satisfaction: a LOOP_COMPLETE sentinel with open
/// stories does not terminate the loop; each such iteration is recorded as a
/// failure and the story stays open.
#[test]
fn premature_complete_sentinel_does_not_terminate() {
    let repo = TestRepo::new().expect("repo");
    let stream_id = repo.new_stream(TWO_STORIES).expect("stream");

    let invoker = ScriptedInvoker::with_outputs(vec!["LOOP_COMPLETE"]);
    let verifier = ScriptedVerifier::passing();

    let outcome = run_build(
        repo.root(),
        stream_id,
        &invoker,
        &verifier,
        NeverAlive,
        &BuildOptions {
            max_iterations: Some(3),
            dry_run: false,
        },
        CancelToken::new(),
    )
    .expect("build");

    assert_eq!(outcome.stop, BuildStop::MaxIterations { iterations: 3 });

    let checklist = read_checklist(&repo, stream_id);
    assert!(!checklist.stories()[0].satisfied());

    let ledger =
        ledger::load_or_default(&StreamPaths::new(repo.root(), stream_id).ledger_path)
            .expect("ledger");
    assert!(ledger.recent.iter().all(|r| r.class == IterationClass::Failure));
}

/// Stall detection: three consecutive iterations on the same story with no
/// new distinct error stop the loop before the budget runs out.
#[test]
fn repeated_identical_failures_stall_early() {
    let repo = TestRepo::new().expect("repo");
    let stream_id = repo.new_stream(TWO_STORIES).expect("stream");

    let invoker = ScriptedInvoker::with_outputs(vec!["attempt"]);
    let verifier = ScriptedVerifier::failing("error: same assertion every time");

    let outcome = run_build(
        repo.root(),
        stream_id,
        &invoker,
        &verifier,
        NeverAlive,
        &BuildOptions {
            max_iterations: Some(10),
            dry_run: false,
        },
        CancelToken::new(),
    )
    .expect("build");

    assert_eq!(
        outcome.stop,
        BuildStop::Stalled {
            story_id: "s1".to_string()
        }
    );
    assert_eq!(outcome.stop.exit_code(), 4);
    assert!(outcome.iterations_run < 10);
    assert!(!lock_file_exists(&repo, stream_id));
}

/// Cancellation observed at the top of the loop aborts without invoking the
/// agent and releases the lock.
#[test]
fn pre_cancelled_loop_aborts_cleanly() {
    let repo = TestRepo::new().expect("repo");
    let stream_id = repo.new_stream(TWO_STORIES).expect("stream");

    let cancel = CancelToken::new();
    cancel.cancel();
    let invoker = ScriptedInvoker::with_outputs(vec!["never runs"]);
    let verifier = ScriptedVerifier::passing();

    let outcome = run_build(
        repo.root(),
        stream_id,
        &invoker,
        &verifier,
        NeverAlive,
        &BuildOptions::default(),
        cancel,
    )
    .expect("build");

    assert_eq!(outcome.stop, BuildStop::Aborted);
    assert_eq!(outcome.iterations_run, 0);
    assert_eq!(invoker.calls(), 0);
    assert!(!lock_file_exists(&repo, stream_id));
}

/// A live lock holder makes `run_build` fail fast with LockBusyError and no
/// side effects on the stream.
#[test]
fn busy_stream_is_a_structural_error() {
    let repo = TestRepo::new().expect("repo");
    let stream_id = repo.new_stream(TWO_STORIES).expect("stream");

    let locks_dir = ConductorPaths::new(repo.root()).locks_dir;
    let manager = LockManager::new(&locks_dir, AlwaysAlive);
    let _guard = manager.acquire(stream_id).expect("hold lock");

    let invoker = ScriptedInvoker::with_outputs(vec!["never runs"]);
    let verifier = ScriptedVerifier::passing();

    let err = run_build(
        repo.root(),
        stream_id,
        &invoker,
        &verifier,
        AlwaysAlive,
        &BuildOptions::default(),
        CancelToken::new(),
    )
    .expect_err("busy");

    assert!(err.downcast_ref::<LockBusyError>().is_some());
    assert_eq!(invoker.calls(), 0);

    let ledger =
        ledger::load_or_default(&StreamPaths::new(repo.root(), stream_id).ledger_path)
            .expect("ledger");
    assert_eq!(ledger.recent.len(), 0);
}
