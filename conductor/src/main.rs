//! Multi-stream coding-agent build loop CLI.
//!
//! Streams are created with `new`, optionally isolated with `workspace`,
//! driven with `build`, and landed with `merge`/`cleanup`. `status` and
//! `verify` consult the reconciliation engine; they never block a running
//! loop.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use conductor::build::{BuildOptions, run_build};
use conductor::cancel::CancelToken;
use conductor::exit_codes;
use conductor::io::config::load_config;
use conductor::io::invoker::CommandInvoker;
use conductor::io::layout::{ConductorPaths, stream_ids};
use conductor::io::lock::SignalProbe;
use conductor::io::verify::ShellVerifier;
use conductor::{logging, reconcile, stream};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Multi-stream coding-agent build loop"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold `.conductor/` with a default config.
    Init,
    /// Allocate a new stream (next unused id).
    New {
        /// Seed the stream's checklist from this file.
        #[arg(long)]
        checklist: Option<PathBuf>,
    },
    /// Create the stream's isolated worktree on a dedicated branch.
    Workspace { stream_id: u32 },
    /// Run the build loop for one stream.
    Build {
        stream_id: u32,
        /// Override the configured iteration budget.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Run the loop without committing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the derived status for one stream, or all of them.
    Status { stream_id: Option<u32> },
    /// Reconcile every stream, applying idempotent corrections.
    Verify,
    /// Merge the stream's branch into the main line.
    Merge { stream_id: u32 },
    /// Remove the stream's workspace and branch after merge or abandonment.
    Cleanup {
        stream_id: u32,
        /// Discard unmerged work.
        #[arg(long)]
        abandon: bool,
    },
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(u8::try_from(exit_codes::ERROR).unwrap_or(1))
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init => cmd_init(&root),
        Command::New { checklist } => cmd_new(&root, checklist.as_deref()),
        Command::Workspace { stream_id } => cmd_workspace(&root, stream_id),
        Command::Build {
            stream_id,
            max_iterations,
            dry_run,
        } => cmd_build(&root, stream_id, max_iterations, dry_run),
        Command::Status { stream_id } => cmd_status(&root, stream_id),
        Command::Verify => cmd_verify(&root),
        Command::Merge { stream_id } => cmd_merge(&root, stream_id),
        Command::Cleanup { stream_id, abandon } => cmd_cleanup(&root, stream_id, abandon),
    }
}

fn cmd_init(root: &Path) -> Result<i32> {
    let paths = stream::init_conductor(root)?;
    println!("initialized {}", paths.conductor_dir.display());
    Ok(exit_codes::COMPLETE)
}

fn cmd_new(root: &Path, checklist: Option<&Path>) -> Result<i32> {
    let seed = match checklist {
        Some(path) => Some(
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?,
        ),
        None => None,
    };
    let stream_id = stream::new_stream(root, seed.as_deref())?;
    println!("{stream_id}");
    Ok(exit_codes::COMPLETE)
}

fn cmd_workspace(root: &Path, stream_id: u32) -> Result<i32> {
    let workspace = stream::init_workspace(root, stream_id)?;
    println!("{}", workspace.display());
    Ok(exit_codes::COMPLETE)
}

fn cmd_build(
    root: &Path,
    stream_id: u32,
    max_iterations: Option<u32>,
    dry_run: bool,
) -> Result<i32> {
    // Install the release handler before the first iteration: an interrupt
    // flips the token, the loop finishes the current record, and the lock
    // guard releases on unwind.
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("install interrupt handler")?;

    let config_path = ConductorPaths::new(root).config_path;
    let config = load_config(&config_path)?;
    let verifier = ShellVerifier::new(config.verify.command.clone());

    let outcome = run_build(
        root,
        stream_id,
        &CommandInvoker,
        &verifier,
        SignalProbe,
        &BuildOptions {
            max_iterations,
            dry_run,
        },
        cancel,
    )?;

    println!(
        "stream {}: {:?} after {} iteration(s)",
        outcome.stream_id, outcome.stop, outcome.iterations_run
    );
    Ok(outcome.stop.exit_code())
}

fn cmd_status(root: &Path, stream_id: Option<u32>) -> Result<i32> {
    let ids = match stream_id {
        Some(id) => vec![id],
        None => stream_ids(root)?,
    };
    for id in ids {
        let status = reconcile::status(root, id, &SignalProbe)?;
        println!("{id}\t{}", status.as_str());
    }
    Ok(exit_codes::COMPLETE)
}

fn cmd_verify(root: &Path) -> Result<i32> {
    let corrections = reconcile::verify_all(root, &SignalProbe)?;
    if corrections.is_empty() {
        println!("all streams consistent");
    }
    for correction in corrections {
        println!("stream {}: {}", correction.stream_id, correction.action);
    }
    Ok(exit_codes::COMPLETE)
}

fn cmd_merge(root: &Path, stream_id: u32) -> Result<i32> {
    if stream::merge_stream(root, stream_id, &SignalProbe)? {
        println!("stream {stream_id} merged");
    } else {
        println!("stream {stream_id} has no workspace, nothing to merge");
    }
    Ok(exit_codes::COMPLETE)
}

fn cmd_cleanup(root: &Path, stream_id: u32, abandon: bool) -> Result<i32> {
    stream::cleanup_stream(root, stream_id, abandon, &SignalProbe)?;
    println!("stream {stream_id} cleaned up");
    Ok(exit_codes::COMPLETE)
}
