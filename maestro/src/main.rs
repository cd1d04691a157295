//! Orchestration controller CLI.
//!
//! Drives a task through the controller state machine with collaborators
//! loaded from a JSON role script, checkpointing to `.maestro/state/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use maestro::controller::{Controller, LoopOutcome, LoopStop, StatusReport, TickReport};
use maestro::core::invariants::validate_invariants;
use maestro::core::types::TaskStatus;
use maestro::exit_codes;
use maestro::io::config::{MaestroConfig, load_config};
use maestro::io::event_log::EventLog;
use maestro::io::init::{InitOptions, MaestroPaths, init_workspace};
use maestro::io::snapshot::load_snapshot;
use maestro::logging;
use maestro::roles::scripted::RoleScript;
use maestro::state_machine::replay_controller_state;
use maestro::store::DataStore;

#[derive(Parser)]
#[command(
    name = "maestro",
    version,
    about = "State-machine controller for LLM-driven desktop automation"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.maestro/` with a default config.
    Init {
        /// Overwrite existing files and discard saved task state.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new task and run it with scripted collaborators.
    Run {
        /// What the task should achieve.
        #[arg(long)]
        objective: String,
        /// JSON role script providing manager, worker, executor and evaluator replies.
        #[arg(long)]
        script: PathBuf,
        /// Stop after this many ticks instead of `controller.max_ticks`.
        #[arg(long)]
        steps: Option<u32>,
    },
    /// Continue the saved task with scripted collaborators.
    Resume {
        #[arg(long)]
        script: PathBuf,
        #[arg(long)]
        steps: Option<u32>,
    },
    /// Print the saved task status as JSON.
    Status,
    /// Print the controller event log.
    Events {
        /// Print the controller state rebuilt from the log instead.
        #[arg(long)]
        replay: bool,
    },
    /// Check config and saved task state against store invariants.
    Validate,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run {
            objective,
            script,
            steps,
        } => cmd_run(&root, objective, &script, steps),
        Command::Resume { script, steps } => cmd_resume(&root, &script, steps),
        Command::Status => cmd_status(&root),
        Command::Events { replay } => cmd_events(&root, replay),
        Command::Validate => cmd_validate(&root),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", paths.maestro_dir.display());
    Ok(exit_codes::OK)
}

fn workspace(root: &Path) -> Result<(MaestroPaths, MaestroConfig)> {
    let paths = MaestroPaths::new(root);
    if !paths.maestro_dir.is_dir() {
        bail!("missing .maestro directory (run `maestro init` first)");
    }
    let config = load_config(&paths.config_path)?;
    Ok((paths, config))
}

fn cmd_run(root: &Path, objective: String, script: &Path, steps: Option<u32>) -> Result<i32> {
    let (paths, config) = workspace(root)?;
    if objective.trim().is_empty() {
        bail!("objective must not be empty");
    }
    let (roles, _) = RoleScript::load(script)?.into_roles();
    let mut controller =
        Controller::new(DataStore::new(objective), roles, &config).persist_to(paths)?;
    let max = steps.unwrap_or(config.controller.max_ticks);
    let outcome = controller.run_with(max, print_tick)?;
    finish(&outcome)
}

fn cmd_resume(root: &Path, script: &Path, steps: Option<u32>) -> Result<i32> {
    let (paths, config) = workspace(root)?;
    let (roles, _) = RoleScript::load(script)?.into_roles();
    let mut controller = Controller::resume(paths, roles, &config)?;
    let max = steps.unwrap_or(config.controller.max_ticks);
    let outcome = controller.run_with(max, print_tick)?;
    finish(&outcome)
}

fn print_tick(report: &TickReport) {
    let code = report
        .status
        .last_trigger_code
        .map_or("-", |code| code.as_str());
    println!(
        "{:>4} {} -> {} [{}] {}",
        report.tick, report.from, report.status.current_state, code, report.status.task_status
    );
}

fn finish(outcome: &LoopOutcome) -> Result<i32> {
    print_status(&outcome.status)?;
    Ok(match outcome.stop {
        LoopStop::Finished(TaskStatus::Fulfilled) => exit_codes::OK,
        LoopStop::Finished(_) => exit_codes::REJECTED,
        LoopStop::Cancelled | LoopStop::TickLimit { .. } => exit_codes::INCOMPLETE,
    })
}

fn print_status(status: &StatusReport) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(status).context("serialize status")?
    );
    Ok(())
}

fn cmd_status(root: &Path) -> Result<i32> {
    let paths = MaestroPaths::new(root);
    let snapshot = load_snapshot(&paths.snapshot_path)?;
    print_status(&StatusReport::capture(&snapshot.store, &snapshot.controller))?;
    Ok(exit_codes::OK)
}

fn cmd_events(root: &Path, replay: bool) -> Result<i32> {
    let paths = MaestroPaths::new(root);
    let events = EventLog::new(&paths.events_path).read_all()?;
    if replay {
        let state = replay_controller_state(&events).context("event log has no state switches")?;
        println!(
            "{}",
            serde_json::to_string_pretty(&state).context("serialize controller state")?
        );
        return Ok(exit_codes::OK);
    }
    for event in events {
        println!(
            "{:>5} {} {}/{} {}",
            event.seq,
            event.timestamp.to_rfc3339(),
            event.module,
            event.event_type,
            event.message
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let (paths, _config) = workspace(root)?;
    if !paths.snapshot_path.exists() {
        println!("config ok; no saved task");
        return Ok(exit_codes::OK);
    }
    let snapshot = load_snapshot(&paths.snapshot_path)?;
    let errors = validate_invariants(&snapshot.store);
    if !errors.is_empty() {
        bail!("invariant violations:\n- {}", errors.join("\n- "));
    }
    println!("config ok; task {} ok", snapshot.store.task().id);
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["maestro", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_steps() {
        let cli = Cli::parse_from([
            "maestro",
            "run",
            "--objective",
            "send the weekly report",
            "--script",
            "script.json",
            "--steps",
            "3",
        ]);
        match cli.command {
            Command::Run {
                objective, steps, ..
            } => {
                assert_eq!(objective, "send the weekly report");
                assert_eq!(steps, Some(3));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_events_replay() {
        let cli = Cli::parse_from(["maestro", "events", "--replay"]);
        assert!(matches!(cli.command, Command::Events { replay: true }));
    }
}
