//! Resumable planner/tool orchestrator.
//!
//! State lives under `.orchestrator/` in the working root: `config.toml`,
//! per-thread checkpoints and the per-run world model.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use orchestrator::core::payload::TerminalPayload;
use orchestrator::core::types::{DEFAULT_REQUEST_KIND, IncomingMessage, ThreadId};
use orchestrator::core::world::WorldChange;
use orchestrator::engine::Engine;
use orchestrator::exit_codes;
use orchestrator::io::checkpoint::{CheckpointStore, FileCheckpointStore};
use orchestrator::io::config::load_config;
use orchestrator::io::paths::{InitOptions, OrchestratorPaths, init_workspace};
use orchestrator::io::planner::CommandPlanner;
use orchestrator::io::tools::ToolRegistry;
use orchestrator::io::world_store::{FileWorldModel, WorldModel, WorldReader, WorldWriter};
use orchestrator::logging;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Resumable planner/tool orchestrator with hard review gates"
)]
struct Cli {
    /// Project root containing `.orchestrator/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.orchestrator/` with a default config.
    Init {
        /// Overwrite the existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one turn of a thread and print the terminal payload as JSON.
    Run {
        /// Thread id as `run_id:session_id`.
        thread: String,
        /// User message text.
        text: String,
        /// Issue the gate checks decision locks against.
        #[arg(long)]
        issue: Option<String>,
        /// Request kind selecting the evidence minimum.
        #[arg(long, default_value = DEFAULT_REQUEST_KIND)]
        kind: String,
    },
    /// Delete checkpoints of one thread, or of every session of a run.
    Reset {
        #[arg(required_unless_present = "run", conflicts_with = "run")]
        thread: Option<String>,
        #[arg(long)]
        run: Option<String>,
    },
    /// List checkpoints of a thread, or every thread with checkpoints.
    Checkpoints { thread: Option<String> },
    /// Keep only the newest checkpoints of a thread.
    Prune {
        thread: String,
        #[arg(long)]
        keep: usize,
    },
    /// Inspect or edit the world model of a run.
    World {
        #[command(subcommand)]
        command: WorldCommand,
    },
}

#[derive(Subcommand)]
enum WorldCommand {
    /// Apply one change given as JSON, e.g. `{"change":"release_lock","lock_id":"L1"}`.
    Apply {
        run: String,
        /// Change JSON; read from `--file` when omitted.
        change: Option<String>,
        #[arg(long, conflicts_with = "change")]
        file: Option<PathBuf>,
    },
    /// Print the world document of a run.
    Show { run: String },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = OrchestratorPaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => {
            init_workspace(&cli.root, &InitOptions { force })?;
            Ok(exit_codes::OK)
        }
        Command::Run {
            thread,
            text,
            issue,
            kind,
        } => cmd_run(&paths, &thread, text, issue, kind),
        Command::Reset { thread, run } => {
            ensure_workspace(&paths)?;
            let store = FileCheckpointStore::new(&paths.checkpoints_dir);
            let deleted = match (thread, run) {
                (Some(thread), _) => {
                    let thread_id = ThreadId::parse(&thread)?;
                    let _claim = store.claim(&thread_id)?;
                    store.reset(&thread_id)?
                }
                (None, Some(run)) => {
                    let _claims = store
                        .threads()?
                        .iter()
                        .filter(|t| t.run_id() == run)
                        .map(|t| store.claim(t))
                        .collect::<Result<Vec<_>, _>>()?;
                    store.reset_run(&run)?
                }
                (None, None) => bail!("reset needs a thread or --run"),
            };
            println!("{deleted}");
            Ok(exit_codes::OK)
        }
        Command::Checkpoints { thread } => {
            ensure_workspace(&paths)?;
            let store = FileCheckpointStore::new(&paths.checkpoints_dir);
            match thread {
                Some(thread) => print_json(&store.list(&ThreadId::parse(&thread)?)?)?,
                None => {
                    let threads: Vec<String> =
                        store.threads()?.iter().map(ToString::to_string).collect();
                    print_json(&threads)?;
                }
            }
            Ok(exit_codes::OK)
        }
        Command::Prune { thread, keep } => {
            ensure_workspace(&paths)?;
            if keep == 0 {
                bail!("--keep must be > 0");
            }
            let store = FileCheckpointStore::new(&paths.checkpoints_dir);
            let thread_id = ThreadId::parse(&thread)?;
            let _claim = store.claim(&thread_id)?;
            let deleted = store.prune(&thread_id, keep)?;
            println!("{deleted}");
            Ok(exit_codes::OK)
        }
        Command::World { command } => {
            ensure_workspace(&paths)?;
            let world = FileWorldModel::new(&paths.world_dir);
            match command {
                WorldCommand::Apply { run, change, file } => {
                    let raw = match (change, file) {
                        (Some(raw), _) => raw,
                        (None, Some(file)) => fs::read_to_string(&file)
                            .with_context(|| format!("read {}", file.display()))?,
                        (None, None) => bail!("world apply needs a change or --file"),
                    };
                    let change: WorldChange =
                        serde_json::from_str(&raw).context("parse world change")?;
                    world.apply_change(&run, &change)?;
                }
                WorldCommand::Show { run } => print_json(&world.world_state(&run)?)?,
            }
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(
    paths: &OrchestratorPaths,
    thread: &str,
    text: String,
    issue: Option<String>,
    kind: String,
) -> Result<i32> {
    ensure_workspace(paths)?;
    let thread_id = ThreadId::parse(thread)?;
    let config = load_config(&paths.config_path)?;
    if config.planner.command.is_empty() {
        bail!(
            "planner.command is not set in {}",
            paths.config_path.display()
        );
    }
    let planner = CommandPlanner::new(config.planner.command.clone(), config.output_limit_bytes);
    let registry = ToolRegistry::from_config(&config.tools, config.output_limit_bytes)?;
    let store = FileCheckpointStore::new(&paths.checkpoints_dir);
    let world: Arc<dyn WorldModel> = Arc::new(FileWorldModel::new(&paths.world_dir));
    let engine = Engine::new(config, planner, store, world, registry);

    let mut message = IncomingMessage::new(text).with_request_kind(kind);
    if let Some(issue) = issue {
        message = message.with_issue_key(issue);
    }

    match engine.run(&thread_id, message) {
        Ok(payload) => {
            print_json(&payload)?;
            Ok(exit_codes::for_status(payload.status))
        }
        Err(err) => {
            print_json(&TerminalPayload::from_error(&err))?;
            Err(err).context("orchestrator run")
        }
    }
}

fn ensure_workspace(paths: &OrchestratorPaths) -> Result<()> {
    if !paths.state_dir.is_dir() {
        bail!(
            "{} not found (run `orchestrator init` first)",
            paths.state_dir.display()
        );
    }
    Ok(())
}

/// Pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{out}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["orchestrator", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_issue_and_kind() {
        let cli = Cli::parse_from([
            "orchestrator",
            "run",
            "r1:chat",
            "total wages?",
            "--issue",
            "ISSUE-1",
            "--kind",
            "payroll",
        ]);
        match cli.command {
            Command::Run {
                thread,
                issue,
                kind,
                ..
            } => {
                assert_eq!(thread, "r1:chat");
                assert_eq!(issue.as_deref(), Some("ISSUE-1"));
                assert_eq!(kind, "payroll");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_kind_defaults_to_general() {
        let cli = Cli::parse_from(["orchestrator", "run", "r1:chat", "hi"]);
        assert!(matches!(cli.command, Command::Run { ref kind, .. } if kind == "general"));
    }

    #[test]
    fn reset_takes_a_thread_or_a_run_but_not_both() {
        let cli = Cli::parse_from(["orchestrator", "reset", "--run", "r1"]);
        assert!(matches!(
            cli.command,
            Command::Reset { thread: None, run: Some(_) }
        ));
        assert!(Cli::try_parse_from(["orchestrator", "reset"]).is_err());
        assert!(Cli::try_parse_from(["orchestrator", "reset", "r1:chat", "--run", "r1"]).is_err());
    }
}
