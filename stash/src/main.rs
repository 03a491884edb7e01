//! `stash` command-line entry point.
//!
//! Thin wrapper over the library: writes config, checks planner output
//! offline, and drives a single run end to end with the Codex adapter.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use stash::core::policy::plan_commands;
use stash::core::types::{NewMessage, Role, Run, RunMode, RunStatus, RunStep};
use stash::engine::{Engine, EngineSettings};
use stash::io::adapter::CodexAdapter;
use stash::io::config::{StashConfig, load_config, write_config};
use stash::io::paths::{FsResolver, canonical_root};
use stash::io::store::HistoryStore;
use tracing::info;

const DEFAULT_CONFIG: &str = ".stash/config.toml";

#[derive(Parser)]
#[command(
    name = "stash",
    version,
    about = "Plan, validate, and execute agent commands inside a project folder"
)]
struct Cli {
    /// Config file (TOML). Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config file.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Extract and validate command blocks from a saved planner reply.
    CheckPlan {
        /// File holding the planner output.
        file: PathBuf,
        /// Project root the commands must stay inside.
        #[arg(long)]
        root: PathBuf,
    },
    /// Send a message to the project's active conversation and run it.
    Send {
        #[arg(long)]
        root: PathBuf,
        /// Message text.
        message: String,
        /// Seconds to wait for the run to finish.
        #[arg(long, default_value_t = 3_600)]
        wait_secs: u64,
    },
}

fn main() {
    stash::logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::CheckPlan { file, root } => cmd_check_plan(&cli.config, &file, &root),
        Command::Send {
            root,
            message,
            wait_secs,
        } => cmd_send(&cli.config, &root, &message, Duration::from_secs(wait_secs)),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &StashConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(())
}

fn cmd_check_plan(config_path: &Path, file: &Path, root: &Path) -> Result<()> {
    let cfg = load_config(config_path)?;
    let text = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let root = canonical_root(&absolute(root)?)?;
    let plan = plan_commands(&text, &root, &cfg.command_policy(), &FsResolver);
    print_json(&plan)?;
    if !plan.is_clean() {
        bail!("{}", plan.rejection_detail());
    }
    Ok(())
}

fn cmd_send(config_path: &Path, root: &Path, message: &str, wait: Duration) -> Result<()> {
    let cfg = load_config(config_path)?;
    let store = Arc::new(HistoryStore::open(&cfg.database_path)?);
    let project = store.open_project(None, &absolute(root)?)?;
    let conversation_id = match project.active_conversation_id.clone() {
        Some(id) => id,
        None => store.create_conversation(&project.id, "Conversation")?.id,
    };

    let adapter = Arc::new(CodexAdapter::from_config(&cfg));
    let engine = Engine::start(Arc::clone(&store), adapter, EngineSettings::from_config(&cfg))?;
    let (trigger, _) =
        store.append_message(&conversation_id, NewMessage::new(Role::User, message))?;
    let run = engine.start_run(&conversation_id, &trigger.id, RunMode::Manual)?;
    info!(run_id = %run.id, "waiting for run");

    let run = engine.wait_for_run(&run.id, wait)?;
    if !run.status.is_terminal() {
        engine.cancel_run(&run.id)?;
        bail!("run {} did not finish within {:?}", run.id, wait);
    }
    engine.shutdown();

    let steps = store.run_steps(&run.id)?;
    let reply = store
        .transcript(&conversation_id, None, 1)?
        .pop()
        .map(|m| m.content);
    print_json(&SendReport {
        run: &run,
        steps,
        reply,
    })?;
    if run.status != RunStatus::Done {
        bail!("run {} ended {}", run.id, run.status);
    }
    Ok(())
}

/// Final state of a run printed by `stash send`.
#[derive(Serialize)]
struct SendReport<'a> {
    run: &'a Run,
    steps: Vec<RunStep>,
    reply: Option<String>,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("read current directory")?;
    Ok(cwd.join(path))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["stash", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG));
    }

    #[test]
    fn parse_send_with_config() {
        let cli = Cli::parse_from([
            "stash",
            "send",
            "--root",
            "/tmp/p",
            "create notes.md",
            "--config",
            "/tmp/c.toml",
        ]);
        match cli.command {
            Command::Send {
                root,
                message,
                wait_secs,
            } => {
                assert_eq!(root, PathBuf::from("/tmp/p"));
                assert_eq!(message, "create notes.md");
                assert_eq!(wait_secs, 3_600);
            }
            _ => panic!("expected send"),
        }
        assert_eq!(cli.config, PathBuf::from("/tmp/c.toml"));
    }

    #[test]
    fn check_plan_rejects_escape() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan_file = temp.path().join("reply.txt");
        fs::write(&plan_file, "<codex_cmd>\ncwd: /etc\ncmd: ls\n</codex_cmd>").expect("write");
        let err = cmd_check_plan(&temp.path().join("none.toml"), &plan_file, temp.path())
            .unwrap_err();
        assert!(err.to_string().contains("PolicyRejected"));
    }
}
