//! Stash configuration stored as TOML (default `.stash/config.toml`).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::core::policy::CommandPolicy;

/// Top-level configuration.
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StashConfig {
    /// SQLite database holding every project's history.
    pub database_path: PathBuf,

    /// Truncate captured stdout/stderr beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    pub planner: AgentCommandConfig,
    pub executor: AgentCommandConfig,
    pub engine: EngineConfig,
    pub policy: PolicyConfig,
    pub server: ServerConfig,
}

/// Argv template and deadline for one external agent binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentCommandConfig {
    /// Program followed by arguments; input is piped over stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl AgentCommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads processing runs.
    pub workers: usize,
    /// Most recent messages included in the planner transcript.
    pub transcript_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Command segments starting with any of these (whole word, case-insensitive) are refused.
    pub deny_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(".stash/stash.db"),
            output_limit_bytes: 200_000,
            planner: AgentCommandConfig {
                command: argv(&["codex", "exec", "--skip-git-repo-check", "-"]),
                timeout_secs: 10 * 60,
            },
            executor: AgentCommandConfig {
                command: argv(&["codex", "exec", "--full-auto", "--skip-git-repo-check", "-"]),
                timeout_secs: 30 * 60,
            },
            engine: EngineConfig::default(),
            policy: PolicyConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            transcript_limit: 50,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            deny_prefixes: argv(&[
                "sudo", "su", "doas", "rm -rf /", "rm -rf ~", "mkfs", "dd", "shutdown", "reboot",
                "curl", "wget", "ssh", "scp", "nc", "git push",
            ]),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

impl StashConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.output_limit_bytes > 0, "output_limit_bytes must be > 0");
        for (name, agent) in [("planner", &self.planner), ("executor", &self.executor)] {
            let program = agent.command.first().map(|p| p.trim()).unwrap_or_default();
            ensure!(!program.is_empty(), "{name}.command must name a program");
            ensure!(agent.timeout_secs > 0, "{name}.timeout_secs must be > 0");
        }
        ensure!(self.engine.workers > 0, "engine.workers must be > 0");
        ensure!(
            self.engine.transcript_limit > 0,
            "engine.transcript_limit must be > 0"
        );
        Ok(())
    }

    pub fn command_policy(&self) -> CommandPolicy {
        CommandPolicy::new(&self.policy.deny_prefixes)
    }
}

/// Read the config at `path`; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<StashConfig> {
    let cfg = match fs::read_to_string(path) {
        Ok(text) => toml::from_str::<StashConfig>(&text)
            .with_context(|| format!("invalid config {}", path.display()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => StashConfig::default(),
        Err(err) => {
            return Err(err).with_context(|| format!("cannot read config {}", path.display()));
        }
    };
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Write `cfg` next to `path` and rename it into place, creating parent directories.
pub fn write_config(path: &Path, cfg: &StashConfig) -> Result<()> {
    cfg.validate()?;
    let text = format!("{}\n", toml::to_string_pretty(cfg).context("encode config")?);

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;

    let staged = path.with_extension("toml.partial");
    fs::write(&staged, text).with_context(|| format!("cannot write {}", staged.display()))?;
    fs::rename(&staged, path).with_context(|| format!("cannot install {}", path.display()))
}

fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
