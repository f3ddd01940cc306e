//! Stagehand configuration stored under `.stagehand/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::selector::{DEFAULT_LOOP_LIMIT, LoopLimit};
use crate::core::workflow::WorkflowKind;

/// Stagehand configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StagehandConfig {
    /// Workflow used when neither `--workflow` nor `STAGEHAND_WORKFLOW` is set.
    pub default_workflow: WorkflowKind,

    /// Claim lease length. A claim older than this is stale.
    pub claim_ttl_secs: u64,

    /// Oscillation bounces tolerated before a task fails. `0` is unbounded.
    pub loop_limit: u32,

    /// How often a running stage checks for the finish signal.
    pub poll_interval_ms: u64,

    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Model command; the rendered prompt is appended as the last argument.
    pub command: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
        }
    }
}

impl Default for StagehandConfig {
    fn default() -> Self {
        Self {
            default_workflow: WorkflowKind::Code,
            claim_ttl_secs: 60 * 60,
            loop_limit: DEFAULT_LOOP_LIMIT,
            poll_interval_ms: 500,
            executor: ExecutorConfig::default(),
        }
    }
}

impl StagehandConfig {
    pub fn validate(&self) -> Result<()> {
        if self.claim_ttl_secs == 0 {
            return Err(anyhow!("claim_ttl_secs must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self
            .executor
            .command
            .first()
            .is_none_or(|program| program.trim().is_empty())
        {
            return Err(anyhow!("executor.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn loop_limit(&self) -> LoopLimit {
        LoopLimit::from_count(self.loop_limit)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `StagehandConfig::default()`.
pub fn load_config(path: &Path) -> Result<StagehandConfig> {
    if !path.exists() {
        let cfg = StagehandConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: StagehandConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &StagehandConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, StagehandConfig::default());
        assert_eq!(cfg.loop_limit(), LoopLimit::Bounded(4));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".stagehand/config.toml");
        let cfg = StagehandConfig {
            default_workflow: WorkflowKind::Writer,
            loop_limit: 0,
            ..StagehandConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.loop_limit(), LoopLimit::Unbounded);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "claim_ttl_secs = 30\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.claim_ttl_secs, 30);
        assert_eq!(cfg.executor, ExecutorConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[executor]\ncommand = []\n").expect("write");
        let err = load_config(&path).expect_err("empty command");
        assert!(format!("{err:#}").contains("executor.command"), "{err:#}");

        fs::write(&path, "claim_ttl_secs = 0\n").expect("write");
        assert!(load_config(&path).is_err());
    }
}
