//! Executor abstraction for running one stage of a task.
//!
//! The [`Executor`] trait decouples stage orchestration from the external
//! model process. Tests use scripted executors that act out a model (finish,
//! exit early, get interrupted) without spawning anything.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::process::{ChildEnd, Watch, spawn_attached, supervise};

/// Parameters for one stage invocation.
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// Working directory for the model process (the repository root).
    pub workdir: PathBuf,
    /// Program and leading arguments; the prompt is appended.
    pub command: Vec<String>,
    pub prompt: String,
    /// Extra environment handed to the model process.
    pub env: Vec<(String, String)>,
    /// How often `watch` is consulted while the process runs.
    pub poll_interval: Duration,
}

impl StageRequest {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// How a stage invocation ended, from the supervisor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecExit {
    /// The process exited by itself.
    Exited(Option<i32>),
    /// The process was stopped after the finish signal.
    Stopped,
    Interrupted,
}

/// Abstraction over model process backends.
pub trait Executor {
    /// Run the stage. `watch` is polled while the process runs and decides
    /// whether it should keep running.
    fn exec(
        &self,
        request: &StageRequest,
        watch: &mut dyn FnMut() -> Result<Watch>,
    ) -> Result<ExecExit>;
}

/// Executor that spawns the configured command attached to the terminal.
pub struct CommandExecutor;

impl Executor for CommandExecutor {
    #[instrument(skip_all, fields(program = request.command.first().map(String::as_str).unwrap_or_default()))]
    fn exec(
        &self,
        request: &StageRequest,
        watch: &mut dyn FnMut() -> Result<Watch>,
    ) -> Result<ExecExit> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| anyhow!("executor command is empty"))?;
        info!(workdir = %request.workdir.display(), "starting model process");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&request.prompt)
            .current_dir(&request.workdir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child =
            spawn_attached(cmd).with_context(|| format!("run model command {program}"))?;
        let end = supervise(&mut child, request.poll_interval, watch)?;
        Ok(match end {
            ChildEnd::Exited(status) => {
                if !status.success() {
                    warn!(exit_code = ?status.code(), "model process exited with failure");
                }
                ExecExit::Exited(status.code())
            }
            ChildEnd::Stopped => ExecExit::Stopped,
            ChildEnd::Interrupted => ExecExit::Interrupted,
        })
    }
}
