//! The resolved context every command runs in.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use crate::core::types::Owner;
use crate::core::workflow::{Workflow, WorkflowKind};
use crate::io::claims::ClaimManager;
use crate::io::config::{StagehandConfig, load_config};
use crate::io::issues::FileIssueTracker;
use crate::io::paths::{StagehandPaths, config_path, discover_root};
use crate::io::process::{ProcessProbe, SystemProbe, current_owner};

/// Session id inherited by the model process.
pub const SESSION_ENV: &str = "STAGEHAND_SESSION";
pub const TASK_ENV: &str = "STAGEHAND_TASK";
pub const WORKFLOW_ENV: &str = "STAGEHAND_WORKFLOW";
pub const REPO_ROOT_ENV: &str = "STAGEHAND_REPO_ROOT";
/// Loop limit of the `run-queue` that started the model process.
pub const LOOP_LIMIT_ENV: &str = "STAGEHAND_LOOP_LIMIT";

/// Repository, workflow, configuration and process identity for one command.
pub struct Workspace {
    pub paths: StagehandPaths,
    pub workflow: &'static dyn Workflow,
    pub config: StagehandConfig,
    pub owner: Owner,
    probe: Box<dyn ProcessProbe>,
}

impl Workspace {
    /// Open the workspace rooted at `root`.
    ///
    /// `kind` falls back to the configured default workflow.
    pub fn open(root: &Path, kind: Option<WorkflowKind>) -> Result<Self> {
        let config = load_config(&config_path(root))?;
        let kind = kind.unwrap_or(config.default_workflow);
        debug!(root = %root.display(), workflow = %kind, "workspace opened");
        Ok(Self {
            paths: StagehandPaths::new(root, kind),
            workflow: kind.definition(),
            config,
            owner: current_owner(),
            probe: Box::new(SystemProbe),
        })
    }

    /// Replace the liveness probe (tests script process deaths with this).
    pub fn with_probe(mut self, probe: impl ProcessProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    pub fn kind(&self) -> WorkflowKind {
        self.workflow.kind()
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn claims(&self) -> ClaimManager<'_> {
        ClaimManager::new(
            &self.paths,
            self.owner.clone(),
            self.config.claim_ttl(),
            self.probe.as_ref(),
        )
    }

    pub fn issues(&self) -> FileIssueTracker<'_> {
        FileIssueTracker::new(&self.paths, self.workflow)
    }
}

/// Pick the repository root: explicit, then environment, then discovery.
pub fn resolve_root(explicit: Option<PathBuf>, env_value: Option<PathBuf>, cwd: &Path) -> PathBuf {
    explicit
        .or(env_value)
        .or_else(|| discover_root(cwd))
        .unwrap_or_else(|| cwd.to_path_buf())
}
