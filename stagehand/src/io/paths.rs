//! Canonical locations under `.stagehand/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::types::TaskName;
use crate::core::workflow::{Stage, WorkflowKind};

/// Name of the state directory at the repository root.
pub const STATE_DIR: &str = ".stagehand";

/// Location of the shared config file for a repository root.
pub fn config_path(root: &Path) -> PathBuf {
    root.join(STATE_DIR).join("config.toml")
}

/// All canonical paths for one workflow kind in one repository.
#[derive(Debug, Clone)]
pub struct StagehandPaths {
    pub kind: WorkflowKind,
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub workflow_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub claims_dir: PathBuf,
    pub issues_dir: PathBuf,
    pub prompts_dir: PathBuf,
}

impl StagehandPaths {
    pub fn new(root: impl Into<PathBuf>, kind: WorkflowKind) -> Self {
        let root = root.into();
        let state_dir = root.join(STATE_DIR);
        let workflow_dir = state_dir.join(kind.as_str());
        Self {
            kind,
            root: root.clone(),
            state_dir: state_dir.clone(),
            config_path: config_path(&root),
            workflow_dir: workflow_dir.clone(),
            tasks_dir: workflow_dir.join("tasks"),
            sessions_dir: workflow_dir.join("sessions"),
            claims_dir: workflow_dir.join("claims"),
            issues_dir: workflow_dir.join("issues"),
            prompts_dir: workflow_dir.join("prompts"),
        }
    }

    /// Directory owned by one task; removed with the task.
    pub fn task_dir(&self, name: &TaskName) -> PathBuf {
        self.tasks_dir.join(name.as_str())
    }

    pub fn task_path(&self, name: &TaskName) -> PathBuf {
        self.task_dir(name).join("task.json")
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json"))
    }

    pub fn claim_path(&self, name: &TaskName) -> PathBuf {
        self.claims_dir.join(format!("{name}.json"))
    }

    pub fn issue_path(&self, issue_id: &str) -> PathBuf {
        self.issues_dir.join(format!("{issue_id}.json"))
    }

    pub fn prompt_override(&self, stage: &Stage) -> PathBuf {
        self.prompts_dir.join(format!("{stage}.md"))
    }

    /// Create every record directory for this workflow kind.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.tasks_dir,
            &self.sessions_dir,
            &self.claims_dir,
            &self.issues_dir,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Walk up from `start` to the first directory holding `.stagehand/` or `.git/`.
pub fn discover_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(STATE_DIR).is_dir())
        .or_else(|| start.ancestors().find(|dir| dir.join(".git").exists()))
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_keyed_by_workflow_kind() {
        let paths = StagehandPaths::new("/repo", WorkflowKind::Writer);
        let name = TaskName::parse("essay").expect("name");
        assert_eq!(
            paths.task_path(&name),
            PathBuf::from("/repo/.stagehand/writer/tasks/essay/task.json")
        );
        assert_eq!(
            paths.claim_path(&name),
            PathBuf::from("/repo/.stagehand/writer/claims/essay.json")
        );
        assert_eq!(
            paths.session_path("1-2-3"),
            PathBuf::from("/repo/.stagehand/writer/sessions/1-2-3.json")
        );
        assert_eq!(paths.config_path, PathBuf::from("/repo/.stagehand/config.toml"));
    }

    #[test]
    fn discover_prefers_state_dir_over_git() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outer = temp.path();
        fs::create_dir_all(outer.join(".git")).expect("git dir");
        let inner = outer.join("pkg");
        fs::create_dir_all(inner.join(STATE_DIR)).expect("state dir");
        let deep = inner.join("src/bin");
        fs::create_dir_all(&deep).expect("deep");

        assert_eq!(discover_root(&deep), Some(inner.clone()));
        fs::remove_dir_all(inner.join(STATE_DIR)).expect("remove state");
        assert_eq!(discover_root(&deep), Some(outer.to_path_buf()));
    }
}
