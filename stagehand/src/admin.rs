//! Operator commands that edit task and issue records directly: `init`,
//! `task`, `hold`, `activate`, `set-stage` and the issue commands.
//!
//! Every task mutation here happens under the task's claim, like a stage run.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::core::transition::{derive_status, plan_override};
use crate::core::types::{
    IssueRecord, IssueStatus, SessionRecord, SessionStatus, TaskName, TaskRecord, TaskStatus,
};
use crate::core::workflow::WorkflowKind;
use crate::error::StateError;
use crate::io::claims::ClaimHandle;
use crate::io::config::{StagehandConfig, write_config};
use crate::io::issues::IssueTracker;
use crate::io::paths::{StagehandPaths, config_path};
use crate::io::sessions::{fail_session, sessions_for_task};
use crate::io::tasks::{create_task, load_task, require_task, save_task};
use crate::workspace::Workspace;

/// What `init` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub config_written: bool,
    pub workflow_dir: PathBuf,
}

/// Create the config file (unless present) and the workflow directories.
pub fn init(root: &Path, kind: WorkflowKind) -> Result<InitReport> {
    let path = config_path(root);
    let config_written = if path.exists() {
        debug!(path = %path.display(), "config already present");
        false
    } else {
        let config = StagehandConfig {
            default_workflow: kind,
            ..StagehandConfig::default()
        };
        write_config(&path, &config)?;
        true
    };
    let paths = StagehandPaths::new(root, kind);
    paths.ensure_dirs()?;
    info!(root = %root.display(), workflow = %kind, config_written, "initialized");
    Ok(InitReport {
        config_written,
        workflow_dir: paths.workflow_dir,
    })
}

/// A task together with its history, as shown by `task <name>`.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub task: TaskRecord,
    pub created: bool,
    pub sessions: Vec<SessionRecord>,
    pub open_issues: Vec<IssueRecord>,
}

/// Create a task at the initial stage, or describe the existing one.
///
/// `hold` also applies to an existing task, through [`hold`].
#[instrument(skip_all, fields(task = %name))]
pub fn create_or_show(ws: &Workspace, name: &TaskName, hold: bool) -> Result<TaskView> {
    let created = match load_task(&ws.paths, ws.workflow, name)? {
        Some(existing) => {
            if hold && !existing.held {
                self::hold(ws, name)?;
            }
            false
        }
        None => {
            let dir = ws.paths.task_dir(name);
            fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
            let mut task = TaskRecord::new(name.clone(), ws.kind(), Utc::now());
            task.held = hold;
            match create_task(&ws.paths, &task) {
                Ok(()) => {
                    info!(stage = %task.stage, held = hold, "task created");
                    true
                }
                Err(StateError::AlreadyExists { .. }) => false,
                Err(err) => return Err(err.into()),
            }
        }
    };
    Ok(TaskView {
        task: require_task(&ws.paths, ws.workflow, name)?,
        created,
        sessions: sessions_for_task(&ws.paths, name)?,
        open_issues: ws.issues().open_for(name)?,
    })
}

pub fn render_task(ws: &Workspace, view: &TaskView) -> String {
    let task = &view.task;
    let mut out = String::new();
    if view.created {
        let _ = writeln!(out, "Created task: {}", task.name);
    } else {
        let _ = writeln!(out, "Task '{}'", task.name);
    }
    let _ = writeln!(out, "  Stage: {} ({})", task.stage, ws.workflow.label(&task.stage));
    let _ = writeln!(out, "  Status: {}", task.status);
    if task.held {
        let _ = writeln!(out, "  Held: yes (backlog)");
    }
    if let Some(error) = &task.last_error {
        let _ = writeln!(out, "  Last error: {error}");
    }
    if !view.open_issues.is_empty() {
        let _ = writeln!(out, "  Open issues: {}", view.open_issues.len());
    }
    if view.sessions.is_empty() {
        let _ = writeln!(out, "  History: (none yet)");
    } else {
        let history: Vec<String> = view
            .sessions
            .iter()
            .map(|session| {
                let mark = match session.status {
                    SessionStatus::Finished => "ok",
                    SessionStatus::Failed => "failed",
                    SessionStatus::Running => "running",
                };
                format!("{} [{mark}]", session.stage)
            })
            .collect();
        let _ = writeln!(out, "  History: {}", history.join(" -> "));
    }
    let _ = writeln!(out, "  Directory: {}", ws.paths.task_dir(&task.name).display());
    out
}

fn claim_task(ws: &Workspace, name: &TaskName) -> Result<(ClaimHandle, TaskRecord)> {
    let claim = ws.claims().acquire(name)?;
    let task = require_task(&ws.paths, ws.workflow, name)?;
    Ok((claim, task))
}

/// Move a task to the backlog. Refused while it runs.
pub fn hold(ws: &Workspace, name: &TaskName) -> Result<TaskRecord> {
    let (claim, mut task) = claim_task(ws, name)?;
    if task.status == TaskStatus::Running {
        return Err(StateError::InvalidTransition {
            task: name.to_string(),
            stage: task.stage.to_string(),
            detail: "task is running; finish or reconcile it before holding".to_string(),
        }
        .into());
    }
    task.held = true;
    task.touch(Utc::now());
    save_task(&ws.paths, &task)?;
    claim.release()?;
    info!(task = %name, "task held");
    Ok(task)
}

/// Clear the hold flag and revive a failed task.
pub fn activate(ws: &Workspace, name: &TaskName) -> Result<TaskRecord> {
    let (claim, mut task) = claim_task(ws, name)?;
    task.held = false;
    if task.status == TaskStatus::Failed {
        let open_issues = ws.issues().has_open_issues(name)?;
        task.status = derive_status(ws.workflow, &task.stage, open_issues);
        task.bounces = 0;
        task.last_error = None;
        info!(task = %name, status = %task.status, "failed task revived");
    }
    task.touch(Utc::now());
    save_task(&ws.paths, &task)?;
    claim.release()?;
    Ok(task)
}

/// Fail every running session of `name`. The caller holds the claim, so
/// whoever ran them is gone.
fn fail_orphaned_sessions(ws: &Workspace, name: &TaskName, reason: &str) -> Result<usize> {
    let now = Utc::now();
    let mut closed = 0;
    for mut session in sessions_for_task(&ws.paths, name)? {
        if session.is_running() {
            fail_session(&ws.paths, &mut session, reason, now)?;
            closed += 1;
        }
    }
    Ok(closed)
}

/// Administrative override of a task's stage and status.
#[instrument(skip_all, fields(task = %name, stage = stage))]
pub fn set_stage(
    ws: &Workspace,
    name: &TaskName,
    stage: &str,
    status: Option<TaskStatus>,
) -> Result<TaskRecord> {
    let stage = ws.workflow.parse_stage(stage)?;
    let (claim, mut task) = claim_task(ws, name)?;
    let open_issues = ws.issues().has_open_issues(name)?;
    let status = plan_override(ws.workflow, &task, &stage, status, open_issues)?;
    if task.status == TaskStatus::Running {
        let closed = fail_orphaned_sessions(ws, name, &format!("stage overridden to {stage}"))?;
        info!(closed, "closed sessions of overridden running task");
    }
    task.stage = stage;
    task.status = status;
    task.bounces = 0;
    task.last_error = None;
    task.touch(Utc::now());
    save_task(&ws.paths, &task)?;
    claim.release()?;
    info!(status = %task.status, "stage overridden");
    Ok(task)
}

/// Issues to list: open ones unless `all`, optionally for one task.
pub fn list_issues(ws: &Workspace, task: Option<&TaskName>, all: bool) -> Result<Vec<IssueRecord>> {
    Ok(ws
        .issues()
        .list()?
        .into_iter()
        .filter(|issue| all || issue.status == IssueStatus::Open)
        .filter(|issue| task.is_none_or(|task| &issue.task == task))
        .collect())
}

pub fn render_issues(issues: &[IssueRecord]) -> String {
    if issues.is_empty() {
        return "No issues\n".to_string();
    }
    let mut out = String::new();
    for issue in issues {
        let status = match issue.status {
            IssueStatus::Open => "open",
            IssueStatus::Resolved => "resolved",
        };
        let _ = write!(out, "{:<24} {:<9} {}: {}", issue.id, status, issue.task, issue.title);
        if let Some(stage) = &issue.stage {
            let _ = write!(out, " (back to {stage})");
        }
        out.push('\n');
    }
    out
}

/// Update a task's status if its claim is free; a running stage picks up
/// issue state at finish anyway.
fn update_if_idle(ws: &Workspace, name: &TaskName, update: impl FnOnce(&mut TaskRecord) -> bool) -> Result<()> {
    let claim = match ws.claims().acquire(name) {
        Ok(claim) => claim,
        Err(StateError::Busy { .. }) => {
            debug!(task = %name, "task busy; leaving status to its runner");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    let mut task = require_task(&ws.paths, ws.workflow, name)?;
    if update(&mut task) {
        task.touch(Utc::now());
        save_task(&ws.paths, &task)?;
    }
    claim.release()?;
    Ok(())
}

/// Open an issue against a task and flag the task.
pub fn add_issue(ws: &Workspace, name: &TaskName, title: &str, stage: Option<&str>) -> Result<IssueRecord> {
    let stage = stage.map(|raw| ws.workflow.parse_stage(raw)).transpose()?;
    require_task(&ws.paths, ws.workflow, name)?;
    let issue = ws.issues().open(name, title, stage, Utc::now())?;
    update_if_idle(ws, name, |task| {
        let flag = matches!(task.status, TaskStatus::Pending | TaskStatus::Incomplete);
        if flag {
            task.status = TaskStatus::Issues;
        }
        flag
    })?;
    Ok(issue)
}

/// Resolve an issue; the last one resolved returns its task to `pending`.
pub fn resolve_issue(ws: &Workspace, issue_id: &str) -> Result<IssueRecord> {
    let issue = ws.issues().resolve(issue_id, Utc::now())?;
    if !ws.issues().has_open_issues(&issue.task)?
        && load_task(&ws.paths, ws.workflow, &issue.task)?.is_some()
    {
        update_if_idle(ws, &issue.task, |task| {
            let clear = task.status == TaskStatus::Issues;
            if clear {
                task.status = TaskStatus::Pending;
            }
            clear
        })?;
    }
    Ok(issue)
}
