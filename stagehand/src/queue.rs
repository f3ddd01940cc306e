//! The queue: a view derived from per-task records, never stored itself.

use std::collections::HashMap;
use std::fmt::Write as _;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, instrument};

use crate::core::selector::{QueueView, group_by_stage};
use crate::core::types::{IssueStatus, TaskName, TaskRecord};
use crate::error::{EntityKind, StateError};
use crate::io::sessions::remove_sessions_for;
use crate::io::tasks::{create_task, load_task, remove_task_dir, scan_tasks};
use crate::workspace::Workspace;

/// Derived queue plus what was found along the way.
#[derive(Debug, Default)]
pub struct QueueListing {
    pub view: QueueView,
    /// Task directories adopted as new pending tasks by this listing.
    pub adopted: Vec<TaskName>,
    /// Records that exist but could not be read. Never defaulted.
    pub corrupt: Vec<StateError>,
}

impl QueueListing {
    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.view
            .groups
            .iter()
            .flat_map(|group| group.tasks.iter().cloned())
            .chain(self.view.held.iter().cloned())
            .collect()
    }
}

/// Scan every task, adopting task directories that have no record yet.
///
/// Adoption uses create-if-absent, so two listings racing on the same new
/// directory produce one record.
#[instrument(skip_all, fields(workflow = %ws.kind()))]
pub fn list_view(ws: &Workspace) -> Result<QueueListing> {
    let scan = scan_tasks(&ws.paths, ws.workflow)?;
    let mut tasks = scan.tasks;
    let mut listing = QueueListing {
        corrupt: scan.corrupt,
        ..QueueListing::default()
    };
    for name in scan.untracked {
        let task = TaskRecord::new(name.clone(), ws.kind(), Utc::now());
        match create_task(&ws.paths, &task) {
            Ok(()) => {
                info!(task = %name, stage = %task.stage, "adopted untracked task directory");
                listing.adopted.push(name);
                tasks.push(task);
            }
            Err(StateError::AlreadyExists { .. }) => match load_task(&ws.paths, ws.workflow, &name) {
                Ok(Some(existing)) => tasks.push(existing),
                Ok(None) => {}
                Err(err) => listing.corrupt.push(err),
            },
            Err(err) => return Err(err.into()),
        }
    }
    for err in &listing.corrupt {
        error!(err = %err, "corrupt task record; fix or remove it by hand");
    }
    listing.view = group_by_stage(ws.workflow, tasks);
    Ok(listing)
}

/// Outcome of `queue <task>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Adopted(TaskRecord),
    Existing(TaskRecord),
}

/// Track an existing task directory, or report the task already tracked.
pub fn enqueue(ws: &Workspace, name: &TaskName) -> Result<Enqueued> {
    if let Some(task) = load_task(&ws.paths, ws.workflow, name)? {
        return Ok(Enqueued::Existing(task));
    }
    if !ws.paths.task_dir(name).is_dir() {
        return Err(StateError::not_found(EntityKind::Task, name.as_str()).into());
    }
    let task = TaskRecord::new(name.clone(), ws.kind(), Utc::now());
    match create_task(&ws.paths, &task) {
        Ok(()) => {
            info!(task = %name, "queued task directory");
            Ok(Enqueued::Adopted(task))
        }
        Err(StateError::AlreadyExists { .. }) => {
            let existing = load_task(&ws.paths, ws.workflow, name)?
                .ok_or_else(|| StateError::not_found(EntityKind::Task, name.as_str()))?;
            Ok(Enqueued::Existing(existing))
        }
        Err(err) => Err(err.into()),
    }
}

/// What `dequeue` deleted besides the task directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dequeued {
    pub sessions: usize,
    pub issues: usize,
}

/// Remove a task, its directory, its sessions and its issues.
///
/// Refuses while a live owner holds the claim; a stale claim is removed too.
/// Open issues block removal unless `force` is set, in which case they are
/// deleted with the task so a later task of the same name starts clean.
#[instrument(skip_all, fields(task = %name, force))]
pub fn dequeue(ws: &Workspace, name: &TaskName, force: bool) -> Result<Dequeued> {
    let claims = ws.claims();
    let _claim = claims.acquire(name)?;
    if !ws.paths.task_dir(name).exists() {
        return Err(StateError::not_found(EntityKind::Task, name.as_str()).into());
    }
    let issues = ws.issues();
    let open = issues.open_for(name)?;
    if !open.is_empty() && !force {
        let stage = load_task(&ws.paths, ws.workflow, name)?
            .map_or_else(|| "unknown".to_string(), |task| task.stage.to_string());
        return Err(StateError::InvalidTransition {
            task: name.to_string(),
            stage,
            detail: format!(
                "{} open issue(s); resolve them or pass --force to delete them with the task",
                open.len()
            ),
        }
        .into());
    }

    let removed = Dequeued {
        issues: issues.remove_for(name)?,
        sessions: remove_sessions_for(&ws.paths, name)?,
    };
    remove_task_dir(&ws.paths, name)?;
    info!(sessions = removed.sessions, issues = removed.issues, "task removed");
    Ok(removed)
}

/// Human-readable queue, grouped by stage, held tasks last.
pub fn render_queue(ws: &Workspace, listing: &QueueListing) -> Result<String> {
    let mut out = String::new();
    if listing.view.is_empty() {
        out.push_str("No tasks\n");
    }
    let mut open_issues: HashMap<TaskName, usize> = HashMap::new();
    for issue in ws.issues().list()? {
        if issue.status == IssueStatus::Open {
            *open_issues.entry(issue.task).or_default() += 1;
        }
    }
    let issue_note = |task: &TaskRecord| match open_issues.get(&task.name) {
        Some(1) => " [1 open issue]".to_string(),
        Some(n) => format!(" [{n} open issues]"),
        None => String::new(),
    };

    for group in &listing.view.groups {
        let _ = writeln!(out, "{}", group.label);
        for task in &group.tasks {
            let _ = writeln!(out, "  {:<10} {}{}", task.status.as_str(), task.name, issue_note(task));
        }
    }
    if !listing.view.held.is_empty() {
        let _ = writeln!(out, "Backlog (held)");
        for task in &listing.view.held {
            let _ = writeln!(
                out,
                "  {:<10} {} ({}){}",
                task.status.as_str(),
                task.name,
                task.stage,
                issue_note(task)
            );
        }
    }
    if !listing.corrupt.is_empty() {
        let _ = writeln!(out, "Unreadable");
        for err in &listing.corrupt {
            let _ = writeln!(out, "  {err}");
        }
    }
    Ok(out)
}
