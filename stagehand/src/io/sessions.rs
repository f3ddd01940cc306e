//! Session lifecycle: open, resolve, close.
//!
//! Sessions are an append-only audit trail. A session is written once as
//! `running` and once more when it closes; after that it is only ever
//! deleted, together with its task.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::types::{
    Owner, RECORD_VERSION, SessionRecord, SessionStatus, TaskName, TaskRecord, TaskStatus,
};
use crate::core::workflow::{Stage, Workflow};
use crate::error::{EntityKind, StateError, StateResult};
use crate::io::paths::StagehandPaths;
use crate::io::store::{create_record, list_records, read_record, remove_record, write_record};
use crate::io::tasks::{load_task, save_task};

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Attempts before giving up on finding an unused session id.
const SESSION_ID_ATTEMPTS: usize = 16;

/// `<unix-secs>-<pid>-<seq>`: sortable by time, unique per process.
pub fn new_session_id(now: DateTime<Utc>, pid: u32) -> String {
    let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{pid}-{seq}", now.timestamp())
}

pub fn load_session(paths: &StagehandPaths, session_id: &str) -> StateResult<Option<SessionRecord>> {
    if !is_session_id(session_id) {
        return Ok(None);
    }
    read_record(&paths.session_path(session_id))
}

pub fn require_session(paths: &StagehandPaths, session_id: &str) -> StateResult<SessionRecord> {
    load_session(paths, session_id)?
        .ok_or_else(|| StateError::not_found(EntityKind::Session, session_id))
}

fn is_session_id(raw: &str) -> bool {
    let parts: Vec<_> = raw.split('-').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// Every readable session. Corrupt files are logged and skipped.
pub fn list_sessions(paths: &StagehandPaths) -> StateResult<Vec<SessionRecord>> {
    let mut sessions = Vec::new();
    for result in list_records::<SessionRecord>(&paths.sessions_dir)? {
        match result {
            Ok(session) => sessions.push(session),
            Err(err) => warn!(err = %err, "skipping unreadable session record"),
        }
    }
    sessions.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    Ok(sessions)
}

/// Sessions of one task, oldest first.
pub fn sessions_for_task(paths: &StagehandPaths, task: &TaskName) -> StateResult<Vec<SessionRecord>> {
    Ok(list_sessions(paths)?
        .into_iter()
        .filter(|session| &session.task == task)
        .collect())
}

/// Delete every session record of `task`. Returns how many were removed.
pub fn remove_sessions_for(paths: &StagehandPaths, task: &TaskName) -> StateResult<usize> {
    let mut removed = 0;
    for session in sessions_for_task(paths, task)? {
        if remove_record(&paths.session_path(&session.session_id))? {
            removed += 1;
        }
    }
    debug!(task = %task, removed, "session records removed");
    Ok(removed)
}

/// Start a session for `task` at its current stage and mark the task running.
///
/// The caller must hold the task's claim. The session is created with
/// create-if-absent, so an id collision fails instead of overwriting history.
pub fn open_session(
    paths: &StagehandPaths,
    task: &mut TaskRecord,
    owner: &Owner,
    now: DateTime<Utc>,
) -> StateResult<SessionRecord> {
    let mut last_err = None;
    for _ in 0..SESSION_ID_ATTEMPTS {
        let session = SessionRecord {
            version: RECORD_VERSION,
            session_id: new_session_id(now, owner.pid),
            task: task.name.clone(),
            workflow: task.workflow,
            stage: task.stage.clone(),
            status: SessionStatus::Running,
            started_at: now,
            finished_at: None,
            next_stage: None,
            owner: owner.clone(),
            error: None,
        };
        match create_record(&paths.session_path(&session.session_id), &session) {
            Ok(()) => {
                task.status = TaskStatus::Running;
                task.last_session = Some(session.session_id.clone());
                task.last_error = None;
                task.touch(now);
                save_task(paths, task)?;
                info!(task = %task.name, stage = %session.stage, session = %session.session_id, "session opened");
                return Ok(session);
            }
            Err(err @ StateError::AlreadyExists { .. }) => {
                debug!(session = %session.session_id, "session id collision, retrying");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| StateError::AlreadyExists {
        path: paths.sessions_dir.clone(),
    }))
}

/// Filters narrowing the implicit session lookup.
#[derive(Debug, Clone, Default)]
pub struct SessionQuery<'a> {
    /// `--session`.
    pub explicit: Option<&'a str>,
    /// Inherited from the environment of a process started by a stage run.
    pub env_fallback: Option<&'a str>,
    pub stage: Option<&'a Stage>,
    pub task: Option<&'a TaskName>,
}

/// Resolve "the" session a command refers to.
///
/// Order: explicit id, then the environment fallback, then the single running
/// session matching the filters. Zero or several matches is `Ambiguous`.
pub fn resolve_active(paths: &StagehandPaths, query: &SessionQuery<'_>) -> StateResult<SessionRecord> {
    if let Some(id) = query.explicit.or(query.env_fallback) {
        let session = require_session(paths, id)?;
        if let Some(task) = query.task
            && &session.task != task
        {
            return Err(StateError::InvalidTransition {
                task: task.to_string(),
                stage: session.stage.to_string(),
                detail: format!("session {id} belongs to task {}", session.task),
            });
        }
        return Ok(session);
    }

    let mut candidates: Vec<SessionRecord> = list_sessions(paths)?
        .into_iter()
        .filter(|session| session.is_running())
        .filter(|session| query.stage.is_none_or(|stage| &session.stage == stage))
        .filter(|session| query.task.is_none_or(|task| &session.task == task))
        .collect();

    if candidates.len() == 1
        && let Some(session) = candidates.pop()
    {
        return Ok(session);
    }
    let reason = if candidates.is_empty() {
        format!("no running session{}", describe_filters(query))
    } else {
        format!("{} running sessions{}", candidates.len(), describe_filters(query))
    };
    Err(StateError::Ambiguous {
        reason,
        candidates: candidates
            .iter()
            .map(|session| format!("{} ({} @ {})", session.session_id, session.task, session.stage))
            .collect(),
    })
}

fn describe_filters(query: &SessionQuery<'_>) -> String {
    let mut parts = Vec::new();
    if let Some(task) = query.task {
        parts.push(format!("task {task}"));
    }
    if let Some(stage) = query.stage {
        parts.push(format!("stage {stage}"));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" for {}", parts.join(", "))
    }
}

/// Mark a session finished with the stage it advanced to.
pub fn close_finished(
    paths: &StagehandPaths,
    session: &mut SessionRecord,
    next_stage: &Stage,
    now: DateTime<Utc>,
) -> StateResult<()> {
    session.status = SessionStatus::Finished;
    session.finished_at = Some(now.max(session.started_at));
    session.next_stage = Some(next_stage.clone());
    write_record(&paths.session_path(&session.session_id), session)
}

/// Mark a running session `failed` without touching its task.
pub fn fail_session(
    paths: &StagehandPaths,
    session: &mut SessionRecord,
    reason: &str,
    now: DateTime<Utc>,
) -> StateResult<()> {
    if !session.is_running() {
        return Ok(());
    }
    session.status = SessionStatus::Failed;
    session.finished_at = Some(now.max(session.started_at));
    session.error = Some(reason.to_string());
    write_record(&paths.session_path(&session.session_id), session)?;
    warn!(task = %session.task, session = %session.session_id, reason, "session closed abnormally");
    Ok(())
}

/// Close a session whose process ended without finishing.
///
/// The session becomes `failed`. Its task, if still `running`, becomes
/// `incomplete` so the scheduler can resume it.
pub fn close_abnormal(
    paths: &StagehandPaths,
    workflow: &dyn Workflow,
    session: &mut SessionRecord,
    reason: &str,
    now: DateTime<Utc>,
) -> StateResult<Option<TaskRecord>> {
    fail_session(paths, session, reason, now)?;

    let Some(mut task) = load_task(paths, workflow, &session.task)? else {
        return Ok(None);
    };
    if task.status != TaskStatus::Running {
        return Ok(Some(task));
    }
    task.status = TaskStatus::Incomplete;
    task.last_error = Some(format!("session {}: {reason}", session.session_id));
    task.touch(now);
    save_task(paths, &task)?;
    Ok(Some(task))
}
