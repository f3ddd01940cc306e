//! Stage runs and the loops that drive them: `run`, `run-next`, `run-queue`,
//! plus crash reconciliation.
//!
//! Every stage run happens under the task's claim. The claim is renewed from
//! the executor's watch loop so a long stage never looks stale to others.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::selector::{LoopLimit, eligible, is_eligible};
use crate::core::transition::plan_replay;
use crate::core::types::{SessionStatus, TaskName, TaskRecord, TaskStatus};
use crate::core::workflow::Stage;
use crate::error::StateError;
use crate::finish::settle_task;
use crate::io::claims::ClaimHandle;
use crate::io::executor::{ExecExit, Executor, StageRequest};
use crate::io::issues::IssueTracker;
use crate::io::process::{Watch, interrupted};
use crate::io::prompt::{PromptEngine, PromptInputs};
use crate::io::sessions::{
    close_abnormal, fail_session, load_session, open_session, require_session, sessions_for_task,
};
use crate::io::tasks::{load_task, require_task, save_task, scan_tasks};
use crate::queue::list_view;
use crate::workspace::{
    LOOP_LIMIT_ENV, REPO_ROOT_ENV, SESSION_ENV, TASK_ENV, WORKFLOW_ENV, Workspace,
};

/// How one stage run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Finish was called; the task moved to `to`.
    Finished { to: Stage, status: TaskStatus },
    /// The model process ended without calling finish.
    NoFinish { exit_code: Option<i32> },
    Interrupted,
}

/// One stage run of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRun {
    pub task: TaskName,
    pub session_id: String,
    pub stage: Stage,
    pub outcome: StageOutcome,
}

impl fmt::Display for StageRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            StageOutcome::Finished { to, status } => {
                write!(f, "{}: {} -> {to} ({status})", self.task, self.stage)
            }
            StageOutcome::NoFinish { exit_code } => {
                write!(f, "{}: {} ended without finish", self.task, self.stage)?;
                if let Some(code) = exit_code {
                    write!(f, " (exit code {code})")?;
                }
                write!(f, "; run `stagehand run {}` to continue", self.task)
            }
            StageOutcome::Interrupted => write!(
                f,
                "{}: {} interrupted; run `stagehand run {}` to continue",
                self.task, self.stage, self.task
            ),
        }
    }
}

fn stage_env(ws: &Workspace, session_id: &str, task: &TaskName, loop_limit: LoopLimit) -> Vec<(String, String)> {
    vec![
        (SESSION_ENV.to_string(), session_id.to_string()),
        (TASK_ENV.to_string(), task.to_string()),
        (WORKFLOW_ENV.to_string(), ws.kind().to_string()),
        (REPO_ROOT_ENV.to_string(), ws.root().display().to_string()),
        (LOOP_LIMIT_ENV.to_string(), loop_limit.to_string()),
    ]
}

/// Interval between lease renewals while a stage runs.
fn renew_interval(ws: &Workspace) -> Duration {
    (ws.config.claim_ttl() / 4).max(Duration::from_millis(100))
}

/// Run the current stage of the claimed task once.
///
/// Opens a session, hands the rendered prompt to `executor` and waits for the
/// finish signal. A session still running afterwards is closed abnormally and
/// its task becomes `incomplete`.
#[instrument(skip_all, fields(task = %claim.task()))]
pub fn run_stage<E: Executor + ?Sized>(
    ws: &Workspace,
    executor: &E,
    claim: &mut ClaimHandle,
    loop_limit: LoopLimit,
) -> Result<StageRun> {
    let name = claim.task().clone();
    let mut task = require_task(&ws.paths, ws.workflow, &name)?;
    let issues = ws.issues();
    let has_issues = issues.has_open_issues(&name)?;
    let reentry = issues.preferred_reentry_stage(&name)?;

    let session = open_session(&ws.paths, &mut task, &ws.owner, Utc::now())?;
    let session_id = session.session_id.clone();
    let stage = session.stage.clone();
    let prompt = PromptEngine::new().render_stage(
        &ws.paths,
        ws.workflow,
        &PromptInputs {
            task: name.as_str(),
            stage: &stage,
            session_id: &session_id,
            has_issues,
            reentry_stage: &reentry,
        },
    );
    let prompt = match prompt {
        Ok(prompt) => prompt,
        Err(err) => {
            let mut session = session;
            close_abnormal(&ws.paths, ws.workflow, &mut session, "prompt rendering failed", Utc::now())?;
            return Err(err);
        }
    };
    let request = StageRequest {
        workdir: ws.root().to_path_buf(),
        command: ws.config.executor.command.clone(),
        prompt,
        env: stage_env(ws, &session_id, &name, loop_limit),
        poll_interval: ws.config.poll_interval(),
    };

    let renew_every = renew_interval(ws);
    let mut last_renewal = Instant::now();
    let mut watch = || -> Result<Watch> {
        if interrupted() {
            return Ok(Watch::Interrupt);
        }
        if last_renewal.elapsed() >= renew_every {
            claim.renew()?;
            last_renewal = Instant::now();
        }
        let current = require_session(&ws.paths, &session_id)?;
        Ok(if current.is_running() {
            Watch::Continue
        } else {
            Watch::Stop
        })
    };
    info!(stage = %stage, session = %session_id, "stage started");
    let exit = executor.exec(&request, &mut watch);

    let mut current = require_session(&ws.paths, &session_id)?;
    let exit = match exit {
        Ok(exit) => exit,
        Err(err) => {
            close_abnormal(&ws.paths, ws.workflow, &mut current, &format!("executor failed: {err:#}"), Utc::now())?;
            return Err(err.context(format!("run stage {stage} of {name}")));
        }
    };

    let outcome = if current.status == SessionStatus::Finished {
        let mut task = require_task(&ws.paths, ws.workflow, &name)?;
        let open_issues = issues.has_open_issues(&name)?;
        if task.status == TaskStatus::Running
            && let Some(plan) = plan_replay(ws.workflow, &task, &current, open_issues, loop_limit)
        {
            // The session write of finish landed, the task write has not.
            settle_task(&mut task, &plan, &current.session_id, Utc::now());
            save_task(&ws.paths, &task).with_context(|| format!("update task {name}"))?;
            warn!(session = %session_id, to = %task.stage, "applied finish whose task write was pending");
        }
        StageOutcome::Finished {
            to: task.stage.clone(),
            status: task.status,
        }
    } else {
        let (reason, outcome) = match exit {
            ExecExit::Interrupted => ("interrupted".to_string(), StageOutcome::Interrupted),
            ExecExit::Exited(code) => (
                match code {
                    Some(code) => format!("model process exited with code {code} without calling finish"),
                    None => "model process was killed without calling finish".to_string(),
                },
                StageOutcome::NoFinish { exit_code: code },
            ),
            ExecExit::Stopped => (
                "model process stopped without calling finish".to_string(),
                StageOutcome::NoFinish { exit_code: None },
            ),
        };
        close_abnormal(&ws.paths, ws.workflow, &mut current, &reason, Utc::now())?;
        outcome
    };
    info!(stage = %stage, session = %session_id, outcome = ?outcome, "stage ended");
    Ok(StageRun {
        task: name,
        session_id,
        stage,
        outcome,
    })
}

/// Options of `run <task>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Stop once the task reaches the workflow's handoff stage.
    pub handoff: bool,
    pub loop_limit: LoopLimit,
}

/// Why `run_task` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    Completed,
    Handoff(Stage),
    Failed(Option<String>),
    NoFinish,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub task: TaskName,
    pub stages: Vec<StageRun>,
    pub stop: RunStop,
}

/// Bring a claimed task into a runnable state.
///
/// Recovers an orphaned `running` status, clears the hold flag, and refuses a
/// failed task.
fn prepare_claimed(ws: &Workspace, name: &TaskName) -> Result<TaskRecord> {
    let mut task = require_task(&ws.paths, ws.workflow, name)?;
    if task.status == TaskStatus::Running {
        if let Some(recovery) = recover_task(ws, task)? {
            println!("{recovery}");
        }
        task = require_task(&ws.paths, ws.workflow, name)?;
    }
    if task.status == TaskStatus::Failed {
        return Err(StateError::InvalidTransition {
            task: name.to_string(),
            stage: task.stage.to_string(),
            detail: format!(
                "task failed ({}); run `stagehand activate {name}` first",
                task.last_error.as_deref().unwrap_or("no diagnostic")
            ),
        }
        .into());
    }
    if task.held {
        task.held = false;
        task.touch(Utc::now());
        save_task(&ws.paths, &task)?;
        info!(task = %name, "activated held task");
    }
    Ok(task)
}

/// Run a task's stages until it completes, fails or stops.
#[instrument(skip_all, fields(task = %name))]
pub fn run_task<E: Executor + ?Sized, F: FnMut(&StageRun)>(
    ws: &Workspace,
    executor: &E,
    name: &TaskName,
    options: RunOptions,
    mut on_stage: F,
) -> Result<RunReport> {
    let mut claim = ws.claims().acquire(name)?;
    let mut task = prepare_claimed(ws, name)?;
    let handoff = options
        .handoff
        .then(|| ws.workflow.handoff_stage())
        .flatten();
    let mut stages = Vec::new();

    let stop = loop {
        if ws.workflow.is_terminal(&task.stage) {
            break RunStop::Completed;
        }
        if task.status == TaskStatus::Failed {
            break RunStop::Failed(task.last_error.clone());
        }
        if let Some(handoff) = handoff
            && task.stage == handoff
        {
            break RunStop::Handoff(task.stage.clone());
        }
        if !stages.is_empty() && !claim.renew()? {
            return Err(StateError::Busy {
                task: name.to_string(),
                owner: "another worker".to_string(),
            }
            .into());
        }

        let run = run_stage(ws, executor, &mut claim, options.loop_limit)?;
        on_stage(&run);
        let outcome = run.outcome.clone();
        stages.push(run);
        match outcome {
            StageOutcome::Finished { .. } if interrupted() => break RunStop::Interrupted,
            StageOutcome::Finished { .. } => {}
            StageOutcome::NoFinish { .. } => break RunStop::NoFinish,
            StageOutcome::Interrupted => break RunStop::Interrupted,
        }
        task = require_task(&ws.paths, ws.workflow, name)?;
    };
    claim.release()?;
    Ok(RunReport {
        task: name.clone(),
        stages,
        stop,
    })
}

/// Claim the best eligible task, skipping candidates another worker holds.
fn claim_next(ws: &Workspace) -> Result<Option<(ClaimHandle, TaskRecord)>> {
    let tasks = list_view(ws)?.tasks();
    let claims = ws.claims();
    for candidate in eligible(ws.workflow, &tasks) {
        let claim = match claims.acquire(&candidate.name) {
            Ok(claim) => claim,
            Err(StateError::Busy { owner, .. }) => {
                debug!(task = %candidate.name, owner, "candidate busy, skipping");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        // Re-read under the claim; the listing may be out of date.
        let Some(task) = load_task(&ws.paths, ws.workflow, &candidate.name)? else {
            continue;
        };
        if is_eligible(ws.workflow, &task) {
            return Ok(Some((claim, task)));
        }
    }
    Ok(None)
}

/// Run exactly one stage: of `target`, or of the first claimable eligible task.
///
/// `None` means there was nothing to run.
#[instrument(skip_all)]
pub fn run_next<E: Executor + ?Sized>(
    ws: &Workspace,
    executor: &E,
    target: Option<&TaskName>,
    loop_limit: LoopLimit,
) -> Result<Option<StageRun>> {
    let mut claim = match target {
        Some(name) => {
            let claim = ws.claims().acquire(name)?;
            let task = prepare_claimed(ws, name)?;
            if ws.workflow.is_terminal(&task.stage) {
                info!(task = %name, "task already completed");
                return Ok(None);
            }
            claim
        }
        None => match claim_next(ws)? {
            Some((claim, _task)) => claim,
            None => return Ok(None),
        },
    };
    let run = run_stage(ws, executor, &mut claim, loop_limit)?;
    claim.release()?;
    Ok(Some(run))
}

/// Why `run_queue` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStop {
    /// No eligible task is left.
    Idle,
    /// A stage ended without finish; the operator should look at it.
    NoFinish(TaskName),
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueReport {
    pub stages: Vec<StageRun>,
    pub stop: QueueStop,
}

/// Keep running eligible tasks until none is left.
///
/// Stays on a task while it remains eligible, so a task moves through its
/// queue stages in one go before the next task starts.
#[instrument(skip_all, fields(workflow = %ws.kind(), loop_limit = %loop_limit))]
pub fn run_queue<E: Executor + ?Sized, F: FnMut(&StageRun)>(
    ws: &Workspace,
    executor: &E,
    loop_limit: LoopLimit,
    mut on_stage: F,
) -> Result<QueueReport> {
    let mut stages = Vec::new();
    let mut current: Option<ClaimHandle> = None;

    let stop = loop {
        if interrupted() {
            break QueueStop::Interrupted;
        }
        let kept = match current.take() {
            Some(mut claim) => {
                let task = load_task(&ws.paths, ws.workflow, claim.task())?;
                if task.is_some_and(|task| is_eligible(ws.workflow, &task)) && claim.renew()? {
                    Some(claim)
                } else {
                    claim.release()?;
                    None
                }
            }
            None => None,
        };
        let mut claim = match kept {
            Some(claim) => claim,
            None => match claim_next(ws)? {
                Some((claim, task)) => {
                    info!(task = %task.name, stage = %task.stage, "picked task");
                    claim
                }
                None => break QueueStop::Idle,
            },
        };

        let run = run_stage(ws, executor, &mut claim, loop_limit)?;
        on_stage(&run);
        let outcome = run.outcome.clone();
        let task = run.task.clone();
        stages.push(run);
        match outcome {
            StageOutcome::Finished { .. } => current = Some(claim),
            StageOutcome::NoFinish { .. } => break QueueStop::NoFinish(task),
            StageOutcome::Interrupted => break QueueStop::Interrupted,
        }
    };
    if let Some(claim) = current {
        claim.release()?;
    }
    Ok(QueueReport { stages, stop })
}

/// What reconciliation did to one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// A finish whose task write was lost was applied again.
    Replayed { session_id: String, to: Stage, status: TaskStatus },
    /// The run died mid-stage; the task is resumable.
    Parked { stage: Stage },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub task: TaskName,
    pub action: RecoveryAction,
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            RecoveryAction::Replayed {
                session_id,
                to,
                status,
            } => write!(
                f,
                "Recovered {}: applied the finish of session {session_id} ({to}, {status})",
                self.task
            ),
            RecoveryAction::Parked { stage } => write!(
                f,
                "Recovered {}: the run at {stage} died without finishing; task is incomplete, run `stagehand run {}` to resume",
                self.task, self.task
            ),
        }
    }
}

/// Recover one `running` task whose owner is gone. The caller holds its claim.
fn recover_task(ws: &Workspace, mut task: TaskRecord) -> Result<Option<Recovery>> {
    if task.status != TaskStatus::Running {
        return Ok(None);
    }
    let now = Utc::now();
    let mut owners = Vec::new();
    for mut session in sessions_for_task(&ws.paths, &task.name)? {
        if session.is_running() {
            owners.push(session.owner.to_string());
            let reason = format!("owner {} stopped without finishing", session.owner);
            fail_session(&ws.paths, &mut session, &reason, now)?;
        }
    }

    let last = match task.last_session.as_deref() {
        Some(id) => load_session(&ws.paths, id)?,
        None => None,
    };
    let open_issues = ws.issues().has_open_issues(&task.name)?;
    if let Some(last) = last
        && let Some(plan) = plan_replay(ws.workflow, &task, &last, open_issues, ws.config.loop_limit())
    {
        settle_task(&mut task, &plan, &last.session_id, now);
        save_task(&ws.paths, &task).with_context(|| format!("update task {}", task.name))?;
        warn!(task = %task.name, session = %last.session_id, to = %task.stage, "re-applied interrupted finish");
        return Ok(Some(Recovery {
            task: task.name,
            action: RecoveryAction::Replayed {
                session_id: last.session_id,
                to: plan.next_stage,
                status: plan.status,
            },
        }));
    }

    let owner = if owners.is_empty() {
        "an unknown owner".to_string()
    } else {
        owners.join(", ")
    };
    task.status = TaskStatus::Incomplete;
    task.last_error = Some(format!(
        "recovered: {owner} stopped while running stage {}",
        task.stage
    ));
    task.touch(now);
    save_task(&ws.paths, &task).with_context(|| format!("update task {}", task.name))?;
    warn!(task = %task.name, stage = %task.stage, owner, "parked orphaned task");
    Ok(Some(Recovery {
        action: RecoveryAction::Parked {
            stage: task.stage.clone(),
        },
        task: task.name,
    }))
}

/// Repair tasks left `running` by a worker that is gone.
#[instrument(skip_all, fields(workflow = %ws.kind()))]
pub fn reconcile(ws: &Workspace) -> Result<Vec<Recovery>> {
    let scan = scan_tasks(&ws.paths, ws.workflow)?;
    for err in &scan.corrupt {
        warn!(err = %err, "skipping corrupt task during reconciliation");
    }
    let claims = ws.claims();
    let mut recoveries = Vec::new();
    for task in scan.tasks {
        if task.status != TaskStatus::Running {
            continue;
        }
        if claims.inspect(&task.name)?.is_some_and(|claim| claim.live) {
            continue;
        }
        let _claim = match claims.acquire(&task.name) {
            Ok(claim) => claim,
            Err(StateError::Busy { .. }) => continue,
            Err(err) => return Err(err.into()),
        };
        let Some(current) = load_task(&ws.paths, ws.workflow, &task.name)? else {
            continue;
        };
        if let Some(recovery) = recover_task(ws, current)? {
            recoveries.push(recovery);
        }
    }
    Ok(recoveries)
}
