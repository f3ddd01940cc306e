//! Transition planning for `finish` and administrative stage overrides.
//!
//! Planning is pure: it decides the next stage, status and bounce counter
//! from the current records. Persisting the plan is `crate::finish`'s job.

use crate::core::selector::{LoopLimit, next_bounces};
use crate::core::types::{SessionRecord, SessionStatus, TaskRecord, TaskStatus};
use crate::core::workflow::{FinishStage, Stage, Workflow};
use crate::error::StateError;

/// Everything `plan_finish` reads.
#[derive(Debug, Clone)]
pub struct FinishRequest<'a> {
    pub task: &'a TaskRecord,
    pub session: &'a SessionRecord,
    pub completed: &'a FinishStage,
    pub explicit_next: Option<&'a Stage>,
    pub open_issues: bool,
    /// Issue tracker's preferred re-entry stage, consulted only on redirect.
    pub reentry: Option<&'a Stage>,
    pub loop_limit: LoopLimit,
}

/// Outcome of a validated `finish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishPlan {
    pub next_stage: Stage,
    /// Set when open issues redirected a terminal target.
    pub redirected_from: Option<Stage>,
    pub status: TaskStatus,
    pub bounces: u32,
    /// Diagnostic recorded when the oscillation guard tripped.
    pub failure: Option<String>,
}

fn invalid(task: &TaskRecord, stage: &Stage, detail: impl Into<String>) -> StateError {
    StateError::InvalidTransition {
        task: task.name.to_string(),
        stage: stage.to_string(),
        detail: detail.into(),
    }
}

/// Validate a finish request and compute the resulting task state.
pub fn plan_finish(workflow: &dyn Workflow, req: &FinishRequest<'_>) -> Result<FinishPlan, StateError> {
    let session = req.session;
    if session.status != SessionStatus::Running {
        return Err(invalid(
            req.task,
            &session.stage,
            format!(
                "session {} is already {}",
                session.session_id, session.status
            ),
        ));
    }
    if let FinishStage::Stage(completed) = req.completed
        && completed != &session.stage
    {
        return Err(invalid(
            req.task,
            &session.stage,
            format!(
                "session {} is running stage {}, not {completed}",
                session.session_id, session.stage
            ),
        ));
    }

    let next_stage = match req.explicit_next {
        Some(next) if workflow.is_valid_finish_target(next) => next.clone(),
        Some(next) => {
            let allowed = workflow
                .valid_finish_targets()
                .iter()
                .map(Stage::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(invalid(
                req.task,
                &session.stage,
                format!("--next {next} is not allowed (allowed: {allowed})"),
            ));
        }
        None => workflow.next_after(req.completed).ok_or_else(|| {
            invalid(
                req.task,
                &session.stage,
                format!("no default stage follows {}; pass --next", req.completed),
            )
        })?,
    };

    let (next_stage, redirected_from) = if req.open_issues && workflow.is_terminal(&next_stage) {
        (reentry_stage(workflow, req.reentry), Some(next_stage))
    } else {
        (next_stage, None)
    };

    Ok(settle(
        workflow,
        &session.stage,
        next_stage,
        redirected_from,
        req.task.bounces,
        req.open_issues,
        req.loop_limit,
    ))
}

/// Re-derive the task update of a finish whose session write landed but
/// whose task write did not. `None` unless the session finished with a
/// recorded next stage.
pub fn plan_replay(
    workflow: &dyn Workflow,
    task: &TaskRecord,
    session: &SessionRecord,
    open_issues: bool,
    loop_limit: LoopLimit,
) -> Option<FinishPlan> {
    if session.status != SessionStatus::Finished {
        return None;
    }
    let next_stage = session.next_stage.clone()?;
    Some(settle(
        workflow,
        &session.stage,
        next_stage,
        None,
        task.bounces,
        open_issues,
        loop_limit,
    ))
}

/// Status, bounce counter and guard verdict for arriving at `next_stage`.
fn settle(
    workflow: &dyn Workflow,
    from_stage: &Stage,
    next_stage: Stage,
    redirected_from: Option<Stage>,
    bounces: u32,
    open_issues: bool,
    loop_limit: LoopLimit,
) -> FinishPlan {
    let bounces = next_bounces(workflow, from_stage, &next_stage, bounces);
    let mut status = derive_status(workflow, &next_stage, open_issues);
    let mut failure = None;
    if loop_limit.is_exceeded(bounces) {
        let (from, to) = workflow.oscillation_pair().unwrap_or_default();
        status = TaskStatus::Failed;
        failure = Some(format!(
            "oscillation guard: {bounces} consecutive {from} -> {to} bounces exceed loop limit {loop_limit}"
        ));
    }
    FinishPlan {
        next_stage,
        redirected_from,
        status,
        bounces,
        failure,
    }
}

/// Where a task with open issues goes instead of the terminal stage.
fn reentry_stage(workflow: &dyn Workflow, preferred: Option<&Stage>) -> Stage {
    preferred
        .filter(|stage| workflow.contains(stage.as_str()) && !workflow.is_terminal(stage))
        .cloned()
        .unwrap_or_else(|| Stage::new(workflow.rework_stage()))
}

/// Status a task takes on arriving at `stage`.
pub fn derive_status(workflow: &dyn Workflow, stage: &Stage, open_issues: bool) -> TaskStatus {
    if workflow.is_terminal(stage) {
        TaskStatus::Completed
    } else if open_issues {
        TaskStatus::Issues
    } else {
        TaskStatus::Pending
    }
}

/// Check an administrative `set-stage` and return the status to write.
pub fn plan_override(
    workflow: &dyn Workflow,
    task: &TaskRecord,
    stage: &Stage,
    status: Option<TaskStatus>,
    open_issues: bool,
) -> Result<TaskStatus, StateError> {
    if open_issues && workflow.is_terminal(stage) {
        return Err(invalid(
            task,
            &task.stage,
            format!("cannot move to {stage} while issues are open"),
        ));
    }
    match status {
        Some(TaskStatus::Completed) if !workflow.is_terminal(stage) => Err(invalid(
            task,
            &task.stage,
            format!(
                "status completed requires stage {}, not {stage}",
                workflow.terminal()
            ),
        )),
        Some(status) => Ok(status),
        None => Ok(derive_status(workflow, stage, open_issues)),
    }
}
