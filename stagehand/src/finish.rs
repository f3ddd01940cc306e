//! The finish protocol: the only way a stage run advances a task.
//!
//! The session is closed first, then the task is updated. Each write is
//! atomic on its own. A crash between the two leaves a finished session
//! carrying `next_stage`, which `crate::run::reconcile` re-applies.

use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::selector::LoopLimit;
use crate::core::transition::{FinishPlan, FinishRequest, plan_finish};
use crate::core::types::{SessionRecord, TaskName, TaskRecord, TaskStatus};
use crate::core::workflow::{FinishStage, Stage, WHOLE_TASK};
use crate::error::StateError;
use crate::io::issues::IssueTracker;
use crate::io::sessions::{SessionQuery, close_finished, resolve_active};
use crate::io::tasks::{require_task, save_task};
use crate::workspace::Workspace;

/// Arguments of `stagehand finish`.
#[derive(Debug, Clone, Default)]
pub struct FinishArgs<'a> {
    /// Stage being finished; `None` means the whole task.
    pub completed: Option<&'a str>,
    pub next: Option<&'a str>,
    pub session: Option<&'a str>,
    pub env_session: Option<&'a str>,
    pub task: Option<&'a TaskName>,
    pub loop_limit: LoopLimit,
}

/// Result of a successful finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advanced {
    pub task: TaskName,
    pub session_id: String,
    pub from: Stage,
    pub to: Stage,
    pub status: TaskStatus,
    pub redirected_from: Option<Stage>,
    pub failure: Option<String>,
}

impl fmt::Display for Advanced {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Advanced {}: {} -> {} ({})",
            self.task, self.from, self.to, self.status
        )?;
        if let Some(target) = &self.redirected_from {
            write!(f, "; open issues kept it from {target}")?;
        }
        if let Some(failure) = &self.failure {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

/// Validate and apply a finish.
#[instrument(skip_all, fields(workflow = %ws.kind()))]
pub fn finish(ws: &Workspace, issues: &dyn IssueTracker, args: &FinishArgs<'_>) -> Result<Advanced> {
    let workflow = ws.workflow;
    let completed = workflow.parse_finish_stage(args.completed.unwrap_or(WHOLE_TASK))?;
    let explicit_next = args
        .next
        .map(|raw| workflow.parse_stage(raw))
        .transpose()?;

    let stage_filter = match &completed {
        FinishStage::Stage(stage) => Some(stage),
        FinishStage::WholeTask => None,
    };
    let session = resolve_active(
        &ws.paths,
        &SessionQuery {
            explicit: args.session,
            env_fallback: args.env_session,
            stage: stage_filter,
            task: args.task,
        },
    )?;
    let task = require_task(&ws.paths, workflow, &session.task)?;
    if session.is_running() && task.stage != session.stage {
        return Err(StateError::InvalidTransition {
            task: task.name.to_string(),
            stage: task.stage.to_string(),
            detail: format!(
                "task moved to {} while session {} ran {}",
                task.stage, session.session_id, session.stage
            ),
        }
        .into());
    }

    let open_issues = issues.has_open_issues(&task.name)?;
    let reentry = if open_issues {
        Some(issues.preferred_reentry_stage(&task.name)?)
    } else {
        None
    };
    let plan = plan_finish(
        workflow,
        &FinishRequest {
            task: &task,
            session: &session,
            completed: &completed,
            explicit_next: explicit_next.as_ref(),
            open_issues,
            reentry: reentry.as_ref(),
            loop_limit: args.loop_limit,
        },
    )?;
    apply(ws, session, task, plan)
}

fn apply(ws: &Workspace, mut session: SessionRecord, mut task: TaskRecord, plan: FinishPlan) -> Result<Advanced> {
    let now = Utc::now();
    close_finished(&ws.paths, &mut session, &plan.next_stage, now)
        .with_context(|| format!("close session {}", session.session_id))?;

    let from = task.stage.clone();
    settle_task(&mut task, &plan, &session.session_id, now);
    save_task(&ws.paths, &task).with_context(|| format!("update task {}", task.name))?;

    if let Some(failure) = &plan.failure {
        warn!(task = %task.name, failure, "task failed by oscillation guard");
    }
    info!(
        task = %task.name,
        session = %session.session_id,
        from = %from,
        to = %task.stage,
        status = %task.status,
        "stage finished"
    );
    Ok(Advanced {
        task: task.name,
        session_id: session.session_id,
        from,
        to: plan.next_stage,
        status: plan.status,
        redirected_from: plan.redirected_from,
        failure: plan.failure,
    })
}

/// Write a finish plan into the task record (finish step 5).
pub(crate) fn settle_task(task: &mut TaskRecord, plan: &FinishPlan, session_id: &str, now: DateTime<Utc>) {
    task.stage = plan.next_stage.clone();
    task.status = plan.status;
    task.bounces = plan.bounces;
    task.last_session = Some(session_id.to_string());
    task.last_error = plan.failure.clone();
    task.touch(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SessionStatus;
    use crate::io::sessions::require_session;
    use crate::test_support::TestWorkspace;

    #[test]
    fn finish_advances_along_default_edge() {
        let tw = TestWorkspace::new().expect("workspace");
        let ws = tw.workspace();
        tw.add_task("alpha").expect("task");
        let session = tw.open_session("alpha").expect("session");

        let advanced = finish(
            &ws,
            &ws.issues(),
            &FinishArgs {
                completed: Some("spec"),
                ..FinishArgs::default()
            },
        )
        .expect("finish");
        assert_eq!(advanced.to, Stage::new("planning"));
        assert_eq!(advanced.status, TaskStatus::Pending);

        let task = tw.task("alpha").expect("task");
        assert_eq!(task.stage, Stage::new("planning"));
        let stored = require_session(&ws.paths, &session.session_id).expect("session");
        assert_eq!(stored.status, SessionStatus::Finished);
        assert_eq!(stored.next_stage, Some(Stage::new("planning")));
    }

    #[test]
    fn unknown_next_stage_fails_before_touching_records() {
        let tw = TestWorkspace::new().expect("workspace");
        let ws = tw.workspace();
        tw.add_task("alpha").expect("task");
        let session = tw.open_session("alpha").expect("session");

        let err = finish(
            &ws,
            &ws.issues(),
            &FinishArgs {
                completed: Some("spec"),
                next: Some("shipping"),
                ..FinishArgs::default()
            },
        )
        .expect_err("unknown stage");
        assert!(matches!(
            err.downcast_ref::<StateError>(),
            Some(StateError::UnknownStage { .. })
        ));
        let stored = require_session(&ws.paths, &session.session_id).expect("session");
        assert!(stored.is_running());
    }

    #[test]
    fn finishing_twice_is_rejected() {
        let tw = TestWorkspace::new().expect("workspace");
        let ws = tw.workspace();
        tw.add_task("alpha").expect("task");
        let session = tw.open_session("alpha").expect("session");
        let args = FinishArgs {
            completed: Some("spec"),
            session: Some(&session.session_id),
            ..FinishArgs::default()
        };
        finish(&ws, &ws.issues(), &args).expect("first");
        let err = finish(&ws, &ws.issues(), &args).expect_err("second");
        assert!(matches!(
            err.downcast_ref::<StateError>(),
            Some(StateError::InvalidTransition { .. })
        ));
        assert_eq!(tw.task("alpha").expect("task").stage, Stage::new("planning"));
    }

    #[test]
    fn open_issues_send_review_back_to_build() {
        let tw = TestWorkspace::new().expect("workspace");
        let ws = tw.workspace();
        tw.add_task_at("alpha", "review").expect("task");
        let name = TaskName::parse("alpha").expect("name");
        ws.issues()
            .open(&name, "missing tests", None, Utc::now())
            .expect("issue");
        tw.open_session("alpha").expect("session");

        let advanced = finish(
            &ws,
            &ws.issues(),
            &FinishArgs {
                completed: Some("review"),
                ..FinishArgs::default()
            },
        )
        .expect("finish");
        assert_eq!(advanced.to, Stage::new("build"));
        assert_eq!(advanced.status, TaskStatus::Issues);
        assert_eq!(advanced.redirected_from, Some(Stage::new("completed")));
    }

    #[test]
    fn override_during_session_is_detected() {
        let tw = TestWorkspace::new().expect("workspace");
        let ws = tw.workspace();
        tw.add_task("alpha").expect("task");
        tw.open_session("alpha").expect("session");
        let mut task = tw.task("alpha").expect("task");
        task.stage = Stage::new("build");
        save_task(&ws.paths, &task).expect("save");

        let err = finish(
            &ws,
            &ws.issues(),
            &FinishArgs {
                completed: Some("spec"),
                ..FinishArgs::default()
            },
        )
        .expect_err("moved");
        assert!(format!("{err:#}").contains("task moved to build"), "{err:#}");
    }
}
