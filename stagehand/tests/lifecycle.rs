use chrono::{Duration, Utc};
use stagehand::admin;
use stagehand::core::selector::LoopLimit;
use stagehand::core::types::{ClaimRecord, Owner, RECORD_VERSION, TaskName, TaskStatus};
use stagehand::core::workflow::{Stage, WorkflowKind};
use stagehand::finish::{FinishArgs, finish};
use stagehand::io::store::write_record;
use stagehand::queue::list_view;
use stagehand::run::{
    QueueStop, RecoveryAction, RunOptions, RunStop, reconcile, run_next, run_queue, run_task,
};
use stagehand::test_support::{
    FixedProbe, ScriptedExecutor, ScriptedStage, TEST_HOST, TEST_PID, TestWorkspace,
};

fn name(raw: &str) -> TaskName {
    TaskName::parse(raw).expect("name")
}

fn stale_claim(task: &str, owner: Owner, acquired_ago: Duration) -> ClaimRecord {
    ClaimRecord {
        version: RECORD_VERSION,
        task: name(task),
        owner,
        token: "stale-token".to_string(),
        acquired_at: Utc::now() - acquired_ago,
        ttl_seconds: 3600,
    }
}

#[test]
fn spec_stage_finishes_into_planning() {
    let tw = TestWorkspace::new().expect("workspace");
    let ws = tw.workspace();
    tw.add_task("alpha").expect("task");
    let executor = ScriptedExecutor::new(vec![ScriptedStage::finish()]);

    let run = run_next(&ws, &executor, Some(&name("alpha")), LoopLimit::default())
        .expect("run")
        .expect("stage ran");
    assert_eq!(run.stage, Stage::new("spec"));
    let task = tw.task("alpha").expect("task");
    assert_eq!(task.stage, Stage::new("planning"));
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.last_session.as_deref(), Some(run.session_id.as_str()));

    // Planning is not a queue stage, so the scheduler leaves it for the operator.
    let idle = ScriptedExecutor::new(Vec::new());
    assert!(run_next(&ws, &idle, None, LoopLimit::default()).expect("run").is_none());
}

#[test]
fn review_build_oscillation_fails_after_loop_limit() {
    let tw = TestWorkspace::new().expect("workspace");
    let ws = tw.workspace();
    tw.add_task_at("alpha", "review").expect("task");
    let executor = ScriptedExecutor::new(vec![
        ScriptedStage::finish_to("build"),
        ScriptedStage::finish(),
        ScriptedStage::finish_to("build"),
        ScriptedStage::finish(),
        ScriptedStage::finish_to("build"),
    ]);

    let report = run_task(
        &ws,
        &executor,
        &name("alpha"),
        RunOptions {
            handoff: false,
            loop_limit: LoopLimit::Bounded(2),
        },
        |_| {},
    )
    .expect("run");
    let RunStop::Failed(Some(reason)) = &report.stop else {
        panic!("expected failure, got {:?}", report.stop);
    };
    assert!(reason.contains("oscillation guard"), "{reason}");
    assert_eq!(report.stages.len(), 5);
    assert_eq!(executor.remaining(), 0);

    let task = tw.task("alpha").expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.stage, Stage::new("build"));
    assert_eq!(task.bounces, 3);
}

#[test]
fn run_queue_loop_limit_fails_on_third_bounce() {
    let tw = TestWorkspace::new().expect("workspace");
    let ws = tw.workspace();
    tw.add_task_at("alpha", "review").expect("task");
    let executor = ScriptedExecutor::new(vec![
        ScriptedStage::finish_to("build"),
        ScriptedStage::finish(),
        ScriptedStage::finish_to("build"),
        ScriptedStage::finish(),
        ScriptedStage::finish_to("build"),
    ]);

    let report = run_queue(&ws, &executor, LoopLimit::Bounded(2), |_| {}).expect("queue");
    assert_eq!(report.stop, QueueStop::Idle);
    assert_eq!(report.stages.len(), 5);
    let task = tw.task("alpha").expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(
        task.last_error
            .as_deref()
            .is_some_and(|err| err.contains("loop limit 2")),
        "{:?}",
        task.last_error
    );
}

#[test]
fn unbounded_loop_limit_lets_review_settle() {
    let tw = TestWorkspace::new().expect("workspace");
    let ws = tw.workspace();
    tw.add_task_at("alpha", "review").expect("task");
    let mut script = Vec::new();
    for _ in 0..6 {
        script.push(ScriptedStage::finish_to("build"));
        script.push(ScriptedStage::finish());
    }
    script.push(ScriptedStage::finish());
    let executor = ScriptedExecutor::new(script);

    let report = run_queue(&ws, &executor, LoopLimit::Unbounded, |_| {}).expect("queue");
    assert_eq!(report.stop, QueueStop::Idle);
    let task = tw.task("alpha").expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.stage, Stage::new("completed"));
    let requests = executor.requests();
    assert!(requests
        .iter()
        .all(|request| request.env_value("STAGEHAND_LOOP_LIMIT") == Some("unbounded")));
}

#[test]
fn finish_changes_only_the_finished_task_in_the_queue() {
    let tw = TestWorkspace::new().expect("workspace");
    let ws = tw.workspace();
    tw.add_task_at("alpha", "build").expect("task");
    tw.add_task_at("beta", "build").expect("task");
    let before = list_view(&ws).expect("listing");
    let session = tw.open_session("alpha").expect("session");

    let advanced = finish(
        &ws,
        &ws.issues(),
        &FinishArgs {
            completed: Some("build"),
            env_session: Some(&session.session_id),
            ..FinishArgs::default()
        },
    )
    .expect("finish");
    assert_eq!(advanced.to, Stage::new("review"));

    let after = list_view(&ws).expect("listing");
    assert_eq!(
        before.view.find(&name("beta")),
        after.view.find(&name("beta"))
    );
    let alpha = after.view.find(&name("alpha")).expect("alpha listed");
    assert_eq!(alpha.stage, Stage::new("review"));
    assert_eq!(alpha.status, TaskStatus::Pending);
    let stages: Vec<_> = after
        .view
        .groups
        .iter()
        .map(|group| group.stage.to_string())
        .collect();
    assert_eq!(stages, vec!["build", "review"]);
}

#[test]
fn queue_reclaims_claim_of_dead_local_owner() {
    let tw = TestWorkspace::new().expect("workspace");
    tw.add_task_at("alpha", "build").expect("task");
    let dead = Owner {
        pid: 999_999,
        host: TEST_HOST.to_string(),
    };
    write_record(
        &tw.paths().claim_path(&name("alpha")),
        &stale_claim("alpha", dead, Duration::seconds(5)),
    )
    .expect("claim");
    let ws = tw.workspace_with(TEST_PID, FixedProbe::dead(&[999_999]));
    let executor = ScriptedExecutor::new(vec![ScriptedStage::finish(), ScriptedStage::finish()]);

    let report = run_queue(&ws, &executor, LoopLimit::default(), |_| {}).expect("queue");
    assert_eq!(report.stop, QueueStop::Idle);
    assert_eq!(tw.task("alpha").expect("task").status, TaskStatus::Completed);
    assert!(!tw.paths().claim_path(&name("alpha")).exists());
}

#[test]
fn queue_reclaims_expired_claim_from_another_host() {
    let tw = TestWorkspace::new().expect("workspace");
    tw.add_task_at("alpha", "review").expect("task");
    tw.add_task_at("beta", "review").expect("task");
    let remote = Owner {
        pid: TEST_PID,
        host: "elsewhere".to_string(),
    };
    write_record(
        &tw.paths().claim_path(&name("alpha")),
        &stale_claim("alpha", remote.clone(), Duration::hours(2)),
    )
    .expect("claim");
    write_record(
        &tw.paths().claim_path(&name("beta")),
        &stale_claim("beta", remote, Duration::seconds(5)),
    )
    .expect("claim");
    let ws = tw.workspace();
    let executor = ScriptedExecutor::new(vec![ScriptedStage::finish()]);

    let report = run_queue(&ws, &executor, LoopLimit::default(), |_| {}).expect("queue");
    assert_eq!(report.stop, QueueStop::Idle);
    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.stages[0].task, name("alpha"));
    // Beta's claim is fresh; a remote owner cannot be probed, so it stays.
    assert_eq!(tw.task("beta").expect("task").status, TaskStatus::Pending);
    assert!(tw.paths().claim_path(&name("beta")).exists());
}

#[test]
fn interrupted_run_resumes_where_it_stopped() {
    let tw = TestWorkspace::new().expect("workspace");
    let ws = tw.workspace();
    tw.add_task_at("alpha", "build").expect("task");
    let executor = ScriptedExecutor::new(vec![
        ScriptedStage::Interrupt,
        ScriptedStage::finish(),
        ScriptedStage::finish(),
    ]);

    let first = run_task(&ws, &executor, &name("alpha"), RunOptions::default(), |_| {})
        .expect("run");
    assert_eq!(first.stop, RunStop::Interrupted);
    let task = tw.task("alpha").expect("task");
    assert_eq!(task.status, TaskStatus::Incomplete);
    assert_eq!(task.stage, Stage::new("build"));
    assert!(!tw.paths().claim_path(&name("alpha")).exists());

    let second = run_task(&ws, &executor, &name("alpha"), RunOptions::default(), |_| {})
        .expect("run");
    assert_eq!(second.stop, RunStop::Completed);
    let stages: Vec<_> = second.stages.iter().map(|run| run.stage.to_string()).collect();
    assert_eq!(stages, vec!["build", "review"]);
}

#[test]
fn crashed_worker_is_reconciled_then_resumed() {
    let tw = TestWorkspace::new().expect("workspace");
    tw.add_task_at("alpha", "build").expect("task");
    tw.open_session("alpha").expect("session");
    let ws = tw.workspace_as(TEST_PID + 1);

    let recoveries = reconcile(&ws).expect("reconcile");
    assert_eq!(recoveries.len(), 1);
    assert_eq!(
        recoveries[0].action,
        RecoveryAction::Parked {
            stage: Stage::new("build")
        }
    );

    let executor = ScriptedExecutor::new(vec![ScriptedStage::finish(), ScriptedStage::finish()]);
    let report = run_queue(&ws, &executor, LoopLimit::default(), |_| {}).expect("queue");
    assert_eq!(report.stop, QueueStop::Idle);
    let task = tw.task("alpha").expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.last_error, None);
}

#[test]
fn open_issues_send_review_back_to_build() {
    let tw = TestWorkspace::new().expect("workspace");
    let ws = tw.workspace();
    tw.add_task_at("alpha", "review").expect("task");
    let issue = admin::add_issue(&ws, &name("alpha"), "tests are flaky", None).expect("issue");
    assert_eq!(tw.task("alpha").expect("task").status, TaskStatus::Issues);

    let executor = ScriptedExecutor::new(vec![ScriptedStage::finish()]);
    let run = run_next(&ws, &executor, Some(&name("alpha")), LoopLimit::default())
        .expect("run")
        .expect("stage ran");
    assert_eq!(run.stage, Stage::new("review"));
    let task = tw.task("alpha").expect("task");
    assert_eq!(task.stage, Stage::new("build"));
    assert_eq!(task.status, TaskStatus::Issues);

    admin::resolve_issue(&ws, &issue.id).expect("resolve");
    assert_eq!(tw.task("alpha").expect("task").status, TaskStatus::Pending);
}

#[test]
fn writer_workflow_runs_its_own_stages() {
    let tw = TestWorkspace::with_workflow(WorkflowKind::Writer).expect("workspace");
    let ws = tw.workspace();
    tw.add_task_at("essay", "write").expect("task");
    let executor = ScriptedExecutor::new(vec![ScriptedStage::finish(), ScriptedStage::finish()]);

    let mut seen = Vec::new();
    let report = run_queue(&ws, &executor, LoopLimit::default(), |run| {
        seen.push(run.stage.to_string());
    })
    .expect("queue");
    assert_eq!(report.stop, QueueStop::Idle);
    assert_eq!(seen, vec!["write", "edit"]);
    assert!(executor
        .requests()
        .iter()
        .all(|request| request.env_value("STAGEHAND_WORKFLOW") == Some("writer")));
    assert_eq!(tw.task("essay").expect("task").status, TaskStatus::Completed);
}
