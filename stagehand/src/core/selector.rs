//! Scheduling over the task set: the queue view, FIFO selection, and the
//! oscillation guard's counter rules.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::core::types::{TaskName, TaskRecord};
use crate::core::workflow::{Stage, Workflow};

/// Default number of bounces tolerated before a task fails.
pub const DEFAULT_LOOP_LIMIT: u32 = 4;

/// Bound on consecutive oscillation bounces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopLimit {
    Bounded(u32),
    Unbounded,
}

impl LoopLimit {
    /// `0` disables the guard, matching `--loop 0`.
    pub fn from_count(count: u32) -> Self {
        if count == 0 {
            LoopLimit::Unbounded
        } else {
            LoopLimit::Bounded(count)
        }
    }

    pub fn is_exceeded(self, bounces: u32) -> bool {
        match self {
            LoopLimit::Bounded(limit) => bounces > limit,
            LoopLimit::Unbounded => false,
        }
    }
}

impl Default for LoopLimit {
    fn default() -> Self {
        LoopLimit::Bounded(DEFAULT_LOOP_LIMIT)
    }
}

impl fmt::Display for LoopLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopLimit::Bounded(limit) => write!(f, "{limit}"),
            LoopLimit::Unbounded => f.write_str("unbounded"),
        }
    }
}

impl FromStr for LoopLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("unbounded") {
            return Ok(LoopLimit::Unbounded);
        }
        s.parse::<u32>()
            .map(LoopLimit::from_count)
            .map_err(|_| format!("invalid loop limit '{s}' (expected a number or 'unbounded')"))
    }
}

/// Counter after a transition `from -> to`.
///
/// Crossing the workflow's oscillation edge counts one bounce; moving within
/// the pair keeps the count; leaving the pair resets it.
pub fn next_bounces(workflow: &dyn Workflow, from: &Stage, to: &Stage, current: u32) -> u32 {
    let Some((bounce_from, bounce_to)) = workflow.oscillation_pair() else {
        return 0;
    };
    if from == bounce_from && to == bounce_to {
        current.saturating_add(1)
    } else if to == bounce_from || to == bounce_to {
        current
    } else {
        0
    }
}

/// Tasks at one stage, in scheduling order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageGroup {
    pub stage: Stage,
    pub label: &'static str,
    pub tasks: Vec<TaskRecord>,
}

/// The derived queue: active tasks grouped by stage, held tasks apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueView {
    pub groups: Vec<StageGroup>,
    pub held: Vec<TaskRecord>,
}

impl QueueView {
    pub fn is_empty(&self) -> bool {
        self.held.is_empty() && self.groups.iter().all(|group| group.tasks.is_empty())
    }

    pub fn find(&self, name: &TaskName) -> Option<&TaskRecord> {
        self.groups
            .iter()
            .flat_map(|group| group.tasks.iter())
            .chain(self.held.iter())
            .find(|task| &task.name == name)
    }
}

fn fifo(a: &TaskRecord, b: &TaskRecord) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.name.cmp(&b.name))
}

/// Group tasks by stage in workflow order. Empty stages are omitted.
pub fn group_by_stage(workflow: &dyn Workflow, tasks: Vec<TaskRecord>) -> QueueView {
    let (mut held, active): (Vec<_>, Vec<_>) = tasks.into_iter().partition(|task| task.held);
    held.sort_by(fifo);

    let mut groups = Vec::new();
    let mut remaining = active;
    for def in workflow.stages() {
        let (mut here, rest): (Vec<_>, Vec<_>) = remaining
            .into_iter()
            .partition(|task| task.stage == def.name);
        remaining = rest;
        if here.is_empty() {
            continue;
        }
        here.sort_by(fifo);
        groups.push(StageGroup {
            stage: Stage::new(def.name),
            label: def.label,
            tasks: here,
        });
    }
    QueueView { groups, held }
}

/// Not held, at a queue stage, in a waiting status.
pub fn is_eligible(workflow: &dyn Workflow, task: &TaskRecord) -> bool {
    !task.held && task.status.is_schedulable() && workflow.is_queue_stage(&task.stage)
}

/// Every task the scheduler could run now, best candidate first.
///
/// Ordered by stage rank, then creation time, then name.
pub fn eligible<'a>(workflow: &dyn Workflow, tasks: &'a [TaskRecord]) -> Vec<&'a TaskRecord> {
    let mut candidates: Vec<&TaskRecord> = tasks
        .iter()
        .filter(|task| is_eligible(workflow, task))
        .collect();
    candidates.sort_by(|a, b| {
        workflow
            .rank(&a.stage)
            .cmp(&workflow.rank(&b.stage))
            .then_with(|| fifo(a, b))
    });
    candidates
}

/// The earliest-created task at the earliest eligible stage.
pub fn next_eligible(workflow: &dyn Workflow, tasks: &[TaskRecord]) -> Option<(TaskName, Stage)> {
    eligible(workflow, tasks)
        .first()
        .map(|task| (task.name.clone(), task.stage.clone()))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::*;
    use crate::core::types::TaskStatus;
    use crate::core::workflow::{CodeWorkflow, WorkflowKind};

    fn at(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        base + Duration::seconds(secs)
    }

    fn task(name: &str, stage: &str, status: TaskStatus, created: DateTime<Utc>) -> TaskRecord {
        let mut task = TaskRecord::new(
            TaskName::parse(name).expect("name"),
            WorkflowKind::Code,
            created,
        );
        task.stage = Stage::new(stage);
        task.status = status;
        task
    }

    #[test]
    fn earliest_stage_wins_over_earliest_created() {
        let base = Utc::now();
        let tasks = vec![
            task("old-review", "review", TaskStatus::Pending, at(base, 0)),
            task("new-build", "build", TaskStatus::Pending, at(base, 10)),
        ];
        let picked = next_eligible(&CodeWorkflow, &tasks).expect("eligible");
        assert_eq!(picked.0.as_str(), "new-build");
        assert_eq!(picked.1, Stage::new("build"));
    }

    #[test]
    fn fifo_within_a_stage() {
        let base = Utc::now();
        let tasks = vec![
            task("second", "build", TaskStatus::Incomplete, at(base, 5)),
            task("first", "build", TaskStatus::Pending, at(base, 1)),
        ];
        let order: Vec<_> = eligible(&CodeWorkflow, &tasks)
            .iter()
            .map(|task| task.name.as_str())
            .collect();
        assert_eq!(order, vec!["first", "second"]);
    }

    #[test]
    fn held_running_and_non_queue_tasks_are_skipped() {
        let base = Utc::now();
        let mut held = task("held", "build", TaskStatus::Pending, at(base, 0));
        held.held = true;
        let tasks = vec![
            held,
            task("running", "build", TaskStatus::Running, at(base, 1)),
            task("failed", "review", TaskStatus::Failed, at(base, 2)),
            task("spec", "spec", TaskStatus::Pending, at(base, 3)),
            task("done", "completed", TaskStatus::Completed, at(base, 4)),
        ];
        assert_eq!(next_eligible(&CodeWorkflow, &tasks), None);
    }

    #[test]
    fn tasks_sent_back_with_issues_are_rescheduled() {
        let base = Utc::now();
        let tasks = vec![task("bounced", "build", TaskStatus::Issues, at(base, 0))];
        assert!(next_eligible(&CodeWorkflow, &tasks).is_some());
    }

    #[test]
    fn grouping_follows_stage_order_and_segregates_held() {
        let base = Utc::now();
        let mut parked = task("parked", "spec", TaskStatus::Pending, at(base, 0));
        parked.held = true;
        let tasks = vec![
            task("c", "review", TaskStatus::Pending, at(base, 3)),
            task("a", "spec", TaskStatus::Pending, at(base, 1)),
            parked,
            task("b", "spec", TaskStatus::Pending, at(base, 2)),
        ];
        let view = group_by_stage(&CodeWorkflow, tasks);
        let stages: Vec<_> = view.groups.iter().map(|g| g.stage.as_str()).collect();
        assert_eq!(stages, vec!["spec", "review"]);
        let spec: Vec<_> = view.groups[0].tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(spec, vec!["a", "b"]);
        assert_eq!(view.groups[0].label, "Spec");
        assert_eq!(view.held.len(), 1);
        assert_eq!(view.held[0].name.as_str(), "parked");
    }

    #[test]
    fn bounce_counter_rules() {
        let wf = CodeWorkflow;
        let review = Stage::new("review");
        let build = Stage::new("build");
        let done = Stage::new("completed");
        assert_eq!(next_bounces(&wf, &review, &build, 2), 3);
        assert_eq!(next_bounces(&wf, &build, &review, 3), 3);
        assert_eq!(next_bounces(&wf, &review, &done, 3), 0);
        assert_eq!(next_bounces(&wf, &Stage::new("planning"), &build, 0), 0);
    }

    #[test]
    fn loop_limit_parsing_and_threshold() {
        assert_eq!("0".parse::<LoopLimit>(), Ok(LoopLimit::Unbounded));
        assert_eq!("unbounded".parse::<LoopLimit>(), Ok(LoopLimit::Unbounded));
        assert_eq!("2".parse::<LoopLimit>(), Ok(LoopLimit::Bounded(2)));
        assert!("-1".parse::<LoopLimit>().is_err());

        let limit = LoopLimit::Bounded(2);
        assert!(!limit.is_exceeded(2));
        assert!(limit.is_exceeded(3));
        assert!(!LoopLimit::Unbounded.is_exceeded(u32::MAX));
    }
}
