//! Workflow definitions: the stage graph each task kind moves through.
//!
//! A [`Workflow`] is pure lookup data. Transition planning and scheduling take
//! `&dyn Workflow` and never branch on the concrete kind, so a new workflow
//! only needs a new implementation here plus a [`WorkflowKind`] variant.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Sentinel accepted by `finish` meaning "the whole task is done".
pub const WHOLE_TASK: &str = "task";

/// A stage name. Membership in a workflow is checked by [`Workflow::parse_stage`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stage(String);

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for Stage {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Stage {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Name and human label of one stage.
#[derive(Debug, Clone, Copy)]
pub struct StageDef {
    pub name: &'static str,
    pub label: &'static str,
}

const fn stage(name: &'static str, label: &'static str) -> StageDef {
    StageDef { name, label }
}

/// The stage a `finish` call claims to have completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishStage {
    Stage(Stage),
    /// The whole task is done regardless of the session's stage.
    WholeTask,
}

impl fmt::Display for FinishStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishStage::Stage(stage) => stage.fmt(f),
            FinishStage::WholeTask => f.write_str(WHOLE_TASK),
        }
    }
}

/// Descriptor of one workflow kind.
///
/// `stages` is ordered; its order is the scheduling priority and the display
/// order. `default_next` may point anywhere in the list, including backwards.
pub trait Workflow: Sync {
    fn kind(&self) -> WorkflowKind;
    fn stages(&self) -> &'static [StageDef];
    fn initial(&self) -> &'static str;
    fn terminal(&self) -> &'static str;
    /// The standard forward edge out of `stage`, if any.
    fn default_next(&self, stage: &str) -> Option<&'static str>;
    /// Where interactive setup ends and unattended execution may begin.
    fn handoff_stage(&self) -> Option<&'static str>;
    fn queue_stages(&self) -> &'static [&'static str];
    /// Working stage a task is sent back to when it may not complete.
    fn rework_stage(&self) -> &'static str;
    /// `(from, to)` edge whose repetition the oscillation guard counts.
    fn oscillation_pair(&self) -> Option<(&'static str, &'static str)>;

    fn contains(&self, stage: &str) -> bool {
        self.stages().iter().any(|def| def.name == stage)
    }

    /// Validate a raw stage name against this workflow.
    fn parse_stage(&self, raw: &str) -> Result<Stage, StateError> {
        if self.contains(raw) {
            Ok(Stage::new(raw))
        } else {
            Err(StateError::UnknownStage {
                workflow: self.kind().to_string(),
                stage: raw.to_string(),
                expected: self
                    .stages()
                    .iter()
                    .map(|def| def.name)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
        }
    }

    /// Parse the `completed_stage` argument of `finish`.
    fn parse_finish_stage(&self, raw: &str) -> Result<FinishStage, StateError> {
        if raw == WHOLE_TASK {
            return Ok(FinishStage::WholeTask);
        }
        self.parse_stage(raw).map(FinishStage::Stage)
    }

    fn initial_stage(&self) -> Stage {
        Stage::new(self.initial())
    }

    fn terminal_stage(&self) -> Stage {
        Stage::new(self.terminal())
    }

    fn is_terminal(&self, stage: &Stage) -> bool {
        stage.as_str() == self.terminal()
    }

    /// Position of `stage` in workflow order.
    fn rank(&self, stage: &Stage) -> Option<usize> {
        self.stages()
            .iter()
            .position(|def| def.name == stage.as_str())
    }

    /// Stages an explicit `--next` may name: everything but the initial stage.
    fn valid_finish_targets(&self) -> Vec<Stage> {
        self.stages()
            .iter()
            .filter(|def| def.name != self.initial())
            .map(|def| Stage::new(def.name))
            .collect()
    }

    fn is_valid_finish_target(&self, stage: &Stage) -> bool {
        self.contains(stage.as_str()) && stage.as_str() != self.initial()
    }

    fn is_queue_stage(&self, stage: &Stage) -> bool {
        self.queue_stages().contains(&stage.as_str())
    }

    /// Default next stage after finishing `finished`.
    fn next_after(&self, finished: &FinishStage) -> Option<Stage> {
        match finished {
            FinishStage::WholeTask => Some(self.terminal_stage()),
            FinishStage::Stage(stage) => self.default_next(stage.as_str()).map(Stage::new),
        }
    }

    fn label(&self, stage: &Stage) -> &'static str {
        self.stages()
            .iter()
            .find(|def| def.name == stage.as_str())
            .map_or("Unknown", |def| def.label)
    }
}

/// Spec-driven software workflow: spec, plan, build, review.
pub struct CodeWorkflow;

const CODE_STAGES: [StageDef; 7] = [
    stage("spec", "Spec"),
    stage("spec-review", "Spec Review"),
    stage("spec-review-issues", "Spec Review Issues"),
    stage("planning", "Planning"),
    stage("build", "Build"),
    stage("review", "Review"),
    stage("completed", "Completed"),
];

impl Workflow for CodeWorkflow {
    fn kind(&self) -> WorkflowKind {
        WorkflowKind::Code
    }

    fn stages(&self) -> &'static [StageDef] {
        &CODE_STAGES
    }

    fn initial(&self) -> &'static str {
        "spec"
    }

    fn terminal(&self) -> &'static str {
        "completed"
    }

    fn default_next(&self, stage: &str) -> Option<&'static str> {
        match stage {
            "spec" | "spec-review" | "spec-review-issues" => Some("planning"),
            "planning" => Some("build"),
            "build" => Some("review"),
            "review" => Some("completed"),
            _ => None,
        }
    }

    fn handoff_stage(&self) -> Option<&'static str> {
        Some("build")
    }

    fn queue_stages(&self) -> &'static [&'static str] {
        &["spec-review-issues", "build", "review"]
    }

    fn rework_stage(&self) -> &'static str {
        "build"
    }

    fn oscillation_pair(&self) -> Option<(&'static str, &'static str)> {
        Some(("review", "build"))
    }
}

/// Long-form writing workflow: outline, draft, edit.
pub struct WriterWorkflow;

const WRITER_STAGES: [StageDef; 5] = [
    stage("init", "Init"),
    stage("plan", "Plan"),
    stage("write", "Write"),
    stage("edit", "Edit"),
    stage("completed", "Completed"),
];

impl Workflow for WriterWorkflow {
    fn kind(&self) -> WorkflowKind {
        WorkflowKind::Writer
    }

    fn stages(&self) -> &'static [StageDef] {
        &WRITER_STAGES
    }

    fn initial(&self) -> &'static str {
        "init"
    }

    fn terminal(&self) -> &'static str {
        "completed"
    }

    fn default_next(&self, stage: &str) -> Option<&'static str> {
        match stage {
            "init" => Some("plan"),
            "plan" => Some("write"),
            "write" => Some("edit"),
            "edit" => Some("completed"),
            _ => None,
        }
    }

    fn handoff_stage(&self) -> Option<&'static str> {
        None
    }

    fn queue_stages(&self) -> &'static [&'static str] {
        &["write", "edit"]
    }

    fn rework_stage(&self) -> &'static str {
        "write"
    }

    fn oscillation_pair(&self) -> Option<(&'static str, &'static str)> {
        Some(("edit", "write"))
    }
}

/// Which workflow a task follows. Also the per-workflow directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowKind {
    Code,
    Writer,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 2] = [WorkflowKind::Code, WorkflowKind::Writer];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowKind::Code => "code",
            WorkflowKind::Writer => "writer",
        }
    }

    pub fn definition(self) -> &'static dyn Workflow {
        match self {
            WorkflowKind::Code => &CodeWorkflow,
            WorkflowKind::Writer => &WriterWorkflow,
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowKind {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| StateError::UnknownWorkflow(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    /// Every stage a workflow refers to must be one of its own stages.
    #[test]
    fn definitions_are_closed_over_their_stages() {
        for kind in WorkflowKind::ALL {
            let wf = kind.definition();
            assert_eq!(wf.kind(), kind);
            assert!(wf.contains(wf.initial()), "{kind}: initial");
            assert!(wf.contains(wf.terminal()), "{kind}: terminal");
            assert!(wf.contains(wf.rework_stage()), "{kind}: rework");
            assert_ne!(wf.rework_stage(), wf.terminal());
            if let Some(handoff) = wf.handoff_stage() {
                assert!(wf.contains(handoff), "{kind}: handoff");
            }
            for def in wf.stages() {
                if let Some(next) = wf.default_next(def.name) {
                    assert!(wf.contains(next), "{kind}: {} -> {next}", def.name);
                }
            }
            for queued in wf.queue_stages() {
                assert!(wf.contains(queued), "{kind}: queue stage {queued}");
            }
            if let Some((from, to)) = wf.oscillation_pair() {
                assert!(wf.contains(from) && wf.contains(to));
            }
            assert!(wf.default_next(wf.terminal()).is_none());
        }
    }

    #[test]
    fn working_stages_do_not_overlap_between_kinds() {
        let code: HashSet<_> = CodeWorkflow
            .stages()
            .iter()
            .map(|def| def.name)
            .filter(|name| *name != CodeWorkflow.terminal())
            .collect();
        assert!(
            WriterWorkflow
                .stages()
                .iter()
                .all(|def| def.name == WriterWorkflow.terminal() || !code.contains(def.name))
        );
    }

    #[test]
    fn code_default_graph_matches_expected_edges() {
        let wf = CodeWorkflow;
        assert_eq!(wf.default_next("spec"), Some("planning"));
        assert_eq!(wf.default_next("spec-review"), Some("planning"));
        assert_eq!(wf.default_next("spec-review-issues"), Some("planning"));
        assert_eq!(wf.default_next("planning"), Some("build"));
        assert_eq!(wf.default_next("build"), Some("review"));
        assert_eq!(wf.default_next("review"), Some("completed"));
    }

    #[test]
    fn finish_targets_exclude_initial_stage() {
        let wf = CodeWorkflow;
        let targets = wf.valid_finish_targets();
        assert!(!targets.contains(&Stage::new("spec")));
        assert!(targets.contains(&Stage::new("build")));
        assert!(targets.contains(&Stage::new("completed")));
        assert!(!wf.is_valid_finish_target(&Stage::new("spec")));
        assert!(!wf.is_valid_finish_target(&Stage::new("bogus")));
    }

    #[test]
    fn whole_task_sentinel_finishes_at_terminal() {
        let wf = WriterWorkflow;
        let finished = wf.parse_finish_stage("task").expect("sentinel");
        assert_eq!(finished, FinishStage::WholeTask);
        assert_eq!(wf.next_after(&finished), Some(Stage::new("completed")));
    }

    #[test]
    fn unknown_stage_is_rejected_with_choices() {
        let err = WriterWorkflow.parse_stage("build").expect_err("unknown");
        let msg = err.to_string();
        assert!(msg.contains("unknown stage 'build'"), "{msg}");
        assert!(msg.contains("init, plan, write, edit, completed"), "{msg}");
    }

    #[test]
    fn workflow_kind_parses_names() {
        assert_eq!("code".parse::<WorkflowKind>().ok(), Some(WorkflowKind::Code));
        assert_eq!(
            "writer".parse::<WorkflowKind>().ok(),
            Some(WorkflowKind::Writer)
        );
        assert!("docs".parse::<WorkflowKind>().is_err());
    }
}
