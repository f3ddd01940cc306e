//! File-backed issue tracker (`issues/<id>.json`).
//!
//! The transition protocol only asks two questions of it; opening and
//! resolving issues is an operator concern handled in `crate::admin`.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::core::types::{IssueRecord, IssueStatus, RECORD_VERSION, TaskName};
use crate::core::workflow::{Stage, Workflow};
use crate::error::{EntityKind, StateError, StateResult};
use crate::io::paths::StagehandPaths;
use crate::io::store::{create_record, list_records, read_record, remove_record, write_record};

/// What the finish protocol needs to know about open issues.
pub trait IssueTracker {
    fn has_open_issues(&self, task: &TaskName) -> StateResult<bool>;
    /// Stage a task with open issues is sent back to instead of completing.
    fn preferred_reentry_stage(&self, task: &TaskName) -> StateResult<Stage>;
}

pub struct FileIssueTracker<'a> {
    paths: &'a StagehandPaths,
    workflow: &'a dyn Workflow,
}

impl<'a> FileIssueTracker<'a> {
    pub fn new(paths: &'a StagehandPaths, workflow: &'a dyn Workflow) -> Self {
        Self { paths, workflow }
    }

    /// All issues, oldest first. Unreadable records are logged and skipped.
    pub fn list(&self) -> StateResult<Vec<IssueRecord>> {
        let mut issues = Vec::new();
        for result in list_records::<IssueRecord>(&self.paths.issues_dir)? {
            match result {
                Ok(issue) => issues.push(issue),
                Err(err) => warn!(err = %err, "skipping unreadable issue record"),
            }
        }
        issues.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(issues)
    }

    pub fn open_for(&self, task: &TaskName) -> StateResult<Vec<IssueRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|issue| &issue.task == task && issue.status == IssueStatus::Open)
            .collect())
    }

    /// Record a new open issue. Ids are `<task>-<n>`, first free `n`.
    pub fn open(
        &self,
        task: &TaskName,
        title: &str,
        stage: Option<Stage>,
        now: DateTime<Utc>,
    ) -> StateResult<IssueRecord> {
        let mut n = self.list()?.iter().filter(|issue| &issue.task == task).count() + 1;
        loop {
            let issue = IssueRecord {
                version: RECORD_VERSION,
                id: format!("{task}-{n}"),
                task: task.clone(),
                title: title.to_string(),
                status: IssueStatus::Open,
                stage: stage.clone(),
                created_at: now,
                resolved_at: None,
            };
            match create_record(&self.paths.issue_path(&issue.id), &issue) {
                Ok(()) => {
                    info!(task = %task, issue = %issue.id, "issue opened");
                    return Ok(issue);
                }
                Err(StateError::AlreadyExists { .. }) => n += 1,
                Err(err) => return Err(err),
            }
        }
    }

    /// Delete every issue of `task`, open or resolved.
    pub fn remove_for(&self, task: &TaskName) -> StateResult<usize> {
        let mut removed = 0;
        for issue in self.list()?.into_iter().filter(|issue| &issue.task == task) {
            if remove_record(&self.paths.issue_path(&issue.id))? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(task = %task, removed, "issues removed with task");
        }
        Ok(removed)
    }

    pub fn resolve(&self, issue_id: &str, now: DateTime<Utc>) -> StateResult<IssueRecord> {
        if TaskName::parse(issue_id).is_err() {
            return Err(StateError::not_found(EntityKind::Issue, issue_id));
        }
        let path = self.paths.issue_path(issue_id);
        let mut issue = read_record::<IssueRecord>(&path)?
            .ok_or_else(|| StateError::not_found(EntityKind::Issue, issue_id))?;
        if issue.status == IssueStatus::Open {
            issue.status = IssueStatus::Resolved;
            issue.resolved_at = Some(now);
            write_record(&path, &issue)?;
            info!(task = %issue.task, issue = %issue.id, "issue resolved");
        }
        Ok(issue)
    }
}

impl IssueTracker for FileIssueTracker<'_> {
    fn has_open_issues(&self, task: &TaskName) -> StateResult<bool> {
        Ok(!self.open_for(task)?.is_empty())
    }

    fn preferred_reentry_stage(&self, task: &TaskName) -> StateResult<Stage> {
        let named = self
            .open_for(task)?
            .into_iter()
            .filter_map(|issue| issue.stage)
            .find(|stage| self.workflow.contains(stage.as_str()) && !self.workflow.is_terminal(stage));
        Ok(named.unwrap_or_else(|| Stage::new(self.workflow.rework_stage())))
    }
}
