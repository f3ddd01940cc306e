//! Task record access (`tasks/<name>/task.json`).

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::types::{TaskName, TaskRecord, TaskStatus};
use crate::core::workflow::Workflow;
use crate::error::{EntityKind, StateError, StateResult};
use crate::io::paths::StagehandPaths;
use crate::io::store::{create_record, read_record, write_record};

/// Reject records that parse but contradict their workflow.
fn check_task(path: &Path, workflow: &dyn Workflow, task: TaskRecord) -> StateResult<TaskRecord> {
    let corrupt = |reason: String| StateError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    if task.workflow != workflow.kind() {
        return Err(corrupt(format!(
            "task belongs to workflow {}, found under {}",
            task.workflow,
            workflow.kind()
        )));
    }
    if !workflow.contains(task.stage.as_str()) {
        return Err(corrupt(format!(
            "stage {} is not a {} stage",
            task.stage,
            workflow.kind()
        )));
    }
    if task.status == TaskStatus::Completed && !workflow.is_terminal(&task.stage) {
        return Err(corrupt(format!(
            "status completed at non-terminal stage {}",
            task.stage
        )));
    }
    let dir_name = path
        .parent()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str());
    if dir_name != Some(task.name.as_str()) {
        return Err(corrupt(format!(
            "record names task {} but lives in another task directory",
            task.name
        )));
    }
    Ok(task)
}

pub fn load_task(
    paths: &StagehandPaths,
    workflow: &dyn Workflow,
    name: &TaskName,
) -> StateResult<Option<TaskRecord>> {
    let path = paths.task_path(name);
    read_record::<TaskRecord>(&path)?
        .map(|task| check_task(&path, workflow, task))
        .transpose()
}

/// Load a task that must exist.
pub fn require_task(
    paths: &StagehandPaths,
    workflow: &dyn Workflow,
    name: &TaskName,
) -> StateResult<TaskRecord> {
    load_task(paths, workflow, name)?.ok_or_else(|| StateError::not_found(EntityKind::Task, name.as_str()))
}

pub fn save_task(paths: &StagehandPaths, task: &TaskRecord) -> StateResult<()> {
    debug!(task = %task.name, stage = %task.stage, status = %task.status, "saving task");
    write_record(&paths.task_path(&task.name), task)
}

/// Create a task record; [`StateError::AlreadyExists`] if one is present.
pub fn create_task(paths: &StagehandPaths, task: &TaskRecord) -> StateResult<()> {
    create_record(&paths.task_path(&task.name), task)
}

/// Everything found under `tasks/`.
#[derive(Debug, Default)]
pub struct TaskScan {
    pub tasks: Vec<TaskRecord>,
    /// Task directories without a record yet.
    pub untracked: Vec<TaskName>,
    pub corrupt: Vec<StateError>,
}

/// Scan task directories. Never adopts; see `crate::queue::list_view`.
pub fn scan_tasks(paths: &StagehandPaths, workflow: &dyn Workflow) -> StateResult<TaskScan> {
    let mut scan = TaskScan::default();
    let entries = match fs::read_dir(&paths.tasks_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(scan),
        Err(err) => return Err(StateError::io("list", &paths.tasks_dir, err)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StateError::io("list", &paths.tasks_dir, err))?;
        if !entry.path().is_dir() {
            continue;
        }
        let raw = entry.file_name().to_string_lossy().into_owned();
        match TaskName::parse(&raw) {
            Ok(name) => names.push(name),
            Err(err) => warn!(dir = %entry.path().display(), err = %err, "ignoring task directory"),
        }
    }
    names.sort();
    for name in names {
        match load_task(paths, workflow, &name) {
            Ok(Some(task)) => scan.tasks.push(task),
            Ok(None) => scan.untracked.push(name),
            Err(err) => scan.corrupt.push(err),
        }
    }
    Ok(scan)
}

/// Delete a task's directory, record included.
pub fn remove_task_dir(paths: &StagehandPaths, name: &TaskName) -> Result<()> {
    let dir = paths.task_dir(name);
    fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::core::workflow::{CodeWorkflow, Stage, WorkflowKind, WriterWorkflow};

    fn fixture() -> (tempfile::TempDir, StagehandPaths) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = StagehandPaths::new(temp.path(), WorkflowKind::Code);
        (temp, paths)
    }

    fn new_task(raw: &str) -> TaskRecord {
        TaskRecord::new(
            TaskName::parse(raw).expect("name"),
            WorkflowKind::Code,
            Utc::now(),
        )
    }

    #[test]
    fn require_missing_task_is_not_found() {
        let (_temp, paths) = fixture();
        let err = require_task(&paths, &CodeWorkflow, &TaskName::parse("ghost").expect("name"))
            .expect_err("missing");
        assert!(matches!(
            err,
            StateError::NotFound {
                kind: EntityKind::Task,
                ..
            }
        ));
    }

    #[test]
    fn stage_outside_workflow_is_corrupt() {
        let (_temp, paths) = fixture();
        let mut task = new_task("alpha");
        task.stage = Stage::new("edit");
        save_task(&paths, &task).expect("save");
        let err = load_task(&paths, &CodeWorkflow, &task.name).expect_err("corrupt");
        assert!(err.to_string().contains("not a code stage"), "{err}");
    }

    #[test]
    fn record_under_wrong_workflow_is_corrupt() {
        let (_temp, paths) = fixture();
        let task = new_task("alpha");
        save_task(&paths, &task).expect("save");
        assert!(load_task(&paths, &WriterWorkflow, &task.name).is_err());
    }

    #[test]
    fn scan_separates_untracked_and_corrupt() {
        let (_temp, paths) = fixture();
        save_task(&paths, &new_task("tracked")).expect("save");
        fs::create_dir_all(paths.tasks_dir.join("untracked")).expect("mkdir");
        fs::create_dir_all(paths.tasks_dir.join("broken")).expect("mkdir");
        fs::write(paths.tasks_dir.join("broken/task.json"), "{").expect("write");
        fs::create_dir_all(paths.tasks_dir.join("Bad Name")).expect("mkdir");

        let scan = scan_tasks(&paths, &CodeWorkflow).expect("scan");
        assert_eq!(scan.tasks.len(), 1);
        assert_eq!(scan.tasks[0].name.as_str(), "tracked");
        assert_eq!(scan.untracked, vec![TaskName::parse("untracked").expect("name")]);
        assert_eq!(scan.corrupt.len(), 1);
    }

    #[test]
    fn create_task_does_not_overwrite() {
        let (_temp, paths) = fixture();
        let task = new_task("alpha");
        create_task(&paths, &task).expect("create");
        assert!(matches!(
            create_task(&paths, &task),
            Err(StateError::AlreadyExists { .. })
        ));
    }
}
