//! Test-only helpers: a throwaway repository, a scripted liveness probe and a
//! scripted model process.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tempfile::TempDir;

use crate::core::selector::LoopLimit;
use crate::core::types::{Owner, SessionRecord, TaskName, TaskRecord};
use crate::core::workflow::WorkflowKind;
use crate::finish::{FinishArgs, finish};
use crate::io::config::{StagehandConfig, write_config};
use crate::io::executor::{ExecExit, Executor, StageRequest};
use crate::io::paths::{StagehandPaths, config_path};
use crate::io::process::{ProcessProbe, Watch};
use crate::io::sessions::{open_session, require_session};
use crate::io::tasks::{create_task, require_task, save_task};
use crate::workspace::{LOOP_LIMIT_ENV, SESSION_ENV, WORKFLOW_ENV, Workspace};

/// Host name every test owner reports.
pub const TEST_HOST: &str = "test-host";
/// Pid of the owner returned by [`TestWorkspace::workspace`].
pub const TEST_PID: u32 = 4242;

/// Liveness probe with a fixed set of dead pids.
#[derive(Debug, Clone, Default)]
pub struct FixedProbe {
    dead: Vec<u32>,
}

impl FixedProbe {
    pub fn all_alive() -> Self {
        Self::default()
    }

    pub fn dead(pids: &[u32]) -> Self {
        Self {
            dead: pids.to_vec(),
        }
    }
}

impl ProcessProbe for FixedProbe {
    fn is_alive(&self, pid: u32) -> bool {
        !self.dead.contains(&pid)
    }
}

/// A repository in a temp directory with the state tree created.
pub struct TestWorkspace {
    temp: TempDir,
    paths: StagehandPaths,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Self::with_workflow(WorkflowKind::Code)
    }

    pub fn with_workflow(kind: WorkflowKind) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = StagehandPaths::new(temp.path(), kind);
        paths.ensure_dirs()?;
        Ok(Self { temp, paths })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &StagehandPaths {
        &self.paths
    }

    pub fn kind(&self) -> WorkflowKind {
        self.paths.kind
    }

    /// Workspace owned by [`TEST_PID`] on [`TEST_HOST`]; every pid is alive.
    pub fn workspace(&self) -> Workspace {
        self.workspace_as(TEST_PID)
    }

    /// Workspace of another worker process on the same host.
    pub fn workspace_as(&self, pid: u32) -> Workspace {
        self.workspace_with(pid, FixedProbe::all_alive())
    }

    pub fn workspace_with(&self, pid: u32, probe: FixedProbe) -> Workspace {
        Workspace::open(self.path(), Some(self.kind()))
            .expect("open test workspace")
            .with_probe(probe)
            .with_owner(Owner {
                pid,
                host: TEST_HOST.to_string(),
            })
    }

    pub fn write_config(&self, config: &StagehandConfig) -> Result<()> {
        write_config(&config_path(self.path()), config)
    }

    /// Create a pending task at the initial stage.
    pub fn add_task(&self, name: &str) -> Result<TaskRecord> {
        let task = TaskRecord::new(TaskName::parse(name)?, self.kind(), Utc::now());
        create_task(&self.paths, &task)?;
        Ok(task)
    }

    /// Create a pending task already at `stage`.
    pub fn add_task_at(&self, name: &str, stage: &str) -> Result<TaskRecord> {
        let mut task = self.add_task(name)?;
        task.stage = self.kind().definition().parse_stage(stage)?;
        save_task(&self.paths, &task)?;
        Ok(task)
    }

    /// Open a running session for `name` as the test owner, without a claim.
    pub fn open_session(&self, name: &str) -> Result<SessionRecord> {
        let mut task = self.task(name)?;
        let owner = Owner {
            pid: TEST_PID,
            host: TEST_HOST.to_string(),
        };
        Ok(open_session(&self.paths, &mut task, &owner, Utc::now())?)
    }

    pub fn task(&self, name: &str) -> Result<TaskRecord> {
        Ok(require_task(
            &self.paths,
            self.kind().definition(),
            &TaskName::parse(name)?,
        )?)
    }
}

/// What the scripted model does with one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedStage {
    /// Call finish for the running stage, optionally with `--next`.
    Finish { next: Option<String> },
    /// Exit with code 1 without calling finish.
    ExitWithoutFinish,
    /// Behave as if the operator pressed Ctrl-C.
    Interrupt,
}

impl ScriptedStage {
    pub fn finish() -> Self {
        ScriptedStage::Finish { next: None }
    }

    pub fn finish_to(next: &str) -> Self {
        ScriptedStage::Finish {
            next: Some(next.to_string()),
        }
    }
}

/// Executor that plays back a script instead of spawning a process.
///
/// A `Finish` step calls finish the way a model process would: through the
/// session id and loop limit it finds in the request environment.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<ScriptedStage>>,
    requests: Mutex<Vec<StageRequest>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<ScriptedStage>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<StageRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script lock").len()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(
        &self,
        request: &StageRequest,
        watch: &mut dyn FnMut() -> Result<Watch>,
    ) -> Result<ExecExit> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let step = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted executor has no stage left"))?;
        match step {
            ScriptedStage::Finish { next } => {
                finish_as_model(request, next.as_deref())?;
                Ok(match watch()? {
                    Watch::Stop => ExecExit::Stopped,
                    Watch::Continue | Watch::Interrupt => ExecExit::Exited(Some(0)),
                })
            }
            ScriptedStage::ExitWithoutFinish => {
                watch()?;
                Ok(ExecExit::Exited(Some(1)))
            }
            ScriptedStage::Interrupt => Ok(ExecExit::Interrupted),
        }
    }
}

fn finish_as_model(request: &StageRequest, next: Option<&str>) -> Result<()> {
    let kind: WorkflowKind = request
        .env_value(WORKFLOW_ENV)
        .ok_or_else(|| anyhow!("{WORKFLOW_ENV} not set"))?
        .parse()?;
    let session_id = request
        .env_value(SESSION_ENV)
        .ok_or_else(|| anyhow!("{SESSION_ENV} not set"))?;
    let loop_limit = request
        .env_value(LOOP_LIMIT_ENV)
        .map(str::parse::<LoopLimit>)
        .transpose()
        .map_err(anyhow::Error::msg)?
        .unwrap_or_default();

    let ws = Workspace::open(&request.workdir, Some(kind))?;
    let session = require_session(&ws.paths, session_id)?;
    finish(
        &ws,
        &ws.issues(),
        &FinishArgs {
            completed: Some(session.stage.as_str()),
            next,
            env_session: Some(session_id),
            loop_limit,
            ..FinishArgs::default()
        },
    )?;
    Ok(())
}
