//! `stagehand` CLI.
//!
//! Each command opens the workspace (repo root, workflow kind, config), runs
//! one orchestration call and maps typed failures to stable exit codes.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stagehand::admin;
use stagehand::core::selector::LoopLimit;
use stagehand::core::types::{TaskName, TaskStatus};
use stagehand::core::workflow::WorkflowKind;
use stagehand::error::exit_code_for;
use stagehand::exit_codes;
use stagehand::finish::{FinishArgs, finish};
use stagehand::io::executor::CommandExecutor;
use stagehand::io::process::install_interrupt_handler;
use stagehand::logging;
use stagehand::queue::{Enqueued, dequeue, enqueue, list_view, render_queue};
use stagehand::run::{
    QueueStop, RunOptions, RunStop, StageOutcome, StageRun, reconcile, run_next, run_queue,
    run_task,
};
use stagehand::workspace::{
    LOOP_LIMIT_ENV, REPO_ROOT_ENV, SESSION_ENV, WORKFLOW_ENV, Workspace, resolve_root,
};
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Run tasks through workflow stages, one model session at a time"
)]
struct Cli {
    /// Workflow kind (default: STAGEHAND_WORKFLOW, then config).
    #[arg(long, global = true)]
    workflow: Option<WorkflowKind>,
    /// Repository root (default: STAGEHAND_REPO_ROOT, then discovery).
    #[arg(long, global = true)]
    repo: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.stagehand/config.toml` and the workflow directories.
    Init,
    /// Create a task, or show an existing one.
    Task {
        name: TaskName,
        /// Put the new task in the backlog.
        #[arg(long)]
        hold: bool,
    },
    /// Show the queue, or start tracking an existing task directory.
    Queue { task: Option<TaskName> },
    /// Remove a task with its directory, sessions and issues.
    Dequeue {
        task: TaskName,
        /// Also delete the task's open issues.
        #[arg(long)]
        force: bool,
    },
    /// Run a task's stages until it completes.
    Run {
        task: TaskName,
        /// Stop when the task reaches the workflow's handoff stage.
        #[arg(long)]
        handoff: bool,
    },
    /// Run one stage of the named task or of the next eligible task.
    RunNext { task: Option<TaskName> },
    /// Run eligible tasks until none is left.
    RunQueue {
        /// Oscillation limit; 0 or `unbounded` disables it.
        #[arg(long = "loop")]
        loop_limit: Option<LoopLimit>,
    },
    /// Finish the running stage and advance the task.
    Finish {
        /// Stage being finished; omitted means the whole task.
        stage: Option<String>,
        /// Stage to move to instead of the default next stage.
        #[arg(long)]
        next: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        task: Option<TaskName>,
    },
    /// Move a task to the backlog.
    Hold { task: TaskName },
    /// Take a task out of the backlog; revives failed tasks.
    Activate { task: TaskName },
    /// Override a task's stage.
    SetStage {
        task: TaskName,
        stage: String,
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// List issues.
    Issues {
        #[arg(long)]
        task: Option<TaskName>,
        /// Include resolved issues.
        #[arg(long)]
        all: bool,
    },
    /// Open or resolve an issue.
    Issue {
        #[command(subcommand)]
        command: IssueCommand,
    },
}

#[derive(Subcommand)]
enum IssueCommand {
    /// Open an issue against a task.
    Add {
        task: TaskName,
        title: String,
        /// Stage the task should go back to while the issue is open.
        #[arg(long)]
        stage: Option<String>,
    },
    /// Resolve an issue by id.
    Resolve { id: String },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cwd = env::current_dir().context("read current directory")?;
    let root = resolve_root(cli.repo, env_value(REPO_ROOT_ENV).map(PathBuf::from), &cwd);
    let kind = match cli.workflow {
        Some(kind) => Some(kind),
        None => env_value(WORKFLOW_ENV)
            .map(|raw| raw.parse::<WorkflowKind>())
            .transpose()?,
    };
    debug!(root = %root.display(), workflow = ?kind, "resolved invocation");

    if let Command::Init = cli.command {
        let report = admin::init(&root, kind.unwrap_or(WorkflowKind::Code))?;
        if report.config_written {
            println!("Wrote {}", root.join(".stagehand/config.toml").display());
        }
        println!("Initialized {}", report.workflow_dir.display());
        return Ok(exit_codes::OK);
    }

    let ws = Workspace::open(&root, kind)?;
    match cli.command {
        Command::Init => Ok(exit_codes::OK),
        Command::Task { name, hold } => {
            let view = admin::create_or_show(&ws, &name, hold)?;
            print!("{}", admin::render_task(&ws, &view));
            Ok(exit_codes::OK)
        }
        Command::Queue { task: Some(name) } => {
            match enqueue(&ws, &name)? {
                Enqueued::Adopted(task) => println!("Queued {} at {}", task.name, task.stage),
                Enqueued::Existing(task) => {
                    println!("{} is at {} ({})", task.name, task.stage, task.status);
                }
            }
            Ok(exit_codes::OK)
        }
        Command::Queue { task: None } => {
            let listing = list_view(&ws)?;
            for name in &listing.adopted {
                println!("Adopted task directory {name}");
            }
            print!("{}", render_queue(&ws, &listing)?);
            Ok(exit_codes::OK)
        }
        Command::Dequeue { task, force } => {
            let removed = dequeue(&ws, &task, force)?;
            println!(
                "Removed {task} ({} sessions, {} issues)",
                removed.sessions, removed.issues
            );
            Ok(exit_codes::OK)
        }
        Command::Run { task, handoff } => {
            prepare_run(&ws)?;
            let options = RunOptions {
                handoff,
                loop_limit: resolve_loop_limit(&ws, None)?,
            };
            let report = run_task(&ws, &CommandExecutor, &task, options, print_stage)?;
            Ok(match report.stop {
                RunStop::Completed => {
                    println!("Task {task} completed.");
                    exit_codes::OK
                }
                RunStop::Handoff(stage) => {
                    println!("Task {task} is ready at {stage}. Run `stagehand run-queue` to continue.");
                    exit_codes::OK
                }
                RunStop::Failed(reason) => {
                    println!(
                        "Task {task} failed: {}",
                        reason.as_deref().unwrap_or("no diagnostic")
                    );
                    exit_codes::FAILURE
                }
                RunStop::NoFinish => exit_codes::OK,
                RunStop::Interrupted => exit_codes::INTERRUPTED,
            })
        }
        Command::RunNext { task } => {
            prepare_run(&ws)?;
            let loop_limit = resolve_loop_limit(&ws, None)?;
            match run_next(&ws, &CommandExecutor, task.as_ref(), loop_limit)? {
                Some(run) => {
                    print_stage(&run);
                    Ok(if run.outcome == StageOutcome::Interrupted {
                        exit_codes::INTERRUPTED
                    } else {
                        exit_codes::OK
                    })
                }
                None => {
                    println!("No eligible tasks.");
                    Ok(exit_codes::IDLE)
                }
            }
        }
        Command::RunQueue { loop_limit } => {
            prepare_run(&ws)?;
            let loop_limit = resolve_loop_limit(&ws, loop_limit)?;
            let report = run_queue(&ws, &CommandExecutor, loop_limit, print_stage)?;
            Ok(match report.stop {
                QueueStop::Idle => {
                    println!("Queue processing complete.");
                    exit_codes::OK
                }
                QueueStop::NoFinish(task) => {
                    println!("Stopped: {task} ended without finishing.");
                    exit_codes::OK
                }
                QueueStop::Interrupted => exit_codes::INTERRUPTED,
            })
        }
        Command::Finish {
            stage,
            next,
            session,
            task,
        } => {
            let env_session = env_value(SESSION_ENV);
            let advanced = finish(
                &ws,
                &ws.issues(),
                &FinishArgs {
                    completed: stage.as_deref(),
                    next: next.as_deref(),
                    session: session.as_deref(),
                    env_session: env_session.as_deref(),
                    task: task.as_ref(),
                    loop_limit: resolve_loop_limit(&ws, None)?,
                },
            )?;
            println!("{advanced}");
            Ok(exit_codes::OK)
        }
        Command::Hold { task } => {
            admin::hold(&ws, &task)?;
            println!("Held {task}");
            Ok(exit_codes::OK)
        }
        Command::Activate { task } => {
            let record = admin::activate(&ws, &task)?;
            println!("Activated {task} ({})", record.status);
            Ok(exit_codes::OK)
        }
        Command::SetStage {
            task,
            stage,
            status,
        } => {
            let record = admin::set_stage(&ws, &task, &stage, status)?;
            println!("Set {task} to {} ({})", record.stage, record.status);
            Ok(exit_codes::OK)
        }
        Command::Issues { task, all } => {
            let issues = admin::list_issues(&ws, task.as_ref(), all)?;
            print!("{}", admin::render_issues(&issues));
            Ok(exit_codes::OK)
        }
        Command::Issue {
            command: IssueCommand::Add { task, title, stage },
        } => {
            let issue = admin::add_issue(&ws, &task, &title, stage.as_deref())?;
            println!("Opened {}", issue.id);
            Ok(exit_codes::OK)
        }
        Command::Issue {
            command: IssueCommand::Resolve { id },
        } => {
            let issue = admin::resolve_issue(&ws, &id)?;
            println!("Resolved {}", issue.id);
            Ok(exit_codes::OK)
        }
    }
}

/// Explicit flag, then the limit inherited from a `run-queue`, then config.
fn resolve_loop_limit(ws: &Workspace, explicit: Option<LoopLimit>) -> Result<LoopLimit> {
    if let Some(limit) = explicit {
        return Ok(limit);
    }
    match env_value(LOOP_LIMIT_ENV) {
        Some(raw) => raw
            .parse::<LoopLimit>()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("parse {LOOP_LIMIT_ENV}")),
        None => Ok(ws.config.loop_limit()),
    }
}

fn prepare_run(ws: &Workspace) -> Result<()> {
    install_interrupt_handler()?;
    for recovery in reconcile(ws)? {
        println!("{recovery}");
    }
    Ok(())
}

fn print_stage(run: &StageRun) {
    println!("{run}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_accepts_optional_stage_and_flags() {
        let cli = Cli::try_parse_from([
            "stagehand", "finish", "review", "--next", "build", "--session", "1-2-3",
        ])
        .expect("parse");
        match cli.command {
            Command::Finish {
                stage,
                next,
                session,
                task,
            } => {
                assert_eq!(stage.as_deref(), Some("review"));
                assert_eq!(next.as_deref(), Some("build"));
                assert_eq!(session.as_deref(), Some("1-2-3"));
                assert!(task.is_none());
            }
            _ => panic!("expected finish"),
        }
        let cli = Cli::try_parse_from(["stagehand", "finish"]).expect("parse");
        assert!(matches!(cli.command, Command::Finish { stage: None, .. }));
    }

    #[test]
    fn run_queue_loop_accepts_numbers_and_unbounded() {
        let cli = Cli::try_parse_from(["stagehand", "run-queue", "--loop", "2"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::RunQueue {
                loop_limit: Some(LoopLimit::Bounded(2))
            }
        ));
        let cli = Cli::try_parse_from(["stagehand", "run-queue", "--loop", "0"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::RunQueue {
                loop_limit: Some(LoopLimit::Unbounded)
            }
        ));
    }

    #[test]
    fn invalid_task_names_and_workflows_are_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["stagehand", "task", "../escape"]).is_err());
        assert!(Cli::try_parse_from(["stagehand", "--workflow", "poetry", "queue"]).is_err());
        let cli = Cli::try_parse_from(["stagehand", "queue", "--workflow", "writer"]).expect("parse");
        assert_eq!(cli.workflow, Some(WorkflowKind::Writer));
    }

    #[test]
    fn set_stage_parses_status() {
        let cli = Cli::try_parse_from(["stagehand", "set-stage", "alpha", "build", "--status", "incomplete"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Command::SetStage {
                status: Some(TaskStatus::Incomplete),
                ..
            }
        ));
    }
}
