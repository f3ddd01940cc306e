//! Typed failures of the state model.
//!
//! Orchestration code works in `anyhow::Result`, but every failure a script
//! may want to branch on originates as a [`StateError`] somewhere in the
//! chain. [`exit_code_for`] recovers it to pick a stable exit code.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::exit_codes;

/// The record kind a [`StateError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Task,
    Session,
    Claim,
    Issue,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Task => "task",
            EntityKind::Session => "session",
            EntityKind::Claim => "claim",
            EntityKind::Issue => "issue",
        })
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    /// Another live owner holds the claim. Expected under parallel workers.
    #[error("task {task} is busy: claimed by {owner}")]
    Busy { task: String, owner: String },

    #[error("cannot resolve a session ({reason}); pass --session{}", render_candidates(.candidates))]
    Ambiguous {
        reason: String,
        candidates: Vec<String>,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("invalid transition for task {task} at stage {stage}: {detail}")]
    InvalidTransition {
        task: String,
        stage: String,
        detail: String,
    },

    #[error("unknown stage '{stage}' for workflow {workflow} (expected one of: {expected})")]
    UnknownStage {
        workflow: String,
        stage: String,
        expected: String,
    },

    #[error("unknown workflow '{0}' (expected one of: code, writer)")]
    UnknownWorkflow(String),

    #[error("invalid task name '{name}': {reason}")]
    InvalidTaskName { name: String, reason: String },

    #[error("corrupt record {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("record already exists: {}", .path.display())]
    AlreadyExists { path: PathBuf },

    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type StateResult<T> = std::result::Result<T, StateError>;

impl StateError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StateError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        StateError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StateError::Busy { .. } => exit_codes::BUSY,
            StateError::Ambiguous { .. } => exit_codes::AMBIGUOUS_SESSION,
            StateError::NotFound { .. } => exit_codes::NOT_FOUND,
            StateError::InvalidTransition { .. } | StateError::UnknownStage { .. } => {
                exit_codes::INVALID_TRANSITION
            }
            StateError::UnknownWorkflow(_) | StateError::InvalidTaskName { .. } => {
                exit_codes::USAGE
            }
            StateError::Corrupt { .. } => exit_codes::CORRUPT,
            StateError::AlreadyExists { .. } | StateError::Io { .. } => exit_codes::FAILURE,
        }
    }
}

fn render_candidates(candidates: &[String]) -> String {
    if candidates.is_empty() {
        String::new()
    } else {
        format!(" (running: {})", candidates.join(", "))
    }
}

/// Map an error chain to an exit code, using the outermost [`StateError`].
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<StateError>())
        .map_or(exit_codes::FAILURE, StateError::exit_code)
}
