//! Filesystem-coordinated stage orchestrator.
//!
//! Tasks move through the stages of a workflow one session at a time. Every
//! worker is an independent OS process; the only coordination is the records
//! under `.stagehand/`, where a claim file grants exclusive ownership of a task
//! for the duration of one stage run.
//!
//! - **[`core`]**: Pure, deterministic logic (workflow graphs, transition
//!   planning, scheduling). No I/O.
//! - **[`io`]**: Side-effecting operations (record store, claims, sessions,
//!   process execution, prompts).
//!
//! Orchestration modules ([`finish`], [`queue`], [`run`], [`admin`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod admin;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod finish;
pub mod io;
pub mod logging;
pub mod queue;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workspace;
