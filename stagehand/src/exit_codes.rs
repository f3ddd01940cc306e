//! Stable exit codes for stagehand CLI commands.
//!
//! Scripts branch on these, so values never change once published.

/// Command succeeded.
pub const OK: i32 = 0;
/// I/O failure or any error without a more specific code.
pub const FAILURE: i32 = 1;
/// Invalid invocation (bad arguments, bad task name).
pub const USAGE: i32 = 2;
/// The task's claim is held by a live owner.
pub const BUSY: i32 = 3;
/// `finish` could not resolve exactly one session.
pub const AMBIGUOUS_SESSION: i32 = 4;
/// Illegal `--next`, stage mismatch, unknown stage, or closed session.
pub const INVALID_TRANSITION: i32 = 5;
/// Referenced task, session or issue does not exist.
pub const NOT_FOUND: i32 = 6;
/// A record exists but could not be parsed or validated.
pub const CORRUPT: i32 = 7;
/// `run-next` found no eligible task.
pub const IDLE: i32 = 8;
/// A stage run was interrupted by a signal.
pub const INTERRUPTED: i32 = 130;
