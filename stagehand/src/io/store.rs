//! One-file-per-record JSON store.
//!
//! Two write primitives:
//! - [`write_record`] replaces a record atomically (unique temp file + rename),
//!   so readers see either the previous or the new complete version.
//! - [`create_record`] publishes a record only if none exists, by hard-linking
//!   a fully written temp file into place. It never overwrites.
//!
//! Reads validate against the embedded v1 JSON Schema, compiled once per record
//! type. A missing record is `Ok(None)`; anything unreadable is
//! [`StateError::Corrupt`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use jsonschema::{Validator, validator_for};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::{ClaimRecord, IssueRecord, SessionRecord, TaskRecord};
use crate::error::{StateError, StateResult};

const TASK_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/task.v1.schema.json"
));
const SESSION_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/session.v1.schema.json"
));
const CLAIM_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/claim.v1.schema.json"
));
const ISSUE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/issue.v1.schema.json"
));

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A compiled embedded schema, or why it failed to compile.
pub type CompiledSchema = Result<Validator, String>;

fn compile(name: &str, schema: &str) -> CompiledSchema {
    let schema: Value =
        serde_json::from_str(schema).map_err(|err| format!("embedded {name} schema: {err}"))?;
    validator_for(&schema).map_err(|err| format!("embedded {name} schema: {err}"))
}

static TASK_VALIDATOR: LazyLock<CompiledSchema> =
    LazyLock::new(|| compile("task", TASK_SCHEMA));
static SESSION_VALIDATOR: LazyLock<CompiledSchema> =
    LazyLock::new(|| compile("session", SESSION_SCHEMA));
static CLAIM_VALIDATOR: LazyLock<CompiledSchema> =
    LazyLock::new(|| compile("claim", CLAIM_SCHEMA));
static ISSUE_VALIDATOR: LazyLock<CompiledSchema> =
    LazyLock::new(|| compile("issue", ISSUE_SCHEMA));

/// A persisted record type with an embedded schema.
pub trait Record: Serialize + DeserializeOwned {
    const NAME: &'static str;

    fn validator() -> &'static CompiledSchema;
}

impl Record for TaskRecord {
    const NAME: &'static str = "task";

    fn validator() -> &'static CompiledSchema {
        &TASK_VALIDATOR
    }
}

impl Record for SessionRecord {
    const NAME: &'static str = "session";

    fn validator() -> &'static CompiledSchema {
        &SESSION_VALIDATOR
    }
}

impl Record for ClaimRecord {
    const NAME: &'static str = "claim";

    fn validator() -> &'static CompiledSchema {
        &CLAIM_VALIDATOR
    }
}

impl Record for IssueRecord {
    const NAME: &'static str = "issue";

    fn validator() -> &'static CompiledSchema {
        &ISSUE_VALIDATOR
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> StateError {
    StateError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Parse and validate record contents already read from `path`.
pub fn parse_record<T: Record>(path: &Path, contents: &str) -> StateResult<T> {
    let value: Value = serde_json::from_str(contents)
        .map_err(|err| corrupt(path, format!("invalid json: {err}")))?;
    let validator = T::validator()
        .as_ref()
        .map_err(|reason| corrupt(path, reason.clone()))?;
    if !validator.is_valid(&value) {
        let messages = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(corrupt(
            path,
            format!("{} schema validation failed: {}", T::NAME, messages.join("; ")),
        ));
    }
    serde_json::from_value(value).map_err(|err| corrupt(path, err.to_string()))
}

/// Read a record. `Ok(None)` if the file does not exist.
pub fn read_record<T: Record>(path: &Path) -> StateResult<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StateError::io("read", path, err)),
    };
    parse_record(path, &contents).map(Some)
}

fn serialize<T: Record>(path: &Path, record: &T) -> StateResult<String> {
    let mut buf = serde_json::to_string_pretty(record).map_err(|err| {
        StateError::io(
            "serialize",
            path,
            std::io::Error::new(ErrorKind::InvalidData, err),
        )
    })?;
    buf.push('\n');
    Ok(buf)
}

/// Temp sibling unique to this process and call: `.<file>.<pid>.<seq>.tmp`.
fn temp_path(path: &Path) -> StateResult<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| corrupt(path, "record path has no parent directory"))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| corrupt(path, "record path has no file name"))?;
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    Ok(parent.join(format!(".{file_name}.{}.{seq}.tmp", process::id())))
}

fn write_temp(path: &Path, contents: &str) -> StateResult<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| StateError::io("create directory", parent, err))?;
    }
    let tmp_path = temp_path(path)?;
    fs::write(&tmp_path, contents).map_err(|err| StateError::io("write temp", &tmp_path, err))?;
    Ok(tmp_path)
}

/// Atomically replace (or create) the file at `path`.
pub(crate) fn replace_file(path: &Path, contents: &str) -> StateResult<()> {
    let tmp_path = write_temp(path, contents)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(StateError::io("replace", path, err));
    }
    Ok(())
}

/// Publish `contents` at `path` only if nothing is there yet.
pub(crate) fn create_file(path: &Path, contents: &str) -> StateResult<()> {
    let tmp_path = write_temp(path, contents)?;
    let linked = fs::hard_link(&tmp_path, path);
    if let Err(err) = fs::remove_file(&tmp_path) {
        warn!(path = %tmp_path.display(), err = %err, "failed to remove temp record");
    }
    match linked {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(StateError::AlreadyExists {
            path: path.to_path_buf(),
        }),
        Err(err) => Err(StateError::io("link", path, err)),
    }
}

/// Atomically replace (or create) a record.
pub fn write_record<T: Record>(path: &Path, record: &T) -> StateResult<()> {
    debug!(kind = T::NAME, path = %path.display(), "writing record");
    replace_file(path, &serialize(path, record)?)
}

/// Create a record only if `path` does not exist yet.
///
/// Fails with [`StateError::AlreadyExists`] instead of overwriting. The link is
/// the commit point, so the record is never visible half-written.
pub fn create_record<T: Record>(path: &Path, record: &T) -> StateResult<()> {
    debug!(kind = T::NAME, path = %path.display(), "creating record");
    create_file(path, &serialize(path, record)?)
}

/// Delete a record. Returns whether it existed.
pub fn remove_record(path: &Path) -> StateResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StateError::io("remove", path, err)),
    }
}

/// Read every `*.json` record in `dir`, skipping temp files.
///
/// Each entry keeps its own result so one corrupt file does not hide the rest.
pub fn list_records<T: Record>(dir: &Path) -> StateResult<Vec<StateResult<T>>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StateError::io("list", dir, err)),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StateError::io("list", dir, err))?;
        let path = entry.path();
        let is_record = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| !name.starts_with('.') && name.ends_with(".json"));
        if is_record {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths
        .iter()
        // A record deleted between listing and reading is not an error.
        .filter_map(|path| read_record::<T>(path).transpose())
        .collect())
}
