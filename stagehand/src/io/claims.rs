//! Claim files: the only mutual-exclusion primitive.
//!
//! A claim is created with create-if-absent, so exactly one of several racing
//! acquirers wins. A claim whose lease expired, or whose owner is a dead
//! process on this host, is stale and may be taken over. Claims from other
//! hosts can only go stale through their lease; clock skew between hosts
//! shifts that judgement by the skew.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::types::{ClaimRecord, Owner, RECORD_VERSION, TaskName};
use crate::error::{StateError, StateResult};
use crate::io::paths::StagehandPaths;
use crate::io::process::ProcessProbe;
use crate::io::store::{
    create_file, create_record, read_record, remove_record, replace_file, write_record,
};

static TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

fn new_token(owner: &Owner) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = TOKEN_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{nanos}-{seq}", owner.host, owner.pid)
}

/// Current state of a claim file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimStatus {
    pub record: ClaimRecord,
    pub live: bool,
}

/// Acquires and inspects claims for one workflow directory.
pub struct ClaimManager<'a> {
    paths: &'a StagehandPaths,
    owner: Owner,
    ttl: Duration,
    probe: &'a dyn ProcessProbe,
}

impl<'a> ClaimManager<'a> {
    pub fn new(
        paths: &'a StagehandPaths,
        owner: Owner,
        ttl: Duration,
        probe: &'a dyn ProcessProbe,
    ) -> Self {
        Self {
            paths,
            owner,
            ttl,
            probe,
        }
    }

    /// A claim is live iff its lease holds and, on this host, its owner runs.
    pub fn is_live(&self, claim: &ClaimRecord) -> bool {
        if claim.is_expired(Utc::now()) {
            return false;
        }
        claim.owner.host != self.owner.host || self.probe.is_alive(claim.owner.pid)
    }

    pub fn inspect(&self, task: &TaskName) -> StateResult<Option<ClaimStatus>> {
        let record = read_record::<ClaimRecord>(&self.paths.claim_path(task))?;
        Ok(record.map(|record| ClaimStatus {
            live: self.is_live(&record),
            record,
        }))
    }

    /// Take exclusive ownership of `task`.
    ///
    /// Fails with [`StateError::Busy`] while a live owner holds it. A stale
    /// claim is taken over; the handle's `reclaimed` names the previous owner.
    pub fn acquire(&self, task: &TaskName) -> StateResult<ClaimHandle> {
        let path = self.paths.claim_path(task);
        let record = ClaimRecord {
            version: RECORD_VERSION,
            task: task.clone(),
            owner: self.owner.clone(),
            token: new_token(&self.owner),
            acquired_at: Utc::now(),
            ttl_seconds: self.ttl.as_secs().max(1),
        };

        match create_record(&path, &record) {
            Ok(()) => {
                debug!(task = %task, "claim acquired");
                return Ok(ClaimHandle::new(path, record, None));
            }
            Err(StateError::AlreadyExists { .. }) => {}
            Err(err) => return Err(err),
        }

        let Some(existing) = read_record::<ClaimRecord>(&path)? else {
            // Released between our attempt and the read; one more try.
            return match create_record(&path, &record) {
                Ok(()) => Ok(ClaimHandle::new(path, record, None)),
                Err(StateError::AlreadyExists { .. }) => Err(self.busy(task, &path)),
                Err(err) => Err(err),
            };
        };

        if self.is_live(&existing) {
            return Err(StateError::Busy {
                task: task.to_string(),
                owner: existing.owner.to_string(),
            });
        }
        self.take_over(&path, &existing, record)
    }

    fn busy(&self, task: &TaskName, path: &Path) -> StateError {
        let owner = read_record::<ClaimRecord>(path)
            .ok()
            .flatten()
            .map_or_else(|| "another worker".to_string(), |claim| claim.owner.to_string());
        StateError::Busy {
            task: task.to_string(),
            owner,
        }
    }

    /// Replace a stale claim, letting only one racing caller win.
    ///
    /// Takeover runs under the claim's [`ReclaimGuard`]. Under the guard the
    /// claim is re-read and replaced only if it is still the stale record we
    /// judged.
    fn take_over(
        &self,
        path: &Path,
        stale: &ClaimRecord,
        record: ClaimRecord,
    ) -> StateResult<ClaimHandle> {
        let task = record.task.clone();
        let Some(_guard) = ReclaimGuard::acquire(path, &record.token)? else {
            return Err(self.busy(&task, path));
        };
        match read_record::<ClaimRecord>(path)? {
            Some(current) if current.token == stale.token => write_record(path, &record)?,
            Some(_) => return Err(self.busy(&task, path)),
            None => match create_record(path, &record) {
                Ok(()) => {}
                Err(StateError::AlreadyExists { .. }) => return Err(self.busy(&task, path)),
                Err(err) => return Err(err),
            },
        }
        info!(
            task = %task,
            previous_owner = %stale.owner,
            acquired_at = %stale.acquired_at,
            "reclaimed stale claim"
        );
        Ok(ClaimHandle::new(
            path.to_path_buf(),
            record,
            Some(stale.owner.clone()),
        ))
    }

    /// Remove a claim that is not live. Errors with `Busy` if it is.
    pub fn clear_stale(&self, task: &TaskName) -> StateResult<bool> {
        match self.inspect(task)? {
            None => Ok(false),
            Some(status) if status.live => Err(StateError::Busy {
                task: task.to_string(),
                owner: status.record.owner.to_string(),
            }),
            Some(_) => remove_record(&self.paths.claim_path(task)),
        }
    }
}

/// Age after which a leftover guard belongs to a crashed process.
const RECLAIM_GUARD_STALE: Duration = Duration::from_secs(30);
/// How long a claim holder waits for a takeover in progress to finish.
const GUARD_WAIT: Duration = Duration::from_secs(1);
const GUARD_POLL: Duration = Duration::from_millis(10);

/// Exclusive right to change one claim file, held as `<claim>.reclaim`.
///
/// The guard file contains its holder's token. A holder removes the file only
/// while it still carries that token, and an abandoned guard is replaced in
/// place rather than removed, so nobody deletes a guard they did not create.
struct ReclaimGuard {
    path: PathBuf,
    token: String,
}

impl ReclaimGuard {
    fn path_for(claim: &Path) -> PathBuf {
        claim.with_extension("json.reclaim")
    }

    /// `None` while someone else holds the guard.
    fn acquire(claim: &Path, token: &str) -> StateResult<Option<Self>> {
        let path = Self::path_for(claim);
        let held = || Self {
            path: path.clone(),
            token: token.to_string(),
        };
        if publish(&path, token)? {
            return Ok(Some(held()));
        }
        let Some(holder) = read_token(&path)? else {
            // Released between our attempt and the read; one more try.
            return Ok(publish(&path, token)?.then(held));
        };
        if !is_abandoned(&path) {
            return Ok(None);
        }

        // Replacing the guard of `holder` is serialized by a marker named after
        // it. Whoever creates the marker re-checks that the guard still belongs
        // to `holder` before swapping in its own token.
        let mut marker = OsString::from(path.as_os_str());
        marker.push(".");
        marker.push(&holder);
        let marker = PathBuf::from(marker);
        if !publish(&marker, token)? {
            return Ok(None);
        }
        let replaced = match read_token(&path) {
            Ok(Some(current)) if current == holder => replace_file(&path, token).map(|()| true),
            Ok(_) => Ok(false),
            Err(err) => Err(err),
        };
        remove_record(&marker)?;
        if !replaced? {
            return Ok(None);
        }
        warn!(path = %path.display(), previous = %holder, "replaced abandoned reclaim guard");
        Ok(Some(held()))
    }

    /// Wait up to [`GUARD_WAIT`] for the guard.
    fn wait(claim: &Path, token: &str) -> StateResult<Option<Self>> {
        let started = Instant::now();
        loop {
            if let Some(guard) = Self::acquire(claim, token)? {
                return Ok(Some(guard));
            }
            if started.elapsed() >= GUARD_WAIT {
                return Ok(None);
            }
            thread::sleep(GUARD_POLL);
        }
    }
}

/// Create `path` holding `token`. `false` if it already exists.
fn publish(path: &Path, token: &str) -> StateResult<bool> {
    match create_file(path, token) {
        Ok(()) => Ok(true),
        Err(StateError::AlreadyExists { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

fn read_token(path: &Path) -> StateResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(token) => Ok(Some(token.trim().to_string())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StateError::io("read reclaim guard", path, err)),
    }
}

fn is_abandoned(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > RECLAIM_GUARD_STALE)
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        match read_token(&self.path) {
            Ok(Some(token)) if token == self.token => {
                if let Err(err) = remove_record(&self.path) {
                    warn!(path = %self.path.display(), err = %err, "failed to remove reclaim guard");
                }
            }
            Ok(_) => {
                warn!(path = %self.path.display(), "reclaim guard was replaced; leaving it");
            }
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "failed to read reclaim guard");
            }
        }
    }
}

/// Proof of ownership of one claim. Released on drop.
#[derive(Debug)]
pub struct ClaimHandle {
    path: PathBuf,
    record: ClaimRecord,
    /// Owner of the stale claim this handle replaced, if any.
    pub reclaimed: Option<Owner>,
    released: bool,
}

impl ClaimHandle {
    fn new(path: PathBuf, record: ClaimRecord, reclaimed: Option<Owner>) -> Self {
        Self {
            path,
            record,
            reclaimed,
            released: false,
        }
    }

    pub fn task(&self) -> &TaskName {
        &self.record.task
    }

    pub fn record(&self) -> &ClaimRecord {
        &self.record
    }

    fn still_ours(&self) -> StateResult<bool> {
        Ok(read_record::<ClaimRecord>(&self.path)?
            .is_some_and(|current| current.token == self.record.token))
    }

    /// Extend the lease. Returns `false` if the claim was taken over, or a
    /// takeover kept its guard past [`GUARD_WAIT`].
    pub fn renew(&mut self) -> StateResult<bool> {
        let Some(_guard) = ReclaimGuard::wait(&self.path, &self.record.token)? else {
            warn!(task = %self.record.task, "claim is being taken over; not renewed");
            return Ok(false);
        };
        if !self.still_ours()? {
            warn!(task = %self.record.task, "claim lost before renewal");
            return Ok(false);
        }
        self.record.acquired_at = Utc::now();
        write_record(&self.path, &self.record)?;
        debug!(task = %self.record.task, "claim renewed");
        Ok(true)
    }

    /// Delete the claim if it still identifies this handle as its owner.
    pub fn release(mut self) -> StateResult<bool> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> StateResult<bool> {
        if self.released {
            return Ok(false);
        }
        self.released = true;
        let Some(_guard) = ReclaimGuard::wait(&self.path, &self.record.token)? else {
            warn!(task = %self.record.task, "claim is being taken over; leaving it in place");
            return Ok(false);
        };
        if !self.still_ours()? {
            warn!(task = %self.record.task, "claim was taken over; leaving it in place");
            return Ok(false);
        }
        let removed = remove_record(&self.path)?;
        debug!(task = %self.record.task, "claim released");
        Ok(removed)
    }
}

impl Drop for ClaimHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(task = %self.record.task, err = %err, "failed to release claim");
        }
    }
}
