//! Process helpers: liveness probes, the interrupt flag, and attached child
//! processes polled with a timeout.

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::core::types::Owner;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Route Ctrl-C into a flag polled by running stages.
///
/// The child shares the terminal's process group and receives the signal
/// itself; the flag lets the orchestrator close the session before exiting.
pub fn install_interrupt_handler() -> Result<()> {
    ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst))
        .context("install interrupt handler")
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Decides whether a process on this host is still running.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by `/proc`, falling back to `kill -0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == std::process::id() {
            return true;
        }
        if Path::new("/proc/self").exists() {
            return Path::new(&format!("/proc/{pid}")).exists();
        }
        match Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(err) => {
                // Without a way to check, only the TTL can expire the claim.
                warn!(pid, err = %err, "cannot probe process liveness");
                true
            }
        }
    }
}

/// Identity of the current process.
pub fn current_owner() -> Owner {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string());
    Owner {
        pid: std::process::id(),
        host,
    }
}

/// What the supervisor wants done with a child still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watch {
    Continue,
    /// The finish signal was observed; the child may be stopped.
    Stop,
    Interrupt,
}

/// How a supervised child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEnd {
    Exited(ExitStatus),
    Stopped,
    Interrupted,
}

/// Spawn `cmd` attached to the caller's terminal.
pub fn spawn_attached(mut cmd: Command) -> Result<Child> {
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    debug!("spawning attached child process");
    cmd.spawn().context("spawn command")
}

/// Wait for `child`, consulting `watch` every `poll` while it runs.
pub fn supervise(
    child: &mut Child,
    poll: Duration,
    watch: &mut dyn FnMut() -> Result<Watch>,
) -> Result<ChildEnd> {
    loop {
        if let Some(status) = child.wait_timeout(poll).context("wait for command")? {
            debug!(exit_code = ?status.code(), "child exited");
            return Ok(ChildEnd::Exited(status));
        }
        match watch()? {
            Watch::Continue => {}
            Watch::Stop => {
                debug!("finish observed, stopping child");
                stop(child)?;
                return Ok(ChildEnd::Stopped);
            }
            Watch::Interrupt => {
                warn!("interrupted, stopping child");
                stop(child)?;
                return Ok(ChildEnd::Interrupted);
            }
        }
    }
}

fn stop(child: &mut Child) -> Result<()> {
    if let Err(err) = child.kill() {
        // Already exited between the poll and the kill.
        debug!(err = %err, "kill child");
    }
    child.wait().context("wait command after kill")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(SystemProbe.is_alive(std::process::id()));
    }

    #[test]
    fn exited_child_is_not_alive() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(!SystemProbe.is_alive(pid));
    }

    #[test]
    fn supervise_stops_child_on_request() {
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let mut polls = 0;
        let end = supervise(&mut child, Duration::from_millis(20), &mut || {
            polls += 1;
            Ok(if polls >= 2 { Watch::Stop } else { Watch::Continue })
        })
        .expect("supervise");
        assert_eq!(end, ChildEnd::Stopped);
    }

    #[test]
    fn supervise_reports_natural_exit() {
        let mut child = Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .expect("spawn sh");
        let end = supervise(&mut child, Duration::from_millis(50), &mut || {
            Ok(Watch::Continue)
        })
        .expect("supervise");
        match end {
            ChildEnd::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
