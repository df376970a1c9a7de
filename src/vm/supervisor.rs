//! Process supervision: starting QEMU under a detached screen session,
//! tracking it through the PID record it writes, and stopping it with a
//! graceful-then-forced termination.
//!
//! The PID record is the sole source of truth for "is this instance
//! running". Absence is definitive; presence still needs a liveness check
//! against the OS, because a crashed QEMU leaves the record behind.

use std::fs;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::util::poll_until;
use crate::vm::{launch, launch::LaunchConfig, Instance};

/// Interval between PID-record / liveness polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Bounded total wait for the PID record to appear after launch, and for the
/// process to exit after SIGTERM.
const POLL_WAIT: Duration = Duration::from_secs(5);

/// Read the PID record. Any I/O or parse failure is `None`, never an error.
pub fn read_pid(instance: &Instance) -> Option<i32> {
    fs::read_to_string(instance.pid_file())
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn alive(pid: i32) -> bool {
    // Signal 0: existence check only.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// True iff the PID record exists and the OS confirms the process is alive.
/// A record pointing at a dead PID reads as not running, silently.
pub fn is_running(instance: &Instance) -> bool {
    read_pid(instance).map(alive).unwrap_or(false)
}

/// Advisory lock guarding start/stop against a concurrent invocation on the
/// same instance directory. Non-blocking: a busy lock fails the operation
/// instead of queueing behind it.
pub(crate) struct InstanceLock {
    file: fs::File,
}

impl InstanceLock {
    pub(crate) fn acquire(instance: &Instance) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(instance.lock_file())
            .with_context(|| format!("opening lock file: {}", instance.lock_file().display()))?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            bail!(
                "another vmctl operation is in progress for instance {}",
                instance.name()
            );
        }
        Ok(Self { file })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// Start the instance.
///
/// Writes the launch artifacts, clears any stale screen session with the same
/// name, launches a fresh detached session running the boot script, and waits
/// (bounded) for QEMU's PID record. A generated artifact is not evidence of
/// success: if the record never appears the session is torn down and the
/// start reports failure with no record left behind.
pub async fn start(instance: &Instance, config: &LaunchConfig) -> Result<()> {
    let _lock = InstanceLock::acquire(instance)?;
    if is_running(instance) {
        bail!("instance {} is already running", instance.name());
    }

    launch::write(instance, config)?;

    let session = instance.session_name();
    quit_session(&session).await;

    let script = instance.boot_script();
    let status = Command::new("screen")
        .arg("-dmS")
        .arg(&session)
        .arg(&script)
        .status()
        .await
        .context("failed to run screen; is it installed?")?;
    if !status.success() {
        bail!(
            "screen failed to create session {} (exit {:?})",
            session,
            status.code()
        );
    }

    let pid_file = instance.pid_file();
    let appeared = poll_until(POLL_INTERVAL, POLL_WAIT, || {
        let path = pid_file.clone();
        async move { path.exists() }
    })
    .await;

    if !appeared || !is_running(instance) {
        warn!(session = %session, "PID record never appeared, tearing session down");
        quit_session(&session).await;
        let _ = fs::remove_file(&pid_file);
        bail!(
            "instance {} did not start: QEMU never wrote its PID record (see {})",
            instance.name(),
            instance.log_file().display()
        );
    }

    info!(
        instance = %instance.name(),
        port = config.port,
        session = %session,
        "VM started"
    );
    Ok(())
}

/// Stop the instance.
///
/// Returns `Ok(false)` as a no-op when there is nothing to stop: no PID
/// record, or a record pointing at a process that is already gone (the stale
/// record is removed on the way out). Otherwise SIGTERM, a bounded wait for
/// exit, then an unconditional SIGKILL fallback — delivering to an
/// already-dead process is tolerated, not an error.
pub async fn stop(instance: &Instance) -> Result<bool> {
    if !instance.pid_file().exists() {
        return Ok(false);
    }
    let _lock = InstanceLock::acquire(instance)?;

    let Some(pid) = read_pid(instance) else {
        // Unreadable record: treat as stale.
        let _ = fs::remove_file(instance.pid_file());
        return Ok(false);
    };
    if !alive(pid) {
        debug!(instance = %instance.name(), pid, "stale PID record, nothing to stop");
        let _ = fs::remove_file(instance.pid_file());
        return Ok(false);
    }

    info!(instance = %instance.name(), pid, "stopping VM");
    unsafe { libc::kill(pid, libc::SIGTERM) };

    let exited = poll_until(POLL_INTERVAL, POLL_WAIT, || async move { !alive(pid) }).await;
    if !exited {
        warn!(instance = %instance.name(), pid, "VM ignored SIGTERM");
    }
    unsafe { libc::kill(pid, libc::SIGKILL) };

    let _ = fs::remove_file(instance.pid_file());
    Ok(true)
}

/// Quit a screen session by name, tolerating "no such session".
async fn quit_session(session: &str) {
    match Command::new("screen")
        .args(["-S", session, "-X", "quit"])
        .status()
        .await
    {
        Ok(status) if !status.success() => {
            debug!(session, "no screen session to quit");
        }
        Ok(_) => {}
        Err(e) => {
            debug!(session, error = %e, "screen quit failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_pid_parses_with_surrounding_whitespace() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        fs::write(inst.pid_file(), "  4242\n").unwrap();
        assert_eq!(read_pid(&inst), Some(4242));
    }

    #[test]
    fn read_pid_garbage_is_none() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        fs::write(inst.pid_file(), "not-a-pid").unwrap();
        assert_eq!(read_pid(&inst), None);
    }

    #[test]
    fn is_running_false_without_record() {
        let dir = TempDir::new().unwrap();
        assert!(!is_running(&Instance::new(dir.path())));
    }

    #[test]
    fn is_running_true_for_live_pid() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        fs::write(inst.pid_file(), std::process::id().to_string()).unwrap();
        assert!(is_running(&inst));
    }

    #[test]
    fn is_running_false_for_dead_pid() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        // A child we have already reaped is guaranteed dead.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        fs::write(inst.pid_file(), pid.to_string()).unwrap();
        assert!(!is_running(&inst));
    }

    #[test]
    fn is_running_false_for_garbage_record() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        fs::write(inst.pid_file(), "definitely not a pid").unwrap();
        assert!(!is_running(&inst));
    }

    #[tokio::test]
    async fn stop_without_record_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        assert!(!stop(&inst).await.unwrap());
    }

    #[tokio::test]
    async fn stop_with_stale_record_is_a_no_op_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        fs::write(inst.pid_file(), pid.to_string()).unwrap();

        assert!(!stop(&inst).await.unwrap());
        assert!(!inst.pid_file().exists());
    }

    #[tokio::test]
    async fn stop_with_unreadable_record_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        fs::write(inst.pid_file(), "garbage").unwrap();
        assert!(!stop(&inst).await.unwrap());
        assert!(!inst.pid_file().exists());
    }

    #[tokio::test]
    async fn start_rejects_already_running_without_touching_artifact() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        // A live PID record: our own process id always passes the liveness check.
        fs::write(inst.pid_file(), std::process::id().to_string()).unwrap();

        let config = LaunchConfig {
            kernel: "/k".into(),
            port: 20000,
            memory: "4G".into(),
            cpus: 2,
        };
        let err = start(&inst, &config).await.unwrap_err();
        assert!(err.to_string().contains("already running"));
        // The rejection happens before any artifact is written and before
        // the screen session is touched.
        assert!(!inst.boot_script().exists());
        assert!(!inst.sidecar().exists());
    }

    #[test]
    fn instance_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());

        let held = InstanceLock::acquire(&inst).unwrap();
        assert!(InstanceLock::acquire(&inst).is_err());
        drop(held);
        assert!(InstanceLock::acquire(&inst).is_ok());
    }
}
