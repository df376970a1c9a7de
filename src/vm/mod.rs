pub mod launch;
pub mod ports;
pub mod probe;
pub mod ssh;
pub mod supervisor;

use std::path::{Path, PathBuf};

/// Namespace prefix for screen session names, so `screen -ls` output groups
/// our consoles together and a quit never hits an unrelated session.
pub const SESSION_PREFIX: &str = "vmctl";

/// Handle to one VM instance, identified by its backing directory.
///
/// The directory IS the instance: the PID record, boot script, sidecar,
/// console log, and SSH key all live inside it, and the controller holds no
/// state beyond this path between invocations.
#[derive(Debug, Clone)]
pub struct Instance {
    dir: PathBuf,
}

impl Instance {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Last path component of the backing directory.
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.to_string_lossy().into_owned())
    }

    /// PID record written by QEMU itself via `-pidfile`.
    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("vm.pid")
    }

    /// Serial console log, captured by the boot script.
    pub fn log_file(&self) -> PathBuf {
        self.dir.join("vm.log")
    }

    /// Generated launch artifact: the executable entry point the screen
    /// session runs, and the durable encoding of the last launch config.
    pub fn boot_script(&self) -> PathBuf {
        self.dir.join("boot.sh")
    }

    /// Structured sidecar record written alongside the boot script.
    pub fn sidecar(&self) -> PathBuf {
        self.dir.join("vm.toml")
    }

    /// Private key for the guest's root account.
    pub fn ssh_key(&self) -> PathBuf {
        self.dir.join("bullseye.id_rsa")
    }

    /// Advisory lock file guarding start/stop against concurrent invocations.
    pub fn lock_file(&self) -> PathBuf {
        self.dir.join("vm.lock")
    }

    /// Deterministic screen session name for this instance's console.
    pub fn session_name(&self) -> String {
        format!("{}-{}", SESSION_PREFIX, self.name())
    }
}
