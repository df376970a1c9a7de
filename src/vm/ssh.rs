//! Control channel into the guest: command execution and recursive file
//! transfer over ssh/scp subprocesses, authenticated as root with the
//! per-instance key.
//!
//! [`SshChannel`] is a guard: it can only be obtained from a running, ready
//! instance, so operations on a non-connected channel are unrepresentable.
//! Each exec/copy spawns its own ssh/scp process, so dropping the guard on
//! any exit path releases everything there is to release.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::vm::{launch, probe, supervisor, Instance};

/// Remote principal: the guest images carry a password-less root account
/// keyed to the per-instance private key.
const SSH_USER: &str = "root";

/// Handshake timeout for readiness probes.
const HANDSHAKE_TIMEOUT_SECS: u32 = 3;
/// Connect timeout for interactive operations, which may queue behind a busy
/// guest sshd.
const CONNECT_TIMEOUT_SECS: u32 = 10;

/// Options shared by every ssh/scp invocation. Guest host keys change on
/// every fresh image, so strict checking and known_hosts are disabled;
/// BatchMode fails fast instead of prompting.
const SSH_OPTS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "BatchMode=yes",
    "-o",
    "LogLevel=ERROR",
];

/// ssh uses exit status 255 for its own failures (connect, auth, transport);
/// anything else is the remote command's exit code.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// One short-timeout handshake: authenticate, run `true`, close. Success is
/// the readiness signal; every failure reads as "not ready".
pub(crate) async fn handshake(key: &Path, port: u16) -> bool {
    let output = Command::new("ssh")
        .args(SSH_OPTS)
        .arg("-o")
        .arg(format!("ConnectTimeout={}", HANDSHAKE_TIMEOUT_SECS))
        .arg("-i")
        .arg(key)
        .arg("-p")
        .arg(port.to_string())
        .arg(format!("{}@localhost", SSH_USER))
        .arg("true")
        .output()
        .await;
    match output {
        Ok(out) => {
            trace!(port, success = out.status.success(), "SSH handshake");
            out.status.success()
        }
        Err(e) => {
            trace!(port, error = %e, "SSH handshake spawn failed");
            false
        }
    }
}

/// An open control channel to exactly one instance.
#[derive(Debug)]
pub struct SshChannel {
    instance_name: String,
    key: PathBuf,
    port: u16,
}

impl SshChannel {
    /// Open a channel to `instance`.
    ///
    /// Fails with a descriptive reason when the instance is not running, not
    /// yet ready, or missing its key file — explicit operations surface
    /// channel failures instead of collapsing them into a boolean.
    pub async fn open(instance: &Instance) -> Result<Self> {
        if !supervisor::is_running(instance) {
            bail!("instance {} is not running", instance.name());
        }
        let key = instance.ssh_key();
        if !key.exists() {
            bail!("SSH key not found: {}", key.display());
        }
        if !probe::is_ready(instance).await {
            bail!(
                "instance {} is still booting; wait for SSH to answer and retry",
                instance.name()
            );
        }
        let config = launch::read(instance)
            .with_context(|| format!("no recoverable launch config for {}", instance.name()))?;

        debug!(instance = %instance.name(), port = config.port, "SSH channel opened");
        Ok(Self {
            instance_name: instance.name(),
            key,
            port: config.port,
        })
    }

    /// Run a command in the guest, returning its stdout and stderr.
    ///
    /// The remote command's own exit code is not an error — callers get the
    /// output either way. Transport failures (ssh exit 255) are.
    pub async fn exec(&self, command: &str) -> Result<(String, String)> {
        let output = Command::new("ssh")
            .args(SSH_OPTS)
            .arg("-o")
            .arg(format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS))
            .arg("-i")
            .arg(&self.key)
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@localhost", SSH_USER))
            .arg(command)
            .output()
            .await
            .context("failed to spawn ssh")?;

        if output.status.code() == Some(SSH_TRANSPORT_FAILURE) {
            bail!(
                "SSH connection to {} failed: {}",
                self.instance_name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok((
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    /// Recursively copy a host path into the guest.
    pub async fn copy_in(&self, local: &Path, remote: &str) -> Result<()> {
        let dest = format!("{}@localhost:{}", SSH_USER, remote);
        self.scp(local.to_string_lossy().as_ref(), &dest).await
    }

    /// Recursively copy a guest path out to the host.
    pub async fn copy_out(&self, remote: &str, local: &Path) -> Result<()> {
        let src = format!("{}@localhost:{}", SSH_USER, remote);
        self.scp(&src, local.to_string_lossy().as_ref()).await
    }

    async fn scp(&self, src: &str, dest: &str) -> Result<()> {
        let output = Command::new("scp")
            .args(SSH_OPTS)
            .arg("-o")
            .arg(format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS))
            .arg("-i")
            .arg(&self.key)
            .arg("-P")
            .arg(self.port.to_string())
            .arg("-r")
            .arg(src)
            .arg(dest)
            .output()
            .await
            .context("failed to spawn scp")?;

        if !output.status.success() {
            bail!(
                "scp {} -> {} failed: {}",
                src,
                dest,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(instance = %self.instance_name, src, dest, "file transfer complete");
        Ok(())
    }

    /// Release the channel. Dropping the guard has the same effect; this
    /// form reads better at the end of a scoped use.
    pub fn close(self) {}
}
