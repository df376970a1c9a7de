//! Readiness detection.
//!
//! "Process alive" and "control channel answering" are distinct states: the
//! guest boot sequence lags QEMU process start by tens of seconds. The sole
//! readiness signal is a successful SSH handshake on the forwarded port;
//! every failure mode (timeout, refusal, bad auth, missing key, missing
//! config) collapses uniformly into "not ready".

use std::time::Duration;

use tracing::debug;

use crate::util::poll_until;
use crate::vm::{launch, ssh, supervisor, Instance};

/// Coarse interval between readiness polls. Guest boot time is roughly
/// constant, so tight retries would just burn handshake overhead.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Non-blocking readiness check: one short-timeout SSH handshake.
pub async fn is_ready(instance: &Instance) -> bool {
    if !supervisor::is_running(instance) {
        return false;
    }
    let Some(config) = launch::read(instance) else {
        debug!(instance = %instance.name(), "no recoverable config, not ready");
        return false;
    };
    let key = instance.ssh_key();
    if !key.exists() {
        debug!(instance = %instance.name(), "SSH key missing, not ready");
        return false;
    }
    ssh::handshake(&key, config.port).await
}

/// Block until the instance is ready or `timeout_secs` elapses.
///
/// Fixed-interval bounded retry; a timeout leaves the still-booting instance
/// running and simply reports `false`.
pub async fn wait_until_ready(instance: &Instance, timeout_secs: u64) -> bool {
    poll_until(
        READY_POLL_INTERVAL,
        Duration::from_secs(timeout_secs),
        || is_ready(instance),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn not_ready_when_not_running() {
        // Config and key present, but no live process: readiness is gated on
        // liveness before any handshake is attempted.
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        launch::write(
            &inst,
            &launch::LaunchConfig {
                kernel: "/k".into(),
                port: 20000,
                memory: "4G".into(),
                cpus: 2,
            },
        )
        .unwrap();
        std::fs::write(inst.ssh_key(), "key material").unwrap();

        assert!(!is_ready(&inst).await);
    }

    #[tokio::test]
    async fn not_ready_without_recoverable_config() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        // Live PID record but no artifacts to recover a port from.
        std::fs::write(inst.pid_file(), std::process::id().to_string()).unwrap();

        assert!(!is_ready(&inst).await);
    }

    #[tokio::test]
    async fn not_ready_without_key_file() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        std::fs::write(inst.pid_file(), std::process::id().to_string()).unwrap();
        launch::write(
            &inst,
            &launch::LaunchConfig {
                kernel: "/k".into(),
                port: 20000,
                memory: "4G".into(),
                cpus: 2,
            },
        )
        .unwrap();

        assert!(!is_ready(&inst).await);
    }

    #[tokio::test]
    async fn wait_until_ready_times_out_on_dead_instance() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        assert!(!wait_until_ready(&inst, 0).await);
    }
}
