//! Forwarding-port allocation.
//!
//! The used set is built from two sources: sockets the host currently has in
//! LISTEN state (`ss -tuln`), and ports claimed by *other* running instances
//! under the same images home. The second source closes the window where a
//! sibling has been started but its QEMU has not bound the port yet.
//!
//! There is no reservation step; allocation and use are not atomic, and a
//! concurrent `run` against a sibling can still race us to a port. The loser
//! surfaces as a start timeout.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::vm::{launch, supervisor, Instance};

/// Inclusive lower bound of the auto-allocation range.
pub const PORT_START: u16 = 20000;
/// Exclusive upper bound of the auto-allocation range.
pub const PORT_END: u16 = 30000;

/// Choose a free forwarding port for `instance`.
///
/// Prefers the port this instance used last time (session continuity across
/// restarts); otherwise scans `[PORT_START, PORT_END)` ascending. Returns
/// `None` when the scan is exhausted or the host socket query fails —
/// non-fatal to the caller, but a start that needs auto-allocation cannot
/// proceed.
pub async fn allocate(instance: &Instance) -> Option<u16> {
    let mut used = match listening_ports().await {
        Ok(ports) => ports,
        Err(e) => {
            warn!(error = %e, "host socket query failed, cannot allocate a port");
            return None;
        }
    };
    used.extend(sibling_ports(instance));

    let last = launch::read(instance).map(|c| c.port);
    let chosen = choose_port(last, &used);
    debug!(instance = %instance.name(), last, chosen, "port allocation");
    chosen
}

/// Pure selection policy: last-used port if free, else lowest free in range.
fn choose_port(last: Option<u16>, used: &HashSet<u16>) -> Option<u16> {
    if let Some(port) = last {
        if !used.contains(&port) {
            return Some(port);
        }
    }
    (PORT_START..PORT_END).find(|p| !used.contains(p))
}

/// Ports of sibling instances in the same parent directory that are running.
///
/// A sibling counts even if its QEMU has not reached the point of binding the
/// forward port: its recovered config plus a live PID record is the claim.
fn sibling_ports(instance: &Instance) -> HashSet<u16> {
    let mut ports = HashSet::new();
    let Some(parent) = instance.dir().parent() else {
        return ports;
    };
    let Ok(entries) = std::fs::read_dir(parent) else {
        return ports;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || path == instance.dir() {
            continue;
        }
        let sibling = Instance::new(&path);
        if let Some(config) = launch::read(&sibling) {
            if supervisor::is_running(&sibling) {
                ports.insert(config.port);
            }
        }
    }
    ports
}

/// Query the host for sockets in LISTEN state.
async fn listening_ports() -> anyhow::Result<HashSet<u16>> {
    use anyhow::Context;

    let output = Command::new("ss")
        .args(["-tuln"])
        .output()
        .await
        .context("failed to run ss")?;
    anyhow::ensure!(
        output.status.success(),
        "ss exited with {:?}",
        output.status.code()
    );
    Ok(parse_listening_ports(&String::from_utf8_lossy(&output.stdout)))
}

/// Pull local ports out of `ss -tuln` (or netstat-shaped) output.
fn parse_listening_ports(text: &str) -> HashSet<u16> {
    static PORT_RE: OnceLock<Regex> = OnceLock::new();
    let re = PORT_RE.get_or_init(|| Regex::new(r":(\d+)\s").unwrap());

    let mut ports = HashSet::new();
    for line in text.lines() {
        if !line.contains("LISTEN") {
            continue;
        }
        if let Some(caps) = re.captures(line) {
            if let Ok(port) = caps[1].parse::<u16>() {
                ports.insert(port);
            }
        }
    }
    ports
}
