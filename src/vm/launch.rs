//! Launch configuration and its durable on-disk form.
//!
//! `write` renders the executable boot script (the artifact the screen
//! session runs) plus a TOML sidecar carrying the same fields. `read`
//! prefers the sidecar and falls back to pattern-extracting the script, so
//! directories last touched by a script-only version of this tool still
//! recover their configuration.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::vm::Instance;

/// Memory size handed to `-m` when the user never specified one.
pub const DEFAULT_MEMORY: &str = "4G";
/// Core count handed to `-smp` when the user never specified one.
pub const DEFAULT_CPUS: u32 = 2;

fn default_memory() -> String {
    DEFAULT_MEMORY.to_string()
}

fn default_cpus() -> u32 {
    DEFAULT_CPUS
}

/// One launch intent: everything QEMU needs beyond the instance directory.
///
/// Immutable once constructed. Ports allocated by [`super::ports::allocate`]
/// fall in `[20000, 30000)`; a user-supplied port is accepted unchecked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Kernel build tree root; the script boots `<kernel>/arch/x86/boot/bzImage`.
    pub kernel: PathBuf,
    /// Host port forwarded to the guest's SSH daemon (22).
    pub port: u16,
    /// QEMU memory size spec, e.g. "4G" or "2048M".
    #[serde(default = "default_memory")]
    pub memory: String,
    /// Virtual CPU count.
    #[serde(default = "default_cpus")]
    pub cpus: u32,
}

/// Render both launch artifacts and mark the script executable.
pub fn write(instance: &Instance, config: &LaunchConfig) -> Result<()> {
    let script = render_script(instance, config);
    let script_path = instance.boot_script();
    fs::write(&script_path, script)
        .with_context(|| format!("writing boot script: {}", script_path.display()))?;
    fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("marking boot script executable: {}", script_path.display()))?;

    let sidecar = toml::to_string_pretty(config).context("serializing launch sidecar")?;
    let sidecar_path = instance.sidecar();
    fs::write(&sidecar_path, sidecar)
        .with_context(|| format!("writing launch sidecar: {}", sidecar_path.display()))?;

    debug!(
        instance = %instance.name(),
        port = config.port,
        "launch artifacts written"
    );
    Ok(())
}

/// Recover the most recent launch configuration, or `None` if this instance
/// has never been launched (or its artifacts lost the mandatory fields).
pub fn read(instance: &Instance) -> Option<LaunchConfig> {
    if let Some(config) = read_sidecar(instance) {
        return Some(config);
    }
    read_script(instance)
}

fn render_script(instance: &Instance, config: &LaunchConfig) -> String {
    format!(
        "#!/bin/bash\n\
         exec qemu-system-x86_64 \\\n \
         -kernel {kernel}/arch/x86/boot/bzImage \\\n \
         -append \"console=ttyS0 root=/dev/sda debug earlyprintk=serial slub_debug=QUZ\" \\\n \
         -hda {dir}/bullseye.img \\\n \
         -net user,hostfwd=tcp::{port}-:22 -net nic \\\n \
         -enable-kvm \\\n \
         -nographic \\\n \
         -m {memory} \\\n \
         -smp {cpus} \\\n \
         -pidfile {pid_file} \\\n \
         2>&1 | tee {log_file}\n",
        kernel = config.kernel.display(),
        dir = instance.dir().display(),
        port = config.port,
        memory = config.memory,
        cpus = config.cpus,
        pid_file = instance.pid_file().display(),
        log_file = instance.log_file().display(),
    )
}

fn read_sidecar(instance: &Instance) -> Option<LaunchConfig> {
    let text = fs::read_to_string(instance.sidecar()).ok()?;
    match toml::from_str(&text) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(
                instance = %instance.name(),
                error = %e,
                "unreadable launch sidecar, falling back to boot script"
            );
            None
        }
    }
}

/// Extract the configuration from the boot script's QEMU invocation.
///
/// Kernel path and forwarded port are mandatory; if either fails to match the
/// whole recovery yields `None`. Memory and CPU count fall back to the fixed
/// defaults. The patterns bind to the invocation syntax, not to this tool's
/// exact rendering, so scripts written by other versions stay parseable.
fn read_script(instance: &Instance) -> Option<LaunchConfig> {
    static KERNEL_RE: OnceLock<Regex> = OnceLock::new();
    static PORT_RE: OnceLock<Regex> = OnceLock::new();
    static MEM_RE: OnceLock<Regex> = OnceLock::new();
    static SMP_RE: OnceLock<Regex> = OnceLock::new();

    let kernel_re =
        KERNEL_RE.get_or_init(|| Regex::new(r"-kernel (\S+)/arch/x86").unwrap());
    let port_re = PORT_RE.get_or_init(|| Regex::new(r"hostfwd=tcp::(\d+)-:22").unwrap());
    let mem_re = MEM_RE.get_or_init(|| Regex::new(r"-m (\S+)").unwrap());
    let smp_re = SMP_RE.get_or_init(|| Regex::new(r"-smp (\d+)").unwrap());

    let text = fs::read_to_string(instance.boot_script()).ok()?;

    let kernel = kernel_re.captures(&text)?.get(1)?.as_str();
    let port: u16 = port_re.captures(&text)?.get(1)?.as_str().parse().ok()?;

    let memory = mem_re
        .captures(&text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(default_memory);
    let cpus = smp_re
        .captures(&text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(DEFAULT_CPUS);

    Some(LaunchConfig {
        kernel: PathBuf::from(kernel),
        port,
        memory,
        cpus,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> LaunchConfig {
        LaunchConfig {
            kernel: PathBuf::from("/build/linux-6.8"),
            port: 20000,
            memory: DEFAULT_MEMORY.to_string(),
            cpus: DEFAULT_CPUS,
        }
    }

    #[test]
    fn round_trip_through_sidecar() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        let config = test_config();

        write(&inst, &config).unwrap();
        assert_eq!(read(&inst), Some(config));
    }

    #[test]
    fn round_trip_through_script_when_sidecar_missing() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        let config = LaunchConfig {
            kernel: PathBuf::from("/build/linux-6.8"),
            port: 24321,
            memory: "2048M".to_string(),
            cpus: 8,
        };

        write(&inst, &config).unwrap();
        std::fs::remove_file(inst.sidecar()).unwrap();
        assert_eq!(read(&inst), Some(config));
    }

    #[test]
    fn read_returns_none_without_artifacts() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        assert_eq!(read(&inst), None);
    }

    #[test]
    fn script_missing_port_recovers_nothing() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        std::fs::write(
            inst.boot_script(),
            "#!/bin/bash\nexec qemu-system-x86_64 -kernel /k/arch/x86/boot/bzImage -m 4G\n",
        )
        .unwrap();
        // A mandatory field failed to extract: no partial config comes back.
        assert_eq!(read(&inst), None);
    }

    #[test]
    fn script_missing_optionals_recovers_defaults() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        std::fs::write(
            inst.boot_script(),
            "#!/bin/bash\n\
             exec qemu-system-x86_64 \\\n \
             -kernel /build/linux/arch/x86/boot/bzImage \\\n \
             -net user,hostfwd=tcp::20000-:22 -net nic\n",
        )
        .unwrap();

        let config = read(&inst).unwrap();
        assert_eq!(config.kernel, PathBuf::from("/build/linux"));
        assert_eq!(config.port, 20000);
        assert_eq!(config.memory, "4G");
        assert_eq!(config.cpus, 2);
    }

    #[test]
    fn foreign_script_with_same_invocation_syntax_parses() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        // Single line, extra flags, different drive setup: only the
        // invocation syntax in the mandatory positions matters.
        std::fs::write(
            inst.boot_script(),
            "qemu-system-x86_64 -snapshot -kernel /lts/arch/x86/boot/bzImage \
             -drive file=disk.img -net user,hostfwd=tcp::29999-:22 -m 8G -smp 4\n",
        )
        .unwrap();

        let config = read(&inst).unwrap();
        assert_eq!(config.kernel, PathBuf::from("/lts"));
        assert_eq!(config.port, 29999);
        assert_eq!(config.memory, "8G");
        assert_eq!(config.cpus, 4);
    }

    #[test]
    fn sidecar_without_optionals_recovers_defaults() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        std::fs::write(inst.sidecar(), "kernel = \"/k\"\nport = 21000\n").unwrap();

        let config = read(&inst).unwrap();
        assert_eq!(config.memory, "4G");
        assert_eq!(config.cpus, 2);
    }

    #[test]
    fn corrupt_sidecar_falls_back_to_script() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        let config = test_config();
        write(&inst, &config).unwrap();
        std::fs::write(inst.sidecar(), "not valid toml [[[").unwrap();

        assert_eq!(read(&inst), Some(config));
    }

    #[test]
    fn script_is_executable_and_embeds_expected_flags() {
        let dir = TempDir::new().unwrap();
        let inst = Instance::new(dir.path());
        write(&inst, &test_config()).unwrap();

        let mode = std::fs::metadata(inst.boot_script()).unwrap().permissions().mode();
        assert_eq!(mode & 0o755, 0o755);

        let text = std::fs::read_to_string(inst.boot_script()).unwrap();
        assert!(text.starts_with("#!/bin/bash\n"));
        assert!(text.contains("-m 4G"));
        assert!(text.contains("-smp 2"));
        assert!(text.contains("hostfwd=tcp::20000-:22"));
        assert!(text.contains(&format!("-pidfile {}", inst.pid_file().display())));
        assert!(text.contains(&format!("tee {}", inst.log_file().display())));
    }
}
