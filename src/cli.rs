//! Subcommand implementations. This layer formats output and passes
//! structured requests down to the image repository and the VM controller
//! modules; it owns no lifecycle logic of its own.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::image::{ImageManager, TEMPLATE_NAME};
use crate::vm::{launch, ports, probe, ssh::SshChannel, supervisor, Instance};

/// User-supplied launch overrides for `run`. Unset fields merge over the
/// recovered last config, then over the fixed defaults.
#[derive(Debug, Default)]
pub struct RunOpts {
    pub kernel: Option<PathBuf>,
    pub port: Option<u16>,
    pub mem: Option<String>,
    pub smp: Option<u32>,
    /// Block after a successful start until SSH answers, up to this many seconds.
    pub wait: Option<u64>,
}

pub fn run_init(config_path: &std::path::Path, images_home: PathBuf) -> Result<()> {
    if config_path.exists() {
        println!("Warning: config already exists at {}", config_path.display());
    }
    let config = Config { images_home };
    config.save(config_path)?;
    println!("Config written: {}", config_path.display());

    let manager = ImageManager::new(&config.images_home);
    manager.initialize()?;
    println!(
        "Images home ready: {}\n\
         Place a disk image (bullseye.img) and key (bullseye.id_rsa) in {}/{} \
         to enable `vmctl create`.",
        config.images_home.display(),
        config.images_home.display(),
        TEMPLATE_NAME
    );
    Ok(())
}

pub fn run_create(config: &Config, name: &str) -> Result<()> {
    let manager = ImageManager::new(&config.images_home);
    manager.create(name)?;
    println!("Image {} created", name);
    Ok(())
}

pub fn run_delete(config: &Config, name: &str) -> Result<()> {
    let manager = ImageManager::new(&config.images_home);
    manager.delete(name)?;
    println!("Image {} deleted", name);
    Ok(())
}

pub fn run_list(config: &Config) -> Result<()> {
    let manager = ImageManager::new(&config.images_home);
    let images = manager.list_images()?;

    println!("Images home: {}\n", config.images_home.display());
    if images.is_empty() {
        println!("No images found. Run `vmctl create NAME` after preparing the template.");
        return Ok(());
    }

    println!("{:<20} {:<20} {:<12} {:>8}", "NAME", "CREATED", "STATUS", "PID");
    for img in images {
        let status = if img.is_template && !img.template_ready {
            "incomplete"
        } else if img.running {
            "running"
        } else {
            "stopped"
        };
        println!(
            "{:<20} {:<20} {:<12} {:>8}",
            img.name,
            img.created_at.format("%Y-%m-%d %H:%M:%S"),
            status,
            img.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

pub async fn run_status(config: &Config, name: &str) -> Result<()> {
    let manager = ImageManager::new(&config.images_home);
    let info = manager
        .get_image_info(name)
        .with_context(|| format!("image {} not found", name))?;

    println!("Name:       {}", info.name);
    println!("Path:       {}", info.path.display());
    println!("Created:    {}", info.created_at.format("%Y-%m-%d %H:%M:%S"));
    if info.is_template {
        println!(
            "Template:   {}",
            if info.template_ready { "ready" } else { "incomplete" }
        );
    }

    let instance = Instance::new(&info.path);
    if info.running {
        // Non-blocking: one short handshake, no waiting for readiness.
        let state = if probe::is_ready(&instance).await {
            "running"
        } else {
            "starting (SSH not answering yet)"
        };
        println!("Status:     {}", state);
        if let Some(pid) = info.pid {
            println!("PID:        {}", pid);
        }
        if let Some(cfg) = launch::read(&instance) {
            println!("Kernel:     {}", cfg.kernel.display());
            println!("SSH port:   {}", cfg.port);
            println!("Memory:     {}", cfg.memory);
            println!("CPUs:       {}", cfg.cpus);
        }
        println!("Console:    screen -r {}", instance.session_name());
    } else {
        println!("Status:     not running");
    }
    Ok(())
}

pub async fn run_run(config: &Config, name: &str, opts: RunOpts) -> Result<()> {
    let manager = ImageManager::new(&config.images_home);
    let info = manager
        .get_image_info(name)
        .with_context(|| format!("image {} not found", name))?;
    if info.running {
        bail!("image {} is already running", name);
    }

    let instance = Instance::new(&info.path);
    let last = launch::read(&instance);

    let kernel = match opts.kernel {
        Some(k) => k,
        None => {
            let k = last
                .as_ref()
                .map(|c| c.kernel.clone())
                .context("kernel path required for first run (--kernel)")?;
            println!("Using last kernel path: {}", k.display());
            k
        }
    };
    let port = match opts.port {
        Some(p) => p,
        None => {
            let p = ports::allocate(&instance)
                .await
                .context("no available SSH forward port")?;
            println!("Allocated SSH port: {}", p);
            p
        }
    };
    let memory = opts
        .mem
        .or_else(|| last.as_ref().map(|c| c.memory.clone()))
        .unwrap_or_else(|| launch::DEFAULT_MEMORY.to_string());
    let cpus = opts
        .smp
        .or_else(|| last.as_ref().map(|c| c.cpus))
        .unwrap_or(launch::DEFAULT_CPUS);

    let launch_config = launch::LaunchConfig {
        kernel,
        port,
        memory,
        cpus,
    };
    supervisor::start(&instance, &launch_config).await?;

    println!("VM starting; SSH will answer once the guest boots.");
    println!("Tip: `screen -r {}` attaches the console (Ctrl+A,D detaches).", instance.session_name());

    if let Some(secs) = opts.wait {
        if probe::wait_until_ready(&instance, secs).await {
            println!("VM is ready");
        } else {
            // The still-booting VM is left running; the caller retries.
            bail!("VM did not become ready within {}s (still booting)", secs);
        }
    }
    Ok(())
}

pub async fn run_stop(config: &Config, name: &str) -> Result<()> {
    let manager = ImageManager::new(&config.images_home);
    let info = manager
        .get_image_info(name)
        .with_context(|| format!("image {} not found", name))?;

    let instance = Instance::new(&info.path);
    if supervisor::stop(&instance).await? {
        println!("VM stopped");
    } else {
        println!("Image {} is not running", name);
    }
    Ok(())
}

pub async fn run_exec(config: &Config, name: &str, command: &str) -> Result<()> {
    let manager = ImageManager::new(&config.images_home);
    let info = manager
        .get_image_info(name)
        .with_context(|| format!("image {} not found", name))?;

    let instance = Instance::new(&info.path);
    let channel = SshChannel::open(&instance).await?;
    let (stdout, stderr) = channel.exec(command).await?;
    channel.close();

    if !stdout.is_empty() {
        print!("{}", stdout);
    }
    if !stderr.is_empty() {
        eprint!("{}", stderr);
    }
    Ok(())
}

pub async fn run_cp(config: &Config, src: &str, dst: &str) -> Result<()> {
    let (src_image, src_path) = parse_path(src);
    let (dst_image, dst_path) = parse_path(dst);

    let (name, to_guest) = match (&src_image, &dst_image) {
        (Some(_), Some(_)) => bail!("direct copy between two VMs is not supported"),
        (None, None) => bail!("one side must name a VM, e.g. `vmctl cp file.txt myvm:/root/`"),
        (Some(name), None) => (name.clone(), false),
        (None, Some(name)) => (name.clone(), true),
    };

    let manager = ImageManager::new(&config.images_home);
    let info = manager
        .get_image_info(&name)
        .with_context(|| format!("image {} not found", name))?;

    let instance = Instance::new(&info.path);
    let channel = SshChannel::open(&instance).await?;
    if to_guest {
        channel.copy_in(std::path::Path::new(&src_path), &dst_path).await?;
        println!("Copied to VM: {}", dst_path);
    } else {
        channel.copy_out(&src_path, std::path::Path::new(&dst_path)).await?;
        println!("Copied from VM: {}", dst_path);
    }
    channel.close();
    Ok(())
}

/// Split `image:path` into its parts; a path without a colon is host-local.
fn parse_path(path: &str) -> (Option<String>, String) {
    match path.split_once(':') {
        Some((image, rest)) => (Some(image.to_string()), rest.to_string()),
        None => (None, path.to_string()),
    }
}
