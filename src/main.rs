mod cli;
mod config;
mod image;
mod util;
mod vm;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::RunOpts;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "vmctl", version, about = "QEMU virtual machine lifecycle manager")]
struct Cli {
    /// Path to the global config file (default: ~/.config/vmctl/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the global config and prepare the images home.
    Init {
        /// Parent directory that will hold one subdirectory per image.
        #[arg(long)]
        images_home: PathBuf,
    },
    /// Create a new image by cloning the template.
    Create { name: String },
    /// Delete an image (must be stopped).
    Delete { name: String },
    /// List all images.
    List,
    /// Show one image's state: liveness, last launch config, SSH readiness.
    Status { name: String },
    /// Launch a VM. Unset options fall back to the previous launch, then to defaults.
    Run {
        name: String,
        /// Kernel build tree root (mandatory on first run).
        #[arg(long)]
        kernel: Option<PathBuf>,
        /// Host port forwarded to guest SSH; auto-allocated when unset.
        #[arg(long)]
        port: Option<u16>,
        /// Memory size spec, e.g. 4G (default: 4G).
        #[arg(long)]
        mem: Option<String>,
        /// Virtual CPU count (default: 2).
        #[arg(long)]
        smp: Option<u32>,
        /// Block until SSH answers, up to this many seconds.
        #[arg(long)]
        wait: Option<u64>,
    },
    /// Stop a running VM (graceful, then forced).
    Stop { name: String },
    /// Execute a command inside a ready VM.
    Exec { name: String, command: String },
    /// Copy files between host and VM; the VM side is `image:path`.
    Cp { src: String, dst: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Cli::parse();
    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_path()?,
    };

    match args.command {
        Commands::Init { images_home } => cli::run_init(&config_path, images_home),
        Commands::Create { name } => cli::run_create(&Config::load(&config_path)?, &name),
        Commands::Delete { name } => cli::run_delete(&Config::load(&config_path)?, &name),
        Commands::List => cli::run_list(&Config::load(&config_path)?),
        Commands::Status { name } => cli::run_status(&Config::load(&config_path)?, &name).await,
        Commands::Run {
            name,
            kernel,
            port,
            mem,
            smp,
            wait,
        } => {
            cli::run_run(
                &Config::load(&config_path)?,
                &name,
                RunOpts { kernel, port, mem, smp, wait },
            )
            .await
        }
        Commands::Stop { name } => cli::run_stop(&Config::load(&config_path)?, &name).await,
        Commands::Exec { name, command } => {
            cli::run_exec(&Config::load(&config_path)?, &name, &command).await
        }
        Commands::Cp { src, dst } => cli::run_cp(&Config::load(&config_path)?, &src, &dst).await,
    }
}
