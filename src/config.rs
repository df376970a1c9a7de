use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Global configuration: where the image directories live.
///
/// Written once by `vmctl init`, read by every other subcommand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Parent directory holding one subdirectory per image.
    pub images_home: PathBuf,
}

impl Config {
    /// Default config file location: `$XDG_CONFIG_HOME/vmctl/config.toml`,
    /// falling back to `~/.config/vmctl/config.toml`.
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            if !xdg.is_empty() {
                return Ok(PathBuf::from(xdg).join("vmctl").join("config.toml"));
            }
        }
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home).join(".config").join("vmctl").join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "reading config: {} (run `vmctl init --images-home DIR` first)",
                path.display()
            )
        })?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("serializing config")?;
        std::fs::write(path, content)
            .with_context(|| format!("writing config: {}", path.display()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.images_home.is_absolute(),
            "images_home must be an absolute path: {}",
            self.images_home.display()
        );
        Ok(())
    }
}
