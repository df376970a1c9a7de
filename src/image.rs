//! Image repository: one subdirectory per image under the images home.
//!
//! The repository only creates, deletes, and enumerates directories and
//! answers per-image questions; building images is out of scope. New images
//! are cloned from the `image-template` directory, which must carry a disk
//! image and its matching SSH key before it counts as ready.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use tracing::info;

use crate::vm::{supervisor, Instance};

/// Reserved name of the template image directory.
pub const TEMPLATE_NAME: &str = "image-template";

/// Root disk file every image carries.
const DISK_FILE: &str = "bullseye.img";
/// Private key for the guest root account, cloned alongside the disk.
const KEY_FILE: &str = "bullseye.id_rsa";

/// Snapshot of one image directory's state.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Local>,
    pub is_template: bool,
    pub template_ready: bool,
    pub running: bool,
    pub pid: Option<i32>,
}

pub struct ImageManager {
    images_home: PathBuf,
}

impl ImageManager {
    pub fn new(images_home: impl Into<PathBuf>) -> Self {
        Self {
            images_home: images_home.into(),
        }
    }

    /// Create the images home and the (empty) template directory.
    pub fn initialize(&self) -> Result<()> {
        let template = self.images_home.join(TEMPLATE_NAME);
        fs::create_dir_all(&template)
            .with_context(|| format!("creating images home: {}", self.images_home.display()))?;
        Ok(())
    }

    /// Clone a new image from the ready template.
    pub fn create(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let template = self.images_home.join(TEMPLATE_NAME);
        if !template_ready(&template) {
            bail!(
                "template image is not ready: {} must contain {} and {}",
                template.display(),
                DISK_FILE,
                KEY_FILE
            );
        }

        let dest = self.images_home.join(name);
        if dest.exists() {
            bail!("image {} already exists", name);
        }
        fs::create_dir(&dest)
            .with_context(|| format!("creating image directory: {}", dest.display()))?;

        for file in [DISK_FILE, KEY_FILE] {
            fs::copy(template.join(file), dest.join(file))
                .with_context(|| format!("cloning {} into {}", file, dest.display()))?;
        }
        // sshd refuses keys readable by the group/world.
        fs::set_permissions(dest.join(KEY_FILE), fs::Permissions::from_mode(0o600))
            .context("restricting key permissions")?;

        info!(name, path = %dest.display(), "image created");
        Ok(())
    }

    /// Delete an image directory. Refuses the template and running images.
    pub fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if name == TEMPLATE_NAME {
            bail!("refusing to delete the template image");
        }
        let path = self.images_home.join(name);
        if !path.is_dir() {
            bail!("image {} not found", name);
        }
        if supervisor::is_running(&Instance::new(&path)) {
            bail!("image {} is running; stop it first", name);
        }
        fs::remove_dir_all(&path)
            .with_context(|| format!("deleting image directory: {}", path.display()))?;
        info!(name, "image deleted");
        Ok(())
    }

    /// Enumerate all image directories, template first, then by name.
    pub fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let entries = fs::read_dir(&self.images_home)
            .with_context(|| format!("reading images home: {}", self.images_home.display()))?;

        let mut images = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                images.push(self.info_for(&path));
            }
        }
        images.sort_by(|a, b| {
            b.is_template
                .cmp(&a.is_template)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(images)
    }

    /// Look up one image by name.
    pub fn get_image_info(&self, name: &str) -> Option<ImageInfo> {
        let path = self.images_home.join(name);
        if !path.is_dir() {
            return None;
        }
        Some(self.info_for(&path))
    }

    fn info_for(&self, path: &Path) -> ImageInfo {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let created_at = fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());
        let instance = Instance::new(path);
        let running = supervisor::is_running(&instance);
        ImageInfo {
            is_template: name == TEMPLATE_NAME,
            template_ready: template_ready(path),
            pid: if running {
                supervisor::read_pid(&instance)
            } else {
                None
            },
            name,
            path: path.to_path_buf(),
            created_at,
            running,
        }
    }
}

fn template_ready(path: &Path) -> bool {
    path.join(DISK_FILE).exists() && path.join(KEY_FILE).exists()
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("image name must not be empty");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        bail!(
            "image name '{}' contains invalid characters (allowed: alphanumeric, -, _, .)",
            name
        );
    }
    if name == "." || name == ".." {
        bail!("image name '{}' is reserved", name);
    }
    Ok(())
}
