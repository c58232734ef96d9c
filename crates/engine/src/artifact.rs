//! Screenshot artifact store
//!
//! Layout under the artifact root:
//!
//! ```text
//! runs/<run_id>/<step_id>.png         full-resolution capture
//! runs/<run_id>/<step_id>.thumb.png   derived on first request
//! tmp/                                staging for atomic writes
//! ```
//!
//! Every read goes through a containment check so the read channel cannot
//! be used to disclose files outside the root.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Maximum thumbnail width in pixels
const THUMBNAIL_WIDTH: u32 = 320;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Path is outside the artifact root: {0}")]
    OutsideRoot(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Invalid artifact key: {0}")]
    InvalidKey(String),
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Thumbnail,
    #[default]
    Full,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create the store, creating the directory layout if needed
    pub fn new(root: impl AsRef<Path>) -> ArtifactResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root.join("runs"))?;
        std::fs::create_dir_all(root.join("tmp"))?;
        let root = root.canonicalize()?;

        info!("Initialized artifact store at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id)
    }

    /// Write the screenshot for one executed step and return its path
    pub fn capture(&self, run_id: &str, step_id: &str, png: &[u8]) -> ArtifactResult<PathBuf> {
        check_key(run_id)?;
        check_key(step_id)?;
        if png.is_empty() {
            return Err(ArtifactError::InvalidKey("empty screenshot".to_string()));
        }

        let dir = self.run_dir(run_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.png", step_id));

        self.write_atomic(&path, png)?;
        debug!("Captured screenshot {} ({} bytes)", path.display(), png.len());
        Ok(path)
    }

    /// Path of the reduced rendition, generating it on first use
    pub fn thumbnail(&self, path: impl AsRef<Path>) -> ArtifactResult<PathBuf> {
        let full = self.contain(path.as_ref())?;
        let thumb = thumbnail_path(&full);
        if full == thumb || thumb.exists() {
            return Ok(thumb);
        }

        let img = image::open(&full)?;
        let (width, height) = img.dimensions();
        let scaled = if width > THUMBNAIL_WIDTH {
            let new_height = ((height as u64 * THUMBNAIL_WIDTH as u64) / width as u64).max(1) as u32;
            img.thumbnail(THUMBNAIL_WIDTH, new_height)
        } else {
            img
        };

        let mut encoded = std::io::Cursor::new(Vec::new());
        scaled.write_to(&mut encoded, ImageFormat::Png)?;
        self.write_atomic(&thumb, encoded.get_ref())?;

        debug!("Generated thumbnail {}", thumb.display());
        Ok(thumb)
    }

    /// Read an artifact; a thumbnail that cannot be produced falls back to the full image
    pub fn read(&self, path: impl AsRef<Path>, variant: Variant) -> ArtifactResult<Vec<u8>> {
        let full = self.contain(path.as_ref())?;
        let target = match variant {
            Variant::Full => full,
            Variant::Thumbnail => match self.thumbnail(&full) {
                Ok(thumb) => thumb,
                Err(e) => {
                    warn!("Thumbnail unavailable for {}: {}", full.display(), e);
                    full
                }
            },
        };
        Ok(std::fs::read(target)?)
    }

    /// Read an artifact encoded as a `data:` URL
    pub fn read_as_data_url(&self, path: impl AsRef<Path>, variant: Variant) -> ArtifactResult<String> {
        let bytes = self.read(path, variant)?;
        Ok(format!("data:image/png;base64,{}", STANDARD.encode(bytes)))
    }

    /// SHA-256 of an artifact, hex encoded
    pub fn digest(&self, path: impl AsRef<Path>) -> ArtifactResult<String> {
        let full = self.contain(path.as_ref())?;
        let data = std::fs::read(full)?;
        let mut hasher = Sha256::new();
        hasher.update(&data);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Delete every artifact recorded for a run
    pub fn remove_run(&self, run_id: &str) -> ArtifactResult<()> {
        check_key(run_id)?;
        let dir = self.run_dir(run_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            debug!("Removed artifacts for run {}", run_id);
        }
        Ok(())
    }

    /// Resolve `path` and ensure it stays within the root
    fn contain(&self, path: &Path) -> ArtifactResult<PathBuf> {
        let requested = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        match requested.canonicalize() {
            Ok(canon) if canon.starts_with(&self.root) => Ok(canon),
            Ok(_) => Err(ArtifactError::OutsideRoot(path.display().to_string())),
            Err(_) => {
                let escapes = requested.components().any(|c| c == Component::ParentDir);
                if escapes || !requested.starts_with(&self.root) {
                    Err(ArtifactError::OutsideRoot(path.display().to_string()))
                } else {
                    Err(ArtifactError::NotFound(path.display().to_string()))
                }
            }
        }
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> ArtifactResult<()> {
        let tmp = tempfile::NamedTempFile::new_in(self.root.join("tmp"))?;
        std::fs::write(tmp.path(), data)?;
        tmp.persist(path).map_err(|e| ArtifactError::Io(e.error))?;
        Ok(())
    }
}

fn thumbnail_path(full: &Path) -> PathBuf {
    let name = full
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.ends_with(".thumb.png") {
        return full.to_path_buf();
    }
    let stem = full
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    full.with_file_name(format!("{}.thumb.png", stem))
}

fn check_key(key: &str) -> ArtifactResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ArtifactError::InvalidKey(key.to_string()))
    }
}
