use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::{
    error::{FormError, Result},
    event::{FileSource, FileUpload},
};

/// Stable reference to an accepted upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub token: String,
    pub display_name: String,
}

/// Receives uploaded media and hands back a stable reference
#[async_trait]
pub trait FileIntake: Send + Sync {
    /// Fails with [`FormError::UnsupportedFormat`] when the extension is not in `allowed`
    async fn intake(&self, upload: &FileUpload, allowed: &[String]) -> Result<FileRef>;
}

/// Lower-cased extension of `file_name` if it is on the allow-list
pub fn check_extension(file_name: &str, allowed: &[String]) -> Result<String> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if allowed.is_empty() || allowed.iter().any(|a| *a == ext) {
        Ok(ext)
    } else {
        Err(FormError::UnsupportedFormat(format!(
            "{file_name} (разрешены: {})",
            allowed.join(", ")
        )))
    }
}

/// Writes uploads under a local directory named by a random token
pub struct LocalFileIntake {
    root: PathBuf,
}

impl LocalFileIntake {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, token: &str) -> PathBuf {
        self.root.join(token)
    }
}

#[async_trait]
impl FileIntake for LocalFileIntake {
    async fn intake(&self, upload: &FileUpload, allowed: &[String]) -> Result<FileRef> {
        let ext = check_extension(&upload.file_name, allowed)?;
        match &upload.source {
            FileSource::Bytes(bytes) => {
                let token = if ext.is_empty() {
                    Uuid::new_v4().to_string()
                } else {
                    format!("{}.{ext}", Uuid::new_v4())
                };
                tokio::fs::create_dir_all(&self.root).await?;
                tokio::fs::write(self.path_for(&token), bytes).await?;
                info!(token = %token, size = bytes.len(), "Stored uploaded file");
                Ok(FileRef {
                    token,
                    display_name: upload.file_name.clone(),
                })
            }
            // the transport keeps the payload; its handle is already stable
            FileSource::Handle(handle) => Ok(FileRef {
                token: handle.clone(),
                display_name: upload.file_name.clone(),
            }),
        }
    }
}
