//! Implements AuditLog with two append-only text files (sync trail, population).

use crate::domain::DomainError;
use crate::ports::AuditLog;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub struct FileAuditLog {
    sync_path: PathBuf,
    population_path: PathBuf,
}

impl FileAuditLog {
    pub fn new(sync_path: impl AsRef<Path>, population_path: impl AsRef<Path>) -> Self {
        Self {
            sync_path: sync_path.as_ref().to_path_buf(),
            population_path: population_path.as_ref().to_path_buf(),
        }
    }

    async fn append(path: &Path, text: &str) -> Result<(), DomainError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| DomainError::Audit(e.to_string()))?;
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| DomainError::Audit(format!("{}: {}", path.display(), e)))?;
        f.write_all(text.as_bytes())
            .await
            .map_err(|e| DomainError::Audit(format!("{}: {}", path.display(), e)))?;
        f.flush()
            .await
            .map_err(|e| DomainError::Audit(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuditLog for FileAuditLog {
    async fn append_sync(&self, text: &str) -> Result<(), DomainError> {
        Self::append(&self.sync_path, text).await
    }

    async fn append_population(&self, text: &str) -> Result<(), DomainError> {
        Self::append(&self.population_path, text).await
    }
}
