//! Implements GroupMapPersistence using a JSON file.
//!
//! `{"<server group name>": {"sgid": 20, "forumGroups": [5, 6], "permanent": false}, ...}`

use crate::domain::{DomainError, GroupMap};
use crate::ports::GroupMapPersistence;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

pub struct GroupMapJson {
    path: PathBuf,
}

impl GroupMapJson {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl GroupMapPersistence for GroupMapJson {
    /// A missing file is an empty map. A corrupt one is an error, never silently reset.
    async fn load(&self) -> Result<GroupMap, DomainError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no group map file; starting empty");
                return Ok(GroupMap::new());
            }
            Err(e) => {
                return Err(DomainError::Persistence(format!(
                    "read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };
        serde_json::from_str(&text).map_err(|e| {
            DomainError::Persistence(format!("parse {}: {}", self.path.display(), e))
        })
    }

    /// Write-replace: temp file, sync_all, rename over the target.
    async fn save(&self, map: &GroupMap) -> Result<(), DomainError> {
        let json = serde_json::to_string_pretty(map)
            .map_err(|e| DomainError::Persistence(e.to_string()))?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| DomainError::Persistence(format!("create dir: {}", e)))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let mut f = fs::File::create(&temp_path)
            .await
            .map_err(|e| DomainError::Persistence(format!("create temp file: {}", e)))?;
        f.write_all(json.as_bytes())
            .await
            .map_err(|e| DomainError::Persistence(format!("write temp file: {}", e)))?;
        f.sync_all()
            .await
            .map_err(|e| DomainError::Persistence(format!("sync temp file: {}", e)))?;
        drop(f);

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| DomainError::Persistence(format!("atomic rename failed: {}", e)))?;
        Ok(())
    }
}
