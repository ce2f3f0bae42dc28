use std::path::PathBuf;

use futures::future::BoxFuture;
use tracing::info;

use capsule_core::error::{CapsuleError, Result};
use capsule_core::traits::RunStore;
use capsule_core::types::RunRecord;

/// Writes each finished run to `{dir}/{run_id}/run.json`.
pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn run_path(&self, record: &RunRecord) -> PathBuf {
        self.dir.join(record.id.as_str()).join("run.json")
    }
}

impl RunStore for FileRunStore {
    fn save<'a>(&'a self, record: &'a RunRecord) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let path = self.run_path(record);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    CapsuleError::Storage(format!("{}: {}", parent.display(), e))
                })?;
            }
            let json = serde_json::to_string_pretty(record)?;
            tokio::fs::write(&path, json)
                .await
                .map_err(|e| CapsuleError::Storage(format!("{}: {}", path.display(), e)))?;

            info!(run_id = %record.id, path = %path.display(), "Run saved");
            Ok(vec![path.display().to_string()])
        })
    }
}
