//! Applier sink writing routed messages as JSON lines.
//!
//! Each applier gets `applier-<id>.jsonl` in the output directory; every line
//! is one `RoutedBatch` in delivery order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use holo_restore::restore::{ApplierId, ApplierSink, RoutedBatch};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct JsonLinesApplier {
    dir: PathBuf,
    files: Mutex<HashMap<ApplierId, File>>,
}

impl JsonLinesApplier {
    pub async fn create(dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create output dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(dir: &Path, applier: ApplierId) -> PathBuf {
        dir.join(format!("applier-{applier}.jsonl"))
    }
}

#[async_trait]
impl ApplierSink for JsonLinesApplier {
    async fn send(&self, batch: RoutedBatch) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&batch).context("encode routed batch")?;
        line.push(b'\n');

        let mut files = self.files.lock().await;
        let file = match files.entry(batch.applier) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let path = Self::path_for(&self.dir, batch.applier);
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                    .with_context(|| format!("open {}", path.display()))?;
                entry.insert(file)
            }
        };
        file.write_all(&line)
            .await
            .with_context(|| format!("write applier {} log", batch.applier))?;
        file.flush().await.context("flush applier log")?;
        Ok(())
    }
}
