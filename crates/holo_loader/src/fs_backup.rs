//! Filesystem-backed backup containers.
//!
//! A backup url is either `file:///abs/dir` or a plain directory path; file
//! names inside the container are relative paths below that directory.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use holo_restore::restore::{BackupContainer, BackupSource, LoaderError};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Opens directories as backup containers.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsBackupSource;

impl FsBackupSource {
    /// Size of `file` in the container at `url`.
    pub async fn file_size(&self, url: &str, file: &str) -> Result<u64, LoaderError> {
        let path = resolve(&root_from_url(url), file)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|err| io_error(file, &err))?;
        Ok(meta.len())
    }
}

#[async_trait]
impl BackupSource for FsBackupSource {
    async fn open(&self, url: &str) -> Result<Arc<dyn BackupContainer>, LoaderError> {
        let root = root_from_url(url);
        let meta = tokio::fs::metadata(&root)
            .await
            .map_err(|err| io_error(url, &err))?;
        if !meta.is_dir() {
            return Err(LoaderError::Io {
                file: url.to_string(),
                reason: "backup url is not a directory".to_string(),
            });
        }
        Ok(Arc::new(FsContainer {
            url: url.to_string(),
            root,
        }))
    }
}

struct FsContainer {
    url: String,
    root: PathBuf,
}

#[async_trait]
impl BackupContainer for FsContainer {
    fn url(&self) -> &str {
        &self.url
    }

    async fn read_range(&self, file: &str, offset: u64, len: usize) -> Result<Bytes, LoaderError> {
        let path = resolve(&self.root, file)?;
        let mut handle = tokio::fs::File::open(&path)
            .await
            .map_err(|err| io_error(file, &err))?;
        handle
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| io_error(file, &err))?;
        let mut buf = Vec::with_capacity(len);
        handle
            .take(len as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(|err| io_error(file, &err))?;
        Ok(Bytes::from(buf))
    }
}

fn root_from_url(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

/// Join `file` below `root`, refusing names that escape it.
fn resolve(root: &Path, file: &str) -> Result<PathBuf, LoaderError> {
    let relative = Path::new(file);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if file.is_empty() || escapes {
        return Err(LoaderError::Io {
            file: file.to_string(),
            reason: "file name must be a relative path inside the backup".to_string(),
        });
    }
    Ok(root.join(relative))
}

fn io_error(file: &str, err: &std::io::Error) -> LoaderError {
    if err.kind() == std::io::ErrorKind::NotFound {
        LoaderError::NotFound {
            file: file.to_string(),
        }
    } else {
        LoaderError::Io {
            file: file.to_string(),
            reason: err.to_string(),
        }
    }
}
