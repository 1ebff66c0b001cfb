use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempfile::{NamedTempFile, TempPath};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One staged multipart part. Its `TempPath` is removed from disk when this
/// value (or anything holding it) is dropped -- success, error, or panic
/// unwinding all take the same path through `Drop`.
pub struct StagedUpload {
    pub field_name: String,
    pub declared_filename: String,
    pub declared_mime: String,
    pub byte_size: u64,
    pub created_at: SystemTime,
    path: TempPath,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates a fresh temp file under `staging_dir`, writes `bytes` into it,
/// and hands back a `StagedUpload` whose `TempPath` owns the on-disk
/// lifetime.
pub fn stage(
    staging_dir: &Path,
    field_name: impl Into<String>,
    declared_filename: impl Into<String>,
    declared_mime: impl Into<String>,
    bytes: &[u8],
) -> std::io::Result<StagedUpload> {
    std::fs::create_dir_all(staging_dir)?;
    let mut file = NamedTempFile::new_in(staging_dir)?;
    std::io::Write::write_all(&mut file, bytes)?;
    let path = file.into_temp_path();
    Ok(StagedUpload {
        field_name: field_name.into(),
        declared_filename: declared_filename.into(),
        declared_mime: declared_mime.into(),
        byte_size: bytes.len() as u64,
        created_at: SystemTime::now(),
        path,
    })
}

/// Per-principal counter bounding concurrent multipart uploads, independent
/// of the scheduler's per-principal concurrency limit. Acquiring returns a
/// guard that decrements on drop so the slot is released on every exit path.
#[derive(Clone)]
pub struct UploadSlots {
    limit: u32,
    counts: Arc<Mutex<HashMap<String, Arc<AtomicU32>>>>,
}

pub struct UploadSlotGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for UploadSlotGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl UploadSlots {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn try_acquire(&self, principal_key: &str) -> Option<UploadSlotGuard> {
        let counter = {
            let mut guard = self.counts.lock().await;
            guard
                .entry(principal_key.to_string())
                .or_insert_with(|| Arc::new(AtomicU32::new(0)))
                .clone()
        };

        loop {
            let current = counter.load(Ordering::SeqCst);
            if current >= self.limit {
                return None;
            }
            if counter
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(UploadSlotGuard { counter });
            }
        }
    }
}

/// Backstop sweeper: walks `staging_dir` and removes any file older than
/// `max_age`, covering crashes that skipped normal drop-based cleanup.
pub async fn sweep_staging_dir(staging_dir: &Path, max_age: Duration) {
    let Ok(mut entries) = tokio::fs::read_dir(staging_dir).await else {
        return;
    };
    let mut removed = 0u32;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path: PathBuf = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let Ok(age) = SystemTime::now().duration_since(modified) else {
            continue;
        };
        if age > max_age {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            } else {
                warn!(target: "tollgate::upload", path = %path.display(), "failed to sweep stale staging file");
            }
        }
    }
    if removed > 0 {
        info!(target: "tollgate::upload", removed, "swept stale staging files");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_upload_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path_copy;
        {
            let staged = stage(dir.path(), "file", "a.wav", "audio/wav", b"data").unwrap();
            path_copy = staged.path().to_path_buf();
            assert!(path_copy.exists());
        }
        assert!(!path_copy.exists());
    }

    #[tokio::test]
    async fn upload_slots_enforce_limit_and_release_on_drop() {
        let slots = UploadSlots::new(1);
        let guard = slots.try_acquire("user-1").await.unwrap();
        assert!(slots.try_acquire("user-1").await.is_none());
        drop(guard);
        assert!(slots.try_acquire("user-1").await.is_some());
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("fresh.tmp");
        tokio::fs::write(&fresh, b"x").await.unwrap();
        sweep_staging_dir(dir.path(), Duration::from_secs(3600)).await;
        assert!(fresh.exists());
    }
}
