use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tollgate_common::Principal;
use tracing::{error, info, warn};

/// Refreshable `api key -> Principal` mapping, backed by a JSON file on disk.
///
/// Mirrors the teacher's `MemoryAuth`: reads are a single `ArcSwap::load`
/// with no locking, writes are a full-map replace behind `ArcSwap::store`.
/// The only addition over the teacher's in-memory snapshot is the watcher
/// that triggers `reload()` when the backing file changes.
pub struct KeyStore {
    path: PathBuf,
    snapshot: ArcSwap<HashMap<String, Principal>>,
    // Keeps the OS watch alive; dropping it stops delivery.
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl KeyStore {
    /// Loads the key file once and starts a debounced filesystem watch.
    /// If the watch cannot be established, the store still starts with the
    /// data loaded at construction time, logging a warning instead of
    /// failing startup.
    pub async fn start(path: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        let path = path.into();
        let initial = load_keys(&path)?;
        let store = Arc::new(Self {
            path: path.clone(),
            snapshot: ArcSwap::from_pointee(initial),
            _watcher: Mutex::new(None),
        });

        match spawn_watch(path.clone(), store.clone()) {
            Ok(watcher) => {
                *store._watcher.lock().unwrap() = Some(watcher);
                info!(target: "tollgate::keystore", path = %path.display(), "watching key file for changes");
            }
            Err(err) => {
                warn!(
                    target: "tollgate::keystore",
                    path = %path.display(),
                    error = %err,
                    "could not establish file watch, live reload disabled"
                );
            }
        }

        Ok(store)
    }

    pub fn lookup(&self, key: &str) -> Option<Principal> {
        self.snapshot.load().get(key).cloned()
    }

    pub fn principal_count(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Re-reads the backing file and atomically swaps the mapping.
    /// A malformed file leaves the previous mapping intact.
    pub fn reload(&self) {
        match load_keys(&self.path) {
            Ok(fresh) => {
                info!(target: "tollgate::keystore", count = fresh.len(), "reloaded key file");
                self.snapshot.store(Arc::new(fresh));
            }
            Err(err) => {
                error!(
                    target: "tollgate::keystore",
                    path = %self.path.display(),
                    error = %err,
                    "failed to reload key file, keeping prior mapping"
                );
            }
        }
    }
}

fn load_keys(path: &Path) -> anyhow::Result<HashMap<String, Principal>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading key file {}: {e}", path.display()))?;
    let principals: Vec<Principal> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("parsing key file {}: {e}", path.display()))?;
    Ok(principals
        .into_iter()
        .map(|p| (p.key.clone(), p))
        .collect())
}

/// Debounces raw filesystem events onto a short coalescing window so a
/// burst of writes (editors that write-then-rename) triggers one reload.
fn spawn_watch(path: PathBuf, store: Arc<KeyStore>) -> notify::Result<RecommendedWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    })?;

    let watch_target = path.parent().filter(|p| !p.as_os_str().is_empty());
    match watch_target {
        Some(dir) => watcher.watch(dir, RecursiveMode::NonRecursive)?,
        None => watcher.watch(Path::new("."), RecursiveMode::NonRecursive)?,
    }

    tokio::spawn(async move {
        loop {
            let Some(event) = rx.recv().await else {
                break;
            };
            if event.is_err() {
                continue;
            }
            // Coalesce any further events that land within the debounce
            // window before actually reloading.
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                else => {}
            }
            while rx.try_recv().is_ok() {}
            store.reload();
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_initial_keys_and_looks_up() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"key":"abc","name":"Ada","email":"ada@example.test"}}]"#
        )
        .unwrap();
        let store = KeyStore::start(file.path()).await.unwrap();
        let principal = store.lookup("abc").unwrap();
        assert_eq!(principal.name, "Ada");
        assert!(store.lookup("missing").is_none());
    }

    #[tokio::test]
    async fn reload_replaces_mapping_atomically() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"key":"abc","name":"Ada","email":"ada@example.test"}}]"#
        )
        .unwrap();
        let store = KeyStore::start(file.path()).await.unwrap();
        std::fs::write(
            file.path(),
            r#"[{"key":"xyz","name":"Grace","email":"grace@example.test"}]"#,
        )
        .unwrap();
        store.reload();
        assert!(store.lookup("abc").is_none());
        assert_eq!(store.lookup("xyz").unwrap().name, "Grace");
    }

    #[tokio::test]
    async fn malformed_reload_keeps_prior_mapping() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"key":"abc","name":"Ada","email":"ada@example.test"}}]"#
        )
        .unwrap();
        let store = KeyStore::start(file.path()).await.unwrap();
        std::fs::write(file.path(), "not json").unwrap();
        store.reload();
        assert_eq!(store.lookup("abc").unwrap().name, "Ada");
    }
}
