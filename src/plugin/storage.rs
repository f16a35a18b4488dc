//! Per-plugin persistent key/value storage
//!
//! Backed by one JSON file per plugin, written atomically (temp file +
//! rename). All writes for a plugin flow through a single queue task, so N
//! overlapping `set` calls produce N file writes in enqueue order. The
//! in-memory cache only advances after a successful persist; a failed write
//! leaves both the cache and the on-disk state at their pre-failure values.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// One queued mutation
enum Change {
    Set(String, Value),
    Delete(String),
}

struct WriteJob {
    change: Change,
    reply: oneshot::Sender<io::Result<()>>,
}

/// Key/value storage for one plugin
pub struct PluginStorage {
    cache: Arc<Mutex<HashMap<String, Value>>>,
    queue: mpsc::UnboundedSender<WriteJob>,
}

impl PluginStorage {
    /// Open the storage file, tolerating a missing or corrupt backing file
    /// by starting empty.
    pub fn open(path: PathBuf) -> io::Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let initial: HashMap<String, Value> = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Corrupt storage file {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        let cache = Arc::new(Mutex::new(initial.clone()));
        let (queue, rx) = mpsc::unbounded_channel();

        let storage = Arc::new(Self {
            cache: cache.clone(),
            queue,
        });

        tokio::spawn(write_loop(path, initial, cache, rx));
        Ok(storage)
    }

    /// Read a key from the committed state.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.cache.lock().get(key).cloned()
    }

    /// Persist a key. Resolves after the file write; on failure the
    /// previous value is still visible.
    pub async fn set(&self, key: &str, value: Value) -> io::Result<()> {
        self.submit(Change::Set(key.to_string(), value)).await
    }

    /// Remove a key.
    pub async fn delete(&self, key: &str) -> io::Result<()> {
        self.submit(Change::Delete(key.to_string())).await
    }

    /// Keys in the committed state, optionally filtered by prefix.
    pub fn list(&self, prefix: Option<&str>) -> Vec<String> {
        let cache = self.cache.lock();
        let mut keys: Vec<String> = match prefix {
            Some(prefix) => cache
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect(),
            None => cache.keys().cloned().collect(),
        };
        keys.sort();
        keys
    }

    async fn submit(&self, change: Change) -> io::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(WriteJob { change, reply })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "storage writer gone"))?;
        rx.await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "storage writer gone"))?
    }
}

/// Single writer: applies jobs in enqueue order against the committed
/// state, persisting each one before advancing the shared cache.
async fn write_loop(
    path: PathBuf,
    mut committed: HashMap<String, Value>,
    cache: Arc<Mutex<HashMap<String, Value>>>,
    mut rx: mpsc::UnboundedReceiver<WriteJob>,
) {
    let counter = AtomicU64::new(0);

    while let Some(job) = rx.recv().await {
        let mut candidate = committed.clone();
        match &job.change {
            Change::Set(key, value) => {
                candidate.insert(key.clone(), value.clone());
            }
            Change::Delete(key) => {
                candidate.remove(key);
            }
        }

        let result = persist(&path, &candidate, &counter);
        match result {
            Ok(()) => {
                committed = candidate;
                *cache.lock() = committed.clone();
                let _ = job.reply.send(Ok(()));
            }
            Err(e) => {
                debug!("Storage write to {} failed: {}", path.display(), e);
                let _ = job.reply.send(Err(e));
            }
        }
    }
}

/// Write-to-temp then rename. The temp file is unlinked on failure,
/// tolerating unlink errors.
fn persist(path: &PathBuf, state: &HashMap<String, Value>, counter: &AtomicU64) -> io::Result<()> {
    let serial = counter.fetch_add(1, Ordering::SeqCst);
    let tmp_path = {
        let mut s = path.as_os_str().to_owned();
        s.push(format!(".tmp.{}", serial));
        PathBuf::from(s)
    };

    let body = serde_json::to_vec_pretty(state)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let write_result = std::fs::write(&tmp_path, &body)
        .and_then(|_| std::fs::rename(&tmp_path, path));

    if let Err(e) = write_result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PluginStorage::open(dir.path().join("storage.json")).unwrap();

        storage.set("alpha", json!({ "n": 1 })).await.unwrap();
        assert_eq!(storage.get("alpha").unwrap()["n"], 1);

        storage.delete("alpha").await.unwrap();
        assert!(storage.get("alpha").is_none());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");

        {
            let storage = PluginStorage::open(path.clone()).unwrap();
            storage.set("kept", json!("value")).await.unwrap();
        }

        let storage = PluginStorage::open(path).unwrap();
        assert_eq!(storage.get("kept").unwrap(), "value");
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, "{{{{not json").unwrap();

        let storage = PluginStorage::open(path).unwrap();
        assert!(storage.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PluginStorage::open(dir.path().join("storage.json")).unwrap();

        storage.set("job:1", json!(1)).await.unwrap();
        storage.set("job:2", json!(2)).await.unwrap();
        storage.set("other", json!(3)).await.unwrap();

        assert_eq!(storage.list(Some("job:")), vec!["job:1", "job:2"]);
        assert_eq!(storage.list(None).len(), 3);
    }

    #[tokio::test]
    async fn test_overlapping_sets_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let storage = PluginStorage::open(path.clone()).unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.set("counter", json!(i)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // The committed file parses and holds one of the written values;
        // sequential ordering means no torn or interleaved state
        let raw = std::fs::read_to_string(&path).unwrap();
        let state: HashMap<String, Value> = serde_json::from_str(&raw).unwrap();
        assert!(state.contains_key("counter"));

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_preserves_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let storage = PluginStorage::open(path.clone()).unwrap();

        storage.set("key", json!("before")).await.unwrap();

        // Make the directory unwritable so the temp-file create fails
        let dir_path = dir.path().to_path_buf();
        let mut perms = std::fs::metadata(&dir_path).unwrap().permissions();
        let original = perms.clone();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o555);
        std::fs::set_permissions(&dir_path, perms).unwrap();

        let result = storage.set("key", json!("after")).await;
        std::fs::set_permissions(&dir_path, original).unwrap();

        if result.is_err() {
            // Cache still serves the pre-failure value
            assert_eq!(storage.get("key").unwrap(), "before");
            let raw = std::fs::read_to_string(&path).unwrap();
            assert!(raw.contains("before"));
        }
    }
}
