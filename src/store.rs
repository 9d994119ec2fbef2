use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::oneshot;

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                error!("Failed to send shutdown to storage thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join storage thread: {join_err:?}");
            }
        }
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
             key TEXT PRIMARY KEY,
             value TEXT NOT NULL,
             updated_at TEXT NOT NULL
         );",
    )
    .context("failed to create storage schema")
}

/// Key-value storage for survey data, JSON strings under well-known keys.
/// All SQLite access happens on one dedicated worker thread; async callers
/// hand closures over and await the reply.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
    db_path: Arc<Option<PathBuf>>,
}

impl Store {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create storage directory {}", parent.display())
                })?;
            }
        }

        let path_for_thread = db_path.clone();
        let store = Self::spawn(move || Connection::open(&path_for_thread), Some(db_path))?;
        Ok(store)
    }

    /// Ephemeral store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::spawn(Connection::open_in_memory, None)
    }

    fn spawn(
        open_conn: impl FnOnce() -> rusqlite::Result<Connection> + Send + 'static,
        db_path: Option<PathBuf>,
    ) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("rawangphai-store".into())
            .spawn(move || {
                let mut conn = match open_conn() {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite storage")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                let init_result = init_schema(&conn);
                if ready_tx.send(init_result).is_err() {
                    error!("Storage initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        StoreCommand::Shutdown => break,
                    }
                }

                info!("Storage thread shutting down");
            })
            .with_context(|| "failed to spawn storage worker thread")?;

        ready_rx
            .recv()
            .context("storage worker exited before signaling readiness")??;

        match &db_path {
            Some(path) => info!("Storage initialized at {}", path.display()),
            None => info!("In-memory storage initialized"),
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Storage caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to storage thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("storage thread terminated unexpectedly"))?
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.execute(move |conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read key '{key}'"))
        })
        .await
    }

    pub async fn set(&self, key: &str, value: String) -> Result<()> {
        let key = key.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("failed to write key '{key}'"))?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.execute(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .with_context(|| format!("failed to delete key '{key}'"))?;
            Ok(())
        })
        .await
    }

    /// Typed read. A value that no longer parses is treated as absent so
    /// one corrupt row cannot brick startup; the problem is logged.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    warn!("stored value under '{key}' is unreadable, ignoring it: {err}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)
            .with_context(|| format!("failed to serialize value for key '{key}'"))?;
        self.set(key, raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn round_trips_and_overwrites() {
        let store = Store::open_in_memory().unwrap();

        store.set("greeting", "hello".to_string()).await.unwrap();
        assert_eq!(store.get("greeting").await.unwrap(), Some("hello".to_string()));

        store.set("greeting", "sawasdee".to_string()).await.unwrap();
        assert_eq!(store.get("greeting").await.unwrap(), Some("sawasdee".to_string()));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = Store::open_in_memory().unwrap();

        store.set("key", "value".to_string()).await.unwrap();
        store.delete("key").await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), None);

        // Deleting again must not fail.
        store.delete("key").await.unwrap();
    }

    #[tokio::test]
    async fn typed_values_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let doc = Doc {
            name: "point1Data".to_string(),
            count: 3,
        };

        store.set_json("doc", &doc).await.unwrap();
        assert_eq!(store.get_json::<Doc>("doc").await.unwrap(), Some(doc));
        assert_eq!(store.get_json::<Doc>("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_values_read_as_absent() {
        let store = Store::open_in_memory().unwrap();

        store.set("doc", "not json at all".to_string()).await.unwrap();
        assert_eq!(store.get_json::<Doc>("doc").await.unwrap(), None);
    }
}
