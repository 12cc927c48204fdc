//! SQLite persistence shared by the document store and the job queue.
//!
//! A `Database` wraps one rusqlite connection behind a `Mutex`; clones share
//! the connection. Async callers hop onto the blocking pool through
//! [`blocking`] before touching it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::Connection;

pub mod document_repo;
pub mod error;
pub mod job_repo;
pub mod migrations;

pub use error::DatabaseError;

/// How long SQLite waits on a locked database file before giving up.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe database handle. Cloning is cheap.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    deadline: Option<Instant>,
}

impl Database {
    /// Opens (or creates) the database at `path` and applies pending migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`Database::open`], with an explicit lock wait. The queue uses its
    /// operation timeout here so a wedged writer surfaces as an error instead
    /// of a hang.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        log::info!("Database opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            deadline: None,
        })
    }

    /// Opens an in-memory database with all migrations applied.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            deadline: None,
        })
    }

    /// A handle on the same connection whose transactions refuse to start
    /// after `deadline`.
    ///
    /// The check happens once the write lock is held, so a caller that has
    /// already given up on the operation never sees it commit later.
    pub fn until(&self, deadline: Instant) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            deadline: Some(deadline),
        }
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }

    /// Runs `f` inside an immediate transaction, committing on `Ok`.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front, so read-then-write
    /// sequences (reserve a job, dedupe a submit) cannot interleave across
    /// processes sharing the file.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(DatabaseError::DeadlineExceeded {
                    late_by: now - deadline,
                });
            }
        }
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Runs a store call on tokio's blocking pool.
///
/// Every `Database` clone shares one connection lock, and the queue may hold
/// it for up to its operation timeout; async code must not wait on it from a
/// runtime worker thread.
pub async fn blocking<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<DatabaseError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(DatabaseError::Interrupted(e.to_string()).into()),
    }
}

/// Returns the default database path: `~/.unbound/data/unbound.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".unbound").join("data").join("unbound.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let count: u32 =
                conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))?;
            assert!(count > 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_open_file_db_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("unbound.db");
        let db = Database::open(&path).unwrap();
        db.with_conn(|conn| {
            let count: u32 =
                conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))?;
            assert!(count > 0);
            Ok(())
        })
        .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_expired_deadline_rolls_back_without_writing() {
        let db = Database::open_in_memory().unwrap();
        let late = db.until(Instant::now());

        let result = late.with_tx(|tx| {
            tx.execute("CREATE TABLE should_not_exist (id INTEGER)", [])?;
            Ok(())
        });
        assert!(matches!(result, Err(DatabaseError::DeadlineExceeded { .. })));

        let exists: bool = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE name = 'should_not_exist'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert!(!exists);

        // The original handle carries no deadline.
        db.with_tx(|_| Ok(())).unwrap();
    }

    #[test]
    fn test_future_deadline_allows_commit() {
        let db = Database::open_in_memory().unwrap();
        let timely = db.until(Instant::now() + Duration::from_secs(60));
        timely.with_tx(|_| Ok(())).unwrap();
    }

    #[test]
    fn test_default_database_path() {
        let path = default_database_path().unwrap();
        assert!(path.ends_with("unbound.db"));
        assert!(path.to_string_lossy().contains(".unbound"));
    }

    #[test]
    fn test_clones_share_connection() {
        let db = Database::open_in_memory().unwrap();
        let db2 = db.clone();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO documents (id, owner_id, title, source_location, created_at, updated_at)
                 VALUES ('d1', 'u1', 'Bio 101', 'file://bio101.pdf', '2026-01-01T00:00:00.000Z', '2026-01-01T00:00:00.000Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        db2.with_conn(|conn| {
            let count: u32 =
                conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))?;
            assert_eq!(count, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_with_tx_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<(), DatabaseError> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO documents (id, owner_id, title, source_location, created_at, updated_at)
                 VALUES ('d1', 'u1', 't', 's', '2026-01-01T00:00:00.000Z', '2026-01-01T00:00:00.000Z')",
                [],
            )?;
            Err(DatabaseError::LockPoisoned)
        });
        assert!(result.is_err());

        let count: u32 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
