pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{CacheError, Result};

/// SQLite connection shared by the cache store and the offline queue.
pub struct Database {
  conn: Mutex<Connection>,
  persistent: bool,
}

impl Database {
  /// Open or create the database file at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        CacheError::StorageUnavailable(format!(
          "failed to create cache directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::StorageUnavailable(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;
    conn.pragma_update(None, "journal_mode", "WAL")?;

    let db = Self {
      conn: Mutex::new(conn),
      persistent: true,
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a database that lives only as long as this process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    let db = Self {
      conn: Mutex::new(conn),
      persistent: false,
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("dashcache").join("cache.db"))
  }

  /// Whether rows survive a restart.
  pub fn is_persistent(&self) -> bool {
    self.persistent
  }

  fn run_migrations(&self) -> Result<()> {
    self.with_conn(|conn| {
      conn.execute_batch(schema::SCHEMA)?;
      Ok(())
    })
  }

  /// Run `f` with exclusive access to the connection.
  pub fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
    let mut conn = self.conn.lock()?;
    f(&mut conn)
  }
}
