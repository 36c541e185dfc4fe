//! libSQL-backed vacation store.
//!
//! Supports a local file, an in-memory database, or a remote libSQL server.

mod migrations;
pub mod vacation;

pub use vacation::{ActiveVacation, VacationMessage};

use std::path::Path;
use std::sync::Arc;

use libsql::{Connection, Database as LibSqlDatabase};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::DatabaseError;

/// Vacation message store.
///
/// Holds a single connection reused for all lookups. `libsql::Connection`
/// is `Send + Sync` and safe for concurrent async use.
pub struct VacationStore {
    /// Owns the database `conn` was opened from; never queried directly.
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl VacationStore {
    /// Open the store named by `url`: `libsql://`, `http(s)://` for a remote
    /// server, `:memory:`, or a local file path.
    pub async fn open(url: &str, auth_token: Option<&SecretString>) -> Result<Self, DatabaseError> {
        if ["libsql://", "https://", "http://"]
            .iter()
            .any(|scheme| url.starts_with(scheme))
        {
            let token = auth_token
                .map(|token| token.expose_secret().to_string())
                .unwrap_or_default();
            Self::new_remote(url, token).await
        } else if url == ":memory:" {
            Self::new_memory().await
        } else {
            Self::new_local(Path::new(url)).await
        }
    }

    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::connect(db).await?;
        info!(path = %path.display(), "Vacation store opened");
        Ok(store)
    }

    /// Connect to a remote libSQL server.
    pub async fn new_remote(url: &str, auth_token: String) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_remote(url.to_string(), auth_token)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open remote database: {e}")))?;

        let store = Self::connect(db).await?;
        info!(url = %url, "Vacation store connected");
        Ok(store)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::connect(db).await
    }

    async fn connect(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            _db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_memory_by_url() {
        let store = VacationStore::open(":memory:", None).await.unwrap();
        let mut rows = store
            .conn()
            .query("SELECT COUNT(*) FROM vacation", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 0);
    }

    #[tokio::test]
    async fn open_local_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vacation.db");

        VacationStore::open(path.to_str().unwrap(), None).await.unwrap();
        assert!(path.exists());
    }
}
