//! Closed set of SQL backend implementations behind one capability trait.
//!
//! Each managed datasource gets a lazily-built, bounded connection pool.
//! Pools are cached per datasource and keyed by the connection tuple plus a
//! fingerprint of the stored credential, so rotating a password abandons the
//! old pool instead of reusing stale connections.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::{DataSource, DataSourceKind};
use crate::infrastructure::config::PoolConfig;
use crate::infrastructure::vault;

pub mod mysql;
pub mod postgres;

pub use mysql::MySqlBackend;
pub use postgres::PostgresBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend parsed and rejected the statement, or it failed during
    /// execution. Carries the backend's message verbatim; never retried.
    #[error("{0}")]
    Rejected(String),
    /// The backend could not be reached or a pooled connection could not be
    /// acquired. The pool recovers transparently on the next call.
    #[error("{0}")]
    Unavailable(String),
}

pub fn map_sqlx_error(err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Database(db_err) => BackendError::Rejected(db_err.message().to_string()),
        other => BackendError::Unavailable(other.to_string()),
    }
}

/// Materialized result set: ordered column metadata plus rows as objects
/// keyed by column name, with SQL NULL preserved as JSON null. Column types
/// are the backend's native type names.
#[derive(Debug, Clone, Default)]
pub struct TableData {
    pub column_names: Vec<String>,
    pub column_types: Vec<String>,
    pub rows: Vec<serde_json::Map<String, Value>>,
}

impl TableData {
    pub fn row_count(&self) -> i64 {
        self.rows.len() as i64
    }
}

/// Capability set every supported engine provides. Backend variants are a
/// closed tagged set; adding an engine means implementing this trait and
/// extending [`build_backend`].
#[async_trait]
pub trait SqlBackend: Send + Sync {
    fn kind(&self) -> DataSourceKind;

    /// Runs a read statement and materializes rows with column metadata.
    async fn run_query(&self, sql: &str) -> Result<TableData, BackendError>;

    /// Runs a write statement outside any preview transaction. Only the
    /// migration-style internal paths use this; user writes go through
    /// [`SqlBackend::begin`].
    async fn run_write(&self, sql: &str) -> Result<u64, BackendError>;

    /// Opens a live transaction on a dedicated pooled connection.
    async fn begin(&self) -> Result<Box<dyn BackendSession>, BackendError>;

    /// On-demand health probe; returns the round-trip latency of a trivial
    /// statement.
    async fn probe(&self) -> Result<Duration, BackendError>;
}

/// A live backend transaction pinned to one connection. Dropping a session
/// without committing aborts the transaction server-side, which both
/// supported engines guarantee on disconnect.
#[async_trait]
pub trait BackendSession: Send {
    async fn execute_write(&mut self, sql: &str) -> Result<u64, BackendError>;
    async fn commit(self: Box<Self>) -> Result<(), BackendError>;
    async fn rollback(self: Box<Self>) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PoolKey {
    kind: DataSourceKind,
    host: String,
    port: u16,
    database: String,
    username: String,
    fingerprint: u64,
}

impl PoolKey {
    fn for_data_source(ds: &DataSource) -> Self {
        Self {
            kind: ds.kind,
            host: ds.host.clone(),
            port: ds.port,
            database: ds.database_name.clone(),
            username: ds.username.clone(),
            fingerprint: vault::fingerprint(&ds.ciphertext_password),
        }
    }
}

struct CachedBackend {
    key: PoolKey,
    backend: Arc<dyn SqlBackend>,
}

/// Process-wide cache of per-datasource backends.
pub struct BackendRegistry {
    pool_config: PoolConfig,
    backends: DashMap<Uuid, CachedBackend>,
}

impl BackendRegistry {
    pub fn new(pool_config: PoolConfig) -> Self {
        Self {
            pool_config,
            backends: DashMap::new(),
        }
    }

    /// Returns the cached backend for a datasource, rebuilding it when the
    /// connection tuple or credential fingerprint changed.
    pub fn acquire(
        &self,
        ds: &DataSource,
        password: &str,
    ) -> Result<Arc<dyn SqlBackend>, BackendError> {
        let key = PoolKey::for_data_source(ds);

        if let Some(cached) = self.backends.get(&ds.id) {
            if cached.key == key {
                return Ok(Arc::clone(&cached.backend));
            }
        }

        let backend = build_backend(ds, password, &self.pool_config)?;
        self.backends.insert(
            ds.id,
            CachedBackend {
                key,
                backend: Arc::clone(&backend),
            },
        );
        Ok(backend)
    }

    /// Drops the cached pool for a datasource; the next acquire rebuilds it.
    pub fn invalidate(&self, data_source_id: Uuid) {
        self.backends.remove(&data_source_id);
    }
}

fn build_backend(
    ds: &DataSource,
    password: &str,
    pool_config: &PoolConfig,
) -> Result<Arc<dyn SqlBackend>, BackendError> {
    match ds.kind {
        DataSourceKind::Postgresql => Ok(Arc::new(PostgresBackend::connect_lazy(
            ds,
            password,
            pool_config,
        ))),
        DataSourceKind::Mysql => Ok(Arc::new(MySqlBackend::connect_lazy(
            ds,
            password,
            pool_config,
        ))),
    }
}

/// Rendering shared by both engines for values that have no native JSON
/// mapping. Binary payloads surface as lowercase hex.
pub(crate) fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_data_source(password_blob: Vec<u8>) -> DataSource {
        DataSource {
            id: Uuid::new_v4(),
            name: "analytics".to_string(),
            kind: DataSourceKind::Postgresql,
            host: "localhost".to_string(),
            port: 5432,
            database_name: "analytics".to_string(),
            username: "reader".to_string(),
            ciphertext_password: password_blob,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn acquire_caches_backend_per_datasource() {
        let registry = BackendRegistry::new(PoolConfig::default());
        let ds = sample_data_source(vec![1, 2, 3]);

        let first = registry.acquire(&ds, "pw").unwrap();
        let second = registry.acquire(&ds, "pw").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn credential_rotation_rebuilds_the_pool() {
        let registry = BackendRegistry::new(PoolConfig::default());
        let mut ds = sample_data_source(vec![1, 2, 3]);

        let first = registry.acquire(&ds, "pw").unwrap();
        ds.ciphertext_password = vec![9, 9, 9];
        let second = registry.acquire(&ds, "new-pw").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn invalidate_drops_the_cached_pool() {
        let registry = BackendRegistry::new(PoolConfig::default());
        let ds = sample_data_source(vec![1, 2, 3]);

        let first = registry.acquire(&ds, "pw").unwrap();
        registry.invalidate(ds.id);
        let second = registry.acquire(&ds, "pw").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn hex_rendering_is_stable() {
        assert_eq!(hex_string(&[0x00, 0xff, 0x10]), "00ff10");
    }
}
