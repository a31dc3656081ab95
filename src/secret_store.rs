//! Persistent mapping from macaroon-identifier hash to root secret, and from
//! payment hash to settlement timestamp.
//!
//! Two backends share the same [`SecretStore`] contract: [`SledSecretStore`]
//! (embedded, default, `sled` plus a compact MessagePack record encoding)
//! and [`PostgresSecretStore`] (relational, following `aperturedb/postgres.go`).
//! Both retry their underlying transaction on a reported serialization
//! conflict up to [`MAX_TX_RETRIES`] times.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use tracing::{debug, info, warn};

use crate::error::SecretStoreError;

/// Size, in bytes, of a macaroon root secret.
pub const SECRET_SIZE: usize = 64;

/// Bound on retrying a transaction after a reported serialization conflict.
pub const MAX_TX_RETRIES: u32 = 5;

// serde's built-in array support only covers lengths up to 32; a 64-byte
// secret needs `serde_big_array::BigArray` to (de)serialize through
// `rmp_serde`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id_hash: [u8; 32],
    pub payment_hash: [u8; 32],
    #[serde(with = "BigArray")]
    pub secret: [u8; SECRET_SIZE],
    pub created_at: i64,
    pub settled_at: Option<i64>,
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// Transactional key-value contract a `SecretStore` backend must satisfy.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn insert_secret(
        &self,
        id_hash: [u8; 32],
        payment_hash: [u8; 32],
        secret: [u8; SECRET_SIZE],
        created_at: i64,
    ) -> Result<(), SecretStoreError>;

    async fn get_secret(&self, id_hash: [u8; 32]) -> Result<[u8; SECRET_SIZE], SecretStoreError>;

    /// Idempotent: applies to all rows matching `payment_hash`.
    async fn set_settled_at(&self, payment_hash: [u8; 32], settled_at: i64) -> Result<(), SecretStoreError>;

    async fn get_settled_at(&self, payment_hash: [u8; 32]) -> Result<Option<i64>, SecretStoreError>;

    async fn get_created_at(&self, id_hash: [u8; 32]) -> Result<i64, SecretStoreError>;

    /// Returns rows affected (expected 0 or 1).
    async fn delete(&self, id_hash: [u8; 32]) -> Result<u64, SecretStoreError>;
}

/// Embedded KV backend, default. Stores each [`SecretRecord`] as a compact
/// MessagePack-encoded value keyed by `id_hash` in a `sled` tree.
pub struct SledSecretStore {
    db: sled::Db,
}

impl SledSecretStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, SecretStoreError> {
        let db = sled::open(path).map_err(|e| SecretStoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }

    fn key(id_hash: &[u8; 32]) -> Vec<u8> {
        let mut k = b"l402/secrets/".to_vec();
        k.extend_from_slice(id_hash);
        k
    }

    fn load(&self, id_hash: &[u8; 32]) -> Result<Option<SecretRecord>, SecretStoreError> {
        let raw = self
            .db
            .get(Self::key(id_hash))
            .map_err(|e| SecretStoreError::Backend(e.to_string()))?;
        match raw {
            Some(bytes) => {
                let record: SecretRecord =
                    rmp_serde::from_slice(&bytes).map_err(|e| SecretStoreError::Backend(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn store(&self, record: &SecretRecord) -> Result<(), SecretStoreError> {
        let bytes = rmp_serde::to_vec_named(record).map_err(|e| SecretStoreError::Backend(e.to_string()))?;
        self.db
            .insert(Self::key(&record.id_hash), bytes)
            .map_err(|e| SecretStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Payment hash is not a primary key, so a settle sweeps every record
    /// whose payment hash matches (re-mints are possible per the data model).
    fn records_by_payment_hash(&self, payment_hash: &[u8; 32]) -> Result<Vec<SecretRecord>, SecretStoreError> {
        let prefix = b"l402/secrets/".to_vec();
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (_, bytes) = item.map_err(|e| SecretStoreError::Backend(e.to_string()))?;
            let record: SecretRecord =
                rmp_serde::from_slice(&bytes).map_err(|e| SecretStoreError::Backend(e.to_string()))?;
            if record.payment_hash == *payment_hash {
                out.push(record);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl SecretStore for SledSecretStore {
    async fn insert_secret(
        &self,
        id_hash: [u8; 32],
        payment_hash: [u8; 32],
        secret: [u8; SECRET_SIZE],
        created_at: i64,
    ) -> Result<(), SecretStoreError> {
        if self.load(&id_hash)?.is_some() {
            return Err(SecretStoreError::Duplicate);
        }
        let record = SecretRecord {
            id_hash,
            payment_hash,
            secret,
            created_at,
            settled_at: None,
        };
        debug!(id_hash = %hex::encode(id_hash), "inserting secret record");
        self.store(&record)
    }

    async fn get_secret(&self, id_hash: [u8; 32]) -> Result<[u8; SECRET_SIZE], SecretStoreError> {
        self.load(&id_hash)?.map(|r| r.secret).ok_or(SecretStoreError::NotFound)
    }

    async fn set_settled_at(&self, payment_hash: [u8; 32], settled_at: i64) -> Result<(), SecretStoreError> {
        let records = self.records_by_payment_hash(&payment_hash)?;
        for mut record in records {
            record.settled_at = Some(settled_at);
            self.store(&record)?;
        }
        Ok(())
    }

    async fn get_settled_at(&self, payment_hash: [u8; 32]) -> Result<Option<i64>, SecretStoreError> {
        let records = self.records_by_payment_hash(&payment_hash)?;
        // Treat the first settled occurrence as canonical, per the data
        // model's invariant on re-mints sharing a payment hash.
        Ok(records.into_iter().find_map(|r| r.settled_at))
    }

    async fn get_created_at(&self, id_hash: [u8; 32]) -> Result<i64, SecretStoreError> {
        self.load(&id_hash)?.map(|r| r.created_at).ok_or(SecretStoreError::NotFound)
    }

    async fn delete(&self, id_hash: [u8; 32]) -> Result<u64, SecretStoreError> {
        let existed = self
            .db
            .remove(Self::key(&id_hash))
            .map_err(|e| SecretStoreError::Backend(e.to_string()))?
            .is_some();
        let affected = if existed { 1 } else { 0 };
        if affected > 1 {
            warn!(id_hash = %hex::encode(id_hash), affected, "unexpected delete row count");
        }
        Ok(affected)
    }
}

/// Relational backend for the `HOST`/`PORT`/`USER`/`PASSWORD`/`DBNAME`/
/// `REQUIRESSL` deployment configuration, following
/// `aperturedb/postgres.go`'s schema.
pub struct PostgresSecretStore {
    pool: sqlx::PgPool,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub require_ssl: bool,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn dsn(&self) -> String {
        let ssl = if self.require_ssl { "require" } else { "disable" };
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.dbname, ssl
        )
    }
}

impl PostgresSecretStore {
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self, SecretStoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(&cfg.dsn())
            .await
            .map_err(|e| SecretStoreError::Backend(e.to_string()))?;
        info!("connected to postgres secret store");
        Ok(Self { pool })
    }

    async fn run_retrying<T, F, Fut>(&self, mut op: F) -> Result<T, SecretStoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if is_serialization_conflict(&e) && attempt < MAX_TX_RETRIES => {
                    attempt += 1;
                    warn!(attempt, "retrying after serialization conflict");
                    continue;
                }
                Err(e) if is_serialization_conflict(&e) => return Err(SecretStoreError::RetriesExhausted),
                Err(e) => return Err(SecretStoreError::Backend(e.to_string())),
            }
        }
    }
}

fn is_serialization_conflict(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("40001"))
}

#[async_trait]
impl SecretStore for PostgresSecretStore {
    async fn insert_secret(
        &self,
        id_hash: [u8; 32],
        payment_hash: [u8; 32],
        secret: [u8; SECRET_SIZE],
        created_at: i64,
    ) -> Result<(), SecretStoreError> {
        self.run_retrying(|| {
            let pool = &self.pool;
            async move {
                sqlx::query(
                    "INSERT INTO secrets (macaroon_id_hash, payment_hash, secret, created_at) \
                     VALUES ($1, $2, $3, to_timestamp($4))",
                )
                .bind(&id_hash[..])
                .bind(&payment_hash[..])
                .bind(&secret[..])
                .bind(created_at as f64)
                .execute(pool)
                .await
                .map(|_| ())
            }
        })
        .await
        .map_err(|e| match e {
            SecretStoreError::Backend(msg) if msg.contains("duplicate key") => SecretStoreError::Duplicate,
            other => other,
        })
    }

    async fn get_secret(&self, id_hash: [u8; 32]) -> Result<[u8; SECRET_SIZE], SecretStoreError> {
        let row: Option<(Vec<u8>,)> = self
            .run_retrying(|| {
                let pool = &self.pool;
                let id_hash = id_hash;
                async move {
                    sqlx::query_as("SELECT secret FROM secrets WHERE macaroon_id_hash = $1")
                        .bind(&id_hash[..])
                        .fetch_optional(pool)
                        .await
                }
            })
            .await?;

        let (bytes,) = row.ok_or(SecretStoreError::NotFound)?;
        bytes
            .try_into()
            .map_err(|_| SecretStoreError::Backend("secret column wrong length".into()))
    }

    async fn set_settled_at(&self, payment_hash: [u8; 32], settled_at: i64) -> Result<(), SecretStoreError> {
        self.run_retrying(|| {
            let pool = &self.pool;
            async move {
                sqlx::query("UPDATE secrets SET settled_at = to_timestamp($2) WHERE payment_hash = $1")
                    .bind(&payment_hash[..])
                    .bind(settled_at as f64)
                    .execute(pool)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    async fn get_settled_at(&self, payment_hash: [u8; 32]) -> Result<Option<i64>, SecretStoreError> {
        let row: Option<(Option<f64>,)> = self
            .run_retrying(|| {
                let pool = &self.pool;
                async move {
                    sqlx::query_as(
                        "SELECT EXTRACT(EPOCH FROM settled_at) FROM secrets \
                         WHERE payment_hash = $1 AND settled_at IS NOT NULL \
                         ORDER BY created_at ASC LIMIT 1",
                    )
                    .bind(&payment_hash[..])
                    .fetch_optional(pool)
                    .await
                }
            })
            .await?;

        Ok(row.and_then(|(v,)| v).map(|v| v as i64))
    }

    async fn get_created_at(&self, id_hash: [u8; 32]) -> Result<i64, SecretStoreError> {
        let row: Option<(f64,)> = self
            .run_retrying(|| {
                let pool = &self.pool;
                async move {
                    sqlx::query_as("SELECT EXTRACT(EPOCH FROM created_at) FROM secrets WHERE macaroon_id_hash = $1")
                        .bind(&id_hash[..])
                        .fetch_optional(pool)
                        .await
                }
            })
            .await?;
        row.map(|(v,)| v as i64).ok_or(SecretStoreError::NotFound)
    }

    async fn delete(&self, id_hash: [u8; 32]) -> Result<u64, SecretStoreError> {
        let result = self
            .run_retrying(|| {
                let pool = &self.pool;
                async move {
                    sqlx::query("DELETE FROM secrets WHERE macaroon_id_hash = $1")
                        .bind(&id_hash[..])
                        .execute(pool)
                        .await
                }
            })
            .await?;

        let affected = result.rows_affected();
        if affected > 1 {
            warn!(id_hash = %hex::encode(id_hash), affected, "unexpected delete row count");
        }
        Ok(affected)
    }
}

/// Shared handle alias used throughout the crate.
pub type SharedSecretStore = Arc<dyn SecretStore>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (SledSecretStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledSecretStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let (store, _dir) = store().await;
        let id_hash = [1u8; 32];
        let payment_hash = [2u8; 32];
        let secret = [3u8; SECRET_SIZE];

        store.insert_secret(id_hash, payment_hash, secret, 1_000).await.unwrap();
        assert_eq!(store.get_secret(id_hash).await.unwrap(), secret);
        assert_eq!(store.get_created_at(id_hash).await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn duplicate_insert_errors() {
        let (store, _dir) = store().await;
        let id_hash = [1u8; 32];
        store.insert_secret(id_hash, [0u8; 32], [0u8; SECRET_SIZE], 0).await.unwrap();
        let err = store.insert_secret(id_hash, [0u8; 32], [0u8; SECRET_SIZE], 0).await;
        assert!(matches!(err, Err(SecretStoreError::Duplicate)));
    }

    #[tokio::test]
    async fn get_missing_secret_not_found() {
        let (store, _dir) = store().await;
        let err = store.get_secret([9u8; 32]).await;
        assert!(matches!(err, Err(SecretStoreError::NotFound)));
    }

    #[tokio::test]
    async fn set_settled_at_is_idempotent_and_scoped_by_payment_hash() {
        let (store, _dir) = store().await;
        let payment_hash = [7u8; 32];
        store.insert_secret([1u8; 32], payment_hash, [0u8; SECRET_SIZE], 0).await.unwrap();
        store.insert_secret([2u8; 32], payment_hash, [0u8; SECRET_SIZE], 0).await.unwrap();

        store.set_settled_at(payment_hash, 500).await.unwrap();
        store.set_settled_at(payment_hash, 500).await.unwrap();

        assert_eq!(store.get_settled_at(payment_hash).await.unwrap(), Some(500));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let (store, _dir) = store().await;
        let id_hash = [1u8; 32];
        store.insert_secret(id_hash, [0u8; 32], [0u8; SECRET_SIZE], 0).await.unwrap();
        assert_eq!(store.delete(id_hash).await.unwrap(), 1);
        assert!(matches!(store.get_secret(id_hash).await, Err(SecretStoreError::NotFound)));
    }
}
