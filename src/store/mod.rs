//! Typed client for the shared metadata store.
//!
//! Every processing node reads and writes job records in one external
//! key-value store, keyed by request id. The store is the only
//! synchronization point between nodes: any node can resolve a job's owner
//! and status from it without node-to-node discovery.
//!
//! # Components
//!
//! - [`JobRecord`] / [`JobStatus`]: the tagged record replacing the loose
//!   string map the store actually holds (validated at the serde boundary)
//! - [`MetadataStore`]: the access seam (`get`, `put`, `put_new`)
//! - [`RedisStore`]: production implementation over a Redis connection
//! - [`MemoryStore`]: in-process implementation for tests and local demos
//!
//! # Consistency
//!
//! Per-key read/write only, no transactions. After creation a record is
//! mutated exclusively by its owner node (handle assignment, status flip),
//! so the read-modify-write here is last-write-wins by design.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::{ImgflowError, Result};

/// Lifecycle of a job as persisted in the store.
///
/// `Processing -> Done`, or an early terminal `Error`; no job regresses.
/// The wire-level `redirect` state never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Done,
    Error,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

/// One resize job as tracked in the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub request_id: String,
    pub status: JobStatus,
    /// Node that accepted the upload; immutable after the first write.
    /// This is what makes redirect resolution correct on every node.
    pub owner_address: String,
    pub owner_port: u16,
    /// Volume-relative, e.g. "input/in-<id>.png"
    pub input_path: String,
    /// Volume-relative, e.g. "output/out-<id>.png"
    pub output_path: String,
    /// Opaque container reference, present once processing was launched
    pub sandbox_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Human-readable detail for terminal errors
    pub message: Option<String>,
}

impl JobRecord {
    pub fn new(
        request_id: String,
        owner_address: String,
        owner_port: u16,
        input_path: String,
        output_path: String,
    ) -> Self {
        Self {
            request_id,
            status: JobStatus::Processing,
            owner_address,
            owner_port,
            input_path,
            output_path,
            sandbox_handle: None,
            created_at: Utc::now(),
            message: None,
        }
    }

    /// True when `address:port` is the node this record belongs to.
    pub fn is_owned_by(&self, address: &str, port: u16) -> bool {
        self.owner_address == address && self.owner_port == port
    }
}

/// Access seam over the external key-value store.
///
/// `put_new` is create-if-absent: it returns `false` instead of silently
/// overwriting when the key already exists, so request-id collisions fail
/// loudly at the caller.
#[tonic::async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, request_id: &str) -> Result<Option<JobRecord>>;
    async fn put(&self, record: &JobRecord) -> Result<()>;
    async fn put_new(&self, record: &JobRecord) -> Result<bool>;
}

/// Redis-backed store; records are stored as JSON under their request id.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to the store at `host:port` and hold a reconnecting
    /// connection manager for the life of the node.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let url = format!("redis://{}:{}/", host, port);
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn encode(record: &JobRecord) -> Result<String> {
        serde_json::to_string(record)
            .map_err(|e| ImgflowError::Store(format!("serialize job record: {}", e)))
    }

    fn decode(request_id: &str, raw: &str) -> Option<JobRecord> {
        match serde_json::from_str(raw) {
            Ok(record) => Some(record),
            Err(e) => {
                // Malformed in-store records are logged, not propagated
                tracing::warn!(request_id, error = %e, "Malformed job record in store");
                None
            }
        }
    }
}

#[tonic::async_trait]
impl MetadataStore for RedisStore {
    async fn get(&self, request_id: &str) -> Result<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(request_id).await?;
        Ok(raw.and_then(|raw| Self::decode(request_id, &raw)))
    }

    async fn put(&self, record: &JobRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = Self::encode(record)?;
        conn.set::<_, _, ()>(&record.request_id, raw).await?;
        Ok(())
    }

    async fn put_new(&self, record: &JobRecord) -> Result<bool> {
        let mut conn = self.conn.clone();
        let raw = Self::encode(record)?;
        let created: bool = conn.set_nx(&record.request_id, raw).await?;
        Ok(created)
    }
}

/// In-process store used by tests and single-process demos.
///
/// Shares the [`MetadataStore`] contract with [`RedisStore`], including
/// create-if-absent semantics, so node code is exercised unchanged.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, JobRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[tonic::async_trait]
impl MetadataStore for MemoryStore {
    async fn get(&self, request_id: &str) -> Result<Option<JobRecord>> {
        let records = self.records.lock().expect("store lock poisoned");
        Ok(records.get(request_id).cloned())
    }

    async fn put(&self, record: &JobRecord) -> Result<()> {
        let mut records = self.records.lock().expect("store lock poisoned");
        records.insert(record.request_id.clone(), record.clone());
        Ok(())
    }

    async fn put_new(&self, record: &JobRecord) -> Result<bool> {
        let mut records = self.records.lock().expect("store lock poisoned");
        if records.contains_key(&record.request_id) {
            return Ok(false);
        }
        records.insert(record.request_id.clone(), record.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> JobRecord {
        JobRecord::new(
            id.to_string(),
            "127.0.0.1".to_string(),
            50052,
            format!("input/in-{}.png", id),
            format!("output/out-{}.png", id),
        )
    }

    #[test]
    fn new_record_starts_processing() {
        let rec = record("abc");
        assert_eq!(rec.status, JobStatus::Processing);
        assert!(rec.sandbox_handle.is_none());
        assert!(rec.message.is_none());
    }

    #[test]
    fn ownership_check_matches_address_and_port() {
        let rec = record("abc");
        assert!(rec.is_owned_by("127.0.0.1", 50052));
        assert!(!rec.is_owned_by("127.0.0.1", 50053));
        assert!(!rec.is_owned_by("10.0.0.1", 50052));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        let json = serde_json::to_string(&JobStatus::Done).unwrap();
        assert_eq!(json, "\"done\"");
    }

    #[test]
    fn record_roundtrips_through_json() {
        let mut rec = record("abc");
        rec.sandbox_handle = Some("cafebabe".to_string());
        let json = serde_json::to_string(&rec).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[tokio::test]
    async fn memory_store_get_put() {
        let store = MemoryStore::new();
        assert!(store.get("abc").await.unwrap().is_none());

        let rec = record("abc");
        store.put(&rec).await.unwrap();
        assert_eq!(store.get("abc").await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn memory_store_put_new_refuses_existing_key() {
        let store = MemoryStore::new();
        let rec = record("abc");
        assert!(store.put_new(&rec).await.unwrap());
        assert!(!store.put_new(&rec).await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_put_overwrites() {
        let store = MemoryStore::new();
        let mut rec = record("abc");
        store.put(&rec).await.unwrap();

        rec.status = JobStatus::Done;
        store.put(&rec).await.unwrap();
        assert_eq!(store.get("abc").await.unwrap().unwrap().status, JobStatus::Done);
    }
}
