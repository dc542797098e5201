use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod fs;
pub mod mem;
pub mod sqlite;

/// One entry from a blob-storage listing. Delimited listings report
/// "directories" as prefixes (trailing slash) and objects as names, the way
/// cloud object stores do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectEntry {
    pub name: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListQuery {
    pub prefix: String,
    /// When set, the listing stops at the next `/` and reports prefixes
    /// instead of recursing.
    pub delimited: bool,
}

impl ListQuery {
    pub fn recursive(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            delimited: false,
        }
    }

    pub fn delimited(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            delimited: true,
        }
    }
}

/// Blob storage as the pipeline sees it: list by prefix, read and write
/// whole objects. The real SDK is an external collaborator; backends here
/// are filesystem and in-memory stand-ins with the same surface.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, query: &ListQuery) -> anyhow::Result<Vec<ObjectEntry>>;
    async fn get(&self, name: &str) -> anyhow::Result<Vec<u8>>;
    async fn put(&self, name: &str, data: &[u8]) -> anyhow::Result<()>;
}

/// Lightweight record pointing a metrics window at the object holding its
/// serialized payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsEntry {
    pub metric_name: String,
    pub object_path: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub run_count: u64,
}

/// Metadata store operations used by reconciliation and by the outputters.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Distinct revisions across all recorded runs, insertion order.
    async fn distinct_revisions(&self) -> anyhow::Result<Vec<String>>;
    async fn run_count(&self) -> anyhow::Result<u64>;
    async fn created_at_for_revision(
        &self,
        revision: &str,
    ) -> anyhow::Result<Option<DateTime<Utc>>>;
    async fn record_metrics_entry(&self, entry: &MetricsEntry) -> anyhow::Result<()>;
}

/// Columnar warehouse surface: tables are created on demand and rows are
/// appended as row-shaped records.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn ensure_table(&self, dataset: &str, table: &str) -> anyhow::Result<()>;
    async fn insert_rows(
        &self,
        dataset: &str,
        table: &str,
        rows: &[serde_json::Value],
    ) -> anyhow::Result<()>;
}
