use super::{MetadataStore, MetricsEntry, Warehouse};
use crate::model::TestRun;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

const METADATA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS test_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    browser_name TEXT NOT NULL,
    browser_version TEXT NOT NULL,
    os_name TEXT NOT NULL,
    os_version TEXT NOT NULL,
    revision TEXT NOT NULL,
    results_url TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_test_runs_revision ON test_runs(revision);

CREATE TABLE IF NOT EXISTS metrics_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    metric_name TEXT NOT NULL,
    object_path TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    run_count INTEGER NOT NULL
);
"#;

/// Metadata store on SQLite. The production system talks to a managed
/// document store; the surface here is the subset the pipeline touches.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("failed to open metadata db")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory metadata db")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(METADATA_DDL)?;
        Ok(())
    }

    pub fn insert_run(&self, run: &TestRun) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO test_runs
             (browser_name, browser_version, os_name, os_version, revision, results_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.browser_name,
                run.browser_version,
                run.os_name,
                run.os_version,
                run.revision,
                run.results_url,
                run.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn distinct_revisions(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT revision FROM test_runs GROUP BY revision ORDER BY MIN(id)")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn run_count(&self) -> anyhow::Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT count(*) FROM test_runs", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    async fn created_at_for_revision(
        &self,
        revision: &str,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT created_at FROM test_runs WHERE revision = ?1 ORDER BY id LIMIT 1",
        )?;
        let mut rows = stmt.query(params![revision])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                let parsed = DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("bad created_at for revision {revision}"))?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    async fn record_metrics_entry(&self, entry: &MetricsEntry) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO metrics_entries
             (metric_name, object_path, start_time, end_time, run_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.metric_name,
                entry.object_path,
                entry.start_time.to_rfc3339(),
                entry.end_time.to_rfc3339(),
                entry.run_count as i64,
            ],
        )?;
        Ok(())
    }
}

/// Warehouse stand-in on SQLite: one table per (dataset, table) pair, rows
/// stored as serialized records. Good enough for append-and-count queries.
#[derive(Clone)]
pub struct SqliteWarehouse {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWarehouse {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("failed to open warehouse db")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory warehouse db")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn table_name(dataset: &str, table: &str) -> String {
        // SQLite identifiers cannot carry the dataset/table split.
        format!("{dataset}__{table}")
    }

    pub fn row_count(&self, dataset: &str, table: &str) -> anyhow::Result<u64> {
        let conn = self.conn.lock().unwrap();
        let name = Self::table_name(dataset, table);
        let count: i64 =
            conn.query_row(&format!("SELECT count(*) FROM \"{name}\""), [], |r| r.get(0))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn ensure_table(&self, dataset: &str, table: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let name = Self::table_name(dataset, table);
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{name}\"
                 (id INTEGER PRIMARY KEY AUTOINCREMENT, row TEXT NOT NULL)"
            ),
            [],
        )?;
        Ok(())
    }

    async fn insert_rows(
        &self,
        dataset: &str,
        table: &str,
        rows: &[serde_json::Value],
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let name = Self::table_name(dataset, table);
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!("INSERT INTO \"{name}\" (row) VALUES (?1)"))?;
            for row in rows {
                stmt.execute(params![serde_json::to_string(row)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
