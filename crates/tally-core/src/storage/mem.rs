use super::{ListQuery, MetadataStore, MetricsEntry, ObjectEntry, ObjectStore, Warehouse};
use crate::model::TestRun;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

/// In-memory backends for tests and local dry runs. They mirror the listing
/// and table semantics of the real services closely enough to exercise the
/// pipeline end to end.
#[derive(Default)]
pub struct MemObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    async fn list(&self, query: &ListQuery) -> anyhow::Result<Vec<ObjectEntry>> {
        let objects = self.objects.lock().unwrap();
        let mut out = Vec::new();
        if query.delimited {
            let mut prefixes = BTreeSet::new();
            for name in objects.keys() {
                let Some(rest) = name.strip_prefix(&query.prefix) else {
                    continue;
                };
                match rest.find('/') {
                    Some(i) => {
                        let prefix = format!("{}{}/", query.prefix, &rest[..i]);
                        if prefixes.insert(prefix.clone()) {
                            out.push(ObjectEntry {
                                prefix: Some(prefix),
                                ..Default::default()
                            });
                        }
                    }
                    None => out.push(ObjectEntry {
                        name: Some(name.clone()),
                        ..Default::default()
                    }),
                }
            }
        } else {
            for name in objects.keys() {
                if name.starts_with(&query.prefix) {
                    out.push(ObjectEntry {
                        name: Some(name.clone()),
                        ..Default::default()
                    });
                }
            }
        }
        Ok(out)
    }

    async fn get(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such object: {name}"))
    }

    async fn put(&self, name: &str, data: &[u8]) -> anyhow::Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemMetadataStore {
    runs: Mutex<Vec<TestRun>>,
    entries: Mutex<Vec<MetricsEntry>>,
}

impl MemMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runs(runs: Vec<TestRun>) -> Self {
        Self {
            runs: Mutex::new(runs),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<MetricsEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataStore for MemMetadataStore {
    async fn distinct_revisions(&self) -> anyhow::Result<Vec<String>> {
        let runs = self.runs.lock().unwrap();
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for run in runs.iter() {
            if seen.insert(run.revision.clone()) {
                out.push(run.revision.clone());
            }
        }
        Ok(out)
    }

    async fn run_count(&self) -> anyhow::Result<u64> {
        Ok(self.runs.lock().unwrap().len() as u64)
    }

    async fn created_at_for_revision(
        &self,
        revision: &str,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.revision == revision)
            .map(|r| r.created_at))
    }

    async fn record_metrics_entry(&self, entry: &MetricsEntry) -> anyhow::Result<()> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemWarehouse {
    tables: Mutex<HashMap<String, Vec<serde_json::Value>>>,
}

impl MemWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(dataset: &str, table: &str) -> String {
        format!("{dataset}.{table}")
    }

    pub fn rows(&self, dataset: &str, table: &str) -> Vec<serde_json::Value> {
        self.tables
            .lock()
            .unwrap()
            .get(&Self::key(dataset, table))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Warehouse for MemWarehouse {
    async fn ensure_table(&self, dataset: &str, table: &str) -> anyhow::Result<()> {
        self.tables
            .lock()
            .unwrap()
            .entry(Self::key(dataset, table))
            .or_default();
        Ok(())
    }

    async fn insert_rows(
        &self,
        dataset: &str,
        table: &str,
        rows: &[serde_json::Value],
    ) -> anyhow::Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let slot = tables
            .get_mut(&Self::key(dataset, table))
            .ok_or_else(|| anyhow::anyhow!("table {dataset}.{table} does not exist"))?;
        slot.extend(rows.iter().cloned());
        Ok(())
    }
}
