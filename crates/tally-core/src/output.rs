use crate::model::MetricsRun;
use crate::net::NetGate;
use crate::storage::{MetadataStore, MetricsEntry, ObjectStore, Warehouse};
use anyhow::Context;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;

/// Destination coordinates for one metric: where the window metadata goes
/// and where the payload/rows go.
#[derive(Debug, Clone, Default)]
pub struct OutputLocation {
    pub object_path: Option<String>,
    pub dataset: Option<String>,
    pub table: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OutputId {
    pub metric_name: String,
    pub metadata: OutputLocation,
    pub data: OutputLocation,
}

/// Serialized shape of an uploaded metric: the window it was computed over
/// plus the metric data itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsPayload<T> {
    pub metrics_run: MetricsRun,
    pub data: T,
}

/// Gzip + JSON encoding used for metric objects.
pub fn encode_payload<T: Serialize>(payload: &MetricsPayload<T>) -> anyhow::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut enc, payload).context("serializing metric payload")?;
    enc.finish().context("compressing metric payload")
}

pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> anyhow::Result<MetricsPayload<T>> {
    let mut buf = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut buf)
        .context("decompressing metric payload")?;
    serde_json::from_slice(&buf).context("deserializing metric payload")
}

/// Capability contract for persisting one computed metric plus its window.
/// Every configured outputter receives every metric independently; a failure
/// in one never blocks the others.
#[async_trait]
pub trait Outputter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write(
        &self,
        id: &OutputId,
        window: &MetricsRun,
        payload: &serde_json::Value,
        rows: &[serde_json::Value],
    ) -> anyhow::Result<()>;
}

/// Combined writer: gzip-compressed payload to blob storage at a
/// deterministic window-keyed path, plus a metadata entry pointing at that
/// object.
pub struct BlobMetadataOutputter {
    pub gate: NetGate,
    pub objects: Arc<dyn ObjectStore>,
    pub metadata: Arc<dyn MetadataStore>,
}

#[async_trait]
impl Outputter for BlobMetadataOutputter {
    fn name(&self) -> &'static str {
        "blob+metadata"
    }

    async fn write(
        &self,
        id: &OutputId,
        window: &MetricsRun,
        payload: &serde_json::Value,
        _rows: &[serde_json::Value],
    ) -> anyhow::Result<()> {
        let object_path = id
            .data
            .object_path
            .as_deref()
            .with_context(|| format!("no object path for metric {}", id.metric_name))?;

        let body = encode_payload(&MetricsPayload {
            metrics_run: window.clone(),
            data: payload.clone(),
        })?;
        tracing::info!(object = object_path, bytes = body.len(), "writing metric object");
        self.gate
            .with(self.objects.put(object_path, &body))
            .await
            .and_then(|r| r)
            .with_context(|| format!("writing {object_path}"))?;

        // The entry is recorded only once the object exists; an entry for a
        // failed write would point readers at nothing.
        let entry = MetricsEntry {
            metric_name: id.metric_name.clone(),
            object_path: object_path.to_string(),
            start_time: window.start_time,
            end_time: window.end_time,
            run_count: window.test_runs.len() as u64,
        };
        self.gate
            .with(self.metadata.record_metrics_entry(&entry))
            .await
            .and_then(|r| r)
            .with_context(|| format!("recording metadata entry for {object_path}"))
    }
}

/// Warehouse writer: window record into the metadata table, row-shaped
/// metric records into the data table, creating tables on first use.
pub struct WarehouseOutputter {
    pub gate: NetGate,
    pub warehouse: Arc<dyn Warehouse>,
}

impl WarehouseOutputter {
    async fn append(
        &self,
        dataset: &str,
        table: &str,
        rows: &[serde_json::Value],
    ) -> anyhow::Result<()> {
        self.gate
            .with(self.warehouse.ensure_table(dataset, table))
            .await
            .and_then(|r| r)
            .with_context(|| format!("creating table {dataset}.{table}"))?;
        self.gate
            .with(self.warehouse.insert_rows(dataset, table, rows))
            .await
            .and_then(|r| r)
            .with_context(|| format!("appending to {dataset}.{table}"))
    }
}

#[async_trait]
impl Outputter for WarehouseOutputter {
    fn name(&self) -> &'static str {
        "warehouse"
    }

    async fn write(
        &self,
        id: &OutputId,
        window: &MetricsRun,
        _payload: &serde_json::Value,
        rows: &[serde_json::Value],
    ) -> anyhow::Result<()> {
        if let (Some(dataset), Some(table)) = (&id.metadata.dataset, &id.metadata.table) {
            let window_row = serde_json::to_value(window)?;
            self.append(dataset, table, &[window_row]).await?;
        }
        match (&id.data.dataset, &id.data.table) {
            (Some(dataset), Some(table)) => {
                tracing::info!(
                    dataset = %dataset,
                    table = %table,
                    rows = rows.len(),
                    metric = %id.metric_name,
                    "uploading warehouse rows"
                );
                self.append(dataset, table, rows).await
            }
            _ => {
                tracing::debug!(metric = %id.metric_name, "no warehouse data table; skipping rows");
                Ok(())
            }
        }
    }
}

/// Fans one metric out to every configured outputter concurrently, joining
/// before returning. Failures are collected per outputter, never propagated
/// between them.
pub async fn write_all(
    outputters: &[Arc<dyn Outputter>],
    id: &OutputId,
    window: &MetricsRun,
    payload: &serde_json::Value,
    rows: &[serde_json::Value],
) -> Vec<(String, anyhow::Error)> {
    let mut handles = Vec::with_capacity(outputters.len());
    for outputter in outputters {
        let outputter = outputter.clone();
        let id = id.clone();
        let window = window.clone();
        let payload = payload.clone();
        let rows = rows.to_vec();
        handles.push(tokio::spawn(async move {
            let res = outputter.write(&id, &window, &payload, &rows).await;
            (outputter.name().to_string(), res)
        }));
    }

    let mut failures = Vec::new();
    for h in handles {
        match h.await {
            Ok((_, Ok(()))) => {}
            Ok((name, Err(e))) => {
                tracing::error!(outputter = %name, error = %format!("{e:#}"), "upload failed");
                failures.push((name, e));
            }
            Err(e) => failures.push(("join".to_string(), e.into())),
        }
    }
    failures
}
