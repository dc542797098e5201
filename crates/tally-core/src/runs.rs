use crate::model::{PlatformSpec, TestRun};
use crate::net::NetGate;
use crate::reconcile::hashes_from_storage;
use crate::storage::{ListQuery, MetadataStore, ObjectStore};
use anyhow::Context;
use std::sync::Arc;

/// Client for the external runs endpoint. One GET per pipeline execution;
/// the response is the full run set for the batch.
pub struct RunsClient {
    http: reqwest::Client,
    host: String,
}

impl RunsClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: host.into(),
        }
    }

    pub async fn fetch_runs(&self) -> anyhow::Result<Vec<TestRun>> {
        let url = format!("https://{}/api/runs", self.host);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("bad response code from {url}: {}", resp.status());
        }
        let runs: Vec<TestRun> = resp
            .json()
            .await
            .with_context(|| format!("decoding runs from {url}"))?;
        tracing::info!(count = runs.len(), host = %self.host, "fetched run set");
        Ok(runs)
    }
}

/// Enumerates runs directly from the blob-storage layout instead of the
/// runs API: each `{hash}/{platform}/` directory pair becomes one run, with
/// the platform fields parsed from the directory name and the creation time
/// looked up in the metadata store. Revisions the metadata store has never
/// seen are skipped; reconciliation would drop them anyway.
pub async fn runs_from_storage(
    gate: &NetGate,
    objects: &Arc<dyn ObjectStore>,
    metadata: &Arc<dyn MetadataStore>,
    host: &str,
    bucket: &str,
) -> anyhow::Result<Vec<TestRun>> {
    let mut runs = Vec::new();
    for hash in hashes_from_storage(gate, objects).await? {
        let created_at = gate
            .with(metadata.created_at_for_revision(&hash))
            .await??;
        let Some(created_at) = created_at else {
            tracing::debug!(revision = %hash, "revision unknown to metadata store; skipping");
            continue;
        };
        let entries = gate
            .with(objects.list(&ListQuery::delimited(format!("{hash}/"))))
            .await??;
        for entry in entries {
            let Some(prefix) = entry.prefix else { continue };
            let platform = prefix
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            let spec = PlatformSpec::parse(&platform);
            if spec.browser_name.is_empty() {
                continue;
            }
            runs.push(TestRun {
                browser_name: spec.browser_name,
                browser_version: spec.browser_version,
                os_name: spec.os_name,
                os_version: spec.os_version,
                revision: hash.clone(),
                results_url: format!("https://{host}/{bucket}/{hash}/{platform}-summary.json.gz"),
                created_at,
            });
        }
    }
    runs.sort();
    tracing::info!(count = runs.len(), "enumerated runs from storage");
    Ok(runs)
}

/// Derives the bucket-relative listing prefix for a run's result documents.
///
/// The results URL has the form `protocol://host/bucket/dir/path-summary.json.gz`
/// while the individual documents live under `protocol://host/bucket/dir/path/**`,
/// so the prefix is the URL sliced from after the bucket segment to the last
/// `-`, with a trailing slash.
pub fn results_prefix(results_url: &str, bucket: &str) -> anyhow::Result<String> {
    let needle = format!("/{bucket}/");
    let start = results_url
        .find(&needle)
        .map(|i| i + needle.len())
        .with_context(|| format!("bucket {bucket} not in results url {results_url}"))?;
    let end = results_url
        .rfind('-')
        .filter(|&i| i > start)
        .with_context(|| format!("no summary suffix in results url {results_url}"))?;
    Ok(format!("{}/", &results_url[start..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_strips_bucket_and_summary_suffix() -> anyhow::Result<()> {
        let url = "https://storage.example.com/wptd/0bd2b5c93a/chrome-63.0-linux-summary.json.gz";
        assert_eq!(results_prefix(url, "wptd")?, "0bd2b5c93a/chrome-63.0-linux/");
        Ok(())
    }

    #[test]
    fn prefix_rejects_urls_without_bucket() {
        let url = "https://storage.example.com/other/0bd2b5c93a/chrome-summary.json.gz";
        assert!(results_prefix(url, "wptd").is_err());
    }

    #[test]
    fn prefix_rejects_urls_without_dash() {
        let url = "https://storage.example.com/wptd/0bd2b5c93a/summary.json.gz";
        assert!(results_prefix(url, "wptd").is_err());
    }

    #[tokio::test]
    async fn storage_enumeration_builds_runs_from_directory_layout() -> anyhow::Result<()> {
        use crate::storage::mem::{MemMetadataStore, MemObjectStore};
        use chrono::TimeZone;

        let objects: Arc<dyn ObjectStore> = Arc::new(MemObjectStore::new());
        for name in [
            "0a1b2c3d4e/chrome-63.0-linux-4.4/dom/a.json",
            "0a1b2c3d4e/firefox-57.0-linux-4.4/dom/a.json",
            "ffffffffff/safari-11.0-mac-10.12/dom/a.json",
            "latest/chrome-63.0-linux-4.4/dom/a.json",
        ] {
            objects.put(name, b"{}").await?;
        }

        let created = chrono::Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let known = TestRun {
            browser_name: "chrome".into(),
            browser_version: "63.0".into(),
            os_name: "linux".into(),
            os_version: "4.4".into(),
            revision: "0a1b2c3d4e".into(),
            results_url: String::new(),
            created_at: created,
        };
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(MemMetadataStore::with_runs(vec![known]));

        let gate = NetGate::new(4);
        let runs =
            runs_from_storage(&gate, &objects, &metadata, "storage.example.com", "wptd").await?;

        // "latest" fails the hex filter; "ffffffffff" is unknown to metadata.
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].browser_name, "chrome");
        assert_eq!(runs[0].browser_version, "63.0");
        assert_eq!(runs[0].os_name, "linux");
        assert_eq!(runs[0].os_version, "4.4");
        assert_eq!(runs[0].revision, "0a1b2c3d4e");
        assert_eq!(runs[0].created_at, created);
        assert_eq!(runs[1].browser_name, "firefox");
        // The synthesized URL feeds back into prefix derivation.
        assert_eq!(
            results_prefix(&runs[0].results_url, "wptd")?,
            "0a1b2c3d4e/chrome-63.0-linux-4.4/"
        );
        Ok(())
    }
}
