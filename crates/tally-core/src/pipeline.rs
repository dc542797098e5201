use crate::index::{decode_document, ResultIndex};
use crate::model::{MetricsRun, TestResults, TestRun};
use crate::net::NetGate;
use crate::reconcile::{
    hashes_from_storage, reconcile_commit_sources, revisions_from_metadata, Commit, CommitResolver,
};
use crate::runs::results_prefix;
use crate::storage::{ListQuery, MetadataStore, ObjectStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Pipeline stage a failure was isolated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    List,
    Read,
    Decode,
    Upload,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::List => "list",
            Stage::Read => "read",
            Stage::Decode => "decode",
            Stage::Upload => "upload",
        };
        f.write_str(s)
    }
}

/// A failure scoped to one unit of work. Accumulated per stage rather than
/// aborting the batch; the batch escalates only after completion.
#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub object: Option<String>,
    pub source: anyhow::Error,
}

impl StageError {
    fn new(stage: Stage, object: Option<String>, source: anyhow::Error) -> Self {
        Self {
            stage,
            object,
            source,
        }
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.object {
            Some(obj) => write!(f, "{} error for {}: {:#}", self.stage, obj, self.source),
            None => write!(f, "{} error: {:#}", self.stage, self.source),
        }
    }
}

/// Everything the batch produced: the completed index, the window metadata,
/// and the failures that were isolated along the way.
pub struct PipelineOutcome {
    pub index: ResultIndex,
    pub window: MetricsRun,
    pub reconciled: Vec<Commit>,
    pub errors: Vec<StageError>,
}

/// Fetch/index stage: lists result documents per run, fetches and decodes
/// them under the gate, and drains everything into the index through one
/// consumer.
#[derive(Clone)]
pub struct Collector {
    pub gate: NetGate,
    pub objects: Arc<dyn ObjectStore>,
    pub bucket: String,
}

impl Collector {
    /// Builds the result index for the given run set. Documents arrive in
    /// any order; the single receiver here is the only writer, so the index
    /// needs no per-key locking.
    pub async fn collect(&self, runs: &[TestRun]) -> anyhow::Result<(ResultIndex, Vec<StageError>)> {
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(TestRun, TestResults)>();
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<StageError>();

        let mut run_tasks = Vec::with_capacity(runs.len());
        for run in runs.iter().cloned() {
            let this = self.clone();
            let result_tx = result_tx.clone();
            let error_tx = error_tx.clone();
            run_tasks.push(tokio::spawn(async move {
                this.process_run(run, result_tx, error_tx).await
            }));
        }
        // Channels close when the last run task drops its senders.
        drop(result_tx);
        drop(error_tx);

        let indexer = tokio::spawn(async move {
            let mut index = ResultIndex::new();
            let mut progress: HashMap<TestRun, u64> = HashMap::new();
            while let Some((run, doc)) = result_rx.recv().await {
                index.add_document(&run, &doc);
                let count = progress.entry(run.clone()).or_insert(0);
                *count += 1;
                if *count % 1000 == 0 {
                    tracing::info!(
                        revision = %run.revision,
                        browser = %run.browser_name,
                        documents = *count,
                        "indexing progress"
                    );
                }
            }
            index
        });
        let error_drain = tokio::spawn(async move {
            let mut errors = Vec::new();
            while let Some(err) = error_rx.recv().await {
                tracing::warn!(error = %err, "isolated pipeline failure");
                errors.push(err);
            }
            errors
        });

        for task in run_tasks {
            task.await?;
        }
        let index = indexer.await?;
        let errors = error_drain.await?;
        Ok((index, errors))
    }

    async fn process_run(
        &self,
        run: TestRun,
        result_tx: mpsc::UnboundedSender<(TestRun, TestResults)>,
        error_tx: mpsc::UnboundedSender<StageError>,
    ) {
        let prefix = match results_prefix(&run.results_url, &self.bucket) {
            Ok(prefix) => prefix,
            Err(e) => {
                let _ = error_tx.send(StageError::new(
                    Stage::List,
                    Some(run.results_url.clone()),
                    e,
                ));
                return;
            }
        };
        let listed = self
            .gate
            .with(self.objects.list(&ListQuery::recursive(prefix.clone())))
            .await
            .and_then(|r| r);
        let entries = match listed {
            Ok(entries) => entries,
            Err(e) => {
                let _ = error_tx.send(StageError::new(Stage::List, Some(prefix), e));
                return;
            }
        };

        let mut doc_tasks = Vec::new();
        for entry in entries {
            // Directory placeholders carry no name.
            let Some(name) = entry.name else { continue };
            let this = self.clone();
            let run = run.clone();
            let result_tx = result_tx.clone();
            let error_tx = error_tx.clone();
            doc_tasks.push(tokio::spawn(async move {
                this.fetch_and_index_one(run, name, result_tx, error_tx).await;
            }));
        }
        for task in doc_tasks {
            if let Err(e) = task.await {
                let _ = error_tx.send(StageError::new(Stage::Read, None, e.into()));
            }
        }
    }

    async fn fetch_and_index_one(
        &self,
        run: TestRun,
        name: String,
        result_tx: mpsc::UnboundedSender<(TestRun, TestResults)>,
        error_tx: mpsc::UnboundedSender<StageError>,
    ) {
        let fetched = self
            .gate
            .with(self.objects.get(&name))
            .await
            .and_then(|r| r);
        let data = match fetched {
            Ok(data) => data,
            Err(e) => {
                let _ = error_tx.send(StageError::new(Stage::Read, Some(name), e));
                return;
            }
        };
        match decode_document(&data) {
            Ok(doc) => {
                let _ = result_tx.send((run, doc));
            }
            Err(e) => {
                let _ = error_tx.send(StageError::new(Stage::Decode, Some(name), e));
            }
        }
    }
}

/// The full batch: reconcile the run set against both commit sources, then
/// fetch and index. Each stage joins before the next begins.
pub struct Pipeline {
    pub gate: NetGate,
    pub objects: Arc<dyn ObjectStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub resolver: Arc<dyn CommitResolver>,
    pub bucket: String,
}

impl Pipeline {
    /// Restricts the run set to revisions present in both the metadata store
    /// and blob storage.
    pub async fn reconcile_runs(
        &self,
        runs: Vec<TestRun>,
    ) -> anyhow::Result<(Vec<TestRun>, Vec<Commit>)> {
        let (metadata_hashes, storage_hashes) = tokio::join!(
            revisions_from_metadata(&self.gate, &self.metadata),
            hashes_from_storage(&self.gate, &self.objects),
        );
        let reconciled =
            reconcile_commit_sources(&self.resolver, metadata_hashes?, storage_hashes?).await?;

        let keep: std::collections::HashSet<&str> = reconciled
            .commits
            .iter()
            .map(|c| c.short_hash.as_str())
            .collect();
        let before = runs.len();
        let runs: Vec<TestRun> = runs
            .into_iter()
            .filter(|r| keep.contains(r.revision.as_str()))
            .collect();
        tracing::info!(
            kept = runs.len(),
            dropped = before - runs.len(),
            commits = reconciled.commits.len(),
            "reconciled run set"
        );
        Ok((runs, reconciled.commits))
    }

    pub async fn run(&self, runs: Vec<TestRun>) -> anyhow::Result<PipelineOutcome> {
        let start_time = Utc::now();
        let (runs, reconciled) = self.reconcile_runs(runs).await?;

        let collector = Collector {
            gate: self.gate.clone(),
            objects: self.objects.clone(),
            bucket: self.bucket.clone(),
        };
        let (index, errors) = collector.collect(&runs).await?;
        let end_time = Utc::now();

        tracing::info!(
            test_ids = index.len(),
            duplicates = index.duplicate_count(),
            errors = errors.len(),
            "index build complete"
        );
        Ok(PipelineOutcome {
            index,
            window: MetricsRun {
                start_time,
                end_time,
                test_runs: runs,
            },
            reconciled,
            errors,
        })
    }
}
