use anyhow::Context;
use clap::Parser;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tally_core::index::ResultIndex;
use tally_core::model::{MetricsRun, TestId};
use tally_core::net::NetGate;
use tally_core::output::{
    write_all, BlobMetadataOutputter, OutputId, OutputLocation, Outputter, WarehouseOutputter,
};
use tally_core::pipeline::Pipeline;
use tally_core::reconcile::{CommitCache, CommitResolver, GitResolver};
use tally_core::runs::{runs_from_storage, RunsClient};
use tally_core::storage::fs::FsObjectStore;
use tally_core::storage::sqlite::{SqliteMetadataStore, SqliteWarehouse};
use tally_core::storage::{MetadataStore, ObjectStore, Warehouse};

#[derive(Parser, Debug)]
#[command(author, version, about = "Batch metrics engine for cross-run test results")]
struct Args {
    /// Hostname of the endpoint serving the runs API.
    #[arg(long, default_value = "wpt.fyi")]
    host: String,

    /// Root directory of the input object store holding result documents.
    #[arg(long, default_value = "wpt-data")]
    data_dir: PathBuf,

    /// Bucket segment of run result URLs, used to derive listing prefixes.
    #[arg(long, default_value = "wptd")]
    input_bucket: String,

    /// Root directory of the output object store for metric objects.
    #[arg(long, default_value = "wpt-metrics")]
    output_dir: PathBuf,

    /// SQLite database backing the metadata store.
    #[arg(long, default_value = "tally-metadata.db")]
    metadata_db: PathBuf,

    /// SQLite database backing the warehouse.
    #[arg(long, default_value = "tally-warehouse.db")]
    warehouse_db: PathBuf,

    /// Checkout of the tested source repository, for hash resolution.
    #[arg(long, default_value = "web-platform-tests")]
    repo_path: PathBuf,

    /// Maximum concurrent remote calls.
    #[arg(long, default_value_t = 1000)]
    max_connections: usize,

    /// Enumerate runs from the blob-storage directory layout instead of the
    /// runs API.
    #[arg(long)]
    runs_from_storage: bool,

    #[arg(long, default_value = "tally-metrics.log")]
    log_file: PathBuf,

    /// Warehouse dataset for window metadata; defaults to a unix-time
    /// suffixed name.
    #[arg(long)]
    metadata_dataset: Option<String>,

    #[arg(long, default_value = "MetricsRuns")]
    metadata_table: String,

    /// Warehouse dataset for metric rows; defaults to a unix-time suffixed
    /// name.
    #[arg(long)]
    data_dataset: Option<String>,

    #[arg(long)]
    pass_rate_table: Option<String>,

    #[arg(long)]
    failures_table: Option<String>,
}

struct Destinations {
    metadata_dataset: String,
    metadata_table: String,
    data_dataset: String,
    pass_rate_table: String,
    failures_table: String,
}

impl Destinations {
    fn from_args(args: &Args) -> Self {
        let unix_now = chrono::Utc::now().timestamp();
        Self {
            metadata_dataset: args
                .metadata_dataset
                .clone()
                .unwrap_or_else(|| format!("tally_metrics_{unix_now}")),
            metadata_table: args.metadata_table.clone(),
            data_dataset: args
                .data_dataset
                .clone()
                .unwrap_or_else(|| format!("tally_metrics_{unix_now}")),
            pass_rate_table: args
                .pass_rate_table
                .clone()
                .unwrap_or_else(|| format!("PassRates_{unix_now}")),
            failures_table: args
                .failures_table
                .clone()
                .unwrap_or_else(|| format!("Failures_{unix_now}")),
        }
    }

    fn metadata_location(&self) -> OutputLocation {
        OutputLocation {
            object_path: None,
            dataset: Some(self.metadata_dataset.clone()),
            table: Some(self.metadata_table.clone()),
        }
    }
}

fn init_logging(path: &PathBuf) -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .init();
    eprintln!("logs appended to {}", path.display());
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = Args::parse();
    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:?}");
            2
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<i32> {
    init_logging(&args.log_file)?;
    let dest = Destinations::from_args(&args);

    let gate = NetGate::new(args.max_connections);
    let input_store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&args.data_dir));
    let output_store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&args.output_dir));
    let metadata: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::open(&args.metadata_db)?);
    let warehouse: Arc<dyn Warehouse> = Arc::new(SqliteWarehouse::open(&args.warehouse_db)?);
    let cache = Arc::new(CommitCache::new());
    let resolver: Arc<dyn CommitResolver> = Arc::new(GitResolver::new(&args.repo_path, cache));

    let runs = if args.runs_from_storage {
        tracing::info!(bucket = %args.input_bucket, "enumerating runs from storage");
        runs_from_storage(
            &gate,
            &input_store,
            &metadata,
            &args.host,
            &args.input_bucket,
        )
        .await?
    } else {
        tracing::info!(host = %args.host, "reading run set");
        RunsClient::new(&args.host).fetch_runs().await?
    };

    let pipeline = Pipeline {
        gate: gate.clone(),
        objects: input_store,
        metadata: metadata.clone(),
        resolver,
        bucket: args.input_bucket.clone(),
    };
    let outcome = pipeline.run(runs).await?;
    let window = outcome.window.clone();
    let index = Arc::new(outcome.index);
    let num_runs = window.test_runs.len();

    tracing::info!(
        test_ids = index.len(),
        runs = num_runs,
        "computing metrics"
    );
    let (totals, pass_rates, failures) = compute_all(index, num_runs, &window).await?;

    let outputters: Vec<Arc<dyn Outputter>> = vec![
        Arc::new(BlobMetadataOutputter {
            gate: gate.clone(),
            objects: output_store,
            metadata,
        }),
        Arc::new(WarehouseOutputter { gate, warehouse }),
    ];

    let mut upload_failures = upload_metrics(
        &outputters,
        &dest,
        &window,
        &totals,
        &pass_rates,
        &failures,
    )
    .await?;

    for err in &outcome.errors {
        tracing::error!(error = %err, "pipeline error");
    }
    let failed = !outcome.errors.is_empty() || !upload_failures.is_empty();
    for (name, err) in upload_failures.drain(..) {
        tracing::error!(outputter = %name, error = %format!("{err:#}"), "upload error");
    }
    if failed {
        tracing::error!("batch completed with errors");
        return Ok(1);
    }
    tracing::info!("batch complete");
    Ok(0)
}

type Totals = std::collections::BTreeMap<String, u64>;
type PassRates = std::collections::BTreeMap<String, Vec<u64>>;
type Failures = Vec<(String, Vec<Vec<TestId>>)>;

/// Runs the three computations concurrently and joins before upload.
async fn compute_all(
    index: Arc<ResultIndex>,
    num_runs: usize,
    window: &MetricsRun,
) -> anyhow::Result<(Totals, PassRates, Failures)> {
    let totals_task = {
        let index = index.clone();
        tokio::spawn(async move { tally_metrics::compute_totals(&index) })
    };
    let pass_rate_task = {
        let index = index.clone();
        tokio::spawn(async move {
            tally_metrics::compute_pass_rate_metric(
                num_runs,
                &index,
                tally_metrics::ok_and_unknown_or_passes,
            )
        })
    };

    let browsers: BTreeSet<String> = window
        .test_runs
        .iter()
        .map(|r| r.browser_name.clone())
        .collect();
    let mut failure_tasks = Vec::new();
    for browser in browsers {
        let index = index.clone();
        failure_tasks.push(tokio::spawn(async move {
            let lists = tally_metrics::compute_browser_failure_list(
                num_runs,
                &browser,
                &index,
                tally_metrics::ok_and_unknown_or_passes,
            );
            (browser, lists)
        }));
    }

    let totals = totals_task.await?;
    let pass_rates = pass_rate_task.await?;
    let mut failures = Vec::new();
    for task in failure_tasks {
        failures.push(task.await?);
    }
    Ok((totals, pass_rates, failures))
}

/// Hands every metric to every outputter; collects per-outputter failures.
async fn upload_metrics(
    outputters: &[Arc<dyn Outputter>],
    dest: &Destinations,
    window: &MetricsRun,
    totals: &Totals,
    pass_rates: &PassRates,
    failures: &Failures,
) -> anyhow::Result<Vec<(String, anyhow::Error)>> {
    let dir = window.dir();
    let mut all_failures = Vec::new();

    let pass_rate_id = OutputId {
        metric_name: "pass-rates".into(),
        metadata: dest.metadata_location(),
        data: OutputLocation {
            object_path: Some(format!("{dir}/pass-rates.json.gz")),
            dataset: Some(dest.data_dataset.clone()),
            table: Some(dest.pass_rate_table.clone()),
        },
    };
    all_failures.extend(
        write_all(
            outputters,
            &pass_rate_id,
            window,
            &serde_json::to_value(pass_rates)?,
            &tally_metrics::rows::pass_rate_rows(totals, pass_rates),
        )
        .await,
    );

    // Totals travel as warehouse columns on the pass-rate rows; as an object
    // they get their own snapshot.
    let totals_id = OutputId {
        metric_name: "test-counts".into(),
        metadata: dest.metadata_location(),
        data: OutputLocation {
            object_path: Some(format!("{dir}/test-counts.json.gz")),
            dataset: None,
            table: None,
        },
    };
    all_failures.extend(
        write_all(
            outputters,
            &totals_id,
            window,
            &serde_json::to_value(totals)?,
            &[],
        )
        .await,
    );

    for (browser, lists) in failures {
        let id = OutputId {
            metric_name: format!("{browser}-failures"),
            metadata: dest.metadata_location(),
            data: OutputLocation {
                object_path: Some(format!("{dir}/{browser}-failures.json.gz")),
                dataset: Some(dest.data_dataset.clone()),
                table: Some(dest.failures_table.clone()),
            },
        };
        all_failures.extend(
            write_all(
                outputters,
                &id,
                window,
                &serde_json::to_value(lists)?,
                &tally_metrics::rows::failure_rows(browser, lists),
            )
            .await,
        );
    }
    Ok(all_failures)
}
