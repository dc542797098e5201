use crate::model::{CompleteStatus, SubTestStatus, TestId, TestResults, TestRun, TestStatus};
use anyhow::Context;
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::io::Read;

/// Decode strategies tried in order against a raw result payload. Result
/// objects are stored either as plain structured text or gzip-compressed;
/// the listing does not say which.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeAttempt {
    Plain,
    Gzip,
}

impl DecodeAttempt {
    pub const ORDER: [DecodeAttempt; 2] = [DecodeAttempt::Plain, DecodeAttempt::Gzip];

    fn apply(self, data: &[u8]) -> anyhow::Result<TestResults> {
        match self {
            DecodeAttempt::Plain => {
                serde_json::from_slice(data).context("not a plain result document")
            }
            DecodeAttempt::Gzip => {
                let mut buf = Vec::new();
                GzDecoder::new(data)
                    .read_to_end(&mut buf)
                    .context("not gzip data")?;
                serde_json::from_slice(&buf).context("not a gzipped result document")
            }
        }
    }
}

/// Decodes one raw payload into a result document, trying each strategy in
/// order and reporting the last failure if none succeeds.
pub fn decode_document(data: &[u8]) -> anyhow::Result<TestResults> {
    let mut last_err = None;
    for attempt in DecodeAttempt::ORDER {
        match attempt.apply(data) {
            Ok(doc) => return Ok(doc),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("empty decode attempt list")))
}

/// TestId → Run → CompleteStatus, the core in-memory aggregation structure.
/// Built once per pipeline execution by a single consumer; duplicate writes
/// for the same (TestId, Run) key the last value and are counted.
#[derive(Debug, Default)]
pub struct ResultIndex {
    by_id: HashMap<TestId, HashMap<TestRun, CompleteStatus>>,
    duplicates: u64,
}

impl ResultIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: TestId, run: TestRun, status: CompleteStatus) {
        let statuses = self.by_id.entry(id.clone()).or_default();
        if statuses.contains_key(&run) {
            tracing::warn!(
                test = %id.test,
                subtest = id.name.as_deref().unwrap_or(""),
                revision = %run.revision,
                browser = %run.browser_name,
                "duplicate result for (test, run); overwriting"
            );
            self.duplicates += 1;
        }
        statuses.insert(run, status);
    }

    /// Indexes one decoded document: the top-level status under the bare
    /// test path, and one entry per subtest.
    pub fn add_document(&mut self, run: &TestRun, doc: &TestResults) {
        let top = TestStatus::parse(&doc.status);
        self.insert(
            TestId::test(doc.test.clone()),
            run.clone(),
            CompleteStatus::top_level(top),
        );
        for sub in &doc.subtests {
            self.insert(
                TestId::subtest(doc.test.clone(), sub.name.clone()),
                run.clone(),
                CompleteStatus {
                    status: top,
                    sub_status: SubTestStatus::parse(&sub.status),
                },
            );
        }
    }

    pub fn entries(&self) -> &HashMap<TestId, HashMap<TestRun, CompleteStatus>> {
        &self.by_id
    }

    pub fn get(&self, id: &TestId) -> Option<&HashMap<TestRun, CompleteStatus>> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Number of overwritten (TestId, Run) keys seen while building.
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates
    }
}
