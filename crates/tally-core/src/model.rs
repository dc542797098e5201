use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One browser/OS test execution at a given source revision. Immutable once
/// fetched; the run set is fixed for the duration of one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TestRun {
    pub browser_name: String,
    pub browser_version: String,
    pub os_name: String,
    pub os_version: String,
    /// First 10 characters of the hash of the tested source revision.
    pub revision: String,
    pub results_url: String,
    pub created_at: DateTime<Utc>,
}

impl Ord for TestRun {
    fn cmp(&self, other: &Self) -> Ordering {
        // Revision first, then platform fields; progress reporting and
        // fixtures rely on this order.
        (
            &self.revision,
            &self.browser_name,
            &self.browser_version,
            &self.os_name,
            &self.os_version,
            &self.results_url,
            &self.created_at,
        )
            .cmp(&(
                &other.revision,
                &other.browser_name,
                &other.browser_version,
                &other.os_name,
                &other.os_version,
                &other.results_url,
                &other.created_at,
            ))
    }
}

impl PartialOrd for TestRun {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTest {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// One decoded result document: a top-level test plus its subtests. One
/// document is produced per executed test file per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResults {
    pub test: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub subtests: Vec<SubTest>,
}

/// Identity of a measured unit: a test path plus optional subtest name.
/// `name: None` identifies the top-level test itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId {
    pub test: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TestId {
    pub fn test(test: impl Into<String>) -> Self {
        Self {
            test: test.into(),
            name: None,
        }
    }

    pub fn subtest(test: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            test: test.into(),
            name: Some(name.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Unknown,
    Ok,
    Error,
    Timeout,
}

impl TestStatus {
    /// Parses a document-level status string ("OK", "ERROR", ...).
    /// Unrecognized strings map to Unknown, never to an error.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "OK" => TestStatus::Ok,
            "ERROR" => TestStatus::Error,
            "TIMEOUT" => TestStatus::Timeout,
            _ => TestStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubTestStatus {
    Unknown,
    Pass,
    Fail,
    Timeout,
    NotRun,
}

impl SubTestStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "PASS" => SubTestStatus::Pass,
            "FAIL" => SubTestStatus::Fail,
            "TIMEOUT" => SubTestStatus::Timeout,
            "NOT_RUN" => SubTestStatus::NotRun,
            _ => SubTestStatus::Unknown,
        }
    }
}

/// (top-level status, sub-status) pair recorded for a (TestId, Run). The
/// sub-status is Unknown when the TestId has no subtest name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CompleteStatus {
    pub status: TestStatus,
    pub sub_status: SubTestStatus,
}

impl CompleteStatus {
    pub fn top_level(status: TestStatus) -> Self {
        Self {
            status,
            sub_status: SubTestStatus::Unknown,
        }
    }
}

/// The (start, end) bounds and run set a metrics snapshot was computed over.
/// Attached to every derived metric so consumers can correlate a snapshot to
/// the runs that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRun {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub test_runs: Vec<TestRun>,
}

impl MetricsRun {
    /// Directory component of metric object names: `{start}-{end}` in unix
    /// seconds.
    pub fn dir(&self) -> String {
        format!("{}-{}", self.start_time.timestamp(), self.end_time.timestamp())
    }
}

/// Platform fields parsed out of a blob-storage directory name of the form
/// `browser-version-os-osversion`. Fragments past the fourth are dropped;
/// some providers append extra fragments there.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformSpec {
    pub browser_name: String,
    pub browser_version: String,
    pub os_name: String,
    pub os_version: String,
}

impl PlatformSpec {
    pub fn parse(s: &str) -> Self {
        let mut parts = s.split('-');
        Self {
            browser_name: parts.next().unwrap_or_default().to_string(),
            browser_version: parts.next().unwrap_or_default().to_string(),
            os_name: parts.next().unwrap_or_default().to_string(),
            os_version: parts.next().unwrap_or_default().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(revision: &str, browser: &str) -> TestRun {
        TestRun {
            browser_name: browser.into(),
            browser_version: "1.0".into(),
            os_name: "linux".into(),
            os_version: "4.4".into(),
            revision: revision.into(),
            results_url: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn status_parsing_is_closed_and_total() {
        assert_eq!(TestStatus::parse("OK"), TestStatus::Ok);
        assert_eq!(TestStatus::parse("timeout"), TestStatus::Timeout);
        assert_eq!(TestStatus::parse("CRASH"), TestStatus::Unknown);
        assert_eq!(SubTestStatus::parse("PASS"), SubTestStatus::Pass);
        assert_eq!(SubTestStatus::parse("NOT_RUN"), SubTestStatus::NotRun);
        assert_eq!(SubTestStatus::parse(""), SubTestStatus::Unknown);
    }

    #[test]
    fn runs_order_by_revision_then_platform() {
        let mut runs = vec![run("bbbb", "chrome"), run("aaaa", "firefox"), run("aaaa", "chrome")];
        runs.sort();
        assert_eq!(runs[0].revision, "aaaa");
        assert_eq!(runs[0].browser_name, "chrome");
        assert_eq!(runs[1].browser_name, "firefox");
        assert_eq!(runs[2].revision, "bbbb");
    }

    #[test]
    fn platform_spec_parses_four_fragments() {
        let spec = PlatformSpec::parse("chrome-63.0-linux-3.16");
        assert_eq!(spec.browser_name, "chrome");
        assert_eq!(spec.browser_version, "63.0");
        assert_eq!(spec.os_name, "linux");
        assert_eq!(spec.os_version, "3.16");
        // Extra fragments (e.g. remote provider tags) are ignored.
        let spec = PlatformSpec::parse("edge-15-windows-10-sauce");
        assert_eq!(spec.os_version, "10");
    }

    #[test]
    fn test_id_orders_top_level_before_subtests() {
        let mut ids = vec![
            TestId::subtest("/dom/a.html", "b"),
            TestId::test("/dom/a.html"),
            TestId::subtest("/dom/a.html", "a"),
        ];
        ids.sort();
        assert_eq!(ids[0], TestId::test("/dom/a.html"));
        assert_eq!(ids[1], TestId::subtest("/dom/a.html", "a"));
    }
}
