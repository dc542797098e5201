//! Aggregate metric computations over a completed result index.
//!
//! All three computations are independent read-only passes; callers may run
//! them concurrently without coordination.

use std::collections::BTreeMap;
use tally_core::index::ResultIndex;
use tally_core::model::{CompleteStatus, SubTestStatus, TestId, TestStatus};

pub mod rows;

/// Default pass predicate: the document-level status is OK and the
/// sub-status is unknown (top-level entry) or an explicit pass.
pub fn ok_and_unknown_or_passes(status: &CompleteStatus) -> bool {
    status.status == TestStatus::Ok
        && (status.sub_status == SubTestStatus::Unknown || status.sub_status == SubTestStatus::Pass)
}

/// All slash-delimited prefixes of a test path, shortest first, the full
/// path included.
fn path_prefixes(test: &str) -> Vec<String> {
    let parts: Vec<&str> = test.split('/').collect();
    (1..=parts.len()).map(|i| parts[..i].join("/")).collect()
}

/// Number of distinct TestIds under every path prefix. Counted once per
/// TestId, not per run.
pub fn compute_totals(index: &ResultIndex) -> BTreeMap<String, u64> {
    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    for test_id in index.entries().keys() {
        for prefix in path_prefixes(&test_id.test) {
            *totals.entry(prefix).or_insert(0) += 1;
        }
    }
    totals
}

/// Per-prefix histogram of pass counts: bucket `k` counts TestIds whose
/// statuses satisfied `passes` in exactly `k` runs. Buckets span 0..=num_runs.
pub fn compute_pass_rate_metric(
    num_runs: usize,
    index: &ResultIndex,
    passes: impl Fn(&CompleteStatus) -> bool,
) -> BTreeMap<String, Vec<u64>> {
    let mut metric: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for (test_id, statuses) in index.entries() {
        let pass_count = statuses.values().filter(|s| passes(s)).count();
        for prefix in path_prefixes(&test_id.test) {
            let histogram = metric.entry(prefix).or_insert_with(|| vec![0; num_runs + 1]);
            histogram[pass_count] += 1;
        }
    }
    metric
}

/// Failure buckets for one browser: bucket `i` holds the TestIds the browser
/// failed while exactly `i` other runs also failed. Browser identity is by
/// name; multiple runs of the same browser still count per run (known skew,
/// preserved for compatibility with historical metric objects).
pub fn compute_browser_failure_list(
    num_runs: usize,
    browser_name: &str,
    index: &ResultIndex,
    passes: impl Fn(&CompleteStatus) -> bool,
) -> Vec<Vec<TestId>> {
    let mut failures: Vec<Vec<TestId>> = vec![Vec::new(); num_runs];
    for (test_id, statuses) in index.entries() {
        let mut num_other_failures = 0;
        let mut browser_failed = false;
        for (run, status) in statuses {
            if !passes(status) {
                if run.browser_name == browser_name {
                    browser_failed = true;
                } else {
                    num_other_failures += 1;
                }
            }
        }
        if browser_failed {
            failures[num_other_failures].push(test_id.clone());
        }
    }
    for bucket in &mut failures {
        bucket.sort();
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_core::model::TestRun;

    fn run(browser: &str) -> TestRun {
        TestRun {
            browser_name: browser.into(),
            browser_version: "1.0".into(),
            os_name: "linux".into(),
            os_version: "4.4".into(),
            revision: "0123abcdef".into(),
            results_url: format!("https://x/wptd/0123abcdef/{browser}-1.0-summary.json.gz"),
            created_at: Utc::now(),
        }
    }

    fn pass() -> CompleteStatus {
        CompleteStatus {
            status: TestStatus::Ok,
            sub_status: SubTestStatus::Pass,
        }
    }

    fn fail() -> CompleteStatus {
        CompleteStatus {
            status: TestStatus::Ok,
            sub_status: SubTestStatus::Fail,
        }
    }

    /// Two browsers, one run each; A fails test1 only, B fails test1 and
    /// test2, both pass test3.
    fn two_browser_index() -> (ResultIndex, TestRun, TestRun) {
        let a = run("alpha");
        let b = run("beta");
        let mut index = ResultIndex::new();
        let t1 = TestId::test("/fx/one.html");
        let t2 = TestId::test("/fx/two.html");
        let t3 = TestId::test("/fx/three.html");

        index.insert(t1.clone(), a.clone(), fail());
        index.insert(t1, b.clone(), fail());
        index.insert(t2.clone(), a.clone(), pass());
        index.insert(t2, b.clone(), fail());
        index.insert(t3.clone(), a.clone(), pass());
        index.insert(t3, b.clone(), pass());
        (index, a, b)
    }

    #[test]
    fn passes_predicate_matches_ok_unknown_and_ok_pass() {
        assert!(ok_and_unknown_or_passes(&CompleteStatus::top_level(
            TestStatus::Ok
        )));
        assert!(ok_and_unknown_or_passes(&pass()));
        assert!(!ok_and_unknown_or_passes(&fail()));
        assert!(!ok_and_unknown_or_passes(&CompleteStatus::top_level(
            TestStatus::Error
        )));
    }

    #[test]
    fn totals_count_distinct_test_ids_per_prefix() {
        let (index, ..) = two_browser_index();
        let totals = compute_totals(&index);
        // Paths start with "/", so the first prefix is the empty segment.
        assert_eq!(totals[""], 3);
        assert_eq!(totals["/fx"], 3);
        assert_eq!(totals["/fx/one.html"], 1);
        assert!(!totals.contains_key("/other"));
    }

    #[test]
    fn histogram_buckets_sum_to_totals() {
        let (index, ..) = two_browser_index();
        let totals = compute_totals(&index);
        let metric = compute_pass_rate_metric(2, &index, ok_and_unknown_or_passes);
        for (prefix, histogram) in &metric {
            assert_eq!(histogram.len(), 3);
            assert_eq!(histogram.iter().sum::<u64>(), totals[prefix]);
        }
        // test1 passes 0 runs, test2 passes 1, test3 passes 2.
        assert_eq!(metric["/fx"], vec![1, 1, 1]);
    }

    #[test]
    fn failure_buckets_index_by_other_failure_count() {
        let (index, ..) = two_browser_index();

        // alpha failed test1; beta also failed it, so one other failure.
        let alpha = compute_browser_failure_list(2, "alpha", &index, ok_and_unknown_or_passes);
        assert_eq!(alpha.len(), 2);
        assert!(alpha[0].is_empty());
        assert_eq!(alpha[1], vec![TestId::test("/fx/one.html")]);

        // beta failed test2 exclusively (bucket 0) and test1 with one other
        // failure (bucket 1).
        let beta = compute_browser_failure_list(2, "beta", &index, ok_and_unknown_or_passes);
        assert_eq!(beta[0], vec![TestId::test("/fx/two.html")]);
        assert_eq!(beta[1], vec![TestId::test("/fx/one.html")]);
    }

    #[test]
    fn failure_bucket_sizes_sum_to_browser_failures() {
        let (index, ..) = two_browser_index();
        let beta = compute_browser_failure_list(2, "beta", &index, ok_and_unknown_or_passes);
        let total: usize = beta.iter().map(|b| b.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn prefixes_split_on_slash() {
        assert_eq!(
            path_prefixes("a/b/c"),
            vec!["a".to_string(), "a/b".to_string(), "a/b/c".to_string()]
        );
    }
}
