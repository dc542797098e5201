//! Row shaping for the warehouse writer.

use serde_json::json;
use std::collections::BTreeMap;
use tally_core::model::TestId;

/// One row per path: the pass-rate histogram joined with the totals count.
pub fn pass_rate_rows(
    totals: &BTreeMap<String, u64>,
    pass_rates: &BTreeMap<String, Vec<u64>>,
) -> Vec<serde_json::Value> {
    pass_rates
        .iter()
        .map(|(dir, histogram)| {
            json!({
                "dir": dir,
                "pass_rates": histogram,
                "total": totals.get(dir).copied().unwrap_or(0),
            })
        })
        .collect()
}

/// One row per failed TestId, tagged with the bucket index it landed in.
pub fn failure_rows(browser_name: &str, failure_lists: &[Vec<TestId>]) -> Vec<serde_json::Value> {
    let mut rows = Vec::with_capacity(failure_lists.iter().map(Vec::len).sum());
    for (num_other_failures, bucket) in failure_lists.iter().enumerate() {
        for test_id in bucket {
            rows.push(json!({
                "browser_name": browser_name,
                "num_other_failures": num_other_failures,
                "test": test_id,
            }));
        }
    }
    rows
}
