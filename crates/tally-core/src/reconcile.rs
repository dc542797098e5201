use crate::net::NetGate;
use crate::storage::{ListQuery, MetadataStore, ObjectStore};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

/// A short revision hash resolved against source-control history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub short_hash: String,
    pub long_hash: String,
    pub commit_time: DateTime<Utc>,
}

fn hex_hash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[0-9a-f]+$").expect("static pattern"))
}

/// Resolves short hashes to commits. The git-backed resolver shells out; a
/// fake can stand in for tests.
#[async_trait]
pub trait CommitResolver: Send + Sync {
    /// A failed resolution (unknown hash, subprocess error) yields None and
    /// is never a pipeline error.
    async fn resolve(&self, short_hash: &str) -> Option<Commit>;
}

/// Hash→Commit cache with lifetime = one pipeline execution, keyed by
/// (repository path, short hash).
#[derive(Default)]
pub struct CommitCache {
    inner: Mutex<HashMap<(PathBuf, String), Option<Commit>>>,
}

impl CommitCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, repo: &Path, short_hash: &str) -> Option<Option<Commit>> {
        self.inner
            .lock()
            .unwrap()
            .get(&(repo.to_path_buf(), short_hash.to_string()))
            .cloned()
    }

    pub fn put(&self, repo: &Path, short_hash: &str, commit: Option<Commit>) {
        self.inner
            .lock()
            .unwrap()
            .insert((repo.to_path_buf(), short_hash.to_string()), commit);
    }
}

/// Resolver backed by `git log` in a local repository checkout. Long hash
/// and commit time are two separate subprocess calls run concurrently.
pub struct GitResolver {
    repo: PathBuf,
    cache: Arc<CommitCache>,
}

impl GitResolver {
    pub fn new(repo: impl Into<PathBuf>, cache: Arc<CommitCache>) -> Self {
        Self {
            repo: repo.into(),
            cache,
        }
    }

    async fn git_log(&self, args: &[&str]) -> Option<String> {
        let out = tokio::process::Command::new("git")
            .arg("log")
            .arg("-1")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .await;
        match out {
            Ok(out) if out.status.success() => {
                Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
            }
            Ok(out) => {
                tracing::warn!(
                    args = ?args,
                    status = %out.status,
                    "git log failed"
                );
                None
            }
            Err(e) => {
                tracing::warn!(args = ?args, error = %e, "git log did not start");
                None
            }
        }
    }

    async fn long_hash(&self, short_hash: &str) -> Option<String> {
        self.git_log(&["--format=%H", short_hash])
            .await
            .filter(|s| !s.is_empty())
    }

    async fn commit_time(&self, short_hash: &str) -> Option<DateTime<Utc>> {
        let raw = self
            .git_log(&["--date=unix", "--format=%cd", short_hash])
            .await?;
        let ts: i64 = raw.parse().ok()?;
        Utc.timestamp_opt(ts, 0).single()
    }
}

#[async_trait]
impl CommitResolver for GitResolver {
    async fn resolve(&self, short_hash: &str) -> Option<Commit> {
        if let Some(cached) = self.cache.get(&self.repo, short_hash) {
            return cached;
        }
        let (long_hash, commit_time) =
            tokio::join!(self.long_hash(short_hash), self.commit_time(short_hash));
        let commit = match (long_hash, commit_time) {
            (Some(long_hash), Some(commit_time)) => Some(Commit {
                short_hash: short_hash.to_string(),
                long_hash,
                commit_time,
            }),
            _ => None,
        };
        self.cache.put(&self.repo, short_hash, commit.clone());
        commit
    }
}

/// Resolves a hash list in parallel, drops failed resolutions, and sorts
/// descending by commit time.
pub async fn resolve_and_sort(
    resolver: &Arc<dyn CommitResolver>,
    hashes: Vec<String>,
) -> anyhow::Result<Vec<Commit>> {
    let mut handles = Vec::with_capacity(hashes.len());
    for hash in hashes {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move { resolver.resolve(&hash).await }));
    }
    let mut commits = Vec::new();
    for h in handles {
        if let Some(commit) = h.await? {
            commits.push(commit);
        }
    }
    commits.sort_by(|a, b| b.commit_time.cmp(&a.commit_time));
    Ok(commits)
}

/// Outcome of a merge-join over the two commit sources. Lone entries are
/// excluded from the run set but kept for reporting.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub commits: Vec<Commit>,
    pub lone_metadata: Vec<Commit>,
    pub lone_storage: Vec<Commit>,
}

/// Two-pointer merge-join of the two commit sources. The walk runs over
/// hash-sorted copies, so it tolerates hash order disagreeing with commit
/// time order; joined commits are re-sorted descending by commit time on
/// the way out. On a short-hash mismatch the smaller side advances and its
/// entry is logged as lone; on a match one commit is emitted and both
/// advance. Remainders after either list is exhausted are lone as well.
pub fn reconcile(mut metadata: Vec<Commit>, mut storage: Vec<Commit>) -> Reconciled {
    metadata.sort_by(|a, b| a.short_hash.cmp(&b.short_hash));
    storage.sort_by(|a, b| a.short_hash.cmp(&b.short_hash));

    let mut out = Reconciled::default();
    let mut i = 0;
    let mut j = 0;
    while i < metadata.len() && j < storage.len() {
        match metadata[i].short_hash.cmp(&storage[j].short_hash) {
            std::cmp::Ordering::Less => {
                tracing::info!(hash = %metadata[i].short_hash, "lone metadata commit");
                out.lone_metadata.push(metadata[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                tracing::info!(hash = %storage[j].short_hash, "lone storage commit");
                out.lone_storage.push(storage[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.commits.push(metadata[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    for commit in &metadata[i..] {
        tracing::info!(hash = %commit.short_hash, "lone metadata commit");
        out.lone_metadata.push(commit.clone());
    }
    for commit in &storage[j..] {
        tracing::info!(hash = %commit.short_hash, "lone storage commit");
        out.lone_storage.push(commit.clone());
    }
    out.commits.sort_by(|a, b| b.commit_time.cmp(&a.commit_time));
    out
}

/// Distinct revisions known to the metadata store, via the gated query path.
pub async fn revisions_from_metadata(
    gate: &NetGate,
    metadata: &Arc<dyn MetadataStore>,
) -> anyhow::Result<Vec<String>> {
    gate.with(metadata.distinct_revisions()).await?
}

/// Revision hashes known to blob storage: top-level delimited prefixes whose
/// name is a hex hash.
pub async fn hashes_from_storage(
    gate: &NetGate,
    objects: &Arc<dyn ObjectStore>,
) -> anyhow::Result<Vec<String>> {
    let entries = gate.with(objects.list(&ListQuery::delimited(""))).await??;
    let mut hashes = Vec::new();
    for entry in entries {
        let Some(prefix) = entry.prefix else { continue };
        let candidate = prefix.trim_end_matches('/');
        if hex_hash_re().is_match(candidate) {
            hashes.push(candidate.to_string());
        }
    }
    Ok(hashes)
}

/// Full reconciliation stage: resolve both hash lists concurrently, join on
/// the barrier, then merge-join. Output only contains revisions present in
/// both the metadata store and blob storage.
pub async fn reconcile_commit_sources(
    resolver: &Arc<dyn CommitResolver>,
    metadata_hashes: Vec<String>,
    storage_hashes: Vec<String>,
) -> anyhow::Result<Reconciled> {
    let (metadata, storage) = tokio::join!(
        resolve_and_sort(resolver, metadata_hashes),
        resolve_and_sort(resolver, storage_hashes),
    );
    Ok(reconcile(metadata?, storage?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(short: &str, ts: i64) -> Commit {
        Commit {
            short_hash: short.into(),
            long_hash: format!("{short}{short}"),
            commit_time: Utc.timestamp_opt(ts, 0).single().unwrap(),
        }
    }

    #[test]
    fn merge_join_emits_intersection_and_lone_entries() {
        // Both lists sorted descending by commit time.
        let metadata = vec![commit("cccc", 30), commit("bbbb", 20), commit("aaaa", 10)];
        let storage = vec![commit("dddd", 40), commit("cccc", 30), commit("aaaa", 10)];
        let out = reconcile(metadata, storage);

        let joined: Vec<_> = out.commits.iter().map(|c| c.short_hash.as_str()).collect();
        assert_eq!(joined, vec!["cccc", "aaaa"]);
        assert!(out.commits[0].commit_time > out.commits[1].commit_time);

        let lone_meta: Vec<_> = out
            .lone_metadata
            .iter()
            .map(|c| c.short_hash.as_str())
            .collect();
        let lone_storage: Vec<_> = out
            .lone_storage
            .iter()
            .map(|c| c.short_hash.as_str())
            .collect();
        assert_eq!(lone_meta, vec!["bbbb"]);
        assert_eq!(lone_storage, vec!["dddd"]);
    }

    #[test]
    fn merge_join_size_bounded_by_smaller_input() {
        let metadata = vec![commit("aaaa", 3), commit("ab00", 2), commit("ac00", 1)];
        let storage = vec![commit("aaaa", 3)];
        let out = reconcile(metadata, storage);
        assert!(out.commits.len() <= 1);
        assert_eq!(out.commits[0].short_hash, "aaaa");
    }

    #[test]
    fn merge_join_tolerates_hash_order_disagreeing_with_time_order() {
        // The newest commit carries the lexicographically-smallest hash, so
        // a walk in time order would drain one side without ever matching.
        let metadata = vec![commit("aaaa", 50), commit("zzzz", 40), commit("mmmm", 30)];
        let storage = vec![commit("aaaa", 50), commit("zzzz", 40)];
        let out = reconcile(metadata, storage);

        let joined: Vec<_> = out.commits.iter().map(|c| c.short_hash.as_str()).collect();
        assert_eq!(joined, vec!["aaaa", "zzzz"]);
        let lone: Vec<_> = out
            .lone_metadata
            .iter()
            .map(|c| c.short_hash.as_str())
            .collect();
        assert_eq!(lone, vec!["mmmm"]);
        assert!(out.lone_storage.is_empty());
    }

    #[test]
    fn hex_filter_accepts_hashes_only() {
        assert!(hex_hash_re().is_match("0123abcdef"));
        assert!(!hex_hash_re().is_match("latest"));
        assert!(!hex_hash_re().is_match("0123ABCDEF"));
        assert!(!hex_hash_re().is_match(""));
    }

    struct FakeResolver(HashMap<String, Commit>);

    #[async_trait]
    impl CommitResolver for FakeResolver {
        async fn resolve(&self, short_hash: &str) -> Option<Commit> {
            self.0.get(short_hash).cloned()
        }
    }

    #[tokio::test]
    async fn resolution_drops_unknown_hashes_and_sorts_descending() -> anyhow::Result<()> {
        let known: HashMap<String, Commit> = [
            ("aaaa".to_string(), commit("aaaa", 10)),
            ("cccc".to_string(), commit("cccc", 30)),
        ]
        .into_iter()
        .collect();
        let resolver: Arc<dyn CommitResolver> = Arc::new(FakeResolver(known));

        let commits = resolve_and_sort(
            &resolver,
            vec!["aaaa".into(), "unknown".into(), "cccc".into()],
        )
        .await?;
        let hashes: Vec<_> = commits.iter().map(|c| c.short_hash.as_str()).collect();
        assert_eq!(hashes, vec!["cccc", "aaaa"]);
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_commit_sources_joins_both_resolutions() -> anyhow::Result<()> {
        let known: HashMap<String, Commit> = [
            ("aaaa".to_string(), commit("aaaa", 10)),
            ("bbbb".to_string(), commit("bbbb", 20)),
            ("cccc".to_string(), commit("cccc", 30)),
            ("dddd".to_string(), commit("dddd", 40)),
        ]
        .into_iter()
        .collect();
        let resolver: Arc<dyn CommitResolver> = Arc::new(FakeResolver(known));

        let out = reconcile_commit_sources(
            &resolver,
            vec!["aaaa".into(), "bbbb".into(), "cccc".into()],
            vec!["aaaa".into(), "cccc".into(), "dddd".into()],
        )
        .await?;
        let joined: Vec<_> = out.commits.iter().map(|c| c.short_hash.as_str()).collect();
        assert_eq!(joined, vec!["cccc", "aaaa"]);
        assert_eq!(out.lone_metadata.len(), 1);
        assert_eq!(out.lone_storage.len(), 1);
        Ok(())
    }

    #[test]
    fn commit_cache_is_keyed_by_repo_and_hash() {
        let cache = CommitCache::new();
        let repo_a = Path::new("/tmp/a");
        let repo_b = Path::new("/tmp/b");
        cache.put(repo_a, "aaaa", Some(commit("aaaa", 1)));
        cache.put(repo_a, "bbbb", None);

        assert!(cache.get(repo_a, "aaaa").unwrap().is_some());
        // Negative resolutions are cached too.
        assert!(cache.get(repo_a, "bbbb").unwrap().is_none());
        assert!(cache.get(repo_b, "aaaa").is_none());
    }
}
