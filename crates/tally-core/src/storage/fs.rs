use super::{ListQuery, ObjectEntry, ObjectStore};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Object store backed by a local directory tree. Object names map to
/// slash-separated relative paths; delimited listings report immediate
/// subdirectories as prefixes.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn walk(dir: &Path, rel: &str, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let child_rel = if rel.is_empty() {
                file_name
            } else {
                format!("{rel}/{file_name}")
            };
            if entry.file_type()?.is_dir() {
                Self::walk(&entry.path(), &child_rel, out)?;
            } else {
                out.push(child_rel);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self, query: &ListQuery) -> anyhow::Result<Vec<ObjectEntry>> {
        let root = self.root.clone();
        let query = query.clone();
        // Directory walks are blocking; keep them off the runtime workers.
        let entries = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<ObjectEntry>> {
            let mut names = Vec::new();
            if root.exists() {
                Self::walk(&root, "", &mut names)
                    .with_context(|| format!("listing {}", root.display()))?;
            }
            names.sort();

            if query.delimited {
                let mut prefixes = BTreeSet::new();
                let mut out = Vec::new();
                for name in names {
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
                            name: Some(name),
                            ..Default::default()
                        }),
                    }
                }
                Ok(out)
            } else {
                Ok(names
                    .into_iter()
                    .filter(|n| n.starts_with(&query.prefix))
                    .map(|n| ObjectEntry {
                        name: Some(n),
                        ..Default::default()
                    })
                    .collect())
            }
        })
        .await??;
        Ok(entries)
    }

    async fn get(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.full_path(name);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading object {}", path.display()))
    }

    async fn put(&self, name: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.full_path(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("writing object {}", path.display()))
    }
}
