use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::error::{DeckhandError, Result};
use crate::services::git::GitClient;

/// One shared, reusable local clone per (url, ref) pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub url: String,
    pub reference: String,
    pub local_path: PathBuf,
    pub last_fetched_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub is_shallow: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: Vec<CacheEntry>,
    pub total_size_bytes: u64,
}

/// Shallow-clone cache with TTL-bounded refresh.
///
/// Entries are shared across deployments and owned by the cache, not by any
/// single workflow. Mutation (clone/fetch) is guarded per key; readers get a
/// stale-but-present path while a refresh runs elsewhere.
pub struct RepoCache {
    cache_dir: PathBuf,
    ttl: Duration,
    shallow_threshold_bytes: u64,
    git: Arc<dyn GitClient>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    remote_refs: RwLock<HashMap<String, RefsEntry>>,
}

#[derive(Debug, Clone)]
struct RefsEntry {
    tags: Vec<String>,
    branches: Vec<String>,
    fetched_at: DateTime<Utc>,
}

/// `https://github.com/org/repo.git` + `17.0` -> `org_repo@17.0`.
fn cache_key(url: &str, reference: &str) -> String {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    let mut parts = trimmed.rsplit(['/', ':']);
    let repo = parts.next().unwrap_or(trimmed);
    let org = parts.next().unwrap_or("repo");
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("{}_{}@{}", sanitize(org), sanitize(repo), sanitize(reference))
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let entry_path = entry.path();
            if entry_path.is_dir() {
                total += dir_size(&entry_path);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

/// Recursive copy including the `.git` directory, off the async runtime.
async fn copy_tree(src: PathBuf, dest: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || copy_tree_blocking(&src, &dest))
        .await
        .map_err(|e| DeckhandError::State(format!("copy task panicked: {e}")))?
}

fn copy_tree_blocking(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree_blocking(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

impl RepoCache {
    pub fn new(
        cache_dir: PathBuf,
        ttl_secs: u64,
        shallow_threshold_bytes: u64,
        git: Arc<dyn GitClient>,
    ) -> Self {
        Self {
            cache_dir,
            ttl: Duration::seconds(ttl_secs as i64),
            shallow_threshold_bytes,
            git,
            entries: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            remote_refs: RwLock::new(HashMap::new()),
        }
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Ensure a usable local clone for (url, ref) and return its path.
    ///
    /// Fresh entries are returned without touching the network; stale ones
    /// fetch only the requested ref. A failed refresh of a present entry
    /// degrades to the last-known-good path.
    pub async fn materialize(&self, url: &str, reference: &str) -> Result<PathBuf> {
        let key = cache_key(url, reference);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let now = Utc::now();
        let existing = self.entries.read().await.get(&key).cloned();
        let path = self.cache_dir.join(&key);

        if let Some(entry) = existing.filter(|e| e.local_path.exists()) {
            if now - entry.last_fetched_at < self.ttl {
                self.touch(&key, now).await;
                return Ok(entry.local_path);
            }
            match self.git.fetch_ref(&entry.local_path, reference).await {
                Ok(()) => {
                    self.refresh_entry(&key, now).await;
                }
                Err(e) => {
                    tracing::warn!(url, reference, error = %e, "refresh failed, serving stale clone");
                    self.touch(&key, now).await;
                }
            }
            return Ok(entry.local_path);
        }

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| DeckhandError::State(format!("failed to create cache dir: {e}")))?;

        if path.exists() {
            // Directory survived a restart; refresh it and re-register.
            if let Err(e) = self.git.fetch_ref(&path, reference).await {
                tracing::warn!(url, reference, error = %e, "refresh of rediscovered clone failed");
            }
        } else {
            tracing::info!(url, reference, "cloning into cache (shallow)");
            self.git.clone_repo(url, reference, &path, true).await?;
        }

        let size = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || dir_size(&path))
                .await
                .unwrap_or(0)
        };
        let entry = CacheEntry {
            url: url.to_string(),
            reference: reference.to_string(),
            local_path: path.clone(),
            last_fetched_at: now,
            last_accessed_at: now,
            is_shallow: self.git.is_shallow(&path),
            size_bytes: size,
        };
        self.entries.write().await.insert(key, entry);
        Ok(path)
    }

    /// Materialize and copy the clone into a deployment working directory.
    pub async fn copy_to(&self, url: &str, reference: &str, dest: &Path) -> Result<()> {
        let cached = self.materialize(url, reference).await?;
        copy_tree(cached, dest.to_path_buf()).await
    }

    /// Remote tags, memoized for the TTL window.
    pub async fn list_tags(&self, url: &str) -> Result<Vec<String>> {
        self.remote_refs(url).await.map(|r| r.tags)
    }

    /// Remote branches, memoized for the TTL window.
    pub async fn list_branches(&self, url: &str) -> Result<Vec<String>> {
        self.remote_refs(url).await.map(|r| r.branches)
    }

    async fn remote_refs(&self, url: &str) -> Result<RefsEntry> {
        let now = Utc::now();
        if let Some(cached) = self.remote_refs.read().await.get(url) {
            if now - cached.fetched_at < self.ttl {
                return Ok(cached.clone());
            }
        }
        let tags = self.git.list_remote_tags(url).await?;
        let branches = self.git.list_remote_branches(url).await?;
        let entry = RefsEntry {
            tags,
            branches,
            fetched_at: now,
        };
        self.remote_refs
            .write()
            .await
            .insert(url.to_string(), entry.clone());
        Ok(entry)
    }

    /// Garbage-collect all entries; with `aggressive` also convert large
    /// full clones to shallow. Returns bytes reclaimed.
    pub async fn optimize(&self, aggressive: bool) -> Result<u64> {
        let snapshot: Vec<(String, CacheEntry)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut saved = 0u64;
        for (key, entry) in snapshot {
            let lock = self.key_lock(&key).await;
            let _guard = lock.lock().await;

            let result = if aggressive
                && !entry.is_shallow
                && entry.size_bytes > self.shallow_threshold_bytes
            {
                self.git
                    .convert_to_shallow(&entry.local_path, &entry.reference)
                    .await
            } else {
                self.git.gc(&entry.local_path).await
            };
            if let Err(e) = result {
                tracing::warn!(key, error = %e, "cache optimization failed for entry");
                continue;
            }

            let new_size = {
                let path = entry.local_path.clone();
                tokio::task::spawn_blocking(move || dir_size(&path))
                    .await
                    .unwrap_or(entry.size_bytes)
            };
            saved += entry.size_bytes.saturating_sub(new_size);
            let is_shallow = self.git.is_shallow(&entry.local_path);
            let mut entries = self.entries.write().await;
            if let Some(e) = entries.get_mut(&key) {
                e.size_bytes = new_size;
                e.is_shallow = is_shallow;
            }
        }
        Ok(saved)
    }

    /// Evict entries idle longer than `max_age_days`. Returns bytes freed.
    pub async fn cleanup(&self, max_age_days: u64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(max_age_days as i64);
        let idle: Vec<(String, CacheEntry)> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.last_accessed_at < cutoff)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut freed = 0u64;
        for (key, entry) in idle {
            let lock = self.key_lock(&key).await;
            let _guard = lock.lock().await;
            if entry.local_path.exists() {
                // A stuck entry must not block eviction of the rest.
                if let Err(e) = tokio::fs::remove_dir_all(&entry.local_path).await {
                    tracing::warn!(key, error = %e, "cache eviction failed for entry");
                    continue;
                }
            }
            freed += entry.size_bytes;
            self.entries.write().await.remove(&key);
            tracing::info!(key, "evicted idle cache entry");
        }
        Ok(freed)
    }

    /// Read-only introspection, largest entries first.
    pub async fn stats(&self) -> CacheStats {
        let mut entries: Vec<CacheEntry> = self.entries.read().await.values().cloned().collect();
        entries.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));
        let total_size_bytes = entries.iter().map(|e| e.size_bytes).sum();
        CacheStats {
            entries,
            total_size_bytes,
        }
    }

    async fn touch(&self, key: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            entry.last_accessed_at = now;
        }
    }

    async fn refresh_entry(&self, key: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            entry.last_fetched_at = now;
            entry.last_accessed_at = now;
        }
    }

    #[cfg(test)]
    async fn tweak_entry<F: FnOnce(&mut CacheEntry)>(&self, url: &str, reference: &str, f: F) {
        let key = cache_key(url, reference);
        let mut entries = self.entries.write().await;
        f(entries.get_mut(&key).expect("entry exists"));
    }
}
