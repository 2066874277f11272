use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use cs_types::{CsResult, Embedding, InstanceId};

/// Cached embedding with the keys that decide its validity
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    instance_id: InstanceId,
    content_digest: String,
    config_fingerprint: String,
    values: Vec<f64>,
    computed_at: DateTime<Utc>,
}

impl CacheEntry {
    fn matches(&self, digest: &str, fingerprint: &str) -> bool {
        self.content_digest == digest && self.config_fingerprint == fingerprint
    }

    fn embedding(&self) -> Embedding {
        Embedding::new(self.instance_id.clone(), self.values.clone())
    }
}

/// Embedding cache keyed by instance id.
///
/// An entry is only served when both the instance file digest and the
/// extractor fingerprint match; anything else counts as a stale entry and is
/// recomputed. With a directory, each entry is mirrored to
/// `<dir>/<instance>.json` so it survives across runs.
#[derive(Debug)]
pub struct EmbeddingCache {
    dir: Option<PathBuf>,
    entries: DashMap<InstanceId, CacheEntry>,
    stats: RwLock<CacheStats>,
}

impl EmbeddingCache {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            entries: DashMap::new(),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn open(dir: impl Into<PathBuf>) -> CsResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: Some(dir),
            entries: DashMap::new(),
            stats: RwLock::new(CacheStats::default()),
        })
    }

    /// Platform cache directory, e.g. `~/.cache/cutsearch/embeddings`.
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cutsearch")
            .join("embeddings")
    }

    pub fn get(&self, id: &InstanceId, digest: &str, fingerprint: &str) -> Option<Embedding> {
        if let Some(entry) = self.entries.get(id) {
            if entry.matches(digest, fingerprint) {
                self.stats.write().hits += 1;
                return Some(entry.embedding());
            }
        }

        if let Some(entry) = self.load_entry(id) {
            if entry.matches(digest, fingerprint) {
                let embedding = entry.embedding();
                self.entries.insert(id.clone(), entry);
                self.stats.write().hits += 1;
                return Some(embedding);
            }
            self.stats.write().stale += 1;
            debug!(instance = %id, "Cached embedding is stale");
        }

        self.stats.write().misses += 1;
        None
    }

    pub fn store(&self, embedding: &Embedding, digest: &str, fingerprint: &str) -> CsResult<()> {
        let entry = CacheEntry {
            instance_id: embedding.instance_id.clone(),
            content_digest: digest.to_string(),
            config_fingerprint: fingerprint.to_string(),
            values: embedding.values.clone(),
            computed_at: Utc::now(),
        };

        if let Some(path) = self.entry_path(&entry.instance_id) {
            let json = serde_json::to_string(&entry)?;
            std::fs::write(path, json)?;
        }

        self.entries.insert(entry.instance_id.clone(), entry);
        self.stats.write().stores += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    /// Drop the in-memory entries; files on disk are kept.
    pub fn clear(&self) {
        self.entries.clear();
        *self.stats.write() = CacheStats::default();
    }

    fn entry_path(&self, id: &InstanceId) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", id.as_str())))
    }

    fn load_entry(&self, id: &InstanceId) -> Option<CacheEntry> {
        let path = self.entry_path(id)?;
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(path = ?path, error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub stale: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Hex SHA-256 of the raw file bytes (compressed bytes for `.gz`).
pub fn content_digest(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(id: &str) -> Embedding {
        Embedding::new(InstanceId::new(id), vec![0.25, 0.5])
    }

    #[test]
    fn hit_requires_matching_keys() {
        let cache = EmbeddingCache::in_memory();
        cache.store(&embedding("p1"), "d1", "f1").unwrap();

        assert!(cache.get(&InstanceId::new("p1"), "d1", "f1").is_some());
        assert!(cache.get(&InstanceId::new("p1"), "d2", "f1").is_none());
        assert!(cache.get(&InstanceId::new("p1"), "d1", "f2").is_none());
        assert!(cache.get(&InstanceId::new("p2"), "d1", "f1").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.hit_rate(), 0.25);
    }

    #[test]
    fn entries_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = EmbeddingCache::open(dir.path()).unwrap();
            cache.store(&embedding("p1"), "d1", "f1").unwrap();
        }

        let reopened = EmbeddingCache::open(dir.path()).unwrap();
        assert!(reopened.is_empty());
        let hit = reopened.get(&InstanceId::new("p1"), "d1", "f1").unwrap();
        assert_eq!(hit.values, vec![0.25, 0.5]);
        assert_eq!(reopened.len(), 1);

        assert!(reopened.get(&InstanceId::new("p1"), "changed", "f1").is_none());
        assert_eq!(reopened.stats().stale, 1);
    }

    #[test]
    fn digest_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.mps");
        std::fs::write(&path, "NAME x\n").unwrap();
        let first = content_digest(&path).unwrap();
        assert_eq!(first.len(), 64);
        std::fs::write(&path, "NAME y\n").unwrap();
        assert_ne!(first, content_digest(&path).unwrap());
    }
}
