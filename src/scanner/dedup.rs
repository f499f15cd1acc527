use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use url::Url;

/// Record kept for each unique artifact admitted this process.
#[derive(Debug, Clone)]
pub struct UrlInfo {
    pub url: String,
    pub repository: String,
    pub path: String,
    pub hash: String,
    pub priority: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DedupStats {
    pub total_seen: usize,
    pub unique_urls: usize,
    pub duplicates: usize,
}

struct Inner {
    seen: HashSet<String>,
    cache: HashMap<String, UrlInfo>,
    rejected: usize,
}

/// In-process artifact deduplicator. Two keys per artifact: the canonical
/// URL and a content hash of `repo:path`, so the same file reached through
/// different queries (or differently-decorated URLs) is fetched once.
/// The durable `shas_seen` set in persistence stays authoritative across
/// restarts; this only collapses duplicates within one process.
pub struct Deduplicator {
    inner: Mutex<Inner>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                seen: HashSet::new(),
                cache: HashMap::new(),
                rejected: 0,
            }),
        }
    }

    /// Returns `true` exactly once per logical artifact per process.
    pub fn try_add(&self, raw_url: &str, repository: &str, path: &str, priority: usize) -> bool {
        let normalized = normalize_url(raw_url);
        let hash = content_hash(repository, path);

        let mut inner = self.inner.lock();
        if inner.seen.contains(&normalized) || inner.seen.contains(&hash) {
            inner.rejected += 1;
            return false;
        }
        inner.seen.insert(normalized.clone());
        inner.seen.insert(hash.clone());
        inner.cache.insert(
            normalized.clone(),
            UrlInfo {
                url: normalized,
                repository: repository.to_string(),
                path: path.to_string(),
                hash,
                priority,
            },
        );
        true
    }

    /// Unique artifacts admitted so far, highest phase priority first.
    pub fn unique_items(&self) -> Vec<UrlInfo> {
        let inner = self.inner.lock();
        let mut items: Vec<UrlInfo> = inner.cache.values().cloned().collect();
        items.sort_by(|a, b| b.priority.cmp(&a.priority));
        items
    }

    pub fn stats(&self) -> DedupStats {
        let inner = self.inner.lock();
        DedupStats {
            total_seen: inner.cache.len() + inner.rejected,
            unique_urls: inner.cache.len(),
            duplicates: inner.rejected,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.seen.clear();
        inner.cache.clear();
        inner.rejected = 0;
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheme + host + path with the trailing slash stripped; query and fragment
/// removed. Unparseable input is used verbatim.
fn normalize_url(raw_url: &str) -> String {
    let Ok(mut parsed) = Url::parse(raw_url) else {
        return raw_url.to_string();
    };
    parsed.set_query(None);
    parsed.set_fragment(None);
    let normalized = parsed.to_string();
    normalized.trim_end_matches('/').to_string()
}

/// First 16 hex chars of `SHA-256(repo + ":" + path)`.
fn content_hash(repository: &str, path: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", repository, path).as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_add_of_the_same_url_is_rejected() {
        let dedup = Deduplicator::new();
        assert!(dedup.try_add(
            "https://github.com/octo/app/blob/main/a.py",
            "octo/app",
            "a.py",
            1
        ));
        assert!(!dedup.try_add(
            "https://github.com/octo/app/blob/main/a.py",
            "octo/app",
            "a.py",
            2
        ));
    }

    #[test]
    fn query_string_and_fragment_do_not_defeat_dedup() {
        let dedup = Deduplicator::new();
        assert!(dedup.try_add(
            "https://github.com/octo/app/blob/main/a.py",
            "octo/app",
            "a.py",
            1
        ));
        assert!(!dedup.try_add(
            "https://github.com/octo/app/blob/main/a.py?plain=1#L10",
            "octo/app",
            "a.py",
            1
        ));
    }

    #[test]
    fn same_repo_and_path_under_a_different_url_is_rejected() {
        let dedup = Deduplicator::new();
        assert!(dedup.try_add(
            "https://github.com/octo/app/blob/main/a.py",
            "octo/app",
            "a.py",
            1
        ));
        // Different ref in the URL, same (repo, path) content hash.
        assert!(!dedup.try_add(
            "https://github.com/octo/app/blob/dev/a.py",
            "octo/app",
            "a.py",
            1
        ));
    }

    #[test]
    fn trailing_slash_is_canonicalized_away() {
        assert_eq!(
            normalize_url("https://github.com/octo/app/"),
            "https://github.com/octo/app"
        );
    }

    #[test]
    fn content_hash_is_16_hex_chars() {
        let hash = content_hash("octo/app", "src/a.py");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash, content_hash("octo/app", "src/b.py"));
    }

    #[test]
    fn unique_items_are_ordered_by_descending_priority() {
        let dedup = Deduplicator::new();
        dedup.try_add("https://github.com/a/a/blob/main/1.py", "a/a", "1.py", 1);
        dedup.try_add("https://github.com/b/b/blob/main/2.py", "b/b", "2.py", 3);
        dedup.try_add("https://github.com/c/c/blob/main/3.py", "c/c", "3.py", 2);

        let priorities: Vec<usize> = dedup.unique_items().iter().map(|i| i.priority).collect();
        assert_eq!(priorities, vec![3, 2, 1]);
    }

    #[test]
    fn clear_resets_the_process_scope() {
        let dedup = Deduplicator::new();
        dedup.try_add("https://github.com/a/a/blob/main/1.py", "a/a", "1.py", 1);
        dedup.clear();
        assert!(dedup.try_add("https://github.com/a/a/blob/main/1.py", "a/a", "1.py", 1));
    }
}
