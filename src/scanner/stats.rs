use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

/// In-memory counters for the current process, separate from the durable
/// progress row in persistence.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanStats {
    pub start_time: i64,
    pub total_queries: usize,
    pub processed_queries: usize,
    pub total_files: u64,
    pub processed_files: u64,
    pub valid_keys: u64,
    pub rate_limited_keys: u64,
    pub error_count: u64,
    pub current_query: String,
    pub is_active: bool,
}

/// All mutation goes through `update`, all reads take a full copy, so no
/// caller ever observes a half-applied change.
pub struct StatsHandle {
    inner: RwLock<ScanStats>,
}

impl StatsHandle {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ScanStats {
                start_time: Utc::now().timestamp(),
                ..Default::default()
            }),
        }
    }

    pub fn update<F: FnOnce(&mut ScanStats)>(&self, f: F) {
        let mut stats = self.inner.write();
        f(&mut stats);
    }

    pub fn snapshot(&self) -> ScanStats {
        self.inner.read().clone()
    }
}

impl Default for StatsHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_are_visible_in_the_next_snapshot() {
        let handle = StatsHandle::new();
        handle.update(|s| {
            s.total_files += 10;
            s.current_query = "AIzaSy in:file".to_string();
        });
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.total_files, 10);
        assert_eq!(snapshot.current_query, "AIzaSy in:file");
    }

    #[test]
    fn snapshot_is_a_copy_not_a_view() {
        let handle = StatsHandle::new();
        let before = handle.snapshot();
        handle.update(|s| s.valid_keys = 5);
        assert_eq!(before.valid_keys, 0);
        assert_eq!(handle.snapshot().valid_keys, 5);
    }
}
