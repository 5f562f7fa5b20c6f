//! Per-group pool policy resolution.
//!
//! A [`GroupedJobInitializer`] tells the executor how large a group's worker
//! pool is and how long it may sit idle before being torn down. Policies are
//! configured on path prefixes and resolved by nearest ancestor.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use super::group::JobGroupPath;
use crate::config::ExecutorConfig;

/// Pool policy for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedJobInitializer {
    pool_size: usize,
    #[serde(with = "humantime_serde")]
    keep_alive: Duration,
}

impl GroupedJobInitializer {
    /// `pool_size` is clamped to at least one worker.
    pub fn new(pool_size: usize, keep_alive: Duration) -> Self {
        Self {
            pool_size: pool_size.max(1),
            keep_alive,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn keep_alive_millis(&self) -> u64 {
        self.keep_alive.as_millis() as u64
    }
}

#[derive(Debug, Default)]
struct ResolutionCache {
    entries: HashMap<JobGroupPath, GroupedJobInitializer>,
    order: VecDeque<JobGroupPath>,
}

/// Resolves and caches [`GroupedJobInitializer`]s.
#[derive(Debug)]
pub struct GroupedJobInitializerManager {
    configured: RwLock<HashMap<JobGroupPath, GroupedJobInitializer>>,
    default: RwLock<GroupedJobInitializer>,
    cache: Mutex<ResolutionCache>,
    capacity: usize,
}

impl GroupedJobInitializerManager {
    pub fn new(default: GroupedJobInitializer, cache_capacity: usize) -> Self {
        Self {
            configured: RwLock::new(HashMap::new()),
            default: RwLock::new(default),
            cache: Mutex::new(ResolutionCache::default()),
            capacity: cache_capacity,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        let manager = Self::new(
            GroupedJobInitializer::new(config.grouped_pool_size, config.grouped_keep_alive),
            config.grouped_initializer_cache_size,
        );
        for group in &config.groups {
            manager.configure(
                JobGroupPath::new(group.path.iter().cloned()),
                GroupedJobInitializer::new(group.pool_size, group.keep_alive),
            );
        }
        manager
    }

    /// Set the policy for `path` and everything below it.
    ///
    /// Cached resolutions are kept until [`invalidate_cache`](Self::invalidate_cache).
    pub fn configure(&self, path: JobGroupPath, initializer: GroupedJobInitializer) {
        tracing::debug!(
            group = %path,
            pool_size = initializer.pool_size(),
            keep_alive_ms = initializer.keep_alive_millis(),
            "Configured grouped job initializer"
        );
        self.configured.write().insert(path, initializer);
    }

    /// Replace the fallback used when no configured prefix matches.
    pub fn set_default(&self, initializer: GroupedJobInitializer) {
        *self.default.write() = initializer;
    }

    pub fn default_initializer(&self) -> GroupedJobInitializer {
        *self.default.read()
    }

    /// Policy for `path`: exact match, then nearest ancestor, then the default.
    pub fn get_grouped_job_initializer(&self, path: &JobGroupPath) -> GroupedJobInitializer {
        if let Some(cached) = self.cache.lock().entries.get(path) {
            return *cached;
        }

        let resolved = {
            let configured = self.configured.read();
            std::iter::once(path.clone())
                .chain(path.ancestors())
                .find_map(|candidate| configured.get(&candidate).copied())
                .unwrap_or_else(|| *self.default.read())
        };

        self.remember(path, resolved);
        resolved
    }

    fn remember(&self, path: &JobGroupPath, initializer: GroupedJobInitializer) {
        if self.capacity == 0 {
            return;
        }

        let mut cache = self.cache.lock();
        if cache.entries.insert(path.clone(), initializer).is_none() {
            cache.order.push_back(path.clone());
        }
        while cache.entries.len() > self.capacity {
            match cache.order.pop_front() {
                Some(oldest) => {
                    cache.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Drop every cached resolution. Running group pools keep their settings.
    pub fn invalidate_cache(&self) {
        let mut cache = self.cache.lock();
        let dropped = cache.entries.len();
        cache.entries.clear();
        cache.order.clear();
        tracing::debug!(dropped, "Grouped job initializer cache invalidated");
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;

    fn path(segments: &[&str]) -> JobGroupPath {
        JobGroupPath::new(segments.iter().copied())
    }

    fn manager() -> GroupedJobInitializerManager {
        let manager = GroupedJobInitializerManager::new(
            GroupedJobInitializer::new(1, Duration::from_secs(60)),
            16,
        );
        manager.configure(path(&["install"]), GroupedJobInitializer::new(4, Duration::from_secs(5)));
        manager
    }

    #[test]
    fn test_nearest_ancestor_wins() {
        let manager = manager();
        manager.configure(
            path(&["install", "plugins"]),
            GroupedJobInitializer::new(2, Duration::ZERO),
        );

        let resolved = manager.get_grouped_job_initializer(&path(&["install", "plugins", "a"]));
        assert_eq!(resolved.pool_size(), 2);

        let resolved = manager.get_grouped_job_initializer(&path(&["install", "core"]));
        assert_eq!(resolved.pool_size(), 4);
    }

    #[test]
    fn test_default_fallback() {
        let manager = manager();
        let resolved = manager.get_grouped_job_initializer(&path(&["scan"]));
        assert_eq!(resolved, GroupedJobInitializer::new(1, Duration::from_secs(60)));
    }

    #[test]
    fn test_cache_until_invalidated() {
        let manager = manager();
        let target = path(&["install", "x"]);
        assert_eq!(manager.get_grouped_job_initializer(&target).pool_size(), 4);

        manager.configure(path(&["install"]), GroupedJobInitializer::new(8, Duration::ZERO));
        assert_eq!(manager.get_grouped_job_initializer(&target).pool_size(), 4);

        manager.invalidate_cache();
        assert_eq!(manager.cached_len(), 0);
        assert_eq!(manager.get_grouped_job_initializer(&target).pool_size(), 8);
    }

    #[test]
    fn test_cache_is_bounded() {
        let manager = GroupedJobInitializerManager::new(
            GroupedJobInitializer::new(1, Duration::ZERO),
            2,
        );
        for name in ["a", "b", "c"] {
            manager.get_grouped_job_initializer(&path(&[name]));
        }
        assert_eq!(manager.cached_len(), 2);
    }

    #[test]
    fn test_pool_size_is_at_least_one() {
        assert_eq!(GroupedJobInitializer::new(0, Duration::ZERO).pool_size(), 1);
    }

    #[test]
    fn test_from_config() {
        let config = ExecutorConfig {
            groups: vec![GroupConfig {
                path: vec!["scan".into()],
                pool_size: 3,
                keep_alive: Duration::from_millis(10),
            }],
            ..Default::default()
        };

        let manager = GroupedJobInitializerManager::from_config(&config);
        let resolved = manager.get_grouped_job_initializer(&path(&["scan", "deep"]));
        assert_eq!(resolved.pool_size(), 3);
        assert_eq!(resolved.keep_alive_millis(), 10);
    }
}
