//! # Sandbox Cache & Grouping
//!
//! Sandboxes are expensive: each one owns a worker thread and a full set of loaded classes. The
//! [`SandboxCache`] hands out one sandbox per distinct [`Configuration`], bounded by an LRU
//! capacity. Evicted sandboxes are shut down immediately; a shut-down entry found on access is
//! replaced by a fresh sandbox.
//!
//! [`group_by_required_sandbox`] partitions test methods by the sandbox they need, so each
//! sandbox is configured once per group instead of once per method.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::classes::ClassSource;
use crate::config::Configuration;
use crate::diagnostics::ConfigurationError;
use crate::sandbox::{HostContext, Sandbox};

pub const DEFAULT_MAX_SANDBOXES: usize = 8;

#[derive(Default)]
struct Entries {
    by_config: HashMap<Configuration, Arc<Sandbox>>,
    /// Least recently used first.
    recency: VecDeque<Configuration>,
}

impl Entries {
    fn touch(&mut self, config: &Configuration) {
        if let Some(pos) = self.recency.iter().position(|c| c == config) {
            if let Some(config) = self.recency.remove(pos) {
                self.recency.push_back(config);
            }
        }
    }

    fn remove(&mut self, config: &Configuration) -> Option<Arc<Sandbox>> {
        self.recency.retain(|c| c != config);
        self.by_config.remove(config)
    }
}

pub struct SandboxCache {
    capacity: usize,
    source: Arc<dyn ClassSource>,
    host: Arc<HostContext>,
    entries: Mutex<Entries>,
    constructions: AtomicUsize,
}

impl SandboxCache {
    pub fn new(capacity: usize, source: Arc<dyn ClassSource>) -> Self {
        let host = Arc::new(HostContext::new(Arc::clone(&source)));
        Self::with_host(capacity, source, host)
    }

    pub fn with_host(capacity: usize, source: Arc<dyn ClassSource>, host: Arc<HostContext>) -> Self {
        Self {
            capacity: capacity.max(1),
            source,
            host,
            entries: Mutex::new(Entries::default()),
            constructions: AtomicUsize::new(0),
        }
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The live sandbox for `config`, building one on a miss or if the cached one is shut down.
    pub fn obtain(&self, config: &Configuration) -> Arc<Sandbox> {
        let mut evicted = Vec::new();
        let sandbox = {
            let mut entries = self.entries.lock();
            match entries.by_config.get(config).cloned() {
                Some(sandbox) if !sandbox.is_shut_down() => {
                    entries.touch(config);
                    tracing::trace!(sandbox = %sandbox.id(), "sandbox cache hit");
                    return sandbox;
                }
                Some(stale) => {
                    tracing::debug!(sandbox = %stale.id(), "replacing shut-down sandbox");
                    entries.remove(config);
                }
                None => {}
            }

            let sandbox = Arc::new(Sandbox::new(
                config.clone(),
                Arc::clone(&self.source),
                Arc::clone(&self.host),
            ));
            self.constructions.fetch_add(1, Ordering::SeqCst);
            entries.by_config.insert(config.clone(), Arc::clone(&sandbox));
            entries.recency.push_back(config.clone());

            while entries.by_config.len() > self.capacity {
                let Some(oldest) = entries.recency.pop_front() else {
                    break;
                };
                if let Some(old) = entries.by_config.remove(&oldest) {
                    evicted.push(old);
                }
            }
            sandbox
        };

        for old in evicted {
            tracing::debug!(sandbox = %old.id(), "evicting sandbox");
            old.shutdown();
        }
        sandbox
    }

    /// Removes and shuts down the sandbox cached for `config`.
    pub fn evict(&self, config: &Configuration) -> Option<Arc<Sandbox>> {
        let removed = self.entries.lock().remove(config);
        if let Some(sandbox) = &removed {
            sandbox.shutdown();
        }
        removed
    }

    /// Number of sandboxes this cache has built.
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().by_config.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shuts down every cached sandbox.
    pub fn clear(&self) {
        let drained: Vec<Arc<Sandbox>> = {
            let mut entries = self.entries.lock();
            entries.recency.clear();
            entries.by_config.drain().map(|(_, sandbox)| sandbox).collect()
        };
        for sandbox in drained {
            sandbox.shutdown();
        }
    }
}

/// Methods that share one sandbox, in discovery order.
#[derive(Debug)]
pub struct SandboxGroup<M> {
    pub sandbox: Arc<Sandbox>,
    pub configuration: Configuration,
    pub methods: Vec<M>,
}

#[derive(Debug)]
pub struct Grouping<M> {
    pub groups: Vec<SandboxGroup<M>>,
    /// Methods whose configuration could not be built. They belong to no group.
    pub rejected: Vec<(M, ConfigurationError)>,
}

impl<M> Grouping<M> {
    pub fn method_count(&self) -> usize {
        self.groups.iter().map(|g| g.methods.len()).sum::<usize>() + self.rejected.len()
    }
}

/// Groups `methods` by the sandbox their configuration requires.
///
/// Groups appear in the order their first method was discovered; methods keep their relative
/// order within a group.
pub fn group_by_required_sandbox<M, I, F>(
    cache: &SandboxCache,
    methods: I,
    mut configure: F,
) -> Grouping<M>
where
    I: IntoIterator<Item = M>,
    F: FnMut(&M) -> Result<Configuration, ConfigurationError>,
{
    let mut groups: Vec<SandboxGroup<M>> = Vec::new();
    let mut rejected = Vec::new();
    for method in methods {
        let configuration = match configure(&method) {
            Ok(configuration) => configuration,
            Err(error) => {
                rejected.push((method, error));
                continue;
            }
        };
        let sandbox = cache.obtain(&configuration);
        match groups
            .iter_mut()
            .find(|group| Arc::ptr_eq(&group.sandbox, &sandbox))
        {
            Some(group) => group.methods.push(method),
            None => groups.push(SandboxGroup {
                sandbox,
                configuration,
                methods: vec![method],
            }),
        }
    }
    tracing::debug!(groups = groups.len(), rejected = rejected.len(), "grouped methods");
    Grouping { groups, rejected }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::ClassPath;

    fn cache(capacity: usize) -> SandboxCache {
        SandboxCache::new(capacity, Arc::new(ClassPath::new()))
    }

    fn config(package: &str) -> Configuration {
        Configuration::builder()
            .instrument_package(package, "test")
            .unwrap()
            .build()
    }

    #[test]
    fn test_same_configuration_reuses_sandbox() {
        let cache = cache(4);
        let a = cache.obtain(&config("a"));
        let again = cache.obtain(&config("a"));
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(cache.constructions(), 1);
    }

    #[test]
    fn test_shut_down_entry_is_rebuilt() {
        let cache = cache(4);
        let first = cache.obtain(&config("a"));
        first.shutdown();
        let second = cache.obtain(&config("a"));
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_shut_down());
        assert_eq!(cache.constructions(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_eviction_shuts_down_oldest() {
        let cache = cache(2);
        let a = cache.obtain(&config("a"));
        let b = cache.obtain(&config("b"));
        cache.obtain(&config("a"));
        let c = cache.obtain(&config("c"));
        assert!(b.is_shut_down());
        assert!(!a.is_shut_down());
        assert!(!c.is_shut_down());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_grouping_preserves_discovery_order() {
        let cache = cache(4);
        let methods = vec![("m1", "x"), ("m2", "y"), ("m3", "x"), ("m4", "bad..pkg"), ("m5", "y")];
        let grouping = group_by_required_sandbox(&cache, methods, |(_, pkg)| {
            Configuration::builder()
                .instrument_package(pkg, "test")
                .map(|b| b.build())
        });
        let names: Vec<Vec<&str>> = grouping
            .groups
            .iter()
            .map(|g| g.methods.iter().map(|(name, _)| *name).collect())
            .collect();
        assert_eq!(names, vec![vec!["m1", "m3"], vec!["m2", "m5"]]);
        assert_eq!(grouping.rejected.len(), 1);
        assert_eq!(grouping.rejected[0].0 .0, "m4");
        assert_eq!(grouping.method_count(), 5);
        assert_eq!(cache.constructions(), 2);
    }
}
