//! Routing spans to per-destination sub-collectors.
//!
//! A trace may advertise its own destination host via `trace-host` metadata.
//! The pool lazily builds one sub-collector per allowed host, caps the total
//! cardinality, and evicts (closing the transport) when over the cap. Hosts
//! the allowlist rejects fall back to the default collector, so an attacker
//! controlling trace metadata cannot fan packets out to arbitrary targets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use tokio::runtime::Handle;
use tracing::debug;

use crate::collector::SubCollector;
use crate::error::Result;

/// Default cap on distinct destination hosts.
pub const DEFAULT_MAX_HOSTS: usize = 10_000;

/// Builds a sub-collector for a destination host.
pub type CollectorFactory = Arc<dyn Fn(&str) -> Result<Arc<SubCollector>> + Send + Sync>;

/// Maps destination hosts to dedicated sub-collectors, bounded in size.
pub struct CollectorPool {
    default: Arc<SubCollector>,
    factory: Option<CollectorFactory>,
    host_match: Option<Regex>,
    collectors: DashMap<String, Arc<SubCollector>>,
    count: AtomicUsize,
    max_hosts: usize,
    runtime: Handle,
}

impl CollectorPool {
    /// Creates a pool around the default collector.
    ///
    /// Captures the current tokio runtime so factory invocations from
    /// non-runtime producer threads can still spawn flusher tasks; must be
    /// called within a runtime.
    pub fn new(
        default: Arc<SubCollector>,
        factory: Option<CollectorFactory>,
        host_match: Option<Regex>,
    ) -> Self {
        Self {
            default,
            factory,
            host_match,
            collectors: DashMap::new(),
            count: AtomicUsize::new(0),
            max_hosts: DEFAULT_MAX_HOSTS,
            runtime: Handle::current(),
        }
    }

    /// Overrides the host cardinality cap.
    pub fn with_max_hosts(mut self, max_hosts: usize) -> Self {
        self.max_hosts = max_hosts;
        self
    }

    /// The collector spans without a destination host route to.
    pub fn default_collector(&self) -> &Arc<SubCollector> {
        &self.default
    }

    /// Number of destination-specific sub-collectors currently alive.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns true if no destination-specific sub-collectors exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the sub-collector for a span's advertised destination host.
    ///
    /// Falls back to the default collector when no factory is configured,
    /// the host is absent or empty, the allowlist rejects it, or the factory
    /// fails.
    pub fn route(&self, trace_host: Option<&str>) -> Arc<SubCollector> {
        let (factory, host) = match (&self.factory, trace_host) {
            (Some(factory), Some(host)) if !host.is_empty() => (factory, host),
            _ => return self.default.clone(),
        };

        if let Some(pattern) = &self.host_match {
            if !pattern.is_match(host) {
                return self.default.clone();
            }
        }

        if let Some(existing) = self.collectors.get(host) {
            return existing.clone();
        }

        if self.count.load(Ordering::Relaxed) >= self.max_hosts {
            self.evict_one();
        }

        let built = {
            let _guard = self.runtime.enter();
            match factory(host) {
                Ok(collector) => collector,
                Err(e) => {
                    debug!(host, error = %e, "failed to build sub-collector, using default");
                    return self.default.clone();
                }
            }
        };

        match self.collectors.entry(host.to_owned()) {
            Entry::Occupied(entry) => {
                // A racing insert won; release the one we just built.
                built.close();
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                self.count.fetch_add(1, Ordering::Relaxed);
                entry.insert(built.clone());
                built
            }
        }
    }

    /// Drops one arbitrary entry, closing its transport first.
    fn evict_one(&self) {
        let victim = self.collectors.iter().next().map(|e| e.key().clone());
        if let Some(key) = victim {
            if let Some((host, collector)) = self.collectors.remove(&key) {
                self.count.fetch_sub(1, Ordering::Relaxed);
                collector.close();
                debug!(host, "evicted sub-collector over host cap");
            }
        }
    }

    /// Closes every destination-specific sub-collector.
    ///
    /// The default collector is owned by the caller and left running.
    pub fn close_all(&self) {
        self.collectors.retain(|_, collector| {
            collector.close();
            false
        });
        self.count.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for CollectorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorPool")
            .field("hosts", &self.len())
            .field("max_hosts", &self.max_hosts)
            .finish()
    }
}
