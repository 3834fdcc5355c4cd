//! Per-instance DNS resolution cache.
//!
//! A dependent's env names its dependencies by canonical hostname
//! (`api-staging-acme.{domain}`). The edge answering for that name may point
//! at an isolated fork (`ab12cd--api-staging-acme.{domain}`), so each cache
//! entry maps hostname to the edge snapshot, with a fork's edge also filed
//! under the hostname of the instance it was forked from. Entries are filled
//! lazily from the store and dropped whenever the source's edges change.
//!
//! Every invalidation bumps the source's generation. A fill only lands if
//! the generation it started from is still current, so an entry built from
//! a document read before a concurrent edge change is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use isogrid_core::canonical_hostname;
use isogrid_state::{GraphNode, Instance, StateResult, StateStore};

type Entry = HashMap<String, GraphNode>;

#[derive(Default)]
struct Cache {
    entries: HashMap<String, Entry>,
    generations: HashMap<String, u64>,
}

impl Cache {
    fn generation(&self, source_id: &str) -> u64 {
        self.generations.get(source_id).copied().unwrap_or(0)
    }
}

/// Resolution cache shared by every graph mutation.
#[derive(Clone, Default)]
pub struct DnsCache {
    cache: Arc<RwLock<Cache>>,
    invalidations: Arc<AtomicU64>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `hostname` as seen from `source_id`.
    ///
    /// Returns `None` if the source is unknown or has no edge answering for
    /// the hostname.
    pub fn resolve(
        &self,
        store: &StateStore,
        source_id: &str,
        hostname: &str,
    ) -> StateResult<Option<GraphNode>> {
        self.resolve_with(store, source_id, hostname, || {})
    }

    /// [`resolve`](Self::resolve), running `before_fill` between the store
    /// read and the cache insert.
    fn resolve_with<F: FnOnce()>(
        &self,
        store: &StateStore,
        source_id: &str,
        hostname: &str,
        before_fill: F,
    ) -> StateResult<Option<GraphNode>> {
        let key = hostname.to_ascii_lowercase();
        let generation = {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.entries.get(source_id) {
                return Ok(entry.get(&key).cloned());
            }
            cache.generation(source_id)
        };

        let Some(source) = store.get_instance(source_id)? else {
            return Ok(None);
        };
        let entry = build_entry(store, &source)?;
        let node = entry.get(&key).cloned();
        before_fill();

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let filled = cache.generation(source_id) == generation;
        if filled {
            cache.entries.insert(source_id.to_string(), entry);
        }
        debug!(%source_id, %hostname, hit = node.is_some(), filled, "dns entry resolved");
        Ok(node)
    }

    /// Drop the cached entry for a source instance.
    pub fn invalidate(&self, source_id: &str) {
        {
            let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
            cache.entries.remove(source_id);
            *cache.generations.entry(source_id.to_string()).or_default() += 1;
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(%source_id, "dns entry invalidated");
    }

    /// Total invalidations issued since creation.
    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Number of cached source entries.
    pub fn len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every hostname the source's edges answer for.
///
/// An edge to an isolated fork also answers for the hostname of the instance
/// it was forked from, which wins over a direct edge to that instance.
fn build_entry(store: &StateStore, source: &Instance) -> StateResult<Entry> {
    let mut entry = Entry::new();
    let mut forks = Vec::new();
    for node in &source.dependencies {
        entry.insert(node.elastic_hostname.to_ascii_lowercase(), node.clone());
        let Some(target) = store.get_instance(&node.instance_id)? else {
            continue;
        };
        if !target.is_isolated_fork() {
            continue;
        }
        let parent = match target.parent.as_deref() {
            Some(hash) => store.find_instance_by_short_hash(hash)?,
            None => None,
        };
        let canonical = match parent {
            Some(parent) => parent.elastic_hostname.to_ascii_lowercase(),
            None => canonical_hostname(&target.elastic_hostname),
        };
        forks.push((canonical, node.clone()));
    }
    entry.extend(forks);
    Ok(entry)
}
