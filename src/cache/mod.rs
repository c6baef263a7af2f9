//! The shared page cache and the pinning guards over it.
//!
//! Committed pages are immutable, so the cache maps `(resource id, file
//! offset)` to shared page handles and never invalidates an entry in place.
//! A [`PageGuard`] pins a page's bytes for as long as it is held; dropping
//! the guard returns the page to the eviction candidates without copying.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::page::Page;
use crate::types::{RastroError, Result};

/// Default number of cached pages per resource store.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Cache key: offsets are stable forever, so they identify a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Owning resource.
    pub resource_id: u64,
    /// Frame offset in the data file.
    pub offset: u64,
}

/// Shared cache of immutable, committed pages.
pub struct PageCache {
    inner: Mutex<LruCache<CacheKey, Arc<Page>>>,
}

impl PageCache {
    /// A cache bounded to `capacity` pages.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or(RastroError::Invalid("cache capacity must be non-zero"))?;
        Ok(Self {
            inner: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Looks up a page, refreshing its recency.
    pub fn get(&self, key: CacheKey) -> Option<Arc<Page>> {
        self.inner.lock().get(&key).cloned()
    }

    /// Inserts a committed page. Entries are immutable; a duplicate insert
    /// for the same offset carries identical bytes by construction.
    pub fn insert(&self, key: CacheKey, page: Arc<Page>) {
        self.inner.lock().put(key, page);
    }

    /// Drops every entry belonging to `resource_id`; used after truncation,
    /// which is the one operation that retires offsets.
    pub fn purge_resource(&self, resource_id: u64) {
        let mut guard = self.inner.lock();
        let keys: Vec<CacheKey> = guard
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| k.resource_id == resource_id)
            .collect();
        for key in keys {
            guard.pop(&key);
        }
    }

    /// Current number of cached pages.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pins a cached page behind a guard.
    pub fn pin(&self, key: CacheKey) -> Option<PageGuard> {
        self.get(key).map(|page| PageGuard { key, page })
    }
}

/// A counted pin on one page.
///
/// While the guard lives, the page's bytes cannot be reclaimed even if the
/// cache evicts the entry. Reacquiring after release yields identical bytes
/// as long as no commit retired the offset (offsets of live revisions are
/// stable forever).
pub struct PageGuard {
    key: CacheKey,
    page: Arc<Page>,
}

impl PageGuard {
    /// Builds a guard over an already-resolved page.
    pub fn new(key: CacheKey, page: Arc<Page>) -> Self {
        Self { key, page }
    }

    /// The cache key this guard pins.
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// The pinned page.
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Shares the pinned page.
    pub fn page_arc(&self) -> Arc<Page> {
        Arc::clone(&self.page)
    }
}
