use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::{debug, warn};

use crate::{
    common::PageID,
    error::{StorageError, StorageResult},
    lock::LockManager,
    page::Page,
    recency::{NodeHandle, RecencyList},
};

/// Tells the cache whether a page is exclusively locked and so must not be
/// evicted. Queries must not block.
pub trait WriterProbe: Send + Sync {
    fn is_locked_by_writer(&self, page_id: PageID) -> StorageResult<bool>;
}

impl WriterProbe for LockManager {
    fn is_locked_by_writer(&self, page_id: PageID) -> StorageResult<bool> {
        self.page_is_locked_by_writer(page_id)
    }
}

struct CacheEntry<P> {
    page: P,
    handle: NodeHandle,
}

struct CacheState<P> {
    pages: HashMap<PageID, CacheEntry<P>>,
    recency: RecencyList<PageID>,
    // pushed out of `pages` while exclusively locked, waiting to be reclaimed
    pending_eviction: HashMap<PageID, P>,
}
impl<P> CacheState<P> {
    fn insert(&mut self, page_id: PageID, page: P) {
        let handle = self.recency.push_back(page_id);
        self.pages.insert(page_id, CacheEntry { page, handle });
    }
    fn remove(&mut self, page_id: PageID) -> Option<P> {
        let entry = self.pages.remove(&page_id)?;
        self.recency.remove(entry.handle);
        Some(entry.page)
    }
}

/// Bounded LRU cache of pages. Least recently used pages are evicted first,
/// except that exclusively locked pages are set aside instead of evicted.
pub struct PageCache<P> {
    capacity: usize,
    state: Mutex<CacheState<P>>,
    probe: Arc<dyn WriterProbe>,
}

impl<P: Page> PageCache<P> {
    pub fn new(capacity: usize, probe: Arc<dyn WriterProbe>) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState {
                pages: HashMap::with_capacity(capacity),
                recency: RecencyList::with_capacity(capacity),
                pending_eviction: HashMap::new(),
            }),
            probe,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> StorageResult<usize> {
        Ok(self.state.lock()?.pages.len())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, page_id: PageID) -> StorageResult<bool> {
        Ok(self.state.lock()?.pages.contains_key(&page_id))
    }

    /// A set-aside page is the latest version, so it wins over the main store.
    pub fn get(&self, page_id: PageID) -> StorageResult<Option<P>> {
        let mut guard = self.state.lock()?;
        let state = &mut *guard;
        if let Some(page) = state.pending_eviction.get(&page_id) {
            return Ok(Some(page.clone()));
        }
        match state.pages.get(&page_id) {
            Some(entry) => {
                state.recency.move_to_back(entry.handle);
                Ok(Some(entry.page.clone()))
            }
            None => Ok(None),
        }
    }

    /// Caches `page`, returning the page evicted to make room, if any.
    /// Fails with `CacheFull` if every cached page is exclusively locked.
    pub fn put(&self, page: P) -> StorageResult<Option<P>> {
        let page_id = page.page_id();
        let mut guard = self.state.lock()?;
        let state = &mut *guard;

        if let Some(entry) = state.pages.get_mut(&page_id) {
            entry.page = page;
            state.recency.move_to_back(entry.handle);
            return Ok(None);
        }
        if let Some(pending) = state.pending_eviction.get_mut(&page_id) {
            *pending = page;
            return Ok(None);
        }
        if state.pages.len() + state.pending_eviction.len() < self.capacity {
            state.insert(page_id, page);
            return Ok(None);
        }

        while let Some(victim_id) = state.recency.front().map(|(_, id)| *id) {
            if self.probe.is_locked_by_writer(victim_id)? {
                if let Some(victim) = state.remove(victim_id) {
                    state.pending_eviction.insert(victim_id, victim);
                }
                debug!(page_id = %victim_id, "write-locked page set aside");
                continue;
            }
            let evicted = state.remove(victim_id);
            state.insert(page_id, page);
            debug!(page_id = %victim_id, "evicted page");
            return Ok(evicted);
        }
        warn!(%page_id, capacity = self.capacity, "no evictable page");
        Err(StorageError::CacheFull)
    }

    pub fn remove(&self, page_id: PageID) -> StorageResult<Option<P>> {
        Ok(self.state.lock()?.remove(page_id))
    }

    pub fn remove_all<'a, I>(&self, page_ids: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = &'a PageID>,
    {
        let mut state = self.state.lock()?;
        for &page_id in page_ids {
            state.remove(page_id);
        }
        Ok(())
    }

    /// Hands back a set-aside page once nobody holds it exclusively anymore.
    pub fn evict_if_not_used(&self, page_id: PageID) -> StorageResult<Option<P>> {
        let mut state = self.state.lock()?;
        if !state.pending_eviction.contains_key(&page_id)
            || self.probe.is_locked_by_writer(page_id)?
        {
            return Ok(None);
        }
        Ok(state.pending_eviction.remove(&page_id))
    }

    /// Snapshot of the main store, least recently used first.
    pub fn pages(&self) -> StorageResult<Vec<P>> {
        let state = self.state.lock()?;
        Ok(state
            .recency
            .iter()
            .filter_map(|page_id| state.pages.get(page_id))
            .map(|entry| entry.page.clone())
            .collect())
    }

    pub fn pending_eviction(&self) -> StorageResult<Vec<PageID>> {
        let mut page_ids = self
            .state
            .lock()?
            .pending_eviction
            .keys()
            .copied()
            .collect::<Vec<_>>();
        page_ids.sort();
        Ok(page_ids)
    }
}
