use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use tracing::{debug, info};

use crate::{
    cache::PageCache,
    common::{PageID, Permission, TransactionID, TransactionIDGenerator},
    config::Config,
    error::{StorageError, StorageResult},
    lock::LockManager,
    page::{HeapPage, Page},
};

/// Where pages live when they are not cached. The byte layout is up to the
/// implementation.
pub trait PageStore: Send + Sync {
    fn read_page(&self, page_id: PageID) -> Result<HeapPage>;
    fn write_page(&self, page: &HeapPage) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryPageStore {
    pages: Mutex<HashMap<PageID, Box<[u8]>>>,
}
impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }
}
impl PageStore for MemoryPageStore {
    fn read_page(&self, page_id: PageID) -> Result<HeapPage> {
        let pages = self.pages.lock().map_err(|_| anyhow!("lock error"))?;
        Ok(match pages.get(&page_id) {
            Some(data) => HeapPage::from_data(page_id, data),
            None => HeapPage::new(page_id),
        })
    }
    fn write_page(&self, page: &HeapPage) -> Result<()> {
        self.pages
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .insert(page.page_id(), page.data().into());
        Ok(())
    }
}

/// Entry point for transactions: page-level locking in front of a bounded
/// page cache backed by a [`PageStore`]. Pages written by a transaction stay
/// in memory until it commits (no steal) and are discarded if it aborts.
pub struct BufferPool {
    lock_manager: Arc<LockManager>,
    cache: PageCache<HeapPage>,
    store: Arc<dyn PageStore>,
    txn_ids: TransactionIDGenerator,
    dirtied: Mutex<HashMap<TransactionID, HashSet<PageID>>>,
}

impl BufferPool {
    pub fn new(capacity: usize, store: Arc<dyn PageStore>) -> Self {
        let lock_manager = Arc::new(LockManager::new());
        let cache = PageCache::new(capacity, lock_manager.clone());
        Self {
            lock_manager,
            cache,
            store,
            txn_ids: TransactionIDGenerator::default(),
            dirtied: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(config: &Config, store: Arc<dyn PageStore>) -> Self {
        Self::new(config.cache_capacity, store)
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    pub fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    // transactions

    pub fn begin(&self) -> StorageResult<TransactionID> {
        let txn_id = self.txn_ids.next();
        self.add_transaction(txn_id)?;
        info!(%txn_id, "begin");
        Ok(txn_id)
    }

    pub fn add_transaction(&self, txn_id: TransactionID) -> StorageResult<()> {
        self.lock_manager.add_transaction(txn_id)
    }

    pub fn complete_transaction(&self, txn_id: TransactionID) -> StorageResult<()> {
        self.lock_manager.complete_transaction(txn_id)
    }

    pub fn release_transaction(&self, txn_id: TransactionID) -> StorageResult<()> {
        self.lock_manager.release_transaction(txn_id)
    }

    /// Writes back the pages `txn_id` dirtied, then releases its locks.
    pub fn commit(&self, txn_id: TransactionID) -> Result<()> {
        let held = self.lock_manager.pages_held(txn_id)?;
        for page_id in self.take_dirtied(txn_id)? {
            if let Some(mut page) = self.cache.get(page_id)? {
                self.store.write_page(&page)?;
                page.mark_clean();
                self.install(page)?;
            }
        }
        self.finish(txn_id, &held, &HashSet::new())?;
        info!(%txn_id, "commit");
        Ok(())
    }

    /// Drops the pages `txn_id` dirtied, then releases its locks.
    pub fn abort(&self, txn_id: TransactionID) -> Result<()> {
        let held = self.lock_manager.pages_held(txn_id)?;
        let dirtied = self.take_dirtied(txn_id)?;
        self.cache_remove_all(&dirtied)?;
        // set-aside copies survive remove; replace them before unlocking
        for page_id in self.cache.pending_eviction()? {
            if dirtied.contains(&page_id) {
                self.install(self.store.read_page(page_id)?)?;
            }
        }
        self.finish(txn_id, &held, &dirtied)?;
        info!(%txn_id, "abort");
        Ok(())
    }

    fn finish(
        &self,
        txn_id: TransactionID,
        held: &[(PageID, Permission)],
        discard: &HashSet<PageID>,
    ) -> Result<()> {
        self.lock_manager.release_transaction(txn_id)?;
        for &(page_id, _) in held {
            if let Some(page) = self.reclaim_evicted(page_id)? {
                if page.is_dirty() && !discard.contains(&page_id) {
                    self.store.write_page(&page)?;
                }
                debug!(%page_id, "reclaimed set-aside page");
            }
        }
        self.lock_manager.complete_transaction(txn_id)?;
        Ok(())
    }

    fn take_dirtied(&self, txn_id: TransactionID) -> StorageResult<HashSet<PageID>> {
        Ok(self.dirtied.lock()?.remove(&txn_id).unwrap_or_default())
    }

    // locks

    pub fn acquire_lock(
        &self,
        txn_id: TransactionID,
        page_id: PageID,
        permission: Permission,
    ) -> StorageResult<()> {
        self.lock_manager.acquire(txn_id, page_id, permission)
    }

    pub fn release_lock(&self, txn_id: TransactionID, page_id: PageID) -> StorageResult<()> {
        self.lock_manager.release(txn_id, page_id)
    }

    pub fn release_all_locks_on_page(&self, page_id: PageID) -> StorageResult<()> {
        self.lock_manager.release_page(page_id)
    }

    pub fn interrupt(&self, txn_id: TransactionID) -> StorageResult<bool> {
        self.lock_manager.interrupt(txn_id)
    }

    pub fn holds_lock(&self, txn_id: TransactionID, page_id: PageID) -> StorageResult<bool> {
        self.lock_manager.holds_lock(txn_id, page_id)
    }

    pub fn page_is_locked(&self, page_id: PageID) -> StorageResult<bool> {
        self.lock_manager.page_is_locked(page_id)
    }

    pub fn page_is_locked_by_writer(&self, page_id: PageID) -> StorageResult<bool> {
        self.lock_manager.page_is_locked_by_writer(page_id)
    }

    // pages

    /// Locks the page for `txn_id` and returns its current version, loading it
    /// from the store on a miss.
    pub fn get_page(
        &self,
        txn_id: TransactionID,
        page_id: PageID,
        permission: Permission,
    ) -> Result<HeapPage> {
        self.acquire_lock(txn_id, page_id, permission)?;
        if let Some(page) = self.cache_get(page_id)? {
            return Ok(page);
        }
        let page = self.store.read_page(page_id)?;
        self.install(page.clone())?;
        Ok(page)
    }

    /// Stores a modified page. `txn_id` must hold the exclusive lock on it.
    pub fn write_page(&self, txn_id: TransactionID, mut page: HeapPage) -> Result<()> {
        let page_id = page.page_id();
        if self.lock_manager.permission(txn_id, page_id)? != Some(Permission::Exclusive) {
            return Err(StorageError::InvariantViolation(format!(
                "{} writes page {} without an exclusive lock",
                txn_id, page_id
            ))
            .into());
        }
        page.mark_dirty(txn_id);
        self.install(page)?;
        self.dirtied
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .entry(txn_id)
            .or_default()
            .insert(page_id);
        Ok(())
    }

    /// Removes a page from the cache and the lock table altogether, stripping
    /// whoever still holds it. Unsaved changes to the page are lost.
    pub fn discard_page(&self, page_id: PageID) -> Result<()> {
        self.cache_remove(page_id)?;
        self.release_all_locks_on_page(page_id)?;
        // a set-aside copy is only reclaimable once nobody write-locks it
        self.reclaim_evicted(page_id)?;
        for pages in self
            .dirtied
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .values_mut()
        {
            pages.remove(&page_id);
        }
        self.lock_manager.remove_page(page_id)?;
        Ok(())
    }

    /// Writes back dirty cached pages whose transaction is no longer active.
    /// Pages of running transactions stay in memory until they commit.
    pub fn flush_all(&self) -> Result<()> {
        for mut page in self.cache_snapshot()? {
            let Some(txn_id) = page.dirtied_by() else {
                continue;
            };
            if self.lock_manager.is_active(txn_id)? {
                debug!(%txn_id, page_id = %page.page_id(), "skipped flush of uncommitted page");
                continue;
            }
            self.store.write_page(&page)?;
            page.mark_clean();
            self.install(page)?;
        }
        Ok(())
    }

    fn install(&self, page: HeapPage) -> Result<()> {
        if let Some(evicted) = self.cache_put(page)? {
            if evicted.is_dirty() {
                self.store.write_page(&evicted)?;
            }
        }
        Ok(())
    }

    pub fn cache_get(&self, page_id: PageID) -> StorageResult<Option<HeapPage>> {
        self.cache.get(page_id)
    }

    pub fn cache_put(&self, page: HeapPage) -> StorageResult<Option<HeapPage>> {
        self.cache.put(page)
    }

    pub fn cache_remove(&self, page_id: PageID) -> StorageResult<Option<HeapPage>> {
        self.cache.remove(page_id)
    }

    pub fn cache_remove_all<'a, I>(&self, page_ids: I) -> StorageResult<()>
    where
        I: IntoIterator<Item = &'a PageID>,
    {
        self.cache.remove_all(page_ids)
    }

    pub fn cache_snapshot(&self) -> StorageResult<Vec<HeapPage>> {
        self.cache.pages()
    }

    pub fn pending_eviction(&self) -> StorageResult<Vec<PageID>> {
        self.cache.pending_eviction()
    }

    pub fn reclaim_evicted(&self, page_id: PageID) -> StorageResult<Option<HeapPage>> {
        self.cache.evict_if_not_used(page_id)
    }
}
