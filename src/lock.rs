use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use tracing::{debug, info};

use crate::{
    common::{PageID, Permission, TransactionID},
    error::{StorageError, StorageResult},
};

use self::{upgradeable::UpgradeableLock, wait_for::WaitForGraph};

pub mod upgradeable;
pub mod wait_for;

type Holdings = HashMap<TransactionID, HashMap<PageID, Permission>>;

/// Page-level two-phase locking. Each page gets its own [`UpgradeableLock`];
/// before a transaction blocks on one, its wait is recorded in the
/// [`WaitForGraph`] so that circular waits are refused up front.
#[derive(Default)]
pub struct LockManager {
    holdings: Mutex<Holdings>,
    page_locks: RwLock<HashMap<PageID, Arc<UpgradeableLock>>>,
    wait_for_graph: WaitForGraph,
    waiting: Mutex<HashMap<TransactionID, (PageID, Arc<UpgradeableLock>)>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction(&self, txn_id: TransactionID) -> StorageResult<()> {
        let mut holdings = self.holdings.lock()?;
        if holdings.contains_key(&txn_id) {
            return Err(StorageError::InvariantViolation(format!(
                "{} is already added",
                txn_id
            )));
        }
        holdings.insert(txn_id, HashMap::new());
        self.wait_for_graph.add_transaction(txn_id)
    }

    pub fn complete_transaction(&self, txn_id: TransactionID) -> StorageResult<()> {
        {
            let mut holdings = self.holdings.lock()?;
            match holdings.get(&txn_id) {
                None => {
                    return Err(StorageError::InvariantViolation(format!(
                        "{} not found",
                        txn_id
                    )))
                }
                Some(held) if !held.is_empty() => {
                    return Err(StorageError::InvariantViolation(format!(
                        "{} still holds {} lock(s)",
                        txn_id,
                        held.len()
                    )))
                }
                Some(_) => {}
            }
            holdings.remove(&txn_id);
        }
        self.wait_for_graph.remove_transaction(txn_id)
    }

    pub fn add_page(&self, page_id: PageID) -> StorageResult<()> {
        self.page_lock(page_id)?;
        Ok(())
    }

    /// Forgets the lock of a page that left the cache. The page must not be held.
    pub fn remove_page(&self, page_id: PageID) -> StorageResult<()> {
        let mut page_locks = self.page_locks.write()?;
        if let Some(lock) = page_locks.get(&page_id) {
            if lock.is_held()? {
                return Err(StorageError::InvariantViolation(format!(
                    "page {} is in use",
                    page_id
                )));
            }
        }
        page_locks.remove(&page_id);
        Ok(())
    }

    pub fn acquire(
        &self,
        txn_id: TransactionID,
        page_id: PageID,
        permission: Permission,
    ) -> StorageResult<()> {
        self.holdings.lock()?.entry(txn_id).or_default();
        self.wait_for_graph.add_transaction(txn_id)?;
        loop {
            let lock = self.page_lock(page_id)?;
            self.lock_physical(txn_id, page_id, &lock, permission)?;
            // remove_page may have dropped the entry before the grant; the
            // lock is only valid while the table still points at it
            if self.is_current(page_id, &lock)? {
                break;
            }
            debug!(%txn_id, %page_id, "page lock replaced while waiting, retrying");
            match permission {
                Permission::Shared => lock.read_unlock(txn_id)?,
                Permission::Exclusive => lock.write_unlock(txn_id)?,
            }
        }

        let mut holdings = self.holdings.lock()?;
        let held = holdings
            .entry(txn_id)
            .or_default()
            .entry(page_id)
            .or_insert(permission);
        *held = (*held).max(permission);
        debug!(%txn_id, %page_id, %permission, "lock granted");
        Ok(())
    }

    pub fn release(&self, txn_id: TransactionID, page_id: PageID) -> StorageResult<()> {
        let permission = self.permission(txn_id, page_id)?.ok_or_else(|| {
            StorageError::InvariantViolation(format!(
                "{} holds no lock on page {}",
                txn_id, page_id
            ))
        })?;
        self.unlock(txn_id, page_id, permission)?;
        if let Some(held) = self.holdings.lock()?.get_mut(&txn_id) {
            held.remove(&page_id);
        }
        debug!(%txn_id, %page_id, "lock released");
        Ok(())
    }

    /// Releases every lock of `txn_id`, on commit or abort. The transaction
    /// stays registered until `complete_transaction`.
    pub fn release_transaction(&self, txn_id: TransactionID) -> StorageResult<()> {
        let held = self
            .holdings
            .lock()?
            .get(&txn_id)
            .map(|held| held.iter().map(|(&p, &perm)| (p, perm)).collect::<Vec<_>>())
            .ok_or_else(|| StorageError::InvariantViolation(format!("{} not found", txn_id)))?;
        for (page_id, permission) in held {
            self.unlock(txn_id, page_id, permission)?;
            if let Some(held) = self.holdings.lock()?.get_mut(&txn_id) {
                held.remove(&page_id);
            }
        }
        debug!(%txn_id, "released all locks");
        Ok(())
    }

    /// Strips every holder of `page_id` of its lock, used when the page is
    /// evicted from under them.
    pub fn release_page(&self, page_id: PageID) -> StorageResult<()> {
        let Some(lock) = self.existing_page_lock(page_id)? else {
            return Ok(());
        };
        let mut released = vec![];
        lock.force_release(|txn_id, _| released.push(txn_id))?;
        let mut holdings = self.holdings.lock()?;
        for txn_id in released {
            if let Some(held) = holdings.get_mut(&txn_id) {
                held.remove(&page_id);
            }
            info!(%txn_id, %page_id, "lock force released");
        }
        Ok(())
    }

    /// Cancels a blocked `acquire` of `txn_id`, which then fails with
    /// `Interrupted`. Returns whether `txn_id` was waiting.
    pub fn interrupt(&self, txn_id: TransactionID) -> StorageResult<bool> {
        let waiting = self.waiting.lock()?;
        match waiting.get(&txn_id) {
            Some((_, lock)) => {
                lock.interrupt(txn_id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether `txn_id` is registered and not yet completed.
    pub fn is_active(&self, txn_id: TransactionID) -> StorageResult<bool> {
        Ok(self.holdings.lock()?.contains_key(&txn_id))
    }

    pub fn holds_lock(&self, txn_id: TransactionID, page_id: PageID) -> StorageResult<bool> {
        Ok(self.permission(txn_id, page_id)?.is_some())
    }

    pub fn permission(
        &self,
        txn_id: TransactionID,
        page_id: PageID,
    ) -> StorageResult<Option<Permission>> {
        Ok(self
            .holdings
            .lock()?
            .get(&txn_id)
            .and_then(|held| held.get(&page_id).copied()))
    }

    pub fn pages_held(&self, txn_id: TransactionID) -> StorageResult<Vec<(PageID, Permission)>> {
        let mut held = self
            .holdings
            .lock()?
            .get(&txn_id)
            .map(|held| held.iter().map(|(&p, &perm)| (p, perm)).collect::<Vec<_>>())
            .unwrap_or_default();
        held.sort();
        Ok(held)
    }

    pub fn page_is_locked(&self, page_id: PageID) -> StorageResult<bool> {
        match self.existing_page_lock(page_id)? {
            Some(lock) => lock.is_held(),
            None => Ok(false),
        }
    }

    pub fn page_is_locked_by_writer(&self, page_id: PageID) -> StorageResult<bool> {
        match self.existing_page_lock(page_id)? {
            Some(lock) => lock.is_held_by_writer(),
            None => Ok(false),
        }
    }

    /// Snapshot of every known page: (page, writer, readers).
    pub fn lock_table(
        &self,
    ) -> StorageResult<Vec<(PageID, Option<TransactionID>, Vec<TransactionID>)>> {
        let page_locks = self.page_locks.read()?;
        let mut table = vec![];
        for (&page_id, lock) in page_locks.iter() {
            let mut readers = lock.readers()?;
            readers.sort();
            table.push((page_id, lock.writer()?, readers));
        }
        table.sort_by_key(|(page_id, _, _)| *page_id);
        Ok(table)
    }

    /// Transactions currently blocked in `acquire`, with the page they want.
    pub fn waiters(&self) -> StorageResult<Vec<(TransactionID, PageID)>> {
        let mut waiters = self
            .waiting
            .lock()?
            .iter()
            .map(|(&txn_id, &(page_id, _))| (txn_id, page_id))
            .collect::<Vec<_>>();
        waiters.sort();
        Ok(waiters)
    }

    pub fn waits_on(&self, txn_id: TransactionID) -> StorageResult<Vec<TransactionID>> {
        self.wait_for_graph.waits_on(txn_id)
    }

    // Blocks on `lock` with the wait-for graph tracking whoever is in the way.
    fn lock_physical(
        &self,
        txn_id: TransactionID,
        page_id: PageID,
        lock: &Arc<UpgradeableLock>,
        permission: Permission,
    ) -> StorageResult<()> {
        self.waiting.lock()?.insert(txn_id, (page_id, lock.clone()));
        let on_wait = |holders: &[TransactionID]| self.wait_for_graph.wait_on(txn_id, holders);
        let granted = match permission {
            Permission::Shared => lock.read_lock_with(txn_id, on_wait),
            Permission::Exclusive => lock.write_lock_with(txn_id, on_wait),
        };
        {
            let mut waiting = self.waiting.lock()?;
            waiting.remove(&txn_id);
            lock.clear_interrupt(txn_id)?;
        }
        self.wait_for_graph.clear_waiter(txn_id)?;
        granted
    }

    fn is_current(&self, page_id: PageID, lock: &Arc<UpgradeableLock>) -> StorageResult<bool> {
        Ok(self
            .page_locks
            .read()?
            .get(&page_id)
            .is_some_and(|current| Arc::ptr_eq(current, lock)))
    }

    fn existing_page_lock(&self, page_id: PageID) -> StorageResult<Option<Arc<UpgradeableLock>>> {
        Ok(self.page_locks.read()?.get(&page_id).cloned())
    }

    fn page_lock(&self, page_id: PageID) -> StorageResult<Arc<UpgradeableLock>> {
        if let Some(lock) = self.existing_page_lock(page_id)? {
            return Ok(lock);
        }
        Ok(self
            .page_locks
            .write()?
            .entry(page_id)
            .or_insert_with(|| Arc::new(UpgradeableLock::new()))
            .clone())
    }

    fn unlock(
        &self,
        txn_id: TransactionID,
        page_id: PageID,
        permission: Permission,
    ) -> StorageResult<()> {
        let lock = self.existing_page_lock(page_id)?.ok_or_else(|| {
            StorageError::InvariantViolation(format!("page {} was never locked", page_id))
        })?;
        match permission {
            Permission::Shared => lock.read_unlock(txn_id),
            Permission::Exclusive => lock.write_unlock(txn_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        thread,
        time::Duration,
    };

    use anyhow::{anyhow, Result};
    use itertools::Itertools;

    use super::*;

    const P1: PageID = PageID(1, 1);
    const P2: PageID = PageID(1, 2);
    const T1: TransactionID = TransactionID(1);
    const T2: TransactionID = TransactionID(2);
    const T3: TransactionID = TransactionID(3);

    fn manager_with(txn_ids: &[TransactionID]) -> Result<Arc<LockManager>> {
        let lock_manager = Arc::new(LockManager::new());
        for &txn_id in txn_ids {
            lock_manager.add_transaction(txn_id)?;
        }
        Ok(lock_manager)
    }

    #[test]
    fn test_acquire_and_release() -> Result<()> {
        let lock_manager = manager_with(&[T1])?;
        lock_manager.acquire(T1, P1, Permission::Shared)?;
        assert!(lock_manager.holds_lock(T1, P1)?);
        assert!(lock_manager.page_is_locked(P1)?);
        assert!(!lock_manager.page_is_locked_by_writer(P1)?);
        lock_manager.release(T1, P1)?;
        assert!(!lock_manager.holds_lock(T1, P1)?);
        assert!(!lock_manager.page_is_locked(P1)?);
        lock_manager.complete_transaction(T1)?;
        Ok(())
    }

    #[test]
    fn test_holdings_keep_strongest_permission() -> Result<()> {
        let lock_manager = manager_with(&[T1])?;
        lock_manager.acquire(T1, P1, Permission::Shared)?;
        lock_manager.acquire(T1, P1, Permission::Exclusive)?;
        assert_eq!(
            lock_manager.permission(T1, P1)?,
            Some(Permission::Exclusive)
        );
        // asking for less does not downgrade
        lock_manager.acquire(T1, P1, Permission::Shared)?;
        assert_eq!(
            lock_manager.permission(T1, P1)?,
            Some(Permission::Exclusive)
        );
        assert!(lock_manager.page_is_locked_by_writer(P1)?);
        lock_manager.release(T1, P1)?;
        assert!(!lock_manager.page_is_locked(P1)?);
        Ok(())
    }

    #[test]
    fn test_double_acquire_has_no_side_effects() -> Result<()> {
        let lock_manager = manager_with(&[T1])?;
        lock_manager.acquire(T1, P1, Permission::Exclusive)?;
        let before = lock_manager.lock_table()?;
        lock_manager.acquire(T1, P1, Permission::Exclusive)?;
        assert_eq!(lock_manager.lock_table()?, before);
        assert_eq!(lock_manager.pages_held(T1)?, vec![(P1, Permission::Exclusive)]);
        assert!(lock_manager.waits_on(T1)?.is_empty());
        // a single release is enough
        lock_manager.release(T1, P1)?;
        assert!(!lock_manager.page_is_locked(P1)?);
        Ok(())
    }

    #[test]
    fn test_upgrade_blocks_until_other_reader_releases() -> Result<()> {
        let lock_manager = manager_with(&[T1, T2])?;
        lock_manager.acquire(T1, P1, Permission::Shared)?;
        lock_manager.acquire(T2, P1, Permission::Shared)?;

        let (sender, receiver) = mpsc::channel();
        let handle = {
            let lock_manager = lock_manager.clone();
            thread::spawn(move || -> Result<()> {
                lock_manager.acquire(T1, P1, Permission::Exclusive)?;
                sender.send(())?;
                Ok(())
            })
        };
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(lock_manager.waits_on(T1)?, vec![T2]);
        // still a reader while waiting
        assert_eq!(lock_manager.permission(T1, P1)?, Some(Permission::Shared));

        lock_manager.release(T2, P1)?;
        receiver.recv_timeout(Duration::from_secs(5))?;
        handle.join().map_err(|_| anyhow!("thread error"))??;
        assert_eq!(
            lock_manager.permission(T1, P1)?,
            Some(Permission::Exclusive)
        );
        assert!(lock_manager.waits_on(T1)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_deadlock_is_detected() -> Result<()> {
        let lock_manager = manager_with(&[T1, T2])?;
        lock_manager.acquire(T1, P1, Permission::Exclusive)?;
        lock_manager.acquire(T2, P2, Permission::Exclusive)?;

        let handle = {
            let lock_manager = lock_manager.clone();
            thread::spawn(move || lock_manager.acquire(T2, P1, Permission::Exclusive))
        };
        // wait until T2 is registered as waiting on T1
        while lock_manager.waits_on(T2)?.is_empty() {
            thread::sleep(Duration::from_millis(10));
        }

        let result = lock_manager.acquire(T1, P2, Permission::Exclusive);
        assert_eq!(
            result,
            Err(StorageError::Deadlock {
                holder: T2,
                waiter: T1
            })
        );
        assert!(!lock_manager.holds_lock(T1, P2)?);
        assert!(lock_manager.waits_on(T1)?.is_empty());

        // abort the victim; T2 proceeds
        lock_manager.release_transaction(T1)?;
        lock_manager.complete_transaction(T1)?;
        handle.join().map_err(|_| anyhow!("thread error"))??;
        assert_eq!(
            lock_manager.pages_held(T2)?,
            vec![(P1, Permission::Exclusive), (P2, Permission::Exclusive)]
        );
        Ok(())
    }

    #[test]
    fn test_upgrade_deadlock_between_two_readers() -> Result<()> {
        let lock_manager = manager_with(&[T1, T2])?;
        lock_manager.acquire(T1, P1, Permission::Shared)?;
        lock_manager.acquire(T2, P1, Permission::Shared)?;
        let handle = {
            let lock_manager = lock_manager.clone();
            thread::spawn(move || lock_manager.acquire(T1, P1, Permission::Exclusive))
        };
        while lock_manager.waits_on(T1)?.is_empty() {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(
            lock_manager.acquire(T2, P1, Permission::Exclusive),
            Err(StorageError::Deadlock { .. })
        ));
        lock_manager.release_transaction(T2)?;
        handle.join().map_err(|_| anyhow!("thread error"))??;
        assert!(lock_manager.page_is_locked_by_writer(P1)?);
        Ok(())
    }

    #[test]
    fn test_shared_locks_never_deadlock() -> Result<()> {
        let lock_manager = manager_with(&[T1, T2, T3])?;
        let pages = (0..8).map(|n| PageID(1, n)).collect_vec();
        let mut handles = vec![];
        for (i, txn_id) in [T1, T2, T3].into_iter().enumerate() {
            let lock_manager = lock_manager.clone();
            let pages = pages.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                // overlapping sets in different orders
                let order = if i % 2 == 0 {
                    pages.iter().collect_vec()
                } else {
                    pages.iter().rev().collect_vec()
                };
                for &page_id in order.into_iter().skip(i) {
                    lock_manager.acquire(txn_id, page_id, Permission::Shared)?;
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().map_err(|_| anyhow!("thread error"))??;
        }
        assert_eq!(lock_manager.pages_held(T1)?.len(), 8);
        assert_eq!(lock_manager.pages_held(T2)?.len(), 7);
        assert_eq!(lock_manager.pages_held(T3)?.len(), 6);
        Ok(())
    }

    #[test]
    fn test_exclusive_mutual_exclusion() -> Result<()> {
        let lock_manager = Arc::new(LockManager::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for i in 1..=8 {
            let lock_manager = lock_manager.clone();
            let inside = inside.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let txn_id = TransactionID(i);
                lock_manager.add_transaction(txn_id)?;
                lock_manager.acquire(txn_id, P1, Permission::Exclusive)?;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                thread::sleep(Duration::from_millis(10));
                inside.fetch_sub(1, Ordering::SeqCst);
                lock_manager.release_transaction(txn_id)?;
                lock_manager.complete_transaction(txn_id)?;
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().map_err(|_| anyhow!("thread error"))??;
        }
        assert!(!lock_manager.page_is_locked(P1)?);
        Ok(())
    }

    #[test]
    fn test_release_transaction_clears_holdings() -> Result<()> {
        let lock_manager = manager_with(&[T1])?;
        lock_manager.acquire(T1, P1, Permission::Shared)?;
        lock_manager.acquire(T1, P2, Permission::Exclusive)?;
        lock_manager.release_transaction(T1)?;
        assert!(!lock_manager.holds_lock(T1, P1)?);
        assert!(!lock_manager.holds_lock(T1, P2)?);
        assert!(!lock_manager.page_is_locked(P1)?);
        assert!(!lock_manager.page_is_locked(P2)?);
        lock_manager.complete_transaction(T1)?;
        Ok(())
    }

    #[test]
    fn test_complete_with_outstanding_locks_fails() -> Result<()> {
        let lock_manager = manager_with(&[T1])?;
        lock_manager.acquire(T1, P1, Permission::Shared)?;
        assert!(matches!(
            lock_manager.complete_transaction(T1),
            Err(StorageError::InvariantViolation(_))
        ));
        assert!(matches!(
            lock_manager.complete_transaction(T2),
            Err(StorageError::InvariantViolation(_))
        ));
        assert!(matches!(
            lock_manager.add_transaction(T1),
            Err(StorageError::InvariantViolation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_release_not_held_fails() -> Result<()> {
        let lock_manager = manager_with(&[T1])?;
        assert!(matches!(
            lock_manager.release(T1, P1),
            Err(StorageError::InvariantViolation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_release_page_keeps_holdings_consistent() -> Result<()> {
        let lock_manager = manager_with(&[T1, T2])?;
        lock_manager.acquire(T1, P1, Permission::Shared)?;
        lock_manager.acquire(T2, P1, Permission::Shared)?;
        lock_manager.acquire(T2, P2, Permission::Exclusive)?;
        lock_manager.release_page(P1)?;
        assert!(!lock_manager.page_is_locked(P1)?);
        assert!(!lock_manager.holds_lock(T1, P1)?);
        assert!(!lock_manager.holds_lock(T2, P1)?);
        assert!(lock_manager.holds_lock(T2, P2)?);
        lock_manager.complete_transaction(T1)?;
        // unknown page is a no-op
        lock_manager.release_page(PageID(9, 9))?;
        Ok(())
    }

    #[test]
    fn test_interrupt_blocked_acquire() -> Result<()> {
        let lock_manager = manager_with(&[T1, T2])?;
        lock_manager.acquire(T1, P1, Permission::Exclusive)?;
        let handle = {
            let lock_manager = lock_manager.clone();
            thread::spawn(move || lock_manager.acquire(T2, P1, Permission::Shared))
        };
        while !lock_manager.interrupt(T2)? {
            thread::sleep(Duration::from_millis(10));
        }
        let result = handle.join().map_err(|_| anyhow!("thread error"))?;
        assert_eq!(result, Err(StorageError::Interrupted(T2)));
        assert!(!lock_manager.holds_lock(T2, P1)?);
        assert!(lock_manager.waits_on(T2)?.is_empty());
        assert!(!lock_manager.interrupt(T2)?);
        lock_manager.complete_transaction(T2)?;
        Ok(())
    }

    #[test]
    fn test_remove_page() -> Result<()> {
        let lock_manager = manager_with(&[T1])?;
        lock_manager.add_page(P1)?;
        lock_manager.acquire(T1, P1, Permission::Shared)?;
        assert!(matches!(
            lock_manager.remove_page(P1),
            Err(StorageError::InvariantViolation(_))
        ));
        lock_manager.release(T1, P1)?;
        lock_manager.remove_page(P1)?;
        assert!(lock_manager.lock_table()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_deadlock_through_reader_granted_while_writer_waits() -> Result<()> {
        let lock_manager = manager_with(&[T1, T2, T3])?;
        lock_manager.acquire(T1, P1, Permission::Shared)?;
        lock_manager.acquire(T2, P2, Permission::Exclusive)?;
        let handle = {
            let lock_manager = lock_manager.clone();
            thread::spawn(move || lock_manager.acquire(T2, P1, Permission::Exclusive))
        };
        while lock_manager.waits_on(T2)?.is_empty() {
            thread::sleep(Duration::from_millis(10));
        }

        // T3 joins the readers T2 is waiting on
        lock_manager.acquire(T3, P1, Permission::Shared)?;
        while !lock_manager.waits_on(T2)?.contains(&T3) {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            lock_manager.acquire(T3, P2, Permission::Exclusive),
            Err(StorageError::Deadlock {
                holder: T2,
                waiter: T3
            })
        );

        lock_manager.release_transaction(T3)?;
        lock_manager.release(T1, P1)?;
        handle.join().map_err(|_| anyhow!("thread error"))??;
        assert_eq!(lock_manager.permission(T2, P1)?, Some(Permission::Exclusive));
        assert!(lock_manager.waits_on(T2)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_wait_edges_follow_current_holders() -> Result<()> {
        let lock_manager = manager_with(&[T1, T2, T3])?;
        lock_manager.acquire(T1, P1, Permission::Shared)?;
        lock_manager.acquire(T2, P1, Permission::Shared)?;
        lock_manager.acquire(T3, P2, Permission::Exclusive)?;
        let third = {
            let lock_manager = lock_manager.clone();
            thread::spawn(move || lock_manager.acquire(T3, P1, Permission::Exclusive))
        };
        while lock_manager.waits_on(T3)?.len() < 2 {
            thread::sleep(Duration::from_millis(10));
        }

        lock_manager.release(T1, P1)?;
        while lock_manager.waits_on(T3)? != vec![T2] {
            thread::sleep(Duration::from_millis(10));
        }
        // T1 no longer blocks T3, so T1 may wait on T3
        let first = {
            let lock_manager = lock_manager.clone();
            thread::spawn(move || lock_manager.acquire(T1, P2, Permission::Exclusive))
        };
        while lock_manager.waits_on(T1)? != vec![T3] {
            thread::sleep(Duration::from_millis(10));
        }

        lock_manager.release(T2, P1)?;
        third.join().map_err(|_| anyhow!("thread error"))??;
        lock_manager.release_transaction(T3)?;
        first.join().map_err(|_| anyhow!("thread error"))??;
        assert_eq!(lock_manager.permission(T1, P2)?, Some(Permission::Exclusive));
        Ok(())
    }

    #[test]
    fn test_remove_page_races_with_acquire() -> Result<()> {
        let lock_manager = Arc::new(LockManager::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let remover = {
            let lock_manager = lock_manager.clone();
            let done = done.clone();
            thread::spawn(move || {
                while done.load(Ordering::SeqCst) < 4 {
                    // refused while held, which is fine here
                    let _ = lock_manager.remove_page(P1);
                }
            })
        };
        let mut handles = vec![];
        for i in 1..=4 {
            let lock_manager = lock_manager.clone();
            let inside = inside.clone();
            let done = done.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let txn_id = TransactionID(i);
                lock_manager.add_transaction(txn_id)?;
                for _ in 0..200 {
                    lock_manager.acquire(txn_id, P1, Permission::Exclusive)?;
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    lock_manager.release(txn_id, P1)?;
                }
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().map_err(|_| anyhow!("thread error"))??;
        }
        remover.join().map_err(|_| anyhow!("thread error"))?;
        Ok(())
    }
}
