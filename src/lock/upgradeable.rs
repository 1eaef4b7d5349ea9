use std::{
    collections::HashSet,
    sync::{Condvar, Mutex},
};

use tracing::debug;

use crate::{
    common::TransactionID,
    error::{StorageError, StorageResult},
};

#[derive(Debug, Default)]
struct LockState {
    readers: HashSet<TransactionID>,
    writer: Option<TransactionID>,
    interrupted: HashSet<TransactionID>,
}
impl LockState {
    fn holds_read(&self, txn_id: TransactionID) -> bool {
        self.readers.contains(&txn_id)
    }
    fn holds_write(&self, txn_id: TransactionID) -> bool {
        self.writer == Some(txn_id)
    }
    // no writer, and no reader other than txn_id itself
    fn write_grantable(&self, txn_id: TransactionID) -> bool {
        self.writer.is_none() && self.readers.iter().all(|&reader| reader == txn_id)
    }
    fn write_blockers(&self, txn_id: TransactionID) -> Vec<TransactionID> {
        self.writer
            .iter()
            .chain(self.readers.iter())
            .filter(|&&holder| holder != txn_id)
            .copied()
            .collect()
    }
}

/// Reentrant readers-writer lock keyed by transaction, where the sole reader
/// may upgrade to writer in place. `write_lock` serves both as exclusive
/// acquire and as upgrade. A transaction holds at most one of the two modes,
/// so a single unlock call releases it regardless of how many times it locked.
#[derive(Debug, Default)]
pub struct UpgradeableLock {
    state: Mutex<LockState>,
    condvar: Condvar,
}

impl UpgradeableLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_lock(&self, txn_id: TransactionID) -> StorageResult<()> {
        self.read_lock_with(txn_id, |_| Ok(()))
    }

    /// Like `read_lock`, but calls `on_wait` with the current holders in the
    /// way every time the call is about to block. An error from `on_wait`
    /// abandons the request.
    pub fn read_lock_with<F>(&self, txn_id: TransactionID, mut on_wait: F) -> StorageResult<()>
    where
        F: FnMut(&[TransactionID]) -> StorageResult<()>,
    {
        let mut state = self.state.lock()?;
        if state.holds_read(txn_id) || state.holds_write(txn_id) {
            return Ok(());
        }
        while let Some(writer) = state.writer {
            if state.interrupted.remove(&txn_id) {
                return Err(StorageError::Interrupted(txn_id));
            }
            on_wait(&[writer])?;
            state = self.condvar.wait(state)?;
        }
        state.interrupted.remove(&txn_id);
        state.readers.insert(txn_id);
        // blocked writers now wait on one more reader
        self.condvar.notify_all();
        Ok(())
    }

    pub fn read_unlock(&self, txn_id: TransactionID) -> StorageResult<()> {
        let mut state = self.state.lock()?;
        if !state.readers.remove(&txn_id) {
            return Err(StorageError::InvariantViolation(format!(
                "{} doesn't hold a read lock",
                txn_id
            )));
        }
        self.condvar.notify_all();
        Ok(())
    }

    pub fn write_lock(&self, txn_id: TransactionID) -> StorageResult<()> {
        self.write_lock_with(txn_id, |_| Ok(()))
    }

    /// Exclusive counterpart of `read_lock_with`.
    pub fn write_lock_with<F>(&self, txn_id: TransactionID, mut on_wait: F) -> StorageResult<()>
    where
        F: FnMut(&[TransactionID]) -> StorageResult<()>,
    {
        let mut state = self.state.lock()?;
        if state.holds_write(txn_id) {
            return Ok(());
        }
        while !state.write_grantable(txn_id) {
            if state.interrupted.remove(&txn_id) {
                return Err(StorageError::Interrupted(txn_id));
            }
            on_wait(&state.write_blockers(txn_id))?;
            state = self.condvar.wait(state)?;
        }
        state.interrupted.remove(&txn_id);
        if state.readers.remove(&txn_id) {
            debug!(%txn_id, "upgraded read lock");
        }
        state.writer = Some(txn_id);
        self.condvar.notify_all();
        Ok(())
    }

    pub fn write_unlock(&self, txn_id: TransactionID) -> StorageResult<()> {
        let mut state = self.state.lock()?;
        if !state.holds_write(txn_id) {
            return Err(StorageError::InvariantViolation(format!(
                "{} doesn't hold the write lock",
                txn_id
            )));
        }
        state.writer = None;
        self.condvar.notify_all();
        Ok(())
    }

    /// Makes a blocked `read_lock`/`write_lock` call of `txn_id` give up. If
    /// `txn_id` is not blocked, the request is consumed by its next grant.
    pub fn interrupt(&self, txn_id: TransactionID) -> StorageResult<()> {
        let mut state = self.state.lock()?;
        state.interrupted.insert(txn_id);
        self.condvar.notify_all();
        Ok(())
    }

    pub fn clear_interrupt(&self, txn_id: TransactionID) -> StorageResult<()> {
        self.state.lock()?.interrupted.remove(&txn_id);
        Ok(())
    }

    pub fn is_held(&self) -> StorageResult<bool> {
        let state = self.state.lock()?;
        Ok(!state.readers.is_empty() || state.writer.is_some())
    }

    pub fn is_held_by_writer(&self) -> StorageResult<bool> {
        Ok(self.state.lock()?.writer.is_some())
    }

    pub fn writer(&self) -> StorageResult<Option<TransactionID>> {
        Ok(self.state.lock()?.writer)
    }

    pub fn readers(&self) -> StorageResult<Vec<TransactionID>> {
        Ok(self.state.lock()?.readers.iter().copied().collect())
    }

    /// Clears every holder and then calls `action(txn_id, is_reader)` once per
    /// released holder. The callback runs after the internal mutex is released,
    /// so it may take other locks.
    pub fn force_release<F>(&self, mut action: F) -> StorageResult<()>
    where
        F: FnMut(TransactionID, bool),
    {
        let (readers, writer) = {
            let mut state = self.state.lock()?;
            let readers = std::mem::take(&mut state.readers);
            let writer = state.writer.take();
            self.condvar.notify_all();
            (readers, writer)
        };
        for txn_id in readers {
            action(txn_id, true);
        }
        if let Some(txn_id) = writer {
            action(txn_id, false);
        }
        Ok(())
    }
}
