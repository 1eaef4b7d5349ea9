use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use tracing::{debug, info};

use crate::{
    common::TransactionID,
    error::{StorageError, StorageResult},
};

#[derive(Debug, Default)]
struct Edges {
    // holder -> transactions waiting on it
    forward: HashMap<TransactionID, HashSet<TransactionID>>,
    // waiter -> transactions it waits on
    backward: HashMap<TransactionID, HashSet<TransactionID>>,
}
impl Edges {
    fn ensure_node(&mut self, txn_id: TransactionID) {
        self.forward.entry(txn_id).or_default();
        self.backward.entry(txn_id).or_default();
    }

    fn has_path(&self, from: TransactionID, to: TransactionID) -> bool {
        let mut queue = VecDeque::from([from]);
        let mut visited = HashSet::new();
        while let Some(txn_id) = queue.pop_front() {
            if txn_id == to {
                return true;
            }
            if !visited.insert(txn_id) {
                continue;
            }
            if let Some(next) = self.forward.get(&txn_id) {
                queue.extend(next.iter().filter(|t| !visited.contains(*t)));
            }
        }
        false
    }

    fn insert(&mut self, holder: TransactionID, waiter: TransactionID) {
        self.ensure_node(holder);
        self.ensure_node(waiter);
        if let Some(waiters) = self.forward.get_mut(&holder) {
            waiters.insert(waiter);
        }
        if let Some(holders) = self.backward.get_mut(&waiter) {
            holders.insert(holder);
        }
    }

    fn remove(&mut self, holder: TransactionID, waiter: TransactionID) {
        if let Some(waiters) = self.forward.get_mut(&holder) {
            waiters.remove(&waiter);
        }
        if let Some(holders) = self.backward.get_mut(&waiter) {
            holders.remove(&holder);
        }
    }
}

/// Directed graph of "holder must release before waiter can proceed" edges.
/// Edges that would close a cycle are refused, so the graph stays acyclic.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: Mutex<Edges>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction(&self, txn_id: TransactionID) -> StorageResult<()> {
        self.edges.lock()?.ensure_node(txn_id);
        Ok(())
    }

    pub fn remove_transaction(&self, txn_id: TransactionID) -> StorageResult<()> {
        let mut edges = self.edges.lock()?;
        if let Some(waiters) = edges.forward.remove(&txn_id) {
            for waiter in waiters {
                if let Some(holders) = edges.backward.get_mut(&waiter) {
                    holders.remove(&txn_id);
                }
            }
        }
        if let Some(holders) = edges.backward.remove(&txn_id) {
            for holder in holders {
                if let Some(waiters) = edges.forward.get_mut(&holder) {
                    waiters.remove(&txn_id);
                }
            }
        }
        Ok(())
    }

    /// Adds `holder -> waiter` unless `waiter` already reaches `holder`, in
    /// which case the edge is not added and `Deadlock` is returned.
    pub fn add_dependency(&self, holder: TransactionID, waiter: TransactionID) -> StorageResult<()> {
        let mut edges = self.edges.lock()?;
        if edges.has_path(waiter, holder) {
            info!(%holder, %waiter, "deadlock detected");
            return Err(StorageError::Deadlock { holder, waiter });
        }
        edges.insert(holder, waiter);
        debug!(%holder, %waiter, "added wait-for edge");
        Ok(())
    }

    /// Makes `holders` exactly the set `waiter` waits on: edges from
    /// transactions no longer in the set are dropped, new ones are added.
    /// Fails with `Deadlock` on the first new edge that would close a cycle.
    pub fn wait_on(&self, waiter: TransactionID, holders: &[TransactionID]) -> StorageResult<()> {
        let mut edges = self.edges.lock()?;
        let stale = edges
            .backward
            .get(&waiter)
            .map(|current| {
                current
                    .iter()
                    .filter(|holder| !holders.contains(*holder))
                    .copied()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for holder in stale {
            edges.remove(holder, waiter);
        }
        for &holder in holders {
            if edges.backward.get(&waiter).is_some_and(|h| h.contains(&holder)) {
                continue;
            }
            if edges.has_path(waiter, holder) {
                info!(%holder, %waiter, "deadlock detected");
                return Err(StorageError::Deadlock { holder, waiter });
            }
            edges.insert(holder, waiter);
            debug!(%holder, %waiter, "added wait-for edge");
        }
        Ok(())
    }

    /// Drops every edge pointing at `waiter`, once it no longer waits.
    pub fn clear_waiter(&self, waiter: TransactionID) -> StorageResult<()> {
        let mut edges = self.edges.lock()?;
        let holders = match edges.backward.get_mut(&waiter) {
            Some(holders) => std::mem::take(holders),
            None => return Ok(()),
        };
        for holder in holders {
            if let Some(waiters) = edges.forward.get_mut(&holder) {
                waiters.remove(&waiter);
            }
        }
        Ok(())
    }

    pub fn has_path(&self, from: TransactionID, to: TransactionID) -> StorageResult<bool> {
        Ok(self.edges.lock()?.has_path(from, to))
    }

    pub fn contains(&self, txn_id: TransactionID) -> StorageResult<bool> {
        Ok(self.edges.lock()?.forward.contains_key(&txn_id))
    }

    /// Transactions `waiter` is currently waiting on.
    pub fn waits_on(&self, waiter: TransactionID) -> StorageResult<Vec<TransactionID>> {
        let edges = self.edges.lock()?;
        Ok(edges
            .backward
            .get(&waiter)
            .map(|holders| holders.iter().copied().collect())
            .unwrap_or_default())
    }
}
