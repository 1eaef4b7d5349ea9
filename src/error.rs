use std::sync::PoisonError;

use thiserror::Error;

use crate::common::TransactionID;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Granting the lock would close a cycle in the wait-for graph. The waiter
    /// should be aborted and its locks released.
    #[error("deadlock: {waiter} waiting on {holder} would close a wait-for cycle")]
    Deadlock {
        holder: TransactionID,
        waiter: TransactionID,
    },
    #[error("all cached pages are exclusively locked")]
    CacheFull,
    #[error("lock acquisition of {0} was interrupted")]
    Interrupted(TransactionID),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("lock error")]
    Poisoned,
}

impl<T> From<PoisonError<T>> for StorageError {
    fn from(_: PoisonError<T>) -> Self {
        StorageError::Poisoned
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
