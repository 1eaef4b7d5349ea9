use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageID(pub u32, pub u32);
impl PageID {
    pub fn table_id(&self) -> u32 {
        self.0
    }
    pub fn page_number(&self) -> u32 {
        self.1
    }
}
impl fmt::Display for PageID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionID(pub u64);
impl fmt::Display for TransactionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Hands out transaction ids that are never reused for the lifetime of the process.
#[derive(Debug)]
pub struct TransactionIDGenerator {
    next: AtomicU64,
}
impl Default for TransactionIDGenerator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}
impl TransactionIDGenerator {
    pub fn next(&self) -> TransactionID {
        TransactionID(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

// declaration order matters: Exclusive > Shared
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    Shared,
    Exclusive,
}
impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Shared => write!(f, "S"),
            Permission::Exclusive => write!(f, "X"),
        }
    }
}
