use crate::common::{PageID, TransactionID, PAGE_SIZE};

/// What the page cache needs from a page: a stable identity.
pub trait Page: Clone + Send {
    fn page_id(&self) -> PageID;
}

/// Opaque fixed-size page payload. `dirtied_by` names the transaction whose
/// changes have not been written back yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapPage {
    page_id: PageID,
    data: Box<[u8]>,
    dirtied_by: Option<TransactionID>,
}
impl HeapPage {
    pub fn new(page_id: PageID) -> Self {
        Self {
            page_id,
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            dirtied_by: None,
        }
    }
    pub fn from_data(page_id: PageID, data: &[u8]) -> Self {
        let mut page = Self::new(page_id);
        let len = data.len().min(PAGE_SIZE);
        page.data[..len].copy_from_slice(&data[..len]);
        page
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    /// Copies `bytes` in at `offset`, truncating at the end of the page.
    /// Returns the number of bytes written.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> usize {
        if offset >= PAGE_SIZE {
            return 0;
        }
        let len = bytes.len().min(PAGE_SIZE - offset);
        self.data[offset..(offset + len)].copy_from_slice(&bytes[..len]);
        len
    }
    pub fn mark_dirty(&mut self, txn_id: TransactionID) {
        self.dirtied_by = Some(txn_id);
    }
    pub fn mark_clean(&mut self) {
        self.dirtied_by = None;
    }
    pub fn is_dirty(&self) -> bool {
        self.dirtied_by.is_some()
    }
    pub fn dirtied_by(&self) -> Option<TransactionID> {
        self.dirtied_by
    }
}
impl Page for HeapPage {
    fn page_id(&self) -> PageID {
        self.page_id
    }
}
