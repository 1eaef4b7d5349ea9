use std::{collections::HashSet, sync::Mutex};

use crate::{
    cache::WriterProbe,
    common::PageID,
    error::StorageResult,
    page::HeapPage,
};

pub fn heap_page(page_number: u32, data: &[u8]) -> HeapPage {
    HeapPage::from_data(PageID(1, page_number), data)
}

/// Write-lock state controlled directly by the test.
#[derive(Default)]
pub struct FakeWriterProbe {
    locked: Mutex<HashSet<PageID>>,
}
impl FakeWriterProbe {
    pub fn lock(&self, page_id: PageID) -> StorageResult<()> {
        self.locked.lock()?.insert(page_id);
        Ok(())
    }
    pub fn unlock(&self, page_id: PageID) -> StorageResult<()> {
        self.locked.lock()?.remove(&page_id);
        Ok(())
    }
}
impl WriterProbe for FakeWriterProbe {
    fn is_locked_by_writer(&self, page_id: PageID) -> StorageResult<bool> {
        Ok(self.locked.lock()?.contains(&page_id))
    }
}
