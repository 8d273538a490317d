use crate::storage::page_cache::*;
use crate::storage::*;

use std::{rc::Rc, sync::Mutex};

pub struct BufferManager {
    smgr: Rc<StorageManager>,
    page_cache: Mutex<PageCache>,
}

impl BufferManager {
    pub fn new(smgr: Rc<StorageManager>, cache_capacity: usize) -> Self {
        let page_cache = Mutex::new(PageCache::new(cache_capacity));

        Self { smgr, page_cache }
    }

    pub fn new_page(&self, shandle: &StorageHandle) -> Result<PagePtr> {
        self.page_cache
            .lock()
            .unwrap()
            .new_page(&self.smgr, shandle)
    }

    pub fn fetch_page(&self, shandle: &StorageHandle, page_num: usize) -> Result<PagePtr> {
        self.page_cache
            .lock()
            .unwrap()
            .fetch_page(&self.smgr, shandle, page_num)
    }

    pub fn release_page(&self, page_ptr: PagePtr) -> Result<()> {
        self.page_cache.lock().unwrap().release_page(page_ptr)
    }

    /// Write one page through to the file and clear its dirty flag.
    pub fn flush_page(&self, shandle: &StorageHandle, page_ptr: &PagePtr) -> Result<()> {
        page_ptr.with_write(|page| {
            if page.is_dirty() {
                let (_, page_num) = page.get_file_and_num();
                self.smgr.write(shandle, page_num, page.buffer())?;
                page.set_dirty(false);
            }
            Ok(())
        })
    }

    /// Restore one page from its on-disk image and clear its dirty flag.
    pub fn recover_page(&self, shandle: &StorageHandle, page_ptr: &PagePtr) -> Result<()> {
        page_ptr.with_write(|page| {
            let (_, page_num) = page.get_file_and_num();
            self.smgr.read(shandle, page_num, page.buffer_mut())?;
            page.set_dirty(false);
            Ok(())
        })
    }

    pub fn flush_relation(&self, shandle: &StorageHandle) -> Result<()> {
        self.page_cache
            .lock()
            .unwrap()
            .flush_relation(&self.smgr, shandle)
    }

    pub fn dirty_page_count(&self, rel: RelFileRef) -> usize {
        self.page_cache.lock().unwrap().dirty_page_count(rel)
    }

    pub fn discard_relation(&self, rel: RelFileRef) {
        self.page_cache.lock().unwrap().discard_relation(rel)
    }

    pub fn get_storage_manager(&self) -> &StorageManager {
        &self.smgr
    }
}
