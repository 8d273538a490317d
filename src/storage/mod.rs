pub mod consts;

mod buffer_manager;
mod page_cache;
mod page_scope;
mod storage_manager;

use crate::{Relation, Result, OID};

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, RwLock},
};

use self::consts::PAGE_SIZE;

pub use self::{
    buffer_manager::BufferManager,
    page_scope::PageScope,
    storage_manager::{StorageHandle, StorageManager},
};

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct RelFileRef {
    pub db: OID,
    pub rel_id: OID,
}

impl fmt::Display for RelFileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.db, self.rel_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanDirection {
    Forward,
    Backward,
}

pub type PageBuffer = [u8; PAGE_SIZE];

pub struct Page {
    file_ref: RelFileRef,
    page_num: usize,
    slot: usize,
    buffer: PageBuffer,
    pin_count: i32,
    dirty: bool,
}

impl Page {
    pub fn pin(&mut self) -> i32 {
        self.pin_count += 1;
        self.pin_count
    }

    pub fn unpin(&mut self) -> i32 {
        self.pin_count -= 1;
        self.pin_count
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn get_file_and_num(&self) -> (RelFileRef, usize) {
        (self.file_ref, self.page_num)
    }

    pub fn set_file_and_num(&mut self, file_ref: RelFileRef, page_num: usize) {
        self.file_ref = file_ref;
        self.page_num = page_num;
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn buffer(&self) -> &PageBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut PageBuffer {
        &mut self.buffer
    }
}

#[derive(Clone)]
pub struct PagePtr(Arc<RwLock<Page>>);

impl Deref for PagePtr {
    type Target = RwLock<Page>;

    fn deref(&self) -> &RwLock<Page> {
        &self.0
    }
}

impl PagePtr {
    pub fn new(file_ref: RelFileRef, page_num: usize, slot: usize) -> Self {
        Self(Arc::new(RwLock::new(Page {
            file_ref,
            page_num,
            slot,
            buffer: [0u8; PAGE_SIZE],
            pin_count: 0,
            dirty: false,
        })))
    }

    pub fn with_read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Page) -> Result<R>,
    {
        let guard = self.0.read().unwrap();
        f(guard.deref())
    }

    pub fn with_write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Page) -> Result<R>,
    {
        let mut guard = self.0.write().unwrap();
        f(guard.deref_mut())
    }
}

/// Read access to a raw page image. Concrete page views in the drivers
/// are built on top of this.
pub trait DiskPageReader {
    fn get_page_buffer(&self) -> &[u8; PAGE_SIZE];
}

pub trait DiskPageWriter: DiskPageReader {
    fn get_page_buffer_mut(&mut self) -> &mut [u8; PAGE_SIZE];
}

pub trait RelationWithStorage: Relation {
    fn get_storage_handle(&self) -> &std::sync::Mutex<Option<StorageHandle>>;

    fn create_storage(&self, smgr: &StorageManager) -> Result<()> {
        self.with_storage(smgr, |storage| smgr.create(storage, false))
    }

    fn with_storage<F, R>(&self, smgr: &StorageManager, f: F) -> Result<R>
    where
        F: FnOnce(&StorageHandle) -> Result<R>,
    {
        let mut guard = self.get_storage_handle().lock().unwrap();

        match &*guard {
            Some(shandle) => f(shandle),
            None => {
                let shandle = smgr.open(self.rel_db(), self.rel_id())?;
                *guard = Some(shandle.clone());
                f(&shandle)
            }
        }
    }

    fn drop_storage_handle(&self) {
        let mut guard = self.get_storage_handle().lock().unwrap();
        *guard = None;
    }
}
