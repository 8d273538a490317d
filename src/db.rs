use crate::*;

use std::{
    rc::Rc,
    sync::atomic::{AtomicBool, Ordering},
};

use log::error;

use self::storage::{BufferManager, StorageManager};

pub struct DB {
    bufmgr: BufferManager,
    smgr: Rc<StorageManager>,
    config: DBConfig,
    available: AtomicBool,
}

impl DB {
    pub fn open(config: DBConfig) -> Result<Self> {
        let smgr = Rc::new(StorageManager::new(config.get_storage_path()));
        smgr.lock_base()?;
        let bufmgr = BufferManager::new(smgr.clone(), config.cache_capacity);
        Ok(Self {
            bufmgr,
            smgr,
            config,
            available: AtomicBool::new(true),
        })
    }

    pub fn get_buffer_manager(&self) -> &BufferManager {
        &self.bufmgr
    }

    pub fn get_storage_manager(&self) -> &StorageManager {
        &self.smgr
    }

    pub fn get_config(&self) -> &DBConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Flag the database as unusable. Set when a rollback path itself
    /// fails, so that later operations refuse to touch the files.
    pub fn set_not_available(&self) {
        if self.available.swap(false, Ordering::Relaxed) {
            error!("database marked not available");
        }
    }
}
