use crate::storage::*;
use crate::{Result, DB};

use log::error;

/// Scoped page set of a single driver operation.
///
/// Every page touched under the scope stays pinned until the scope ends.
/// `commit` writes the dirtied pages through; `abort` restores their
/// on-disk images in reverse dirtying order. In batch mode pages are kept
/// dirty in the cache until the dirty count crosses the configured
/// ceiling, and `abort` degrades to a best-effort flush that marks the
/// database unavailable.
pub struct PageScope<'a> {
    db: &'a DB,
    shandle: StorageHandle,
    pages: Vec<(usize, PagePtr)>,
    dirty_order: Vec<usize>,
    batch: bool,
    done: bool,
}

impl<'a> PageScope<'a> {
    pub fn new(db: &'a DB, shandle: StorageHandle, batch: bool) -> Self {
        Self {
            db,
            shandle,
            pages: Vec::new(),
            dirty_order: Vec::new(),
            batch,
            done: false,
        }
    }

    fn page(&mut self, page_num: usize) -> Result<PagePtr> {
        for (num, ptr) in self.pages.iter() {
            if *num == page_num {
                return Ok(ptr.clone());
            }
        }

        let ptr = self
            .db
            .get_buffer_manager()
            .fetch_page(&self.shandle, page_num)?;
        self.pages.push((page_num, ptr.clone()));
        Ok(ptr)
    }

    pub fn with_page<F, R>(&mut self, page_num: usize, f: F) -> Result<R>
    where
        F: FnOnce(&PageBuffer) -> Result<R>,
    {
        let ptr = self.page(page_num)?;
        ptr.with_read(|page| f(page.buffer()))
    }

    pub fn with_page_mut<F, R>(&mut self, page_num: usize, f: F) -> Result<R>
    where
        F: FnOnce(&mut PageBuffer) -> Result<R>,
    {
        let ptr = self.page(page_num)?;
        if !self.dirty_order.contains(&page_num) {
            self.dirty_order.push(page_num);
        }
        ptr.with_write(|page| {
            page.set_dirty(true);
            f(page.buffer_mut())
        })
    }

    /// Extend the file by one zeroed page and take it into the scope.
    pub fn allocate(&mut self) -> Result<usize> {
        let ptr = self.db.get_buffer_manager().new_page(&self.shandle)?;
        let page_num = ptr.with_read(|page| Ok(page.get_file_and_num().1))?;
        self.pages.push((page_num, ptr.clone()));
        self.dirty_order.push(page_num);
        ptr.with_write(|page| {
            page.set_dirty(true);
            Ok(())
        })?;
        Ok(page_num)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_order.len()
    }

    pub fn commit(mut self) -> Result<()> {
        let bufmgr = self.db.get_buffer_manager();

        if self.batch {
            let rel = self.shandle.file_ref();
            if bufmgr.dirty_page_count(rel) > self.db.get_config().batch_max_page_cache {
                bufmgr.flush_relation(&self.shandle)?;
            }
        } else {
            for page_num in self.dirty_order.clone() {
                let ptr = self.page(page_num)?;
                bufmgr.flush_page(&self.shandle, &ptr)?;
            }
        }

        self.release_all();
        self.done = true;
        Ok(())
    }

    /// Roll the dirtied pages back to their on-disk images. Called on the
    /// error path; the original error is what the caller re-raises.
    pub fn abort(mut self) {
        let bufmgr = self.db.get_buffer_manager();

        if self.batch {
            // no page recovery in batch mode
            if let Err(e) = bufmgr.flush_relation(&self.shandle) {
                error!(
                    "flush of relation {} failed during batch abort: {}",
                    self.shandle.file_ref(),
                    e
                );
            }
            self.db.set_not_available();
        } else {
            for page_num in self.dirty_order.clone().into_iter().rev() {
                let recovered = self
                    .page(page_num)
                    .and_then(|ptr| bufmgr.recover_page(&self.shandle, &ptr));
                if let Err(e) = recovered {
                    error!(
                        "recovery of page {} of relation {} failed: {}",
                        page_num,
                        self.shandle.file_ref(),
                        e
                    );
                    self.db.set_not_available();
                    break;
                }
            }
        }

        self.release_all();
        self.done = true;
    }

    fn release_all(&mut self) {
        let bufmgr = self.db.get_buffer_manager();
        for (_, ptr) in self.pages.drain(..) {
            let _ = bufmgr.release_page(ptr);
        }
    }
}

impl<'a> Drop for PageScope<'a> {
    fn drop(&mut self) {
        if !self.done {
            self.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::get_temp_db;

    fn scope_for<'a>(db: &'a DB, rel_id: crate::OID, batch: bool) -> PageScope<'a> {
        let smgr = db.get_storage_manager();
        let shandle = smgr.open(0, rel_id).unwrap();
        smgr.create(&shandle, false).unwrap();
        PageScope::new(db, shandle, batch)
    }

    #[test]
    fn commit_writes_dirty_pages_through() {
        let (db, _dir) = get_temp_db();
        let mut scope = scope_for(&db, 1, false);
        let page = scope.allocate().unwrap();
        scope
            .with_page_mut(page, |buf| {
                buf[0] = 0xAB;
                Ok(())
            })
            .unwrap();
        scope.commit().unwrap();

        // a fresh scope sees the committed image
        let mut scope = PageScope::new(&db, db.get_storage_manager().open(0, 1).unwrap(), false);
        let byte = scope.with_page(page, |buf| Ok(buf[0])).unwrap();
        assert_eq!(byte, 0xAB);
    }

    #[test]
    fn abort_restores_the_on_disk_image() {
        let (db, _dir) = get_temp_db();
        let mut scope = scope_for(&db, 2, false);
        let page = scope.allocate().unwrap();
        scope
            .with_page_mut(page, |buf| {
                buf[0] = 0x11;
                Ok(())
            })
            .unwrap();
        scope.commit().unwrap();

        // dirty the page again, then roll back
        let mut scope = PageScope::new(&db, db.get_storage_manager().open(0, 2).unwrap(), false);
        scope
            .with_page_mut(page, |buf| {
                buf[0] = 0x22;
                Ok(())
            })
            .unwrap();
        scope.abort();
        assert!(db.is_available());

        let mut scope = PageScope::new(&db, db.get_storage_manager().open(0, 2).unwrap(), false);
        let byte = scope.with_page(page, |buf| Ok(buf[0])).unwrap();
        assert_eq!(byte, 0x11);
    }

    #[test]
    fn batch_abort_marks_the_database_unavailable() {
        let (db, _dir) = get_temp_db();
        let mut scope = scope_for(&db, 3, true);
        let page = scope.allocate().unwrap();
        scope
            .with_page_mut(page, |buf| {
                buf[0] = 0x33;
                Ok(())
            })
            .unwrap();

        // no page recovery exists in batch mode
        scope.abort();
        assert!(!db.is_available());
    }
}
