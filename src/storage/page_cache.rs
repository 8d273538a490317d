use crate::storage::consts::PAGE_SIZE;
use crate::storage::*;
use crate::*;

use lru::LruCache;
use std::{collections::HashMap, vec::Vec};

#[derive(Clone, Copy, Hash, PartialEq, Eq)]
struct PageTag(RelFileRef, usize);

pub struct PageCache {
    lru: LruCache<PageTag, usize>,
    page_hash: HashMap<PageTag, usize>,
    page_pool: Vec<PagePtr>,
    free_slots: Vec<usize>,
    cache_capacity: usize,
}

impl PageCache {
    pub fn new(cache_capacity: usize) -> Self {
        PageCache {
            lru: LruCache::new(cache_capacity),
            page_hash: HashMap::new(),
            page_pool: Vec::new(),
            free_slots: Vec::new(),
            cache_capacity,
        }
    }

    /// Create a new page if the cache is not full. Otherwise select a victim
    /// and evict the page, writing it out first when dirty.
    fn alloc_page(&mut self, smgr: &StorageManager, rel: RelFileRef, page_num: usize) -> Result<PagePtr> {
        let tag = PageTag(rel, page_num);

        if let Some(slot) = self.free_slots.pop() {
            let page_ptr = self.page_pool[slot].clone();
            page_ptr.with_write(|page| {
                page.set_file_and_num(rel, page_num);
                page.set_dirty(false);
                Ok(())
            })?;
            self.page_hash.insert(tag, slot);
            return Ok(page_ptr);
        }

        if self.page_pool.len() < self.cache_capacity {
            let slot = self.page_pool.len();
            let page_ptr = PagePtr::new(rel, page_num, slot);
            self.page_pool.push(page_ptr.clone());
            self.page_hash.insert(tag, slot);

            Ok(page_ptr)
        } else {
            match self.evict(smgr)? {
                Some(page_ptr) => {
                    page_ptr.with_write(|page| {
                        page.set_file_and_num(rel, page_num);
                        self.page_hash.insert(tag, page.slot());
                        Ok(())
                    })?;

                    Ok(page_ptr)
                }
                None => Err(Error::OutOfMemory),
            }
        }
    }

    pub fn new_page(&mut self, smgr: &StorageManager, shandle: &StorageHandle) -> Result<PagePtr> {
        let page_num = smgr.file_size_in_page(shandle)?;
        let temp_buf = [0u8; PAGE_SIZE];
        smgr.write(shandle, page_num, &temp_buf)?;
        let page_ptr = self.alloc_page(smgr, shandle.file_ref(), page_num)?;
        page_ptr.with_write(|page| {
            for b in page.buffer_mut().iter_mut() {
                *b = 0;
            }
            page.pin();
            Ok(())
        })?;

        Ok(page_ptr)
    }

    pub fn fetch_page(
        &mut self,
        smgr: &StorageManager,
        shandle: &StorageHandle,
        page_num: usize,
    ) -> Result<PagePtr> {
        let tag = PageTag(shandle.file_ref(), page_num);

        let cached = self.page_hash.get(&tag).copied();
        match cached {
            Some(slot) => {
                let page_ptr = self.page_pool[slot].clone();

                let pin_count = page_ptr.with_write(|page| Ok(page.pin()))?;
                if pin_count == 1 {
                    self.lru.pop(&tag);
                }

                Ok(page_ptr)
            }
            None => {
                let page_ptr = self.alloc_page(smgr, shandle.file_ref(), page_num)?;
                page_ptr.with_write(|page| {
                    smgr.read(shandle, page_num, page.buffer_mut())?;
                    page.pin();
                    Ok(())
                })?;

                Ok(page_ptr)
            }
        }
    }

    pub fn release_page(&mut self, page_ptr: PagePtr) -> Result<()> {
        page_ptr.with_write(|page| {
            let pin_count = page.unpin();
            let (file_ref, page_num) = page.get_file_and_num();
            let slot = page.slot();

            if pin_count == 0 {
                self.lru.put(PageTag(file_ref, page_num), slot);
            }

            Ok(())
        })
    }

    /// Write every dirty page of the relation back to its file.
    pub fn flush_relation(&mut self, smgr: &StorageManager, shandle: &StorageHandle) -> Result<()> {
        let rel = shandle.file_ref();
        let slots: Vec<usize> = self
            .page_hash
            .iter()
            .filter(|(tag, _)| tag.0 == rel)
            .map(|(_, slot)| *slot)
            .collect();

        for slot in slots {
            let page_ptr = self.page_pool[slot].clone();
            page_ptr.with_write(|page| {
                if page.is_dirty() {
                    let (_, page_num) = page.get_file_and_num();
                    smgr.write(shandle, page_num, page.buffer())?;
                    page.set_dirty(false);
                }
                Ok(())
            })?;
        }

        Ok(())
    }

    pub fn dirty_page_count(&self, rel: RelFileRef) -> usize {
        self.page_hash
            .iter()
            .filter(|(tag, slot)| {
                tag.0 == rel
                    && self.page_pool[**slot]
                        .with_read(|page| Ok(page.is_dirty()))
                        .unwrap_or(false)
            })
            .count()
    }

    /// Drop every cached page of the relation without writing it back.
    /// Used when the relation is destroyed or moved away.
    pub fn discard_relation(&mut self, rel: RelFileRef) {
        let tags: Vec<PageTag> = self
            .page_hash
            .keys()
            .filter(|tag| tag.0 == rel)
            .copied()
            .collect();

        for tag in tags {
            if let Some(slot) = self.page_hash.remove(&tag) {
                self.lru.pop(&tag);
                self.free_slots.push(slot);
                let _ = self.page_pool[slot].with_write(|page| {
                    page.set_dirty(false);
                    Ok(())
                });
            }
        }
    }

    fn evict(&mut self, smgr: &StorageManager) -> Result<Option<PagePtr>> {
        match self.lru.pop_lru() {
            Some((tag, victim)) => {
                let page_ptr = self.page_pool[victim].clone();
                self.page_hash.remove(&tag);

                // the victim may still carry changes kept back by batch mode
                page_ptr.with_write(|page| {
                    if page.is_dirty() {
                        let shandle = smgr.open(tag.0.db, tag.0.rel_id)?;
                        let (_, page_num) = page.get_file_and_num();
                        smgr.write(&shandle, page_num, page.buffer())?;
                        page.set_dirty(false);
                    }
                    Ok(())
                })?;

                Ok(Some(page_ptr))
            }
            None => Ok(None),
        }
    }
}
