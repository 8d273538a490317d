//! The direct-addressed vector file driver.
//!
//! A tuple lives in the slot `key % slots_per_page` of the data page
//! `key / slots_per_page`; absence is an all-0xFF slot. Every block of
//! data pages is fronted by an occupancy bitmap page so that traversal
//! can skip dead pages without touching them.

mod vector_page;

use self::vector_page::{
    views::*, DATA_PAGES_PER_BLOCK, DATA_PAGE_HEADER_SIZE, PAGES_PER_TABLE, VECTOR_MAGIC,
};

use crate::{
    am::{
        cond::{Condition, MatchType},
        datum::{DataType, FieldDef, RowLayout, Value},
        index::{IndexFile, Progress, Projection},
        open_option::{OpenMode, OpenOption, OptionKey},
        FileId,
    },
    plan::predicate::{alternate_term, CompareOp, Operand, Predicate},
    storage::{consts::PAGE_SIZE, PageScope, RelationWithStorage, StorageHandle},
    Error, Relation, RelationEntry, RelationKind, Result, TupleBitSetPtr, DB,
};

use std::sync::Mutex;

use log::debug;

const HEADER_PAGE_NUM: usize = 0;

/// The whole key space is legal except this sentinel.
pub const ILLEGAL_KEY: u32 = 0xFFFF_FFFF;

const VECTOR_OVERHEAD: f64 = 0.0005;
const VECTOR_PROCESS_COST: f64 = 0.00002;

struct VecOpenState {
    mode: OpenMode,
    reverse: bool,
    projection: Vec<usize>,
    search_by_bitset: Option<TupleBitSetPtr>,
    fetch_mode: bool,
    intervals: Vec<(u32, u32)>,
    interval_index: usize,
    /// Last key returned inside the current interval.
    current: Option<u32>,
    marked: Option<(usize, Option<u32>)>,
    exhausted: bool,
}

pub struct VectorFile {
    rel_entry: RelationEntry,
    file_id: FileId,
    slot_size: usize,
    shandle: Mutex<Option<StorageHandle>>,
    mounted: bool,
    open_state: Option<VecOpenState>,
}

impl VectorFile {
    pub fn new(file_id: FileId) -> Result<Self> {
        let slot_size = file_id.value.slot_size().ok_or_else(|| {
            Error::BadArgument(
                "a vector file stores fixed-size fields only".to_string(),
            )
        })?;
        let rel_entry = RelationEntry::new(file_id.rel_id, file_id.db, RelationKind::Vector);
        Ok(Self {
            rel_entry,
            file_id,
            slot_size,
            shandle: Mutex::new(None),
            mounted: false,
            open_state: None,
        })
    }

    fn slots_per_page(&self) -> usize {
        (PAGE_SIZE - DATA_PAGE_HEADER_SIZE) / self.slot_size
    }

    /// Fields are numbered with the key as field 0 and the stored
    /// fields after it.
    fn field_count(&self) -> usize {
        1 + self.file_id.value.len()
    }

    /// Condition compilation happens against the key alone.
    fn cond_file_id(&self) -> FileId {
        FileId {
            db: self.file_id.db,
            rel_id: self.file_id.rel_id,
            key: RowLayout::new(vec![FieldDef::new(DataType::UInt32)]),
            value: RowLayout::empty(),
            unique: true,
            top_null: false,
        }
    }

    // ------------------------------------------------------------------
    // page arithmetic

    fn data_index_of(&self, key: u32) -> usize {
        key as usize / self.slots_per_page()
    }

    fn position_of(&self, key: u32) -> usize {
        key as usize % self.slots_per_page()
    }

    /// Page id of a data page, skipping the bitmap page fronting each
    /// block.
    fn data_page_id(&self, data_index: usize) -> usize {
        let block = data_index / DATA_PAGES_PER_BLOCK;
        let in_block = data_index % DATA_PAGES_PER_BLOCK;
        1 + block * PAGES_PER_TABLE + 1 + in_block
    }

    fn bitmap_page_id(&self, data_index: usize) -> usize {
        let block = data_index / DATA_PAGES_PER_BLOCK;
        1 + block * PAGES_PER_TABLE
    }

    fn key_of(&self, data_index: usize, position: usize) -> u32 {
        (data_index * self.slots_per_page() + position) as u32
    }

    fn check_available(&self, db: &DB) -> Result<()> {
        if db.is_available() {
            Ok(())
        } else {
            Err(Error::InvalidState("database is not available".to_string()))
        }
    }

    fn begin_scope<'a>(&self, db: &'a DB, batch: bool) -> Result<PageScope<'a>> {
        let shandle = self.with_storage(db.get_storage_manager(), |s| Ok(s.clone()))?;
        Ok(PageScope::new(db, shandle, batch))
    }

    // ------------------------------------------------------------------
    // lifecycle

    pub fn create(&mut self, db: &DB) -> Result<()> {
        self.check_available(db)?;
        self.create_storage(db.get_storage_manager())?;

        let mut scope = self.begin_scope(db, false)?;
        let page = scope.allocate()?;
        if page != HEADER_PAGE_NUM {
            return Err(Error::Unexpected(format!(
                "header page allocated at page {}",
                page
            )));
        }
        scope.with_page_mut(HEADER_PAGE_NUM, |buf| {
            let mut view = VectorHeaderPageViewMut::new(buf);
            view.init_page();
            Ok(())
        })?;
        scope.commit()?;
        self.mounted = true;
        Ok(())
    }

    /// Remove the file without consulting mount state.
    pub fn destroy(&mut self, db: &DB) -> Result<()> {
        self.open_state = None;
        db.get_buffer_manager()
            .discard_relation(self.file_id.file_ref());
        let smgr = db.get_storage_manager();
        let shandle = smgr.open(self.rel_db(), self.rel_id())?;
        smgr.destroy(&shandle)?;
        self.drop_storage_handle();
        self.mounted = false;
        Ok(())
    }

    pub fn mount(&mut self, db: &DB) -> Result<()> {
        if !db
            .get_storage_manager()
            .exists(self.file_id.file_ref())
        {
            return Err(Error::FileAccess(format!(
                "relation {} has no backing file",
                self.file_id.file_ref()
            )));
        }
        self.mounted = true;
        Ok(())
    }

    pub fn unmount(&mut self, db: &DB) -> Result<()> {
        self.flush(db)?;
        self.open_state = None;
        db.get_buffer_manager()
            .discard_relation(self.file_id.file_ref());
        self.drop_storage_handle();
        self.mounted = false;
        Ok(())
    }

    pub fn move_file(&mut self, db: &DB, new_db: crate::OID) -> Result<()> {
        let smgr = db.get_storage_manager();
        let old_ref = self.file_id.file_ref();
        if self.mounted {
            let _ = self.flush(db);
        }
        db.get_buffer_manager().discard_relation(old_ref);
        let shandle = smgr.open(old_ref.db, old_ref.rel_id)?;
        let new_ref = crate::storage::RelFileRef {
            db: new_db,
            rel_id: old_ref.rel_id,
        };
        smgr.rename(&shandle, new_ref)?;
        self.drop_storage_handle();
        self.file_id.db = new_db;
        self.rel_entry = RelationEntry::new(self.file_id.rel_id, new_db, RelationKind::Vector);
        Ok(())
    }

    pub fn flush(&self, db: &DB) -> Result<()> {
        self.with_storage(db.get_storage_manager(), |shandle| {
            db.get_buffer_manager().flush_relation(shandle)
        })
    }

    pub fn recover(&self, db: &DB) -> Result<()> {
        db.get_buffer_manager()
            .discard_relation(self.file_id.file_ref());
        Ok(())
    }

    pub fn restore(&self, db: &DB) -> Result<()> {
        self.recover(db)
    }

    pub fn start_backup(&self, db: &DB) -> Result<()> {
        self.sync(db)
    }

    pub fn end_backup(&self, _db: &DB) -> Result<()> {
        Ok(())
    }

    pub fn sync(&self, db: &DB) -> Result<()> {
        self.with_storage(db.get_storage_manager(), |shandle| {
            db.get_buffer_manager().flush_relation(shandle)?;
            db.get_storage_manager().sync(shandle)
        })
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn is_accessible(&self, db: &DB) -> bool {
        db.get_storage_manager().exists(self.file_id.file_ref())
    }

    // ------------------------------------------------------------------
    // header and page helpers

    fn read_header(&self, scope: &mut PageScope<'_>) -> Result<(u64, u32)> {
        scope.with_page(HEADER_PAGE_NUM, |buf| {
            let view = VectorHeaderPageView::new(buf);
            if view.get_magic() != VECTOR_MAGIC {
                return Err(Error::DataCorrupted(
                    "not a vector file: bad magic".to_string(),
                ));
            }
            Ok((view.get_count(), view.get_max_page()))
        })
    }

    fn update_header<F>(&self, scope: &mut PageScope<'_>, f: F) -> Result<()>
    where
        F: FnOnce(&mut VectorHeaderPageViewMut<'_>),
    {
        scope.with_page_mut(HEADER_PAGE_NUM, |buf| {
            let mut view = VectorHeaderPageViewMut::new(buf);
            f(&mut view);
            view.update_crc();
            Ok(())
        })
    }

    /// Grow the file until the given page exists. Data pages come up
    /// with every slot erased; bitmap pages come up zeroed.
    fn ensure_page(&self, scope: &mut PageScope<'_>, page_id: usize) -> Result<()> {
        let (_, max_page) = self.read_header(scope)?;
        let mut top = max_page as usize;
        if page_id <= top {
            return Ok(());
        }
        while top < page_id {
            let page = scope.allocate()?;
            if page != top + 1 {
                return Err(Error::Unexpected(format!(
                    "expected to extend to page {}, got {}",
                    top + 1,
                    page
                )));
            }
            if !self.is_bitmap_page(page) {
                scope.with_page_mut(page, |buf| {
                    let mut view = VectorDataPageViewMut::new(buf);
                    view.init_page();
                    Ok(())
                })?;
            }
            top = page;
        }
        self.update_header(scope, |view| view.set_max_page(top as u32))
    }

    fn is_bitmap_page(&self, page_id: usize) -> bool {
        page_id >= 1 && (page_id - 1) % PAGES_PER_TABLE == 0
    }

    fn page_occupied(&self, scope: &mut PageScope<'_>, data_index: usize) -> Result<bool> {
        let bitmap = self.bitmap_page_id(data_index);
        let in_block = data_index % DATA_PAGES_PER_BLOCK;
        scope.with_page(bitmap, |buf| {
            let view = VectorBitmapPageView::new(buf);
            Ok(view.get_bit(in_block))
        })
    }

    fn set_page_occupied(
        &self,
        scope: &mut PageScope<'_>,
        data_index: usize,
        on: bool,
    ) -> Result<()> {
        let bitmap = self.bitmap_page_id(data_index);
        let in_block = data_index % DATA_PAGES_PER_BLOCK;
        scope.with_page_mut(bitmap, |buf| {
            let mut view = VectorBitmapPageViewMut::new(buf);
            view.set_bit(in_block, on);
            Ok(())
        })
    }

    fn max_data_index(&self, max_page: u32) -> Option<usize> {
        let max_page = max_page as usize;
        if max_page < 2 {
            return None;
        }
        let block = (max_page - 1) / PAGES_PER_TABLE;
        let in_table = (max_page - 1) % PAGES_PER_TABLE;
        if in_table == 0 {
            // the top page is a bitmap page with no data pages behind it
            if block == 0 {
                None
            } else {
                Some(block * DATA_PAGES_PER_BLOCK - 1)
            }
        } else {
            Some(block * DATA_PAGES_PER_BLOCK + in_table - 1)
        }
    }

    /// First occupied data page at or after `from`, consulting only the
    /// occupancy bitmaps.
    fn next_occupied(
        &self,
        scope: &mut PageScope<'_>,
        from: usize,
        limit: usize,
    ) -> Result<Option<usize>> {
        let mut data_index = from;
        while data_index <= limit {
            let bitmap = self.bitmap_page_id(data_index);
            let in_block = data_index % DATA_PAGES_PER_BLOCK;
            let found = scope.with_page(bitmap, |buf| {
                let view = VectorBitmapPageView::new(buf);
                Ok(view.next_set(in_block))
            })?;
            match found {
                Some(i) => {
                    let candidate = (data_index - in_block) + i;
                    if candidate > limit {
                        return Ok(None);
                    }
                    return Ok(Some(candidate));
                }
                None => {
                    // jump to the next block
                    data_index = (data_index - in_block) + DATA_PAGES_PER_BLOCK;
                }
            }
        }
        Ok(None)
    }

    /// Last occupied data page at or before `from`.
    fn prev_occupied(&self, scope: &mut PageScope<'_>, from: usize) -> Result<Option<usize>> {
        let mut data_index = from as isize;
        while data_index >= 0 {
            let bitmap = self.bitmap_page_id(data_index as usize);
            let in_block = data_index as usize % DATA_PAGES_PER_BLOCK;
            let found = scope.with_page(bitmap, |buf| {
                let view = VectorBitmapPageView::new(buf);
                Ok(view.prev_set(in_block))
            })?;
            match found {
                Some(i) => return Ok(Some((data_index as usize - in_block) + i)),
                None => {
                    data_index = data_index - in_block as isize - 1;
                }
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // point operations

    pub fn insert(&mut self, db: &DB, values: &[Value]) -> Result<()> {
        self.check_available(db)?;
        let mode = match &self.open_state {
            Some(state) => state.mode,
            None => return Err(Error::FileNotOpen("insert before open".to_string())),
        };
        match mode {
            OpenMode::Update | OpenMode::Initialize | OpenMode::Batch => {}
            _ => {
                return Err(Error::BadArgument(
                    "insert requires an update open mode".to_string(),
                ))
            }
        }
        if values.len() != self.field_count() {
            return Err(Error::BadArgument(format!(
                "tuple has {} fields, the file stores {}",
                values.len(),
                self.field_count()
            )));
        }
        let key = values[0].as_u32()?;
        if key == ILLEGAL_KEY {
            return Err(Error::BadArgument(
                "the all-ones key is reserved".to_string(),
            ));
        }

        let slot = self.file_id.value.encode(&values[1..])?;
        let batch = mode == OpenMode::Batch;
        let mut scope = self.begin_scope(db, batch)?;
        match self.insert_impl(&mut scope, key, &slot) {
            Ok(()) => scope.commit(),
            Err(e) => {
                scope.abort();
                Err(e)
            }
        }
    }

    fn insert_impl(&self, scope: &mut PageScope<'_>, key: u32, slot: &[u8]) -> Result<()> {
        let (count, _) = self.read_header(scope)?;
        let data_index = self.data_index_of(key);
        let position = self.position_of(key);
        let page_id = self.data_page_id(data_index);
        let slot_size = self.slot_size;

        self.ensure_page(scope, page_id)?;

        let free = scope.with_page(page_id, |buf| {
            let view = VectorDataPageView::new(buf);
            Ok(view.is_slot_free(position, slot_size))
        })?;
        if !free {
            return Err(Error::UniquenessViolation(format!(
                "key {} already present in relation {}",
                key,
                self.file_id.file_ref()
            )));
        }

        let page_count = scope.with_page_mut(page_id, |buf| {
            let mut view = VectorDataPageViewMut::new(buf);
            view.set_slot(position, slot_size, slot);
            let c = view.get_data_count() + 1;
            view.set_data_count(c);
            Ok(c)
        })?;

        if page_count == 1 {
            self.set_page_occupied(scope, data_index, true)?;
        }
        self.update_header(scope, |view| view.set_count(count + 1))
    }

    pub fn expunge(&mut self, db: &DB, key: u32) -> Result<()> {
        self.check_available(db)?;
        let mode = match &self.open_state {
            Some(state) => state.mode,
            None => return Err(Error::FileNotOpen("expunge before open".to_string())),
        };
        match mode {
            OpenMode::Update | OpenMode::Batch => {}
            _ => {
                return Err(Error::BadArgument(
                    "expunge requires an update open mode".to_string(),
                ))
            }
        }

        let batch = mode == OpenMode::Batch;
        let mut scope = self.begin_scope(db, batch)?;
        match self.expunge_impl(&mut scope, key) {
            Ok(()) => scope.commit(),
            Err(e) => {
                scope.abort();
                Err(e)
            }
        }
    }

    fn expunge_impl(&self, scope: &mut PageScope<'_>, key: u32) -> Result<()> {
        let (count, max_page) = self.read_header(scope)?;
        let data_index = self.data_index_of(key);
        let position = self.position_of(key);
        let page_id = self.data_page_id(data_index);
        let slot_size = self.slot_size;

        if page_id > max_page as usize || !self.page_occupied(scope, data_index)? {
            return Err(Error::EntryNotFound(format!(
                "key {} not present in relation {}",
                key,
                self.file_id.file_ref()
            )));
        }

        let free = scope.with_page(page_id, |buf| {
            let view = VectorDataPageView::new(buf);
            Ok(view.is_slot_free(position, slot_size))
        })?;
        if free {
            return Err(Error::EntryNotFound(format!(
                "key {} not present in relation {}",
                key,
                self.file_id.file_ref()
            )));
        }

        let page_count = scope.with_page_mut(page_id, |buf| {
            let mut view = VectorDataPageViewMut::new(buf);
            view.reset_slot(position, slot_size);
            let c = view.get_data_count() - 1;
            view.set_data_count(c);
            Ok(c)
        })?;

        if page_count == 0 {
            self.set_page_occupied(scope, data_index, false)?;
        }
        self.update_header(scope, |view| view.set_count(count - 1))
    }

    /// In-place update of the selected stored fields. `fields` indexes
    /// the stored layout, the key being immutable.
    pub fn update(
        &mut self,
        db: &DB,
        key: u32,
        new_values: &[Value],
        fields: &[usize],
    ) -> Result<()> {
        self.check_available(db)?;
        let mode = match &self.open_state {
            Some(state) => state.mode,
            None => return Err(Error::FileNotOpen("update before open".to_string())),
        };
        match mode {
            OpenMode::Update | OpenMode::Batch => {}
            _ => {
                return Err(Error::BadArgument(
                    "update requires an update open mode".to_string(),
                ))
            }
        }
        if new_values.len() != fields.len() {
            return Err(Error::BadArgument(format!(
                "{} values for {} fields",
                new_values.len(),
                fields.len()
            )));
        }

        let batch = mode == OpenMode::Batch;
        let mut scope = self.begin_scope(db, batch)?;
        match self.update_impl(&mut scope, key, new_values, fields) {
            Ok(()) => scope.commit(),
            Err(e) => {
                scope.abort();
                Err(e)
            }
        }
    }

    fn update_impl(
        &self,
        scope: &mut PageScope<'_>,
        key: u32,
        new_values: &[Value],
        fields: &[usize],
    ) -> Result<()> {
        let (_, max_page) = self.read_header(scope)?;
        let data_index = self.data_index_of(key);
        let position = self.position_of(key);
        let page_id = self.data_page_id(data_index);
        let slot_size = self.slot_size;

        if page_id > max_page as usize || !self.page_occupied(scope, data_index)? {
            return Err(Error::EntryNotFound(format!(
                "key {} not present in relation {}",
                key,
                self.file_id.file_ref()
            )));
        }

        let slot = scope.with_page(page_id, |buf| {
            let view = VectorDataPageView::new(buf);
            if view.is_slot_free(position, slot_size) {
                return Err(Error::EntryNotFound(format!(
                    "key {} not present in relation {}",
                    key,
                    self.file_id.file_ref()
                )));
            }
            Ok(view.get_slot(position, slot_size).to_vec())
        })?;

        let mut values = self.file_id.value.decode(&slot)?;
        for (value, field) in new_values.iter().zip(fields.iter()) {
            if *field >= values.len() {
                return Err(Error::BadArgument(format!(
                    "field {} out of range",
                    field
                )));
            }
            values[*field] = value.clone();
        }
        let slot = self.file_id.value.encode(&values)?;

        scope.with_page_mut(page_id, |buf| {
            let mut view = VectorDataPageViewMut::new(buf);
            view.set_slot(position, slot_size, &slot);
            Ok(())
        })
    }

    /// Single-slot read. Fills the projected fields and reports whether
    /// the key exists.
    pub fn fetch_values(&self, db: &DB, key: u32, out: &mut Vec<Value>) -> Result<bool> {
        self.check_available(db)?;
        let projection: Vec<usize> = match &self.open_state {
            Some(state) => state.projection.clone(),
            None => (0..self.field_count()).collect(),
        };

        let mut scope = self.begin_scope(db, false)?;
        match self.read_slot(&mut scope, key)? {
            Some(values) => {
                out.clear();
                for field in projection {
                    if field == 0 {
                        out.push(Value::UInt32(key));
                    } else {
                        out.push(values[field - 1].clone());
                    }
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn read_slot(&self, scope: &mut PageScope<'_>, key: u32) -> Result<Option<Vec<Value>>> {
        if key == ILLEGAL_KEY {
            return Ok(None);
        }
        let (_, max_page) = self.read_header(scope)?;
        let data_index = self.data_index_of(key);
        let position = self.position_of(key);
        let page_id = self.data_page_id(data_index);
        let slot_size = self.slot_size;

        if page_id > max_page as usize {
            return Ok(None);
        }
        let slot = scope.with_page(page_id, |buf| {
            let view = VectorDataPageView::new(buf);
            if view.is_slot_free(position, slot_size) {
                Ok(None)
            } else {
                Ok(Some(view.get_slot(position, slot_size).to_vec()))
            }
        })?;
        match slot {
            Some(bytes) => Ok(Some(self.file_id.value.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // traversal

    /// The next live key after `key`, or the first live key when `key`
    /// is the sentinel. Dead pages are skipped through the bitmaps.
    fn next_key(&self, scope: &mut PageScope<'_>, key: u32) -> Result<u32> {
        let (_, max_page) = self.read_header(scope)?;
        let limit = match self.max_data_index(max_page) {
            Some(limit) => limit,
            None => return Ok(ILLEGAL_KEY),
        };
        let slot_size = self.slot_size;
        let spp = self.slots_per_page();

        let (mut data_index, mut position) = if key == ILLEGAL_KEY {
            match self.next_occupied(scope, 0, limit)? {
                Some(i) => (i, 0),
                None => return Ok(ILLEGAL_KEY),
            }
        } else {
            let prev_index = self.data_index_of(key);
            let next = key as usize + 1;
            let next_index = next / spp;
            if next_index != prev_index {
                match self.next_occupied(scope, next_index, limit)? {
                    Some(i) => (i, 0),
                    None => return Ok(ILLEGAL_KEY),
                }
            } else {
                (prev_index, next % spp)
            }
        };
        if data_index > limit {
            return Ok(ILLEGAL_KEY);
        }

        loop {
            let page_id = self.data_page_id(data_index);
            let found = scope.with_page(page_id, |buf| {
                let view = VectorDataPageView::new(buf);
                for pos in position..spp {
                    if !view.is_slot_free(pos, slot_size) {
                        return Ok(Some(pos));
                    }
                }
                Ok(None)
            })?;
            if let Some(pos) = found {
                return Ok(self.key_of(data_index, pos));
            }
            match self.next_occupied(scope, data_index + 1, limit)? {
                Some(i) => {
                    data_index = i;
                    position = 0;
                }
                None => return Ok(ILLEGAL_KEY),
            }
        }
    }

    /// The previous live key before `key`, or the last live key when
    /// `key` is the sentinel.
    fn prev_key(&self, scope: &mut PageScope<'_>, key: u32) -> Result<u32> {
        let (_, max_page) = self.read_header(scope)?;
        let limit = match self.max_data_index(max_page) {
            Some(limit) => limit,
            None => return Ok(ILLEGAL_KEY),
        };
        let slot_size = self.slot_size;
        let spp = self.slots_per_page();

        let (mut data_index, mut position) = if key == ILLEGAL_KEY {
            match self.prev_occupied(scope, limit)? {
                Some(i) => (i, spp - 1),
                None => return Ok(ILLEGAL_KEY),
            }
        } else {
            if key == 0 {
                return Ok(ILLEGAL_KEY);
            }
            let prev_index = self.data_index_of(key);
            let next = key as usize - 1;
            let next_index = next / spp;
            if next_index != prev_index || prev_index > limit {
                match self.prev_occupied(scope, next_index.min(limit))? {
                    Some(i) => (i, spp - 1),
                    None => return Ok(ILLEGAL_KEY),
                }
            } else {
                (prev_index, next % spp)
            }
        };

        loop {
            let page_id = self.data_page_id(data_index);
            let found = scope.with_page(page_id, |buf| {
                let view = VectorDataPageView::new(buf);
                for pos in (0..=position).rev() {
                    if !view.is_slot_free(pos, slot_size) {
                        return Ok(Some(pos));
                    }
                }
                Ok(None)
            })?;
            if let Some(pos) = found {
                return Ok(self.key_of(data_index, pos));
            }
            if data_index == 0 {
                return Ok(ILLEGAL_KEY);
            }
            match self.prev_occupied(scope, data_index - 1)? {
                Some(i) => {
                    data_index = i;
                    position = spp - 1;
                }
                None => return Ok(ILLEGAL_KEY),
            }
        }
    }

    pub fn search(&mut self, db: &DB, reverse: bool) -> Result<()> {
        self.check_available(db)?;
        let state = self
            .open_state
            .as_mut()
            .ok_or_else(|| Error::FileNotOpen("search before open".to_string()))?;
        state.reverse = reverse;
        state.interval_index = if reverse {
            state.intervals.len().saturating_sub(1)
        } else {
            0
        };
        state.current = None;
        state.marked = None;
        state.exhausted = state.intervals.is_empty();
        Ok(())
    }

    pub fn get(&mut self, db: &DB, out: &mut Vec<Value>) -> Result<Option<u32>> {
        self.check_available(db)?;
        let mut state = self
            .open_state
            .take()
            .ok_or_else(|| Error::FileNotOpen("get before open".to_string()))?;
        let result = self.do_get(db, &mut state, out);
        self.open_state = Some(state);
        result
    }

    fn do_get(
        &self,
        db: &DB,
        state: &mut VecOpenState,
        out: &mut Vec<Value>,
    ) -> Result<Option<u32>> {
        if state.exhausted || state.intervals.is_empty() {
            return Ok(None);
        }
        let mut scope = self.begin_scope(db, false)?;

        loop {
            let (min, max) = state.intervals[state.interval_index];
            // resume just outside the interval so the step lands on min
            // (or max when reversed)
            let from = match state.current {
                Some(c) => c,
                None => {
                    if !state.reverse {
                        if min == 0 {
                            ILLEGAL_KEY
                        } else {
                            min - 1
                        }
                    } else if max == ILLEGAL_KEY - 1 {
                        ILLEGAL_KEY
                    } else {
                        max + 1
                    }
                }
            };

            let key = if !state.reverse {
                self.next_key(&mut scope, from)?
            } else {
                self.prev_key(&mut scope, from)?
            };

            let in_window = key != ILLEGAL_KEY && key >= min && key <= max;
            if in_window {
                state.current = Some(key);
                if let Some(bitset) = &state.search_by_bitset {
                    if !bitset.borrow().test(key) {
                        continue;
                    }
                }
                let values = match self.read_slot(&mut scope, key)? {
                    Some(values) => values,
                    None => {
                        return Err(Error::Unexpected(format!(
                            "live key {} vanished mid-scan",
                            key
                        )))
                    }
                };
                out.clear();
                for field in state.projection.iter() {
                    if *field == 0 {
                        out.push(Value::UInt32(key));
                    } else {
                        out.push(values[*field - 1].clone());
                    }
                }
                return Ok(Some(key));
            }

            // the interval is exhausted; move to the next one
            state.current = None;
            if !state.reverse {
                state.interval_index += 1;
                if state.interval_index >= state.intervals.len() {
                    state.interval_index = state.intervals.len() - 1;
                    state.exhausted = true;
                    return Ok(None);
                }
            } else {
                if state.interval_index == 0 {
                    state.exhausted = true;
                    return Ok(None);
                }
                state.interval_index -= 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // verify

    pub fn verify(&self, db: &DB) -> Result<Progress> {
        self.check_available(db)?;
        let mut progress = Progress::new();
        let mut scope = self.begin_scope(db, false)?;

        match self.verify_impl(&mut scope, &mut progress) {
            Ok(()) => Ok(progress),
            Err(Error::VerifyAborted(message)) => {
                progress.fail(message);
                Ok(progress)
            }
            Err(e) => Err(e),
        }
    }

    fn verify_impl(&self, scope: &mut PageScope<'_>, progress: &mut Progress) -> Result<()> {
        let header_ok = scope.with_page(HEADER_PAGE_NUM, |buf| {
            let view = VectorHeaderPageView::new(buf);
            if view.get_magic() != VECTOR_MAGIC {
                return Ok(Some("bad magic in the header page".to_string()));
            }
            if !view.crc_ok() {
                return Ok(Some("header page checksum mismatch".to_string()));
            }
            Ok(None)
        })?;
        if let Some(message) = header_ok {
            progress.fail(message);
            return Ok(());
        }

        let (count, max_page) = self.read_header(scope)?;
        let slot_size = self.slot_size;
        let spp = self.slots_per_page();
        let limit = self.max_data_index(max_page);

        let mut total = 0u64;
        if let Some(limit) = limit {
            for data_index in 0..=limit {
                let page_id = self.data_page_id(data_index);
                let (live, recorded) = scope.with_page(page_id, |buf| {
                    let view = VectorDataPageView::new(buf);
                    let mut live = 0u32;
                    for pos in 0..spp {
                        if !view.is_slot_free(pos, slot_size) {
                            live += 1;
                        }
                    }
                    Ok((live, view.get_data_count()))
                })?;

                if live != recorded {
                    progress.fail(format!(
                        "data page {} records {} tuples but holds {}",
                        page_id, recorded, live
                    ));
                }
                let occupied = self.page_occupied(scope, data_index)?;
                if occupied != (live > 0) {
                    progress.fail(format!(
                        "occupancy bit of data page {} is {} with {} live tuples",
                        page_id, occupied, live
                    ));
                }
                total += live as u64;
            }
        }

        // bits past the last data page must all be off
        if max_page >= 1 {
            let last_block_first = {
                let blocks = (max_page as usize - 1) / PAGES_PER_TABLE;
                blocks * DATA_PAGES_PER_BLOCK
            };
            let next_index = limit.map(|l| l + 1).unwrap_or(0).max(last_block_first);
            let bitmap = self.bitmap_page_id(next_index);
            if bitmap <= max_page as usize {
                let stray = scope.with_page(bitmap, |buf| {
                    let view = VectorBitmapPageView::new(buf);
                    Ok(view.next_set(next_index % DATA_PAGES_PER_BLOCK))
                })?;
                if let Some(bit) = stray {
                    progress.fail(format!(
                        "occupancy bit set for unallocated data page {}",
                        (next_index - next_index % DATA_PAGES_PER_BLOCK) + bit
                    ));
                }
            }
        }

        if total != count {
            progress.fail(format!(
                "header counts {} tuples but the pages hold {}",
                count, total
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // condition shapes this file can search with

    fn searchable_term(&self, pred: &Predicate) -> bool {
        match pred {
            Predicate::Comparison { op, left, right } => {
                if *op == CompareOp::NotEquals {
                    return false;
                }
                matches!(
                    alternate_term(*op, left, right),
                    Some((0, Operand::Constant(Value::UInt32(_)), _))
                )
            }
            Predicate::Fetch { fields } => fields.len() == 1 && fields[0] == 0,
            _ => false,
        }
    }

    fn searchable(&self, pred: &Predicate) -> bool {
        match pred {
            Predicate::And(children) => {
                !children.is_empty() && children.iter().all(|c| self.searchable_term(c))
            }
            Predicate::Or(children) => {
                !children.is_empty()
                    && children.iter().all(|c| match c {
                        Predicate::And(inner) => {
                            !inner.is_empty() && inner.iter().all(|t| self.searchable_term(t))
                        }
                        other => self.searchable_term(other),
                    })
            }
            other => self.searchable_term(other),
        }
    }

    fn interval_of(cond: &Condition) -> Option<(u32, u32)> {
        if !cond.is_valid() || cond.is_never_match() {
            return None;
        }

        let min = match cond.get_lower().match_type {
            None | Some(MatchType::Undefined) => 0,
            Some(MatchType::Equals) | Some(MatchType::GreaterThanEquals) => {
                cond.get_lower().values.last()?.as_u32().ok()?
            }
            Some(MatchType::GreaterThan) => cond
                .get_lower()
                .values
                .last()?
                .as_u32()
                .ok()?
                .checked_add(1)?,
            _ => return None,
        };
        let max = match cond.get_upper().match_type {
            None | Some(MatchType::Undefined) => ILLEGAL_KEY - 1,
            Some(MatchType::Equals) | Some(MatchType::LessThanEquals) => {
                cond.get_upper().values.last()?.as_u32().ok()?
            }
            Some(MatchType::LessThan) => cond
                .get_upper()
                .values
                .last()?
                .as_u32()
                .ok()?
                .checked_sub(1)?,
            _ => return None,
        };

        let max = max.min(ILLEGAL_KEY - 1);
        if min <= max {
            Some((min, max))
        } else {
            None
        }
    }

    fn build_intervals(conditions: &[Condition]) -> Vec<(u32, u32)> {
        let mut intervals: Vec<(u32, u32)> = conditions
            .iter()
            .filter_map(Self::interval_of)
            .collect();
        intervals.sort();

        // merge overlapping windows so no key is visited twice
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(intervals.len());
        for (min, max) in intervals {
            match merged.last_mut() {
                Some((_, last_max)) if min <= last_max.saturating_add(1) => {
                    *last_max = (*last_max).max(max);
                }
                _ => merged.push((min, max)),
            }
        }
        merged
    }
}

impl Relation for VectorFile {
    fn get_relation_entry(&self) -> &RelationEntry {
        &self.rel_entry
    }
}

impl RelationWithStorage for VectorFile {
    fn get_storage_handle(&self) -> &Mutex<Option<StorageHandle>> {
        &self.shandle
    }
}

impl IndexFile for VectorFile {
    fn file_id(&self) -> &FileId {
        &self.file_id
    }

    fn get_search_parameter(&self, pred: &Predicate, opt: &mut OpenOption) -> bool {
        if !self.searchable(pred) {
            return false;
        }
        Condition::new(&self.cond_file_id()).get_search_parameter(pred, opt)
    }

    fn get_sort_parameter(&self, keys: &[usize], descending: bool, opt: &mut OpenOption) -> bool {
        // the file streams in key order
        if keys.len() != 1 || keys[0] != 0 {
            return false;
        }
        opt.set_bool(OptionKey::Reverse, descending);
        true
    }

    fn get_projection_parameter(&self, projection: &Projection, opt: &mut OpenOption) -> bool {
        match projection {
            Projection::Fields(fields) => {
                if fields.iter().any(|f| *f >= self.field_count()) {
                    return false;
                }
                opt.set_bool(OptionKey::FieldSelect, true);
                opt.set_int(OptionKey::TargetFieldNumber, fields.len() as i64);
                for (i, field) in fields.iter().enumerate() {
                    opt.set_int(OptionKey::TargetFieldIndex(i as u32), *field as i64);
                }
                true
            }
            // min/max of the key would be a plain boundary scan; the
            // planner never asks the vector driver for it
            Projection::Min(_) | Projection::Max(_) => false,
        }
    }

    fn get_count(&self, db: &DB) -> Result<u64> {
        let mut scope = self.begin_scope(db, false)?;
        let (count, _) = self.read_header(&mut scope)?;
        Ok(count)
    }

    fn get_estimate_count(&self, db: &DB, opt: &OpenOption) -> Result<u64> {
        let count = self.get_count(db)?;
        let cond_count = opt.get_int_or(OptionKey::ConditionCount, 0)?;
        if cond_count == 0 {
            return Ok(count);
        }
        if opt.get_int_or(OptionKey::FetchFieldNumber, 0)? > 0 {
            return Ok(1);
        }

        let mut conditions = Vec::new();
        for number in 0..cond_count {
            let mut cond = Condition::new(&self.cond_file_id());
            cond.set_open_option(opt, number as u32)?;
            conditions.push(cond);
        }
        let width: u64 = Self::build_intervals(&conditions)
            .iter()
            .map(|(min, max)| (*max - *min) as u64 + 1)
            .sum();
        Ok(width.min(count))
    }

    fn get_overhead(&self) -> f64 {
        VECTOR_OVERHEAD
    }

    fn get_process_cost(&self) -> f64 {
        VECTOR_PROCESS_COST
    }

    fn is_get_by_bitset(&self) -> bool {
        true
    }

    fn is_search_by_bitset(&self) -> bool {
        true
    }

    fn open(&mut self, db: &DB, opt: &OpenOption) -> Result<()> {
        self.check_available(db)?;
        if !self.mounted {
            return Err(Error::FileNotOpen(format!(
                "relation {} is not mounted",
                self.file_id.file_ref()
            )));
        }

        let mode = opt.get_open_mode()?;

        let projection = if opt.get_bool(OptionKey::FieldSelect)? {
            let n = opt.get_int_or(OptionKey::TargetFieldNumber, 0)?;
            let mut fields = Vec::with_capacity(n as usize);
            for i in 0..n {
                let field = opt
                    .get_int(OptionKey::TargetFieldIndex(i as u32))?
                    .ok_or_else(|| {
                        Error::BadArgument(format!("projection field {} missing", i))
                    })?;
                if field as usize >= self.field_count() {
                    return Err(Error::BadArgument(format!(
                        "projection field {} out of range",
                        field
                    )));
                }
                fields.push(field as usize);
            }
            fields
        } else {
            (0..self.field_count()).collect()
        };

        let fetch_mode = opt.get_int_or(OptionKey::FetchFieldNumber, 0)? > 0;
        let cond_count = opt.get_int_or(OptionKey::ConditionCount, 0)?.max(1);
        let mut conditions = Vec::with_capacity(cond_count as usize);
        for number in 0..cond_count {
            let mut cond = Condition::new(&self.cond_file_id());
            cond.set_open_option(opt, number as u32)?;
            conditions.push(cond);
        }

        let intervals = if fetch_mode {
            Vec::new()
        } else {
            Self::build_intervals(&conditions)
        };

        let reverse = opt.get_bool(OptionKey::Reverse)?;
        self.open_state = Some(VecOpenState {
            mode,
            reverse,
            projection,
            search_by_bitset: opt.get_bitset(OptionKey::SearchByBitSet)?,
            fetch_mode,
            exhausted: intervals.is_empty(),
            interval_index: if reverse {
                intervals.len().saturating_sub(1)
            } else {
                0
            },
            intervals,
            current: None,
            marked: None,
        });
        debug!(
            "opened vector {} in {:?} mode",
            self.file_id.file_ref(),
            mode
        );
        Ok(())
    }

    fn close(&mut self, db: &DB) -> Result<()> {
        if let Some(state) = self.open_state.take() {
            if state.mode == OpenMode::Batch {
                self.flush(db)?;
            }
        }
        Ok(())
    }

    fn fetch(&mut self, key: &[Value]) -> Result<()> {
        let state = self
            .open_state
            .as_mut()
            .ok_or_else(|| Error::FileNotOpen("fetch before open".to_string()))?;
        if !state.fetch_mode || key.len() != 1 {
            return Err(Error::BadArgument(
                "the file was not opened for fetch".to_string(),
            ));
        }
        let key = key[0].as_u32()?;
        state.intervals = if key == ILLEGAL_KEY {
            Vec::new()
        } else {
            vec![(key, key)]
        };
        state.interval_index = 0;
        state.current = None;
        state.marked = None;
        state.exhausted = state.intervals.is_empty();
        Ok(())
    }

    fn get(&mut self, db: &DB, out: &mut Vec<Value>) -> Result<Option<u32>> {
        VectorFile::get(self, db, out)
    }

    fn get_by_bitset(&mut self, db: &DB, out: &TupleBitSetPtr) -> Result<()> {
        self.check_available(db)?;
        let state = self
            .open_state
            .as_ref()
            .ok_or_else(|| Error::FileNotOpen("get before open".to_string()))?;
        let intervals = state.intervals.clone();
        let narrowing = state.search_by_bitset.clone();
        let mut scope = self.begin_scope(db, false)?;

        for (min, max) in intervals {
            let mut key = if min == 0 {
                self.next_key(&mut scope, ILLEGAL_KEY)?
            } else {
                self.next_key(&mut scope, min - 1)?
            };
            while key != ILLEGAL_KEY && key <= max {
                if key >= min {
                    if let Some(bitset) = &narrowing {
                        if bitset.borrow().test(key) {
                            out.borrow_mut().insert(key);
                        }
                    } else {
                        out.borrow_mut().insert(key);
                    }
                }
                key = self.next_key(&mut scope, key)?;
            }
        }
        Ok(())
    }

    fn mark(&mut self) -> Result<()> {
        let state = self
            .open_state
            .as_mut()
            .ok_or_else(|| Error::FileNotOpen("mark before open".to_string()))?;
        if state.current.is_some() {
            state.marked = Some((state.interval_index, state.current));
        }
        Ok(())
    }

    fn rewind(&mut self, _db: &DB) -> Result<()> {
        let state = self
            .open_state
            .as_mut()
            .ok_or_else(|| Error::FileNotOpen("rewind before open".to_string()))?;
        match state.marked.take() {
            Some((interval_index, current)) => {
                state.interval_index = interval_index;
                state.current = current;
                state.exhausted = false;
            }
            None => {
                // no mark: restart the scan
                state.interval_index = if state.reverse {
                    state.intervals.len().saturating_sub(1)
                } else {
                    0
                };
                state.current = None;
                state.exhausted = state.intervals.is_empty();
            }
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let state = self
            .open_state
            .as_mut()
            .ok_or_else(|| Error::FileNotOpen("reset before open".to_string()))?;
        state.interval_index = 0;
        state.current = None;
        state.marked = None;
        state.exhausted = state.intervals.is_empty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::am::datum::Collation;
    use crate::test_util::get_temp_db;
    use crate::TupleBitSet;

    fn small_file() -> FileId {
        FileId {
            db: 0,
            rel_id: 3,
            key: RowLayout::empty(),
            value: RowLayout::new(vec![FieldDef {
                data_type: DataType::Char(8),
                collation: Collation::PadSpace,
            }]),
            unique: true,
            top_null: false,
        }
    }

    /// Wide slots so a handful of keys spans several data pages.
    fn wide_file() -> FileId {
        FileId {
            db: 0,
            rel_id: 4,
            key: RowLayout::empty(),
            value: RowLayout::new(vec![FieldDef {
                data_type: DataType::Char(500),
                collation: Collation::PadSpace,
            }]),
            unique: true,
            top_null: false,
        }
    }

    fn open_mode(file: &mut VectorFile, db: &DB, mode: OpenMode) {
        let mut opt = OpenOption::new();
        opt.set_open_mode(mode);
        file.open(db, &opt).unwrap();
    }

    fn tuple(key: u32, s: &str) -> Vec<Value> {
        vec![Value::UInt32(key), Value::String(s.to_string())]
    }

    #[test]
    fn dense_update_cycle() {
        let (db, _dir) = get_temp_db();
        let mut file = VectorFile::new(small_file()).unwrap();
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        file.insert(&db, &tuple(5, "a")).unwrap();
        file.update(&db, 5, &[Value::String("b".to_string())], &[0])
            .unwrap();

        let mut out = Vec::new();
        assert!(file.fetch_values(&db, 5, &mut out).unwrap());
        assert_eq!(
            out,
            vec![Value::UInt32(5), Value::String("b".to_string())]
        );

        file.expunge(&db, 5).unwrap();
        assert!(!file.fetch_values(&db, 5, &mut out).unwrap());
        file.close(&db).unwrap();
    }

    #[test]
    fn missing_and_duplicate_keys_are_reported() {
        let (db, _dir) = get_temp_db();
        let mut file = VectorFile::new(small_file()).unwrap();
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        file.insert(&db, &tuple(1, "x")).unwrap();

        match file.insert(&db, &tuple(1, "y")) {
            Err(Error::UniquenessViolation(_)) => {}
            other => panic!("expected a uniqueness violation, got {:?}", other.err()),
        }
        match file.expunge(&db, 2) {
            Err(Error::EntryNotFound(_)) => {}
            other => panic!("expected entry-not-found, got {:?}", other.err()),
        }
        match file.insert(&db, &tuple(ILLEGAL_KEY, "z")) {
            Err(Error::BadArgument(_)) => {}
            other => panic!("expected a bad argument, got {:?}", other.err()),
        }
    }

    #[test]
    fn occupancy_bits_follow_page_population() {
        let (db, _dir) = get_temp_db();
        let mut file = VectorFile::new(wide_file()).unwrap();
        file.create(&db).unwrap();

        let spp = file.slots_per_page() as u32;
        open_mode(&mut file, &db, OpenMode::Update);

        // three keys on three different data pages
        let keys = [0, spp + 1, 2 * spp + 3];
        for k in keys.iter() {
            file.insert(&db, &tuple(*k, "v")).unwrap();
        }
        let progress = file.verify(&db).unwrap();
        assert!(progress.consistent, "{:?}", progress.messages);

        // emptying the middle page must clear its bit, which the scan
        // then skips
        file.expunge(&db, spp + 1).unwrap();
        let progress = file.verify(&db).unwrap();
        assert!(progress.consistent, "{:?}", progress.messages);
        file.close(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Read);
        file.search(&db, false).unwrap();
        let mut out = Vec::new();
        assert_eq!(file.get(&db, &mut out).unwrap(), Some(0));
        assert_eq!(file.get(&db, &mut out).unwrap(), Some(2 * spp + 3));
        assert_eq!(file.get(&db, &mut out).unwrap(), None);
        file.close(&db).unwrap();
    }

    #[test]
    fn forward_and_reverse_scans() {
        let (db, _dir) = get_temp_db();
        let mut file = VectorFile::new(small_file()).unwrap();
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        for k in &[8u32, 1, 30, 12] {
            file.insert(&db, &tuple(*k, "v")).unwrap();
        }
        file.close(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Read);
        file.search(&db, false).unwrap();
        let mut out = Vec::new();
        let mut keys = Vec::new();
        while let Some(k) = file.get(&db, &mut out).unwrap() {
            keys.push(k);
        }
        assert_eq!(keys, vec![1, 8, 12, 30]);

        file.search(&db, true).unwrap();
        let mut keys = Vec::new();
        while let Some(k) = file.get(&db, &mut out).unwrap() {
            keys.push(k);
        }
        assert_eq!(keys, vec![30, 12, 8, 1]);
        file.close(&db).unwrap();
    }

    #[test]
    fn interval_scan_from_predicate() {
        let (db, _dir) = get_temp_db();
        let mut file = VectorFile::new(small_file()).unwrap();
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        for k in 0..20 {
            file.insert(&db, &tuple(k, "v")).unwrap();
        }
        file.close(&db).unwrap();

        let pred = Predicate::Or(vec![
            Predicate::And(vec![
                Predicate::ge(0, Value::UInt32(2)),
                Predicate::le(0, Value::UInt32(4)),
            ]),
            Predicate::eq(0, Value::UInt32(17)),
        ]);
        let mut opt = OpenOption::new();
        opt.set_open_mode(OpenMode::Read);
        assert!(file.get_search_parameter(&pred, &mut opt));
        file.open(&db, &opt).unwrap();
        file.search(&db, false).unwrap();

        let mut out = Vec::new();
        let mut keys = Vec::new();
        while let Some(k) = file.get(&db, &mut out).unwrap() {
            keys.push(k);
        }
        assert_eq!(keys, vec![2, 3, 4, 17]);
        file.close(&db).unwrap();

        // estimates follow the window widths
        let estimate = file.get_estimate_count(&db, &opt).unwrap();
        assert_eq!(estimate, 4);
    }

    #[test]
    fn fetch_binds_single_keys() {
        let (db, _dir) = get_temp_db();
        let mut file = VectorFile::new(small_file()).unwrap();
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        for k in 0..5 {
            file.insert(&db, &tuple(k, "v")).unwrap();
        }
        file.close(&db).unwrap();

        let mut opt = OpenOption::new();
        opt.set_open_mode(OpenMode::Read);
        assert!(file.get_search_parameter(&Predicate::Fetch { fields: vec![0] }, &mut opt));
        file.open(&db, &opt).unwrap();

        let mut out = Vec::new();
        file.fetch(&[Value::UInt32(3)]).unwrap();
        assert_eq!(file.get(&db, &mut out).unwrap(), Some(3));
        assert_eq!(file.get(&db, &mut out).unwrap(), None);

        file.fetch(&[Value::UInt32(7)]).unwrap();
        assert_eq!(file.get(&db, &mut out).unwrap(), None);
        file.close(&db).unwrap();
    }

    #[test]
    fn bitset_output_and_narrowing() {
        let (db, _dir) = get_temp_db();
        let mut file = VectorFile::new(small_file()).unwrap();
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        for k in 0..10 {
            file.insert(&db, &tuple(k, "v")).unwrap();
        }
        file.close(&db).unwrap();

        let pred = Predicate::And(vec![
            Predicate::ge(0, Value::UInt32(2)),
            Predicate::le(0, Value::UInt32(8)),
        ]);

        let mut opt = OpenOption::new();
        opt.set_open_mode(OpenMode::Read);
        assert!(file.get_search_parameter(&pred, &mut opt));
        opt.set_bool(OptionKey::GetByBitSet, true);
        file.open(&db, &opt).unwrap();
        let out = TupleBitSet::new_ptr();
        file.get_by_bitset(&db, &out).unwrap();
        assert_eq!(
            out.borrow().iter().collect::<Vec<_>>(),
            vec![2, 3, 4, 5, 6, 7, 8]
        );
        file.close(&db).unwrap();

        // narrowed by a caller-supplied bitset
        let narrowing = TupleBitSet::new_ptr();
        narrowing.borrow_mut().insert(3);
        narrowing.borrow_mut().insert(7);
        narrowing.borrow_mut().insert(9);

        let mut opt = OpenOption::new();
        opt.set_open_mode(OpenMode::Read);
        assert!(file.get_search_parameter(&pred, &mut opt));
        opt.set_bitset(OptionKey::SearchByBitSet, narrowing);
        file.open(&db, &opt).unwrap();
        file.search(&db, false).unwrap();
        let mut out = Vec::new();
        let mut keys = Vec::new();
        while let Some(k) = file.get(&db, &mut out).unwrap() {
            keys.push(k);
        }
        assert_eq!(keys, vec![3, 7]);
        file.close(&db).unwrap();
    }
}
