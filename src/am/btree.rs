//! The B+tree file driver.
//!
//! Entries are the marshalled key fields followed by the value fields;
//! the last value field is the tuple id. Non-leaf entries carry a full
//! entry image as the separator plus the child page id, so that entries
//! with equal keys still have a total order and every descent lands on
//! one page.

mod btree_page;

use self::btree_page::{views::*, FREE_PAGE_LEVEL, MAX_LEAF_ENTRY_SIZE};

use crate::{
    am::{
        cond::Condition,
        datum::{Compare, DataType, FieldDef, RowLayout, Value},
        index::{IndexFile, Progress, Projection},
        open_option::{OpenMode, OpenOption, OptionKey, MIN_MAX_MAX, MIN_MAX_MIN},
        FileId,
    },
    plan::predicate::Predicate,
    storage::{PageScope, RelationWithStorage, StorageHandle},
    Error, Relation, RelationEntry, RelationKind, Result, TupleBitSet, TupleBitSetPtr, DB,
};

use std::{cmp::Ordering, collections::HashSet, sync::Mutex};

use log::debug;

const HEADER_PAGE_NUM: usize = 0;

// planner cost units
const BTREE_OVERHEAD: f64 = 0.002;
const BTREE_PROCESS_COST: f64 = 0.00005;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MinMax {
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cursor {
    /// Not positioned yet; the next `get` issues the search.
    Invalid,
    /// The current condition ran out of entries.
    Exhausted,
    /// The next entry to examine.
    At { page: u32, index: isize },
}

struct OpenState {
    mode: OpenMode,
    reverse: bool,
    get_by_bitset: bool,
    search_by_bitset: Option<TupleBitSetPtr>,
    min_max: Option<MinMax>,
    min_max_done: bool,
    projection: Vec<usize>,
    conditions: Vec<Condition>,
    cond_index: usize,
    cursor: Cursor,
    marked: Option<(usize, Cursor)>,
    /// Tuple ids committed as returned; `get` skips them.
    tuple_bit: TupleBitSet,
    /// Tuple ids returned since the last commit point; replayable by a
    /// rewind.
    pending: Vec<u32>,
}

impl OpenState {
    fn commit_pending(&mut self) {
        for id in self.pending.drain(..) {
            self.tuple_bit.insert(id);
        }
    }
}

pub struct BtreeFile {
    rel_entry: RelationEntry,
    file_id: FileId,
    shandle: Mutex<Option<StorageHandle>>,
    mounted: bool,
    open_state: Option<OpenState>,
}

type TreePath = Vec<(u32, usize)>;

impl BtreeFile {
    pub fn new(file_id: FileId) -> Self {
        let rel_entry = RelationEntry::new(file_id.rel_id, file_id.db, RelationKind::Btree);
        Self {
            rel_entry,
            file_id,
            shandle: Mutex::new(None),
            mounted: false,
            open_state: None,
        }
    }

    fn entry_layout(&self) -> RowLayout {
        self.file_id.entry_layout()
    }

    fn internal_layout(&self) -> RowLayout {
        let mut fields = self.entry_layout().fields().to_vec();
        fields.push(FieldDef::new(DataType::UInt32));
        RowLayout::new(fields)
    }

    fn entry_compare(&self) -> Compare {
        Compare::new(self.entry_layout().fields().to_vec())
    }

    fn key_len(&self) -> usize {
        self.file_id.key.len()
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
        let unique = self.file_id.unique;
        scope.with_page_mut(HEADER_PAGE_NUM, |buf| {
            let mut view = BtreeHeaderPageViewMut::new(buf);
            view.init_page(unique);
            Ok(())
        })?;
        scope.commit()?;
        self.mounted = true;
        Ok(())
    }

    /// Remove the file. Never consults mount state so that a
    /// half-finished create can always be torn down.
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

    /// Rename the backing file into another database directory. Like
    /// destroy this works whether or not the file is mounted.
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
        self.rel_entry = RelationEntry::new(self.file_id.rel_id, new_db, RelationKind::Btree);
        Ok(())
    }

    pub fn flush(&self, db: &DB) -> Result<()> {
        self.with_storage(db.get_storage_manager(), |shandle| {
            db.get_buffer_manager().flush_relation(shandle)
        })
    }

    /// Throw away unflushed changes; pages are re-read on demand.
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
    // header helpers

    fn read_header(&self, scope: &mut PageScope<'_>) -> Result<(u64, u32, u32, u32, u32)> {
        scope.with_page(HEADER_PAGE_NUM, |buf| {
            let view = BtreeHeaderPageView::new(buf);
            if view.get_magic() != btree_page::BTREE_MAGIC {
                return Err(Error::DataCorrupted(
                    "not a btree file: bad magic".to_string(),
                ));
            }
            Ok((
                view.get_count(),
                view.get_root(),
                view.get_leftmost(),
                view.get_free_head(),
                view.get_max_page(),
            ))
        })
    }

    fn update_header<F>(&self, scope: &mut PageScope<'_>, f: F) -> Result<()>
    where
        F: FnOnce(&mut BtreeHeaderPageViewMut<'_>),
    {
        scope.with_page_mut(HEADER_PAGE_NUM, |buf| {
            let mut view = BtreeHeaderPageViewMut::new(buf);
            f(&mut view);
            view.update_crc();
            Ok(())
        })
    }

    fn page_info(&self, scope: &mut PageScope<'_>, page: u32) -> Result<(usize, u32, u16)> {
        scope.with_page(page as usize, |buf| {
            let view = BtreeIndexPageView::new(buf);
            Ok((view.get_entry_count(), view.get_next(), view.get_level()))
        })
    }

    fn read_entry(&self, scope: &mut PageScope<'_>, page: u32, index: usize) -> Result<Vec<u8>> {
        scope.with_page(page as usize, |buf| {
            let view = BtreeIndexPageView::new(buf);
            if index >= view.get_entry_count() {
                return Err(Error::Unexpected(format!(
                    "entry {} out of range on page {}",
                    index, page
                )));
            }
            Ok(view.get_entry(index).to_vec())
        })
    }

    fn entry_key(&self, entry: &[u8]) -> Result<Vec<Value>> {
        self.file_id.key.decode(entry)
    }

    fn entry_values(&self, entry: &[u8]) -> Result<Vec<Value>> {
        self.entry_layout().decode(entry)
    }

    fn child_of(&self, entry: &[u8]) -> Result<u32> {
        let values = self.internal_layout().decode(entry)?;
        values
            .last()
            .ok_or_else(|| Error::DataCorrupted("empty separator entry".to_string()))?
            .as_u32()
    }

    // ------------------------------------------------------------------
    // descent

    /// Binary search over a page's entries: the first index for which
    /// `pred` is true, assuming the predicate is monotone.
    fn first_matching<F>(
        &self,
        scope: &mut PageScope<'_>,
        page: u32,
        start: usize,
        pred: F,
    ) -> Result<usize>
    where
        F: Fn(&[u8]) -> Result<bool>,
    {
        scope.with_page(page as usize, |buf| {
            let view = BtreeIndexPageView::new(buf);
            let mut lo = start;
            let mut hi = view.get_entry_count();
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if pred(view.get_entry(mid))? {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }
            Ok(lo)
        })
    }

    /// Descend to the leaf where the first entry satisfying the lower
    /// bound lives. Returns the leaf and the entry index (possibly one
    /// past the last entry of that leaf).
    fn descend_lower(
        &self,
        scope: &mut PageScope<'_>,
        root: u32,
        cond: &Condition,
    ) -> Result<(u32, usize)> {
        let mut page = root;
        loop {
            let (count, _, level) = self.page_info(scope, page)?;
            if level == 0 {
                let index = self.first_matching(scope, page, 0, |entry| {
                    Ok(cond.matches_lower(&self.entry_key(entry)?))
                })?;
                return Ok((page, index));
            }
            // the leftmost entry acts as minus infinity
            let fm = if count <= 1 {
                count
            } else {
                self.first_matching(scope, page, 1, |entry| {
                    Ok(cond.matches_lower(&self.entry_key(entry)?))
                })?
            };
            let child_index = fm.saturating_sub(1);
            let entry = self.read_entry(scope, page, child_index)?;
            page = self.child_of(&entry)?;
        }
    }

    /// Descend to the leaf holding the last entry inside the upper
    /// bound. Returns the leaf and that entry's index, or index -1 when
    /// the leaf starts past the bound.
    fn descend_upper(
        &self,
        scope: &mut PageScope<'_>,
        root: u32,
        cond: &Condition,
    ) -> Result<(u32, isize)> {
        let mut page = root;
        loop {
            let (count, _, level) = self.page_info(scope, page)?;
            if level == 0 {
                let fu = self.first_matching(scope, page, 0, |entry| {
                    Ok(!cond.matches_upper(&self.entry_key(entry)?))
                })?;
                return Ok((page, fu as isize - 1));
            }
            let fu = if count <= 1 {
                count
            } else {
                self.first_matching(scope, page, 1, |entry| {
                    Ok(!cond.matches_upper(&self.entry_key(entry)?))
                })?
            };
            let child_index = fu.saturating_sub(1);
            let entry = self.read_entry(scope, page, child_index)?;
            page = self.child_of(&entry)?;
        }
    }

    /// Descend by the total entry order, recording the path. Used by
    /// insert and expunge.
    fn descend_entry(
        &self,
        scope: &mut PageScope<'_>,
        root: u32,
        target: &[Value],
    ) -> Result<(u32, usize, TreePath)> {
        let compare = self.entry_compare();
        let field_count = self.file_id.field_count();
        let mut page = root;
        let mut path = TreePath::new();
        loop {
            let (count, _, level) = self.page_info(scope, page)?;
            if level == 0 {
                let index = self.first_matching(scope, page, 0, |entry| {
                    let values = self.entry_values(entry)?;
                    Ok(compare.compare(&values, target) != Ordering::Less)
                })?;
                return Ok((page, index, path));
            }
            let fm = if count <= 1 {
                count
            } else {
                self.first_matching(scope, page, 1, |entry| {
                    let values = self.internal_layout().decode(entry)?;
                    Ok(compare.compare(&values[..field_count], target) == Ordering::Greater)
                })?
            };
            let child_index = fm.saturating_sub(1);
            let entry = self.read_entry(scope, page, child_index)?;
            path.push((page, child_index));
            page = self.child_of(&entry)?;
        }
    }

    fn rightmost_leaf(&self, scope: &mut PageScope<'_>, root: u32) -> Result<(u32, usize)> {
        let mut page = root;
        loop {
            let (count, _, level) = self.page_info(scope, page)?;
            if level == 0 {
                return Ok((page, count));
            }
            let entry = self.read_entry(scope, page, count - 1)?;
            page = self.child_of(&entry)?;
        }
    }

    /// Find the entry just before `target` in the total order. Used to
    /// step a reverse scan across a page boundary.
    fn step_page_backward(
        &self,
        scope: &mut PageScope<'_>,
        root: u32,
        target: &[Value],
    ) -> Result<Option<(u32, isize)>> {
        let compare = self.entry_compare();
        let field_count = self.file_id.field_count();
        let mut page = root;
        loop {
            let (count, _, level) = self.page_info(scope, page)?;
            if count == 0 {
                return Ok(None);
            }
            if level == 0 {
                let index = self.first_matching(scope, page, 0, |entry| {
                    let values = self.entry_values(entry)?;
                    Ok(compare.compare(&values, target) != Ordering::Less)
                })?;
                if index == 0 {
                    return Ok(None);
                }
                return Ok(Some((page, index as isize - 1)));
            }
            let fm = if count <= 1 {
                count
            } else {
                self.first_matching(scope, page, 1, |entry| {
                    let values = self.internal_layout().decode(entry)?;
                    Ok(compare.compare(&values[..field_count], target) != Ordering::Less)
                })?
            };
            let child_index = fm.saturating_sub(1);
            let entry = self.read_entry(scope, page, child_index)?;
            page = self.child_of(&entry)?;
        }
    }

    // ------------------------------------------------------------------
    // page allocation

    fn alloc_index_page(&self, scope: &mut PageScope<'_>, level: u16) -> Result<u32> {
        let (_, _, _, free_head, max_page) = self.read_header(scope)?;

        let page = if free_head != 0 {
            let next_free = scope.with_page(free_head as usize, |buf| {
                let view = BtreeIndexPageView::new(buf);
                if !view.is_free() {
                    return Err(Error::DataCorrupted(format!(
                        "page {} on the free list is not free",
                        free_head
                    )));
                }
                Ok(view.get_next())
            })?;
            self.update_header(scope, |view| view.set_free_head(next_free))?;
            free_head
        } else {
            let page = scope.allocate()? as u32;
            if page > max_page {
                self.update_header(scope, |view| view.set_max_page(page))?;
            }
            page
        };

        scope.with_page_mut(page as usize, |buf| {
            let mut view = BtreeIndexPageViewMut::new(buf);
            view.init_page(level);
            Ok(())
        })?;
        Ok(page)
    }

    fn free_index_page(&self, scope: &mut PageScope<'_>, page: u32) -> Result<()> {
        let (_, _, _, free_head, _) = self.read_header(scope)?;
        scope.with_page_mut(page as usize, |buf| {
            let mut view = BtreeIndexPageViewMut::new(buf);
            view.init_page(FREE_PAGE_LEVEL);
            view.set_next(free_head);
            Ok(())
        })?;
        self.update_header(scope, |view| view.set_free_head(page))
    }

    // ------------------------------------------------------------------
    // insert

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

        if values.len() != self.file_id.field_count() {
            return Err(Error::BadArgument(format!(
                "tuple has {} fields, the file stores {}",
                values.len(),
                self.file_id.field_count()
            )));
        }
        if !self.file_id.top_null {
            for value in values[..self.key_len()].iter() {
                if value.is_null() {
                    return Err(Error::BadArgument(
                        "null keys are not storable in this file".to_string(),
                    ));
                }
            }
        }

        let entry = self.entry_layout().encode(values)?;
        if entry.len() > MAX_LEAF_ENTRY_SIZE {
            return Err(Error::BadArgument(format!(
                "entry of {} bytes exceeds the page limit",
                entry.len()
            )));
        }

        let batch = mode == OpenMode::Batch;
        let mut scope = self.begin_scope(db, batch)?;
        match self.insert_impl(&mut scope, &entry, values) {
            Ok(()) => scope.commit(),
            Err(e) => {
                scope.abort();
                Err(e)
            }
        }
    }

    fn insert_impl(
        &self,
        scope: &mut PageScope<'_>,
        entry: &[u8],
        values: &[Value],
    ) -> Result<()> {
        let (count, root, _, _, _) = self.read_header(scope)?;

        if root == 0 {
            let page = self.alloc_index_page(scope, 0)?;
            scope.with_page_mut(page as usize, |buf| {
                let mut view = BtreeIndexPageViewMut::new(buf);
                view.insert_entry(0, entry);
                Ok(())
            })?;
            self.update_header(scope, |view| {
                view.set_root(page);
                view.set_leftmost(page);
                view.set_count(count + 1);
            })?;
            return Ok(());
        }

        let (leaf, index, path) = self.descend_entry(scope, root, values)?;

        if self.file_id.unique {
            self.check_unique(scope, leaf, index, values)?;
        }

        self.insert_into_page(scope, leaf, index, entry, path)?;
        self.update_header(scope, |view| view.set_count(count + 1))?;
        Ok(())
    }

    /// A unique file refuses a second entry with the same key, unless
    /// the key contains a null.
    fn check_unique(
        &self,
        scope: &mut PageScope<'_>,
        leaf: u32,
        index: usize,
        values: &[Value],
    ) -> Result<()> {
        if values[..self.key_len()].iter().any(|v| v.is_null()) {
            return Ok(());
        }

        let key_compare = Compare::new(self.file_id.key.fields().to_vec());
        let key = &values[..self.key_len()];

        // the neighbours of the insertion point are the only candidates
        let (count, next, _) = self.page_info(scope, leaf)?;
        let mut candidates = Vec::new();
        if index < count {
            candidates.push((leaf, index));
        } else if next != 0 {
            candidates.push((next, 0));
        }
        if index > 0 {
            candidates.push((leaf, index - 1));
        }

        for (page, i) in candidates {
            let (c, _, _) = self.page_info(scope, page)?;
            if i >= c {
                continue;
            }
            let entry = self.read_entry(scope, page, i)?;
            let entry_key = self.entry_key(&entry)?;
            if key_compare.compare(&entry_key, key) == Ordering::Equal {
                return Err(Error::UniquenessViolation(format!(
                    "key already present in relation {}",
                    self.file_id.file_ref()
                )));
            }
        }
        Ok(())
    }

    fn insert_into_page(
        &self,
        scope: &mut PageScope<'_>,
        page: u32,
        index: usize,
        entry: &[u8],
        path: TreePath,
    ) -> Result<()> {
        let fits = scope.with_page(page as usize, |buf| {
            let view = BtreeIndexPageView::new(buf);
            Ok(view.has_room(entry.len()))
        })?;

        if fits {
            return scope.with_page_mut(page as usize, |buf| {
                let mut view = BtreeIndexPageViewMut::new(buf);
                view.insert_entry(index, entry);
                Ok(())
            });
        }

        self.split_page(scope, page, index, entry, path)
    }

    fn split_page(
        &self,
        scope: &mut PageScope<'_>,
        page: u32,
        index: usize,
        entry: &[u8],
        mut path: TreePath,
    ) -> Result<()> {
        // gather the page's entries with the new one in place
        let (level, old_next, mut entries) = scope.with_page(page as usize, |buf| {
            let view = BtreeIndexPageView::new(buf);
            let mut entries: Vec<Vec<u8>> = Vec::with_capacity(view.get_entry_count() + 1);
            for i in 0..view.get_entry_count() {
                entries.push(view.get_entry(i).to_vec());
            }
            Ok((view.get_level(), view.get_next(), entries))
        })?;
        entries.insert(index, entry.to_vec());

        // split by accumulated size so both halves fit
        let total: usize = entries.iter().map(|e| e.len()).sum();
        let mut split = 1;
        let mut acc = entries[0].len();
        while split < entries.len() - 1 && acc < total / 2 {
            acc += entries[split].len();
            split += 1;
        }

        let right_page = self.alloc_index_page(scope, level)?;

        // rebuild the left page
        scope.with_page_mut(page as usize, |buf| {
            let mut view = BtreeIndexPageViewMut::new(buf);
            view.init_page(level);
            for (i, e) in entries[..split].iter().enumerate() {
                view.insert_entry(i, e);
            }
            view.set_next(right_page);
            Ok(())
        })?;

        // fill the right page
        scope.with_page_mut(right_page as usize, |buf| {
            let mut view = BtreeIndexPageViewMut::new(buf);
            for (i, e) in entries[split..].iter().enumerate() {
                view.insert_entry(i, e);
            }
            view.set_next(old_next);
            Ok(())
        })?;

        // the separator for the parent is the right page's first entry
        let sep_fields = self.entry_values(&entries[split])?;
        let mut sep_values = sep_fields;
        sep_values.push(Value::UInt32(right_page));
        let sep_entry = self.internal_layout().encode(&sep_values)?;

        match path.pop() {
            Some((parent, child_index)) => {
                self.insert_into_page(scope, parent, child_index + 1, &sep_entry, path)
            }
            None => {
                // split of the root: grow the tree by one level
                let new_root = self.alloc_index_page(scope, level + 1)?;
                let mut left_values = self.entry_values(&entries[0])?;
                left_values.push(Value::UInt32(page));
                let left_entry = self.internal_layout().encode(&left_values)?;
                scope.with_page_mut(new_root as usize, |buf| {
                    let mut view = BtreeIndexPageViewMut::new(buf);
                    view.insert_entry(0, &left_entry);
                    view.insert_entry(1, &sep_entry);
                    Ok(())
                })?;
                self.update_header(scope, |view| view.set_root(new_root))
            }
        }
    }

    // ------------------------------------------------------------------
    // expunge / update

    pub fn expunge(&mut self, db: &DB, values: &[Value]) -> Result<()> {
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

        if values.len() != self.file_id.field_count() {
            return Err(Error::BadArgument(format!(
                "key has {} fields, the file stores {}",
                values.len(),
                self.file_id.field_count()
            )));
        }

        let batch = mode == OpenMode::Batch;
        let mut scope = self.begin_scope(db, batch)?;
        match self.expunge_impl(&mut scope, values) {
            Ok(()) => scope.commit(),
            Err(e) => {
                scope.abort();
                Err(e)
            }
        }
    }

    fn expunge_impl(&self, scope: &mut PageScope<'_>, values: &[Value]) -> Result<()> {
        let (count, root, _, _, _) = self.read_header(scope)?;
        if root == 0 {
            return Err(Error::EntryNotFound(format!(
                "relation {} is empty",
                self.file_id.file_ref()
            )));
        }

        let target = self.entry_layout().encode(values)?;
        let (leaf, index, path) = self.descend_entry(scope, root, values)?;

        let found = scope.with_page(leaf as usize, |buf| {
            let view = BtreeIndexPageView::new(buf);
            Ok(index < view.get_entry_count() && view.get_entry(index) == &target[..])
        })?;
        if !found {
            return Err(Error::EntryNotFound(format!(
                "no matching entry in relation {}",
                self.file_id.file_ref()
            )));
        }

        let remaining = scope.with_page_mut(leaf as usize, |buf| {
            let mut view = BtreeIndexPageViewMut::new(buf);
            view.remove_entry(index);
            Ok(view.get_entry_count())
        })?;

        if remaining == 0 && leaf != root {
            self.free_empty_page(scope, leaf, path)?;
        }
        self.collapse_root(scope)?;
        self.update_header(scope, |view| view.set_count(count - 1))?;
        Ok(())
    }

    /// Unlink an emptied page from its level chain and its parent, then
    /// push it on the free list.
    fn free_empty_page(
        &self,
        scope: &mut PageScope<'_>,
        page: u32,
        mut path: TreePath,
    ) -> Result<()> {
        let (_, next, level) = self.page_info(scope, page)?;

        if level == 0 {
            let (_, _, leftmost, _, _) = self.read_header(scope)?;
            if leftmost == page {
                self.update_header(scope, |view| view.set_leftmost(next))?;
            } else if let Some(left) = self.left_sibling(scope, &path)? {
                scope.with_page_mut(left as usize, |buf| {
                    let mut view = BtreeIndexPageViewMut::new(buf);
                    view.set_next(next);
                    Ok(())
                })?;
            }
        }

        self.free_index_page(scope, page)?;

        if let Some((parent, child_index)) = path.pop() {
            let remaining = scope.with_page_mut(parent as usize, |buf| {
                let mut view = BtreeIndexPageViewMut::new(buf);
                view.remove_entry(child_index);
                Ok(view.get_entry_count())
            })?;

            let (_, root, _, _, _) = self.read_header(scope)?;
            if remaining == 0 && parent != root {
                self.free_empty_page(scope, parent, path)?;
            }
        }
        Ok(())
    }

    /// The leaf immediately to the left of the path's leaf, found by
    /// walking up to the first ancestor with a left branch and down its
    /// rightmost spine.
    fn left_sibling(&self, scope: &mut PageScope<'_>, path: &TreePath) -> Result<Option<u32>> {
        for depth in (0..path.len()).rev() {
            let (parent, child_index) = path[depth];
            if child_index == 0 {
                continue;
            }
            let entry = self.read_entry(scope, parent, child_index - 1)?;
            let mut page = self.child_of(&entry)?;
            loop {
                let (count, _, level) = self.page_info(scope, page)?;
                if level == 0 {
                    return Ok(Some(page));
                }
                let entry = self.read_entry(scope, page, count - 1)?;
                page = self.child_of(&entry)?;
            }
        }
        Ok(None)
    }

    /// Shrink the tree while the root is an internal page with a single
    /// child.
    fn collapse_root(&self, scope: &mut PageScope<'_>) -> Result<()> {
        loop {
            let (_, root, _, _, _) = self.read_header(scope)?;
            if root == 0 {
                return Ok(());
            }
            let (count, _, level) = self.page_info(scope, root)?;
            if level == 0 || count != 1 {
                return Ok(());
            }
            let entry = self.read_entry(scope, root, 0)?;
            let child = self.child_of(&entry)?;
            self.free_index_page(scope, root)?;
            self.update_header(scope, |view| view.set_root(child))?;
        }
    }

    /// Update is an expunge of the prior entry image and an insert of
    /// the new one, under a single page scope.
    pub fn update(&mut self, db: &DB, old_values: &[Value], new_values: &[Value]) -> Result<()> {
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
        if new_values.len() != self.file_id.field_count() {
            return Err(Error::BadArgument(format!(
                "tuple has {} fields, the file stores {}",
                new_values.len(),
                self.file_id.field_count()
            )));
        }

        let entry = self.entry_layout().encode(new_values)?;
        if entry.len() > MAX_LEAF_ENTRY_SIZE {
            return Err(Error::BadArgument(format!(
                "entry of {} bytes exceeds the page limit",
                entry.len()
            )));
        }

        let batch = mode == OpenMode::Batch;
        let mut scope = self.begin_scope(db, batch)?;
        let result = self
            .expunge_impl(&mut scope, old_values)
            .and_then(|()| self.insert_impl(&mut scope, &entry, new_values));
        match result {
            Ok(()) => scope.commit(),
            Err(e) => {
                scope.abort();
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // search / get

    /// Position the cursor at the first (or, reversed, last) entry of
    /// the window of the current condition.
    pub fn search(&mut self, db: &DB, reverse: bool) -> Result<()> {
        self.check_available(db)?;
        let mut state = self
            .open_state
            .take()
            .ok_or_else(|| Error::FileNotOpen("search before open".to_string()))?;
        state.reverse = reverse;
        state.cond_index = 0;
        state.min_max_done = false;
        state.cursor = Cursor::Invalid;
        state.marked = None;
        state.pending.clear();
        self.open_state = Some(state);
        Ok(())
    }

    fn position_cursor(
        &self,
        scope: &mut PageScope<'_>,
        cond: &Condition,
        reverse: bool,
    ) -> Result<Cursor> {
        if !cond.is_valid() || cond.is_never_match() {
            return Ok(Cursor::Exhausted);
        }

        let (_, root, leftmost, _, _) = self.read_header(scope)?;
        if root == 0 {
            return Ok(Cursor::Exhausted);
        }

        if !reverse {
            let (page, index) = if cond.get_lower().is_defined() {
                self.descend_lower(scope, root, cond)?
            } else {
                (leftmost, 0)
            };
            Ok(Cursor::At {
                page,
                index: index as isize,
            })
        } else {
            let (page, index) = if cond.get_upper().is_defined() {
                self.descend_upper(scope, root, cond)?
            } else {
                let (page, count) = self.rightmost_leaf(scope, root)?;
                (page, count as isize - 1)
            };
            Ok(Cursor::At { page, index })
        }
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
        state: &mut OpenState,
        out: &mut Vec<Value>,
    ) -> Result<Option<u32>> {
        let conditions = std::mem::take(&mut state.conditions);
        let result = self.do_get_inner(db, state, &conditions, out);
        state.conditions = conditions;
        result
    }

    fn do_get_inner(
        &self,
        db: &DB,
        state: &mut OpenState,
        conditions: &[Condition],
        out: &mut Vec<Value>,
    ) -> Result<Option<u32>> {
        if state.min_max_done {
            return Ok(None);
        }

        let layout = self.entry_layout();
        let key_len = self.key_len();
        let mut scope = self.begin_scope(db, false)?;

        loop {
            match state.cursor {
                Cursor::Invalid => {
                    let cond = &conditions[state.cond_index];
                    state.cursor = self.position_cursor(&mut scope, cond, state.reverse)?;
                }
                Cursor::Exhausted => {
                    state.commit_pending();
                    state.cond_index += 1;
                    if state.cond_index >= conditions.len() {
                        state.cond_index = conditions.len() - 1;
                        return Ok(None);
                    }
                    state.cursor = Cursor::Invalid;
                }
                Cursor::At { page, index } => {
                    let cond = &conditions[state.cond_index];
                    let (count, next, _) = self.page_info(&mut scope, page)?;

                    if !state.reverse {
                        if index as usize >= count {
                            state.cursor = if next == 0 {
                                Cursor::Exhausted
                            } else {
                                Cursor::At {
                                    page: next,
                                    index: 0,
                                }
                            };
                            continue;
                        }
                    } else if index < 0 {
                        if count == 0 {
                            state.cursor = Cursor::Exhausted;
                            continue;
                        }
                        let first = self.read_entry(&mut scope, page, 0)?;
                        let first_values = layout.decode(&first)?;
                        let (_, root, _, _, _) = self.read_header(&mut scope)?;
                        state.cursor =
                            match self.step_page_backward(&mut scope, root, &first_values)? {
                                Some((p, i)) => Cursor::At { page: p, index: i },
                                None => Cursor::Exhausted,
                            };
                        continue;
                    }

                    let entry = self.read_entry(&mut scope, page, index as usize)?;
                    let values = layout.decode(&entry)?;
                    let key = &values[..key_len];

                    if !state.reverse {
                        if !cond.matches_upper(key) {
                            state.cursor = Cursor::Exhausted;
                            continue;
                        }
                        state.cursor = Cursor::At {
                            page,
                            index: index + 1,
                        };
                    } else {
                        if !cond.matches_lower(key) {
                            state.cursor = Cursor::Exhausted;
                            continue;
                        }
                        state.cursor = Cursor::At {
                            page,
                            index: index - 1,
                        };
                    }

                    if !cond.is_other_condition_match(key)? {
                        continue;
                    }
                    if state.min_max.is_some() && values[0].is_null() {
                        continue;
                    }

                    let tuple_id = values
                        .last()
                        .ok_or_else(|| {
                            Error::DataCorrupted("entry with no tuple id".to_string())
                        })?
                        .as_u32()?;

                    if let Some(bitset) = &state.search_by_bitset {
                        if !bitset.borrow().test(tuple_id) {
                            continue;
                        }
                    }
                    if state.tuple_bit.test(tuple_id) {
                        continue;
                    }
                    state.pending.push(tuple_id);

                    out.clear();
                    for field in state.projection.iter() {
                        out.push(values[*field].clone());
                    }
                    if state.min_max.is_some() {
                        state.min_max_done = true;
                    }
                    return Ok(Some(tuple_id));
                }
            }
        }
    }

    /// Union the tuple ids of every serialised condition into the
    /// caller's bitset.
    pub fn get_by_bitset_impl(&mut self, db: &DB, out: &TupleBitSetPtr) -> Result<()> {
        self.check_available(db)?;
        let mut state = self
            .open_state
            .take()
            .ok_or_else(|| Error::FileNotOpen("get before open".to_string()))?;
        if !state.get_by_bitset {
            self.open_state = Some(state);
            return Err(Error::BadArgument(
                "the file was not opened for bitset output".to_string(),
            ));
        }
        let result = self.do_get_by_bitset(db, &mut state, out);
        self.open_state = Some(state);
        result
    }

    fn do_get_by_bitset(
        &self,
        db: &DB,
        state: &mut OpenState,
        out: &TupleBitSetPtr,
    ) -> Result<()> {
        let layout = self.entry_layout();
        let key_len = self.key_len();
        let mut scope = self.begin_scope(db, false)?;

        for cond in state.conditions.iter() {
            let mut cursor = self.position_cursor(&mut scope, cond, false)?;
            loop {
                let (page, index) = match cursor {
                    Cursor::At { page, index } => (page, index),
                    _ => break,
                };
                let (count, next, _) = self.page_info(&mut scope, page)?;
                if index as usize >= count {
                    cursor = if next == 0 {
                        Cursor::Exhausted
                    } else {
                        Cursor::At {
                            page: next,
                            index: 0,
                        }
                    };
                    continue;
                }

                let entry = self.read_entry(&mut scope, page, index as usize)?;
                let values = layout.decode(&entry)?;
                let key = &values[..key_len];
                if !cond.matches_upper(key) {
                    break;
                }
                cursor = Cursor::At {
                    page,
                    index: index + 1,
                };

                if !cond.is_other_condition_match(key)? {
                    continue;
                }
                let tuple_id = values
                    .last()
                    .ok_or_else(|| Error::DataCorrupted("entry with no tuple id".to_string()))?
                    .as_u32()?;
                if let Some(narrowing) = &state.search_by_bitset {
                    if !narrowing.borrow().test(tuple_id) {
                        continue;
                    }
                }
                out.borrow_mut().insert(tuple_id);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // estimate

    /// Fraction of the key space strictly below the condition's bound.
    fn bound_fraction(
        &self,
        scope: &mut PageScope<'_>,
        root: u32,
        cond: &Condition,
        upper: bool,
    ) -> Result<f64> {
        let mut page = root;
        let mut fraction = 0.0;
        let mut weight = 1.0;
        loop {
            let (count, _, level) = self.page_info(scope, page)?;
            if count == 0 {
                return Ok(fraction);
            }
            if level == 0 {
                let index = if upper {
                    self.first_matching(scope, page, 0, |entry| {
                        Ok(!cond.matches_upper(&self.entry_key(entry)?))
                    })?
                } else {
                    self.first_matching(scope, page, 0, |entry| {
                        Ok(cond.matches_lower(&self.entry_key(entry)?))
                    })?
                };
                return Ok(fraction + weight * index as f64 / count as f64);
            }
            let fm = if count <= 1 {
                count
            } else if upper {
                self.first_matching(scope, page, 1, |entry| {
                    Ok(!cond.matches_upper(&self.entry_key(entry)?))
                })?
            } else {
                self.first_matching(scope, page, 1, |entry| {
                    Ok(cond.matches_lower(&self.entry_key(entry)?))
                })?
            };
            let child_index = fm.saturating_sub(1);
            fraction += weight * child_index as f64 / count as f64;
            weight /= count as f64;
            let entry = self.read_entry(scope, page, child_index)?;
            page = self.child_of(&entry)?;
        }
    }

    fn estimate_one(&self, db: &DB, cond: &Condition) -> Result<u64> {
        if !cond.is_valid() || cond.is_never_match() {
            return Ok(0);
        }

        let mut scope = self.begin_scope(db, false)?;
        let (count, root, _, _, _) = self.read_header(&mut scope)?;
        if root == 0 || count == 0 {
            return Ok(0);
        }

        let low = if cond.get_lower().is_defined() {
            self.bound_fraction(&mut scope, root, cond, false)?
        } else {
            0.0
        };
        let high = if cond.get_upper().is_defined() {
            self.bound_fraction(&mut scope, root, cond, true)?
        } else {
            1.0
        };

        let fraction = (high - low).max(0.0);
        let estimate = (count as f64 * fraction).round() as u64;
        if estimate == 0 && fraction > 0.0 {
            Ok(1)
        } else {
            Ok(estimate.min(count))
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
                // the abort stays inside the verify entry point
                progress.fail(message);
                Ok(progress)
            }
            Err(e) => Err(e),
        }
    }

    fn verify_impl(&self, scope: &mut PageScope<'_>, progress: &mut Progress) -> Result<()> {
        let header_ok = scope.with_page(HEADER_PAGE_NUM, |buf| {
            let view = BtreeHeaderPageView::new(buf);
            if view.get_magic() != btree_page::BTREE_MAGIC {
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

        let (count, root, leftmost, _, max_page) = self.read_header(scope)?;
        if root == 0 {
            if count != 0 {
                progress.fail(format!("header counts {} tuples but has no root", count));
            }
            return Ok(());
        }

        let mut visited = HashSet::new();
        let mut leaves = Vec::new();
        let mut total = 0u64;
        self.verify_walk(
            scope,
            root,
            max_page,
            &mut visited,
            &mut leaves,
            &mut total,
            progress,
        )?;

        if total != count {
            progress.fail(format!(
                "header counts {} tuples but the leaves hold {}",
                count, total
            ));
        }

        // the leaf chain must mirror the tree order
        if leaves.first() != Some(&leftmost) && !leaves.is_empty() {
            progress.fail("leftmost leaf does not start the chain".to_string());
        }
        for window in leaves.windows(2) {
            let (_, next, _) = self.page_info(scope, window[0])?;
            if next != window[1] {
                progress.fail(format!(
                    "leaf {} links to {} instead of {}",
                    window[0], next, window[1]
                ));
            }
        }
        if let Some(last) = leaves.last() {
            let (_, next, _) = self.page_info(scope, *last)?;
            if next != 0 {
                progress.fail(format!("last leaf {} has a dangling link", last));
            }
        }

        Ok(())
    }

    fn verify_walk(
        &self,
        scope: &mut PageScope<'_>,
        page: u32,
        max_page: u32,
        visited: &mut HashSet<u32>,
        leaves: &mut Vec<u32>,
        total: &mut u64,
        progress: &mut Progress,
    ) -> Result<()> {
        if page > max_page {
            return Err(Error::VerifyAborted(format!(
                "page {} beyond the recorded maximum {}",
                page, max_page
            )));
        }
        if !visited.insert(page) {
            return Err(Error::VerifyAborted(format!(
                "page {} reached twice",
                page
            )));
        }

        let (count, _, level) = self.page_info(scope, page)?;
        let compare = self.entry_compare();
        let field_count = self.file_id.field_count();

        // entries must be strictly ordered
        let mut prev: Option<Vec<Value>> = None;
        for i in 0..count {
            let entry = self.read_entry(scope, page, i)?;
            let values = if level == 0 {
                self.entry_values(&entry)?
            } else {
                let mut v = self.internal_layout().decode(&entry)?;
                v.truncate(field_count);
                v
            };
            if let Some(p) = &prev {
                if compare.compare(p, &values) != Ordering::Less {
                    progress.fail(format!("entries out of order on page {}", page));
                }
            }
            prev = Some(values);
        }

        if level == 0 {
            leaves.push(page);
            *total += count as u64;
            return Ok(());
        }

        for i in 0..count {
            let entry = self.read_entry(scope, page, i)?;
            let mut sep = self.internal_layout().decode(&entry)?;
            let child = sep
                .pop()
                .ok_or_else(|| Error::DataCorrupted("empty separator".to_string()))?
                .as_u32()?;

            let (child_count, _, child_level) = self.page_info(scope, child)?;
            if child_level != level - 1 {
                progress.fail(format!(
                    "page {} at level {} has a child {} at level {}",
                    page, level, child, child_level
                ));
            }
            // the separator bounds its child from below
            if i > 0 && child_count > 0 {
                let first = self.read_entry(scope, child, 0)?;
                let first_values = if child_level == 0 {
                    self.entry_values(&first)?
                } else {
                    let mut v = self.internal_layout().decode(&first)?;
                    v.truncate(field_count);
                    v
                };
                if compare.compare(&sep, &first_values) == Ordering::Greater {
                    progress.fail(format!(
                        "separator on page {} exceeds the first key of child {}",
                        page, child
                    ));
                }
            }
            self.verify_walk(scope, child, max_page, visited, leaves, total, progress)?;
        }
        Ok(())
    }
}

impl Relation for BtreeFile {
    fn get_relation_entry(&self) -> &RelationEntry {
        &self.rel_entry
    }
}

impl RelationWithStorage for BtreeFile {
    fn get_storage_handle(&self) -> &Mutex<Option<StorageHandle>> {
        &self.shandle
    }
}

impl IndexFile for BtreeFile {
    fn file_id(&self) -> &FileId {
        &self.file_id
    }

    fn get_search_parameter(&self, pred: &Predicate, opt: &mut OpenOption) -> bool {
        Condition::new(&self.file_id).get_search_parameter(pred, opt)
    }

    fn get_sort_parameter(&self, keys: &[usize], descending: bool, opt: &mut OpenOption) -> bool {
        if keys.is_empty() || keys.len() > self.key_len() {
            return false;
        }
        for (i, key) in keys.iter().enumerate() {
            if *key != i {
                return false;
            }
        }
        opt.set_bool(OptionKey::Reverse, descending);
        true
    }

    fn get_projection_parameter(&self, projection: &Projection, opt: &mut OpenOption) -> bool {
        match projection {
            Projection::Fields(fields) => {
                if fields.iter().any(|f| *f >= self.file_id.field_count()) {
                    return false;
                }
                opt.set_bool(OptionKey::FieldSelect, true);
                opt.set_int(OptionKey::TargetFieldNumber, fields.len() as i64);
                for (i, field) in fields.iter().enumerate() {
                    opt.set_int(OptionKey::TargetFieldIndex(i as u32), *field as i64);
                }
                true
            }
            Projection::Min(field) | Projection::Max(field) => {
                // a single-sided seek only works on the leading key
                if *field != 0 {
                    return false;
                }
                opt.set_bool(OptionKey::FieldSelect, true);
                opt.set_int(OptionKey::TargetFieldNumber, 1);
                opt.set_int(OptionKey::TargetFieldIndex(0), 0);
                let max = matches!(projection, Projection::Max(_));
                opt.set_int(
                    OptionKey::MinMax,
                    if max { MIN_MAX_MAX } else { MIN_MAX_MIN },
                );
                opt.set_bool(OptionKey::Reverse, max);
                true
            }
        }
    }

    fn get_count(&self, db: &DB) -> Result<u64> {
        let mut scope = self.begin_scope(db, false)?;
        let (count, _, _, _, _) = self.read_header(&mut scope)?;
        Ok(count)
    }

    fn get_estimate_count(&self, db: &DB, opt: &OpenOption) -> Result<u64> {
        let cond_count = opt.get_int_or(OptionKey::ConditionCount, 0)?.max(1);
        let mut total = 0u64;
        for number in 0..cond_count {
            let mut cond = Condition::new(&self.file_id);
            cond.set_open_option(opt, number as u32)?;
            total += self.estimate_one(db, &cond)?;
        }
        let file_count = self.get_count(db)?;
        Ok(total.min(file_count))
    }

    fn get_overhead(&self) -> f64 {
        BTREE_OVERHEAD
    }

    fn get_process_cost(&self) -> f64 {
        BTREE_PROCESS_COST
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
                if field as usize >= self.file_id.field_count() {
                    return Err(Error::BadArgument(format!(
                        "projection field {} out of range",
                        field
                    )));
                }
                fields.push(field as usize);
            }
            fields
        } else {
            (0..self.file_id.field_count()).collect()
        };

        let min_max = match opt.get_int(OptionKey::MinMax)? {
            Some(MIN_MAX_MIN) => Some(MinMax::Min),
            Some(MIN_MAX_MAX) => Some(MinMax::Max),
            Some(v) => {
                return Err(Error::BadArgument(format!("unknown min/max marker {}", v)))
            }
            None => None,
        };

        let cond_count = opt.get_int_or(OptionKey::ConditionCount, 0)?.max(1);
        let mut conditions = Vec::with_capacity(cond_count as usize);
        for number in 0..cond_count {
            let mut cond = Condition::new(&self.file_id);
            cond.set_open_option(opt, number as u32)?;
            conditions.push(cond);
        }

        self.open_state = Some(OpenState {
            mode,
            reverse: opt.get_bool(OptionKey::Reverse)?,
            get_by_bitset: opt.get_bool(OptionKey::GetByBitSet)?,
            search_by_bitset: opt.get_bitset(OptionKey::SearchByBitSet)?,
            min_max,
            min_max_done: false,
            projection,
            conditions,
            cond_index: 0,
            cursor: Cursor::Invalid,
            marked: None,
            tuple_bit: TupleBitSet::new(),
            pending: Vec::new(),
        });
        debug!(
            "opened btree {} in {:?} mode",
            self.file_id.file_ref(),
            mode
        );
        Ok(())
    }

    fn close(&mut self, db: &DB) -> Result<()> {
        if let Some(state) = self.open_state.take() {
            if state.mode == OpenMode::Batch {
                // keep the batch's trailing dirty pages
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
        for cond in state.conditions.iter_mut() {
            cond.set_fetch_key(key)?;
        }
        state.cond_index = 0;
        state.cursor = Cursor::Invalid;
        state.marked = None;
        // a new fetch key starts a fresh logical search
        state.tuple_bit.clear();
        state.pending.clear();
        Ok(())
    }

    fn get(&mut self, db: &DB, out: &mut Vec<Value>) -> Result<Option<u32>> {
        BtreeFile::get(self, db, out)
    }

    fn get_by_bitset(&mut self, db: &DB, out: &TupleBitSetPtr) -> Result<()> {
        self.get_by_bitset_impl(db, out)
    }

    fn mark(&mut self) -> Result<()> {
        let state = self
            .open_state
            .as_mut()
            .ok_or_else(|| Error::FileNotOpen("mark before open".to_string()))?;
        if let Cursor::At { .. } = state.cursor {
            state.commit_pending();
            state.marked = Some((state.cond_index, state.cursor));
        }
        Ok(())
    }

    fn rewind(&mut self, _db: &DB) -> Result<()> {
        let state = self
            .open_state
            .as_mut()
            .ok_or_else(|| Error::FileNotOpen("rewind before open".to_string()))?;
        match state.marked.take() {
            Some((cond_index, cursor)) => {
                state.cond_index = cond_index;
                state.cursor = cursor;
                state.pending.clear();
            }
            None => {
                // no mark since the last search: re-issue the search on
                // the current branch, keeping the duplicate bitmap; rows
                // still pending are replayable, not suppressed
                state.pending.clear();
                state.cursor = Cursor::Invalid;
            }
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let state = self
            .open_state
            .as_mut()
            .ok_or_else(|| Error::FileNotOpen("reset before open".to_string()))?;
        state.cursor = Cursor::Invalid;
        state.cond_index = 0;
        state.min_max_done = false;
        state.marked = None;
        state.tuple_bit.clear();
        state.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::am::datum::Collation;
    use crate::test_util::get_temp_db;

    use rand::seq::SliceRandom;

    fn int_file(unique: bool) -> FileId {
        FileId {
            db: 0,
            rel_id: 1,
            key: RowLayout::new(vec![FieldDef::new(DataType::Int32)]),
            value: RowLayout::new(vec![FieldDef::new(DataType::UInt32)]),
            unique,
            top_null: true,
        }
    }

    fn varchar_file() -> FileId {
        FileId {
            db: 0,
            rel_id: 2,
            key: RowLayout::new(vec![FieldDef {
                data_type: DataType::Varchar(32),
                collation: Collation::PadSpace,
            }]),
            value: RowLayout::new(vec![FieldDef::new(DataType::UInt32)]),
            unique: false,
            top_null: true,
        }
    }

    fn open_mode(file: &mut BtreeFile, db: &DB, mode: OpenMode) {
        let mut opt = OpenOption::new();
        opt.set_open_mode(mode);
        file.open(db, &opt).unwrap();
    }

    fn open_with_predicate(
        file: &mut BtreeFile,
        db: &DB,
        pred: &Predicate,
        projection: &[usize],
    ) {
        let mut opt = OpenOption::new();
        opt.set_open_mode(OpenMode::Search);
        assert!(file.get_search_parameter(pred, &mut opt));
        assert!(file.get_projection_parameter(&Projection::Fields(projection.to_vec()), &mut opt));
        file.open(db, &opt).unwrap();
    }

    #[test]
    fn unique_insert_expunge_scan() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(int_file(true));
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        file.insert(&db, &[Value::Int32(10), Value::UInt32(1)]).unwrap();
        file.insert(&db, &[Value::Int32(20), Value::UInt32(2)]).unwrap();
        file.insert(&db, &[Value::Int32(30), Value::UInt32(3)]).unwrap();
        file.expunge(&db, &[Value::Int32(20), Value::UInt32(2)]).unwrap();
        file.close(&db).unwrap();

        open_with_predicate(&mut file, &db, &Predicate::ge(0, Value::Int32(10)), &[0]);
        file.search(&db, false).unwrap();

        let mut out = Vec::new();
        assert!(file.get(&db, &mut out).unwrap().is_some());
        assert_eq!(out, vec![Value::Int32(10)]);
        assert!(file.get(&db, &mut out).unwrap().is_some());
        assert_eq!(out, vec![Value::Int32(30)]);
        assert!(file.get(&db, &mut out).unwrap().is_none());
        file.close(&db).unwrap();
    }

    #[test]
    fn unique_violation_is_reported() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(int_file(true));
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        file.insert(&db, &[Value::Int32(5), Value::UInt32(1)]).unwrap();
        match file.insert(&db, &[Value::Int32(5), Value::UInt32(2)]) {
            Err(Error::UniquenessViolation(_)) => {}
            other => panic!("expected a uniqueness violation, got {:?}", other.err()),
        }

        // the failed insert left the file untouched
        assert_eq!(file.get_count(&db).unwrap(), 1);
        let progress = file.verify(&db).unwrap();
        assert!(progress.consistent, "{:?}", progress.messages);
    }

    #[test]
    fn expunge_missing_entry_fails() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(int_file(false));
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        file.insert(&db, &[Value::Int32(1), Value::UInt32(1)]).unwrap();
        match file.expunge(&db, &[Value::Int32(2), Value::UInt32(2)]) {
            Err(Error::EntryNotFound(_)) => {}
            other => panic!("expected entry-not-found, got {:?}", other.err()),
        }
    }

    #[test]
    fn ordered_scan_over_many_pages() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(int_file(false));
        file.create(&db).unwrap();

        let mut keys: Vec<i32> = (0..2000).collect();
        keys.shuffle(&mut rand::thread_rng());

        open_mode(&mut file, &db, OpenMode::Update);
        for k in keys.iter() {
            file.insert(&db, &[Value::Int32(*k), Value::UInt32(*k as u32)])
                .unwrap();
        }
        file.close(&db).unwrap();

        assert_eq!(file.get_count(&db).unwrap(), 2000);
        let progress = file.verify(&db).unwrap();
        assert!(progress.consistent, "{:?}", progress.messages);

        // ascending
        open_with_predicate(&mut file, &db, &Predicate::ge(0, Value::Int32(0)), &[0]);
        file.search(&db, false).unwrap();
        let mut out = Vec::new();
        let mut prev = i32::min_value();
        let mut seen = 0;
        while file.get(&db, &mut out).unwrap().is_some() {
            match out[0] {
                Value::Int32(v) => {
                    assert!(v > prev);
                    prev = v;
                }
                _ => panic!("unexpected value"),
            }
            seen += 1;
        }
        assert_eq!(seen, 2000);
        file.close(&db).unwrap();

        // descending
        open_with_predicate(&mut file, &db, &Predicate::le(0, Value::Int32(1999)), &[0]);
        file.search(&db, true).unwrap();
        let mut prev = i32::max_value();
        let mut seen = 0;
        while file.get(&db, &mut out).unwrap().is_some() {
            match out[0] {
                Value::Int32(v) => {
                    assert!(v < prev);
                    prev = v;
                }
                _ => panic!("unexpected value"),
            }
            seen += 1;
        }
        assert_eq!(seen, 2000);
        file.close(&db).unwrap();
    }

    #[test]
    fn header_count_survives_expunges_and_sync() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(int_file(false));
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        for k in 0..600 {
            file.insert(&db, &[Value::Int32(k), Value::UInt32(k as u32)])
                .unwrap();
        }
        for k in (0..600).step_by(2) {
            file.expunge(&db, &[Value::Int32(k), Value::UInt32(k as u32)])
                .unwrap();
        }
        file.close(&db).unwrap();
        file.sync(&db).unwrap();

        assert_eq!(file.get_count(&db).unwrap(), 300);
        let progress = file.verify(&db).unwrap();
        assert!(progress.consistent, "{:?}", progress.messages);
    }

    #[test]
    fn like_prefix_push_down() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(varchar_file());
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        for (i, s) in ["ab", "abc", "ac", "b"].iter().enumerate() {
            file.insert(
                &db,
                &[Value::String(s.to_string()), Value::UInt32(i as u32 + 1)],
            )
            .unwrap();
        }
        file.close(&db).unwrap();

        let pred = Predicate::like(0, "ab%", Some('*'));
        open_with_predicate(&mut file, &db, &pred, &[0]);
        file.search(&db, false).unwrap();

        let mut out = Vec::new();
        assert!(file.get(&db, &mut out).unwrap().is_some());
        assert_eq!(out, vec![Value::String("ab".to_string())]);
        assert!(file.get(&db, &mut out).unwrap().is_some());
        assert_eq!(out, vec![Value::String("abc".to_string())]);
        assert!(file.get(&db, &mut out).unwrap().is_none());
        file.close(&db).unwrap();
    }

    #[test]
    fn mark_and_rewind_replay() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(int_file(false));
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        for k in 1..=4 {
            file.insert(&db, &[Value::Int32(k), Value::UInt32(k as u32)])
                .unwrap();
        }
        file.close(&db).unwrap();

        open_with_predicate(&mut file, &db, &Predicate::ge(0, Value::Int32(1)), &[0]);
        file.search(&db, false).unwrap();

        let mut out = Vec::new();
        let x1 = file.get(&db, &mut out).unwrap().unwrap();
        file.mark().unwrap();
        let x2 = file.get(&db, &mut out).unwrap().unwrap();
        assert_ne!(x1, x2);

        // rewind to the mark replays the row after it
        file.rewind(&db).unwrap();
        assert_eq!(file.get(&db, &mut out).unwrap(), Some(x2));

        // the mark is consumed: a second rewind re-searches the branch,
        // and rows emitted before the mark stay suppressed
        file.rewind(&db).unwrap();
        assert_eq!(file.get(&db, &mut out).unwrap(), Some(x2));
        file.close(&db).unwrap();
    }

    #[test]
    fn get_by_bitset_unions_conditions() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(int_file(false));
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        for k in 0..20 {
            file.insert(&db, &[Value::Int32(k), Value::UInt32(100 + k as u32)])
                .unwrap();
        }
        file.close(&db).unwrap();

        let pred = Predicate::Or(vec![
            Predicate::eq(0, Value::Int32(3)),
            Predicate::eq(0, Value::Int32(7)),
            Predicate::eq(0, Value::Int32(19)),
        ]);
        let mut opt = OpenOption::new();
        opt.set_open_mode(OpenMode::Read);
        assert!(file.get_search_parameter(&pred, &mut opt));
        opt.set_bool(OptionKey::GetByBitSet, true);
        file.open(&db, &opt).unwrap();

        let out = TupleBitSet::new_ptr();
        file.get_by_bitset_impl(&db, &out).unwrap();
        let ids: Vec<u32> = out.borrow().iter().collect();
        assert_eq!(ids, vec![103, 107, 119]);
        file.close(&db).unwrap();
    }

    #[test]
    fn estimate_tracks_selectivity() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(int_file(false));
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        for k in 0..1000 {
            file.insert(&db, &[Value::Int32(k), Value::UInt32(k as u32)])
                .unwrap();
        }
        file.close(&db).unwrap();

        // a ~10% window estimates well under half the file
        let pred = Predicate::And(vec![
            Predicate::ge(0, Value::Int32(100)),
            Predicate::lt(0, Value::Int32(200)),
        ]);
        let mut opt = OpenOption::new();
        assert!(file.get_search_parameter(&pred, &mut opt));
        let estimate = file.get_estimate_count(&db, &opt).unwrap();
        assert!(estimate > 0);
        assert!(estimate < 500, "estimate {} too coarse", estimate);

        // an equality estimates a handful at most
        let mut opt = OpenOption::new();
        assert!(file.get_search_parameter(&Predicate::eq(0, Value::Int32(42)), &mut opt));
        let estimate = file.get_estimate_count(&db, &opt).unwrap();
        assert!(estimate >= 1 && estimate < 50, "estimate {}", estimate);
    }

    #[test]
    fn min_max_single_sided_seek() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(int_file(false));
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        file.insert(&db, &[Value::Null, Value::UInt32(0)]).unwrap();
        for k in &[7, 3, 9] {
            file.insert(&db, &[Value::Int32(*k), Value::UInt32(*k as u32)])
                .unwrap();
        }
        file.close(&db).unwrap();

        let mut opt = OpenOption::new();
        opt.set_open_mode(OpenMode::Read);
        assert!(file.get_projection_parameter(&Projection::Min(0), &mut opt));
        file.open(&db, &opt).unwrap();
        file.search(&db, false).unwrap();
        let mut out = Vec::new();
        // the first non-null key, nulls sorting on top
        assert!(file.get(&db, &mut out).unwrap().is_some());
        assert_eq!(out, vec![Value::Int32(3)]);
        assert!(file.get(&db, &mut out).unwrap().is_none());
        file.close(&db).unwrap();

        let mut opt = OpenOption::new();
        opt.set_open_mode(OpenMode::Read);
        assert!(file.get_projection_parameter(&Projection::Max(0), &mut opt));
        file.open(&db, &opt).unwrap();
        file.search(&db, true).unwrap();
        assert!(file.get(&db, &mut out).unwrap().is_some());
        assert_eq!(out, vec![Value::Int32(9)]);
        assert!(file.get(&db, &mut out).unwrap().is_none());
        file.close(&db).unwrap();
    }

    #[test]
    fn batch_mode_defers_flushes() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(int_file(false));
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Batch);
        for k in 0..500 {
            file.insert(&db, &[Value::Int32(k), Value::UInt32(k as u32)])
                .unwrap();
        }
        file.close(&db).unwrap();

        assert_eq!(file.get_count(&db).unwrap(), 500);
        let progress = file.verify(&db).unwrap();
        assert!(progress.consistent, "{:?}", progress.messages);
    }

    #[test]
    fn survives_page_cache_pressure() {
        crate::test_util::init_log();
        let db_dir = tempfile::tempdir().unwrap();
        let config = crate::DBConfig::new().root_path(&db_dir.path()).cache_capacity(16);
        let db = DB::open(config).unwrap();

        let mut file = BtreeFile::new(int_file(false));
        file.create(&db).unwrap();
        open_mode(&mut file, &db, OpenMode::Update);
        for k in 0..3000 {
            file.insert(&db, &[Value::Int32(k), Value::UInt32(k as u32)])
                .unwrap();
        }
        file.close(&db).unwrap();

        assert_eq!(file.get_count(&db).unwrap(), 3000);
        let progress = file.verify(&db).unwrap();
        assert!(progress.consistent, "{:?}", progress.messages);
    }

    #[test]
    fn destroy_is_idempotent() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(int_file(false));
        file.create(&db).unwrap();

        assert!(file.destroy(&db).is_ok());
        // destroying an already-destroyed, unmounted file stays quiet
        assert!(file.destroy(&db).is_ok());
    }

    #[test]
    fn update_replaces_the_entry() {
        let (db, _dir) = get_temp_db();
        let mut file = BtreeFile::new(int_file(false));
        file.create(&db).unwrap();

        open_mode(&mut file, &db, OpenMode::Update);
        file.insert(&db, &[Value::Int32(1), Value::UInt32(1)]).unwrap();
        file.update(
            &db,
            &[Value::Int32(1), Value::UInt32(1)],
            &[Value::Int32(2), Value::UInt32(1)],
        )
        .unwrap();
        file.close(&db).unwrap();

        assert_eq!(file.get_count(&db).unwrap(), 1);

        open_with_predicate(&mut file, &db, &Predicate::eq(0, Value::Int32(2)), &[0]);
        file.search(&db, false).unwrap();
        let mut out = Vec::new();
        assert_eq!(file.get(&db, &mut out).unwrap(), Some(1));
        file.close(&db).unwrap();
    }
}
