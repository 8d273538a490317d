//! Execution iterators emitted by the planner.
//!
//! Every iterator exposes open/next/close/reset/mark/rewind/finish,
//! carries an optional per-row check predicate and an action list. The
//! only blocking work happens inside the drivers; iterators themselves
//! are computational, with cancellation checks between rows.

use crate::{
    am::{
        datum::{compare_values, FieldDef, Value},
        index::IndexFile,
        open_option::OpenOption,
    },
    plan::{predicate::Predicate, Direction},
    Error, Result, TupleBitSet, TupleBitSetPtr, DB,
};

use std::{
    cmp::Ordering,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
};

use log::debug;

/// One produced row: the tuple id plus the fields read from the file.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub tuple_id: u32,
    pub values: Vec<Value>,
}

/// Row-id lock hook, attached where the plan materialises its result.
pub trait Locker {
    fn lock(&self, tuple_id: u32) -> Result<()>;
}

/// Residual predicate re-checked on every produced row.
pub struct CheckPredicate {
    pub predicate: Predicate,
    pub fields: Vec<FieldDef>,
}

impl CheckPredicate {
    fn matches(&self, row: &Row) -> Result<bool> {
        self.predicate.evaluate(&row.values, &self.fields)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitSetOp {
    Assign,
    Or,
    Diff,
}

/// Start-up work of an iterator, run once at open.
pub enum StartUpAction {
    CheckCancel(Arc<AtomicBool>),
    /// Open the file, collect its matches into `target`, close it. A
    /// narrowing input travels inside the open option.
    GetBitSet {
        file: Box<dyn IndexFile>,
        option: OpenOption,
        target: TupleBitSetPtr,
    },
    /// Fold `source` into `target`.
    Combine {
        source: TupleBitSetPtr,
        target: TupleBitSetPtr,
        op: BitSetOp,
    },
    /// Acquire locks for a bitset that outlives the statement.
    LockBitSet {
        target: TupleBitSetPtr,
        locker: Rc<dyn Locker>,
    },
}

impl StartUpAction {
    fn run(&mut self, db: &DB) -> Result<()> {
        match self {
            StartUpAction::CheckCancel(flag) => check_cancel(flag),
            StartUpAction::GetBitSet {
                file,
                option,
                target,
            } => {
                file.open(db, option)?;
                let result = file.get_by_bitset(db, target);
                let closed = file.close(db);
                result.and(closed)
            }
            StartUpAction::Combine { source, target, op } => {
                let source = source.borrow();
                match op {
                    BitSetOp::Assign => {
                        let mut target = target.borrow_mut();
                        target.clear();
                        target.union_with(&source);
                    }
                    BitSetOp::Or => target.borrow_mut().union_with(&source),
                    BitSetOp::Diff => target.borrow_mut().difference_with(&source),
                }
                Ok(())
            }
            StartUpAction::LockBitSet { target, locker } => {
                for id in target.borrow().iter() {
                    locker.lock(id)?;
                }
                Ok(())
            }
        }
    }
}

/// Per-row work.
pub enum RowAction {
    CheckCancel(Arc<AtomicBool>),
    Lock(Rc<dyn Locker>),
}

impl RowAction {
    fn run(&self, row: &Row) -> Result<()> {
        match self {
            RowAction::CheckCancel(flag) => check_cancel(flag),
            RowAction::Lock(locker) => locker.lock(row.tuple_id),
        }
    }
}

fn check_cancel(flag: &Arc<AtomicBool>) -> Result<()> {
    if flag.load(AtomicOrdering::Relaxed) {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

pub trait ExecIterator {
    fn open(&mut self, db: &DB) -> Result<()>;

    fn next(&mut self, db: &DB) -> Result<Option<Row>>;

    fn reset(&mut self, db: &DB) -> Result<()>;

    fn mark(&mut self) -> Result<()> {
        Ok(())
    }

    fn rewind(&mut self, db: &DB) -> Result<()>;

    fn close(&mut self, db: &DB) -> Result<()>;

    fn finish(&mut self, db: &DB) -> Result<()> {
        self.close(db)
    }

    /// Bind the runtime key of a fetch-mode plan.
    fn bind(&mut self, _key: &[Value]) -> Result<()> {
        Err(Error::NotSupported(
            "this plan takes no fetch key".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------
// FileScan

/// Leaf iterator over one index file. The scan direction travels
/// inside the open option's reverse flag.
pub struct FileScanIter {
    file: Box<dyn IndexFile>,
    option: OpenOption,
    check: Option<CheckPredicate>,
    row_actions: Vec<RowAction>,
    opened: bool,
}

impl FileScanIter {
    pub fn new(
        file: Box<dyn IndexFile>,
        option: OpenOption,
        check: Option<CheckPredicate>,
        row_actions: Vec<RowAction>,
    ) -> Self {
        Self {
            file,
            option,
            check,
            row_actions,
            opened: false,
        }
    }
}

impl ExecIterator for FileScanIter {
    fn open(&mut self, db: &DB) -> Result<()> {
        self.file.open(db, &self.option)?;
        self.opened = true;
        Ok(())
    }

    fn next(&mut self, db: &DB) -> Result<Option<Row>> {
        if !self.opened {
            return Err(Error::FileNotOpen("iterator not open".to_string()));
        }
        let mut values = Vec::new();
        loop {
            let tuple_id = match self.file.get(db, &mut values)? {
                Some(id) => id,
                None => return Ok(None),
            };
            let row = Row {
                tuple_id,
                values: values.clone(),
            };
            if let Some(check) = &self.check {
                if !check.matches(&row)? {
                    continue;
                }
            }
            for action in self.row_actions.iter() {
                action.run(&row)?;
            }
            return Ok(Some(row));
        }
    }

    fn reset(&mut self, _db: &DB) -> Result<()> {
        self.file.reset()
    }

    fn mark(&mut self) -> Result<()> {
        self.file.mark()
    }

    fn rewind(&mut self, db: &DB) -> Result<()> {
        self.file.rewind(db)
    }

    fn close(&mut self, db: &DB) -> Result<()> {
        if self.opened {
            self.opened = false;
            self.file.close(db)?;
        }
        Ok(())
    }

    fn bind(&mut self, key: &[Value]) -> Result<()> {
        self.file.fetch(key)
    }
}

// ---------------------------------------------------------------------
// BitSetScan

/// Enumerates the set bits of a bitset in ascending tuple-id order.
pub struct BitSetScanIter {
    bitset: TupleBitSetPtr,
    next_from: u32,
    marked: Option<u32>,
    row_actions: Vec<RowAction>,
}

impl BitSetScanIter {
    pub fn new(bitset: TupleBitSetPtr, row_actions: Vec<RowAction>) -> Self {
        Self {
            bitset,
            next_from: 0,
            marked: None,
            row_actions,
        }
    }
}

impl ExecIterator for BitSetScanIter {
    fn open(&mut self, _db: &DB) -> Result<()> {
        self.next_from = 0;
        Ok(())
    }

    fn next(&mut self, _db: &DB) -> Result<Option<Row>> {
        let id = match self.bitset.borrow().next_set(self.next_from) {
            Some(id) => id,
            None => return Ok(None),
        };
        self.next_from = id + 1;
        let row = Row {
            tuple_id: id,
            values: Vec::new(),
        };
        for action in self.row_actions.iter() {
            action.run(&row)?;
        }
        Ok(Some(row))
    }

    fn reset(&mut self, _db: &DB) -> Result<()> {
        self.next_from = 0;
        self.marked = None;
        Ok(())
    }

    fn mark(&mut self) -> Result<()> {
        self.marked = Some(self.next_from);
        Ok(())
    }

    fn rewind(&mut self, _db: &DB) -> Result<()> {
        self.next_from = self.marked.take().unwrap_or(0);
        Ok(())
    }

    fn close(&mut self, _db: &DB) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// LoopOnce

/// Runs its start-up actions exactly once, then delegates to the inner
/// iterator. The planner parks bitset construction here.
pub struct LoopOnceIter {
    startup: Vec<StartUpAction>,
    inner: Box<dyn ExecIterator>,
    started: bool,
}

impl LoopOnceIter {
    pub fn new(startup: Vec<StartUpAction>, inner: Box<dyn ExecIterator>) -> Self {
        Self {
            startup,
            inner,
            started: false,
        }
    }
}

impl ExecIterator for LoopOnceIter {
    fn open(&mut self, db: &DB) -> Result<()> {
        if !self.started {
            for action in self.startup.iter_mut() {
                action.run(db)?;
            }
            self.started = true;
            debug!("startup actions complete");
        }
        self.inner.open(db)
    }

    fn next(&mut self, db: &DB) -> Result<Option<Row>> {
        self.inner.next(db)
    }

    fn reset(&mut self, db: &DB) -> Result<()> {
        self.inner.reset(db)
    }

    fn mark(&mut self) -> Result<()> {
        self.inner.mark()
    }

    fn rewind(&mut self, db: &DB) -> Result<()> {
        self.inner.rewind(db)
    }

    fn close(&mut self, db: &DB) -> Result<()> {
        self.inner.close(db)
    }

    fn bind(&mut self, key: &[Value]) -> Result<()> {
        self.inner.bind(key)
    }
}

// ---------------------------------------------------------------------
// Filter

/// Adapts an already materialised collection into an iterator.
pub struct FilterIter {
    collection: Vec<Row>,
    position: usize,
    marked: Option<usize>,
    check: Option<CheckPredicate>,
}

impl FilterIter {
    pub fn new(collection: Vec<Row>, check: Option<CheckPredicate>) -> Self {
        Self {
            collection,
            position: 0,
            marked: None,
            check,
        }
    }
}

impl ExecIterator for FilterIter {
    fn open(&mut self, _db: &DB) -> Result<()> {
        self.position = 0;
        Ok(())
    }

    fn next(&mut self, _db: &DB) -> Result<Option<Row>> {
        while self.position < self.collection.len() {
            let row = self.collection[self.position].clone();
            self.position += 1;
            if let Some(check) = &self.check {
                if !check.matches(&row)? {
                    continue;
                }
            }
            return Ok(Some(row));
        }
        Ok(None)
    }

    fn reset(&mut self, _db: &DB) -> Result<()> {
        self.position = 0;
        self.marked = None;
        Ok(())
    }

    fn mark(&mut self) -> Result<()> {
        self.marked = Some(self.position);
        Ok(())
    }

    fn rewind(&mut self, _db: &DB) -> Result<()> {
        self.position = self.marked.take().unwrap_or(0);
        Ok(())
    }

    fn close(&mut self, _db: &DB) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// UnionDistinct

/// Merges child streams that are each ordered by tuple id, emitting
/// every id exactly once.
pub struct UnionDistinctIter {
    children: Vec<Box<dyn ExecIterator>>,
    heads: Vec<Option<Row>>,
    last_emitted: Option<u32>,
    row_actions: Vec<RowAction>,
}

impl UnionDistinctIter {
    pub fn new(children: Vec<Box<dyn ExecIterator>>, row_actions: Vec<RowAction>) -> Self {
        Self {
            heads: (0..children.len()).map(|_| None).collect(),
            children,
            last_emitted: None,
            row_actions,
        }
    }

    fn pull(&mut self, db: &DB, index: usize) -> Result<()> {
        self.heads[index] = self.children[index].next(db)?;
        Ok(())
    }
}

impl ExecIterator for UnionDistinctIter {
    fn open(&mut self, db: &DB) -> Result<()> {
        for child in self.children.iter_mut() {
            child.open(db)?;
        }
        for index in 0..self.children.len() {
            self.pull(db, index)?;
        }
        self.last_emitted = None;
        Ok(())
    }

    fn next(&mut self, db: &DB) -> Result<Option<Row>> {
        loop {
            let mut smallest: Option<(usize, u32)> = None;
            for (index, head) in self.heads.iter().enumerate() {
                if let Some(row) = head {
                    match smallest {
                        Some((_, id)) if id <= row.tuple_id => {}
                        _ => smallest = Some((index, row.tuple_id)),
                    }
                }
            }

            let (index, id) = match smallest {
                Some(s) => s,
                None => return Ok(None),
            };
            let row = self.heads[index].take().expect("head vanished");
            self.pull(db, index)?;

            if self.last_emitted == Some(id) {
                continue;
            }
            self.last_emitted = Some(id);
            for action in self.row_actions.iter() {
                action.run(&row)?;
            }
            return Ok(Some(row));
        }
    }

    fn reset(&mut self, db: &DB) -> Result<()> {
        for child in self.children.iter_mut() {
            child.reset(db)?;
        }
        self.last_emitted = None;
        Ok(())
    }

    fn rewind(&mut self, db: &DB) -> Result<()> {
        self.reset(db)
    }

    fn close(&mut self, db: &DB) -> Result<()> {
        for child in self.children.iter_mut() {
            child.close(db)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// MergeSort

/// N-way merge of presorted child streams over explicit key positions,
/// distinct by tuple id.
pub struct MergeSortIter {
    children: Vec<Box<dyn ExecIterator>>,
    heads: Vec<Option<Row>>,
    key_positions: Vec<usize>,
    key_fields: Vec<FieldDef>,
    directions: Vec<Direction>,
    emitted: TupleBitSet,
    row_actions: Vec<RowAction>,
}

impl MergeSortIter {
    pub fn new(
        children: Vec<Box<dyn ExecIterator>>,
        key_positions: Vec<usize>,
        key_fields: Vec<FieldDef>,
        directions: Vec<Direction>,
        row_actions: Vec<RowAction>,
    ) -> Self {
        Self {
            heads: (0..children.len()).map(|_| None).collect(),
            children,
            key_positions,
            key_fields,
            directions,
            emitted: TupleBitSet::new(),
            row_actions,
        }
    }

    fn pull(&mut self, db: &DB, index: usize) -> Result<()> {
        self.heads[index] = self.children[index].next(db)?;
        Ok(())
    }

    fn key_compare(&self, a: &Row, b: &Row) -> Ordering {
        for ((position, field), direction) in self
            .key_positions
            .iter()
            .zip(self.key_fields.iter())
            .zip(self.directions.iter())
        {
            let ord = compare_values(&a.values[*position], &b.values[*position], field);
            let ord = match direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl ExecIterator for MergeSortIter {
    fn open(&mut self, db: &DB) -> Result<()> {
        for child in self.children.iter_mut() {
            child.open(db)?;
        }
        for index in 0..self.children.len() {
            self.pull(db, index)?;
        }
        self.emitted.clear();
        Ok(())
    }

    fn next(&mut self, db: &DB) -> Result<Option<Row>> {
        loop {
            let mut best: Option<usize> = None;
            for index in 0..self.heads.len() {
                if self.heads[index].is_none() {
                    continue;
                }
                best = match best {
                    None => Some(index),
                    Some(current) => {
                        let a = self.heads[index].as_ref().expect("head vanished");
                        let b = self.heads[current].as_ref().expect("head vanished");
                        if self.key_compare(a, b) == Ordering::Less {
                            Some(index)
                        } else {
                            Some(current)
                        }
                    }
                };
            }

            let index = match best {
                Some(index) => index,
                None => return Ok(None),
            };
            let row = self.heads[index].take().expect("head vanished");
            self.pull(db, index)?;

            if !self.emitted.insert(row.tuple_id) {
                continue;
            }
            for action in self.row_actions.iter() {
                action.run(&row)?;
            }
            return Ok(Some(row));
        }
    }

    fn reset(&mut self, db: &DB) -> Result<()> {
        for child in self.children.iter_mut() {
            child.reset(db)?;
        }
        self.emitted.clear();
        Ok(())
    }

    fn rewind(&mut self, db: &DB) -> Result<()> {
        self.reset(db)
    }

    fn close(&mut self, db: &DB) -> Result<()> {
        for child in self.children.iter_mut() {
            child.close(db)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Program

/// The emitted plan: an iterator tree plus the statement's cancel flag.
pub struct Program {
    root: Box<dyn ExecIterator>,
    cancel: Arc<AtomicBool>,
    parallel_safe: bool,
}

impl Program {
    pub fn new(root: Box<dyn ExecIterator>, cancel: Arc<AtomicBool>, parallel_safe: bool) -> Self {
        Self {
            root,
            cancel,
            parallel_safe,
        }
    }

    /// Handle the caller can trip to abort between rows.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Whether independent branches of the plan could be computed in
    /// parallel (no locking involved). Execution is sequential either
    /// way.
    pub fn is_parallel_safe(&self) -> bool {
        self.parallel_safe
    }

    pub fn open(&mut self, db: &DB) -> Result<()> {
        self.root.open(db)
    }

    pub fn next(&mut self, db: &DB) -> Result<Option<Row>> {
        self.root.next(db)
    }

    pub fn reset(&mut self, db: &DB) -> Result<()> {
        self.root.reset(db)
    }

    pub fn close(&mut self, db: &DB) -> Result<()> {
        self.root.close(db)
    }

    pub fn bind(&mut self, key: &[Value]) -> Result<()> {
        self.root.bind(key)
    }

    /// Open, drain and close in one go.
    pub fn run(&mut self, db: &DB) -> Result<Vec<Row>> {
        self.open(db)?;
        let mut rows = Vec::new();
        while let Some(row) = self.next(db)? {
            rows.push(row);
        }
        self.close(db)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::am::datum::DataType;
    use crate::plan::predicate::Predicate;
    use crate::test_util::get_temp_db;

    fn row(id: u32, key: i32) -> Row {
        Row {
            tuple_id: id,
            values: vec![Value::Int32(key)],
        }
    }

    fn filter(rows: Vec<Row>) -> Box<dyn ExecIterator> {
        Box::new(FilterIter::new(rows, None))
    }

    #[test]
    fn filter_adapts_a_collection() {
        let (db, _dir) = get_temp_db();
        let check = CheckPredicate {
            predicate: Predicate::gt(0, Value::Int32(10)),
            fields: vec![FieldDef::new(DataType::Int32)],
        };
        let mut iter = FilterIter::new(vec![row(1, 5), row(2, 20), row(3, 30)], Some(check));

        iter.open(&db).unwrap();
        assert_eq!(iter.next(&db).unwrap().unwrap().tuple_id, 2);
        iter.mark().unwrap();
        assert_eq!(iter.next(&db).unwrap().unwrap().tuple_id, 3);
        iter.rewind(&db).unwrap();
        assert_eq!(iter.next(&db).unwrap().unwrap().tuple_id, 3);
        assert!(iter.next(&db).unwrap().is_none());
        iter.close(&db).unwrap();
    }

    #[test]
    fn union_distinct_merges_by_tuple_id() {
        let (db, _dir) = get_temp_db();
        let left = filter(vec![row(1, 0), row(4, 0), row(9, 0)]);
        let right = filter(vec![row(1, 0), row(2, 0), row(9, 0), row(12, 0)]);

        let mut union = UnionDistinctIter::new(vec![left, right], Vec::new());
        union.open(&db).unwrap();
        let mut ids = Vec::new();
        while let Some(row) = union.next(&db).unwrap() {
            ids.push(row.tuple_id);
        }
        assert_eq!(ids, vec![1, 2, 4, 9, 12]);
        union.close(&db).unwrap();
    }

    #[test]
    fn merge_sort_is_ordered_and_distinct() {
        let (db, _dir) = get_temp_db();
        let left = filter(vec![row(1, 1), row(3, 5), row(5, 9)]);
        let right = filter(vec![row(2, 2), row(3, 5), row(6, 7)]);

        let mut merge = MergeSortIter::new(
            vec![left, right],
            vec![0],
            vec![FieldDef::new(DataType::Int32)],
            vec![Direction::Ascending],
            Vec::new(),
        );
        merge.open(&db).unwrap();
        let mut seen = Vec::new();
        while let Some(row) = merge.next(&db).unwrap() {
            seen.push((row.tuple_id, row.values[0].clone()));
        }
        assert_eq!(
            seen,
            vec![
                (1, Value::Int32(1)),
                (2, Value::Int32(2)),
                (3, Value::Int32(5)),
                (6, Value::Int32(7)),
                (5, Value::Int32(9)),
            ]
        );
    }

    #[test]
    fn bitset_combination_actions() {
        let (db, _dir) = get_temp_db();
        let target = TupleBitSet::new_ptr();
        let source = TupleBitSet::new_ptr();
        for id in &[1u32, 3, 5] {
            target.borrow_mut().insert(*id);
        }
        for id in &[3u32, 5, 7] {
            source.borrow_mut().insert(*id);
        }

        let startup = vec![StartUpAction::Combine {
            source: source.clone(),
            target: target.clone(),
            op: BitSetOp::Diff,
        }];
        let scan = BitSetScanIter::new(target.clone(), Vec::new());
        let mut iter = LoopOnceIter::new(startup, Box::new(scan));

        iter.open(&db).unwrap();
        let mut ids = Vec::new();
        while let Some(row) = iter.next(&db).unwrap() {
            ids.push(row.tuple_id);
        }
        assert_eq!(ids, vec![1]);
    }
}
