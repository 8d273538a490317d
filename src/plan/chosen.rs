//! Index choice.
//!
//! The planner turns a predicate tree into an arena of chosen nodes —
//! each leaf bound to the cheapest file able to evaluate it — then
//! emits the iterator tree: plain or narrowed file scans, bitset
//! AND/OR/DIFF chains built at startup, union-distinct or merge-sort
//! combinations. A shape with no strategy raises `NotSupported`; that
//! is the one statement-level retryable error, the caller falls back
//! to a scan.

use crate::{
    am::{
        datum::{DataType, FieldDef},
        index::IndexFile,
        open_option::{OpenMode, OpenOption, OptionKey},
    },
    plan::{
        candidate::{CandidateFile, CandidateTable, CheckIndexArgument, FileUse},
        cost::Cost,
        iterator::{
            BitSetOp, BitSetScanIter, CheckPredicate, ExecIterator, FileScanIter, Locker,
            LoopOnceIter, MergeSortIter, Program, RowAction, StartUpAction, UnionDistinctIter,
        },
        predicate::Predicate,
        Direction, Order,
    },
    Error, Result, TupleBitSet, TupleBitSetPtr, DB,
};

use std::{
    cmp::Ordering,
    rc::Rc,
    sync::{atomic::AtomicBool, Arc},
};

use log::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChosenId(pub usize);

/// One node of the chosen-predicate tree.
#[derive(Clone)]
enum ChosenNode {
    /// A leaf predicate, bound to a file or to nothing at all.
    Single {
        predicate: Predicate,
        choice: Option<FileUse>,
    },
    And {
        operands: Vec<ChosenId>,
    },
    Or {
        operands: Vec<ChosenId>,
    },
    Not {
        operand: ChosenId,
    },
    /// An indexable part plus the residue checked per tuple.
    Partial {
        checked: ChosenId,
        unchecked: Predicate,
    },
}

/// The buckets a chosen node can land in; every leaf takes exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Bucket {
    NeedScan,
    Fetch,
    IndexScan,
    SearchByBitSet,
    BitSet,
}

pub struct Planner<'a> {
    db: &'a DB,
    table: CandidateTable,
    files: Vec<CandidateFile>,
    nodes: Vec<ChosenNode>,
    locker: Option<Rc<dyn Locker>>,
    parallel: bool,
}

impl<'a> Planner<'a> {
    pub fn new(db: &'a DB, table: CandidateTable) -> Self {
        Self {
            db,
            table,
            files: Vec::new(),
            nodes: Vec::new(),
            locker: None,
            parallel: false,
        }
    }

    /// Register a candidate file; `key_columns` names the table column
    /// behind each of its key positions.
    pub fn add_file(&mut self, file: Box<dyn IndexFile>, key_columns: Vec<usize>) {
        self.files.push(CandidateFile::new(file, key_columns));
    }

    pub fn set_locker(&mut self, locker: Rc<dyn Locker>) {
        self.locker = Some(locker);
    }

    /// Choose indexes for the predicate and emit the iterator tree.
    pub fn plan(
        mut self,
        predicate: Option<&Predicate>,
        order: Option<&Order>,
        limit: Option<u64>,
    ) -> Result<Program> {
        let root = match predicate {
            Some(pred) => self.choose(pred, order, limit)?,
            None => {
                // no predicate: an unconditioned scan over some file
                let everything = Predicate::And(Vec::new());
                match self.choose_file(&everything, order, limit)? {
                    Some(choice) => self.push(ChosenNode::Single {
                        predicate: everything,
                        choice: Some(choice),
                    }),
                    None => {
                        return Err(Error::NotSupported(
                            "no file can run an unconditioned scan".to_string(),
                        ))
                    }
                }
            }
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let iterator = self.emit_node(root, order, &cancel)?;
        let parallel_safe = self.parallel && !self.table.needs_lock;
        Ok(Program::new(iterator, cancel, parallel_safe))
    }

    fn push(&mut self, node: ChosenNode) -> ChosenId {
        self.nodes.push(node);
        ChosenId(self.nodes.len() - 1)
    }

    // ------------------------------------------------------------------
    // choice

    fn choose(
        &mut self,
        pred: &Predicate,
        order: Option<&Order>,
        limit: Option<u64>,
    ) -> Result<ChosenId> {
        // a single file taking the whole predicate wins outright; an
        // ordered OR is kept apart because a multi-condition scan does
        // not stream in key order
        let try_single = match pred {
            Predicate::Not(_) => false,
            Predicate::Or(_) => order.is_none(),
            _ => true,
        };
        if try_single {
            if let Some(choice) = self.choose_file(pred, order, limit)? {
                return Ok(self.push(ChosenNode::Single {
                    predicate: pred.clone(),
                    choice: Some(choice),
                }));
            }
        }

        match pred {
            Predicate::And(children) => {
                let mut operands = Vec::new();
                let mut unchecked = Vec::new();
                for child in children {
                    match child {
                        Predicate::And(_) | Predicate::Or(_) | Predicate::Not(_) => {
                            let id = self.choose(child, order, None)?;
                            if self.is_scan_only(id) {
                                unchecked.push(child.clone());
                            } else {
                                operands.push(id);
                            }
                        }
                        _ => match self.choose_file(child, order, None)? {
                            Some(choice) => {
                                let id = self.push(ChosenNode::Single {
                                    predicate: child.clone(),
                                    choice: Some(choice),
                                });
                                operands.push(id);
                            }
                            None => unchecked.push(child.clone()),
                        },
                    }
                }

                if operands.is_empty() {
                    return Ok(self.push(ChosenNode::Single {
                        predicate: pred.clone(),
                        choice: None,
                    }));
                }
                let checked = if operands.len() == 1 {
                    operands[0]
                } else {
                    self.push(ChosenNode::And { operands })
                };
                if unchecked.is_empty() {
                    Ok(checked)
                } else {
                    let unchecked = if unchecked.len() == 1 {
                        unchecked.pop().expect("non-empty")
                    } else {
                        Predicate::And(unchecked)
                    };
                    Ok(self.push(ChosenNode::Partial { checked, unchecked }))
                }
            }
            Predicate::Or(children) => {
                let mut operands = Vec::new();
                for child in children {
                    operands.push(self.choose(child, order, None)?);
                }
                // one scan-only branch poisons the whole OR
                if operands.iter().any(|id| self.is_scan_only(*id)) {
                    Ok(self.push(ChosenNode::Single {
                        predicate: pred.clone(),
                        choice: None,
                    }))
                } else {
                    Ok(self.push(ChosenNode::Or { operands }))
                }
            }
            Predicate::Not(child) => {
                let operand = self.choose(child, None, None)?;
                Ok(self.push(ChosenNode::Not { operand }))
            }
            _ => Ok(self.push(ChosenNode::Single {
                predicate: pred.clone(),
                choice: None,
            })),
        }
    }

    fn is_scan_only(&self, id: ChosenId) -> bool {
        matches!(
            self.nodes[id.0],
            ChosenNode::Single { choice: None, .. }
        )
    }

    /// Ask every candidate file for a plan over the predicate and keep
    /// the cheapest. A file whose plain scan beats its own index is
    /// marked and not used for this predicate.
    fn choose_file(
        &mut self,
        pred: &Predicate,
        order: Option<&Order>,
        limit: Option<u64>,
    ) -> Result<Option<FileUse>> {
        let db = self.db;
        let table_count = self.table.tuple_count;
        let needs_lock = self.table.needs_lock;
        let mut best: Option<FileUse> = None;

        for (index, cand) in self.files.iter_mut().enumerate() {
            if cand.reserved {
                continue;
            }
            let file = match cand.file.as_ref() {
                Some(file) => file,
                None => continue,
            };
            let remapped = match cand.remap_predicate(pred) {
                Some(p) => p,
                None => continue,
            };

            let mut option = OpenOption::new();
            option.set_open_mode(OpenMode::Read);
            if !file.get_search_parameter(&remapped, &mut option) {
                continue;
            }

            let mut provides_order = false;
            if let Some(order) = order {
                if let Some(position) = cand.key_position(order.field) {
                    provides_order = file.get_sort_parameter(
                        &[position],
                        order.direction == Direction::Descending,
                        &mut option,
                    );
                }
            }

            let is_fetch = predicate_has_fetch(&remapped);
            let estimate = if is_fetch {
                1
            } else {
                let mut estimate_option = option.clone();
                estimate_option.set_bool(OptionKey::Estimate, true);
                file.get_estimate_count(db, &estimate_option)?
            };
            let mut cost = Cost::calculate(
                file.get_overhead(),
                file.get_process_cost(),
                estimate,
                table_count,
            );
            cost.is_fetch = is_fetch;
            if limit.is_some() && (order.is_none() || provides_order) {
                cost.is_limited = true;
            }

            let scan_cost =
                Cost::scan_cost(file.get_overhead(), file.get_process_cost(), table_count);
            if needs_lock {
                cost.add_locking_penalty(scan_cost);
            }
            if !is_fetch && scan_cost < cost.total_cost {
                cand.scan_better = true;
                debug!(
                    "file {} rejected for this predicate: a scan is cheaper",
                    file.file_id().file_ref()
                );
                continue;
            }

            let candidate = FileUse {
                file_index: index,
                option,
                cost,
                is_fetch,
                provides_order,
            };
            best = match best {
                Some(current) if current.cost.compare(&candidate.cost) != Ordering::Greater => {
                    Some(current)
                }
                _ => Some(candidate),
            };
        }

        // every returned choice is adopted by the caller
        if let Some(choice) = &best {
            self.files[choice.file_index].reserved = true;
        }
        Ok(best)
    }

    // ------------------------------------------------------------------
    // classification

    fn classify(&self, id: ChosenId) -> Bucket {
        match &self.nodes[id.0] {
            ChosenNode::Single { choice: None, .. } => Bucket::NeedScan,
            ChosenNode::Single {
                choice: Some(choice),
                ..
            } => {
                if choice.is_fetch {
                    Bucket::Fetch
                } else if choice.provides_order {
                    // an ordered stream that can still take a narrowing
                    // bitset as input
                    Bucket::SearchByBitSet
                } else {
                    Bucket::BitSet
                }
            }
            ChosenNode::And { operands } => {
                let buckets: Vec<Bucket> = operands.iter().map(|id| self.classify(*id)).collect();
                if buckets
                    .iter()
                    .any(|b| matches!(b, Bucket::NeedScan | Bucket::Fetch))
                {
                    Bucket::NeedScan
                } else if buckets.iter().all(|b| *b == Bucket::BitSet) {
                    Bucket::BitSet
                } else if buckets.iter().filter(|b| **b == Bucket::SearchByBitSet).count() == 1
                    && buckets
                        .iter()
                        .all(|b| matches!(b, Bucket::BitSet | Bucket::SearchByBitSet))
                {
                    Bucket::SearchByBitSet
                } else {
                    Bucket::IndexScan
                }
            }
            ChosenNode::Or { operands } => {
                let buckets: Vec<Bucket> = operands.iter().map(|id| self.classify(*id)).collect();
                if buckets.iter().all(|b| *b == Bucket::BitSet) {
                    Bucket::BitSet
                } else if buckets.iter().all(|b| *b == Bucket::SearchByBitSet) {
                    Bucket::SearchByBitSet
                } else {
                    Bucket::NeedScan
                }
            }
            ChosenNode::Not { operand } => {
                if self.classify(*operand) == Bucket::BitSet {
                    Bucket::BitSet
                } else {
                    Bucket::NeedScan
                }
            }
            ChosenNode::Partial { checked, .. } => match &self.nodes[checked.0] {
                ChosenNode::Single {
                    choice: Some(_), ..
                } => Bucket::IndexScan,
                _ => Bucket::NeedScan,
            },
        }
    }

    fn node_estimate(&self, id: ChosenId) -> f64 {
        let table = self.table.tuple_count as f64;
        match &self.nodes[id.0] {
            ChosenNode::Single { choice: None, .. } => table,
            ChosenNode::Single {
                choice: Some(choice),
                ..
            } => choice.cost.tuple_count,
            ChosenNode::And { operands } => operands
                .iter()
                .map(|id| self.node_estimate(*id))
                .fold(table, f64::min),
            ChosenNode::Or { operands } => operands
                .iter()
                .map(|id| self.node_estimate(*id))
                .sum::<f64>()
                .min(table),
            ChosenNode::Not { operand } => (table - self.node_estimate(*operand)).max(1.0),
            ChosenNode::Partial { checked, .. } => self.node_estimate(*checked),
        }
    }

    fn predicate_of(&self, id: ChosenId) -> Predicate {
        match &self.nodes[id.0] {
            ChosenNode::Single { predicate, .. } => predicate.clone(),
            ChosenNode::And { operands } => {
                Predicate::And(operands.iter().map(|id| self.predicate_of(*id)).collect())
            }
            ChosenNode::Or { operands } => {
                Predicate::Or(operands.iter().map(|id| self.predicate_of(*id)).collect())
            }
            ChosenNode::Not { operand } => {
                Predicate::Not(Box::new(self.predicate_of(*operand)))
            }
            ChosenNode::Partial { checked, unchecked } => Predicate::And(vec![
                self.predicate_of(*checked),
                unchecked.clone(),
            ]),
        }
    }

    fn single_use(&self, id: ChosenId) -> Result<FileUse> {
        match &self.nodes[id.0] {
            ChosenNode::Single {
                choice: Some(choice),
                ..
            } => Ok(choice.clone()),
            _ => Err(Error::NotSupported(
                "this operand cannot drive a scan".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // emission

    fn emit_node(
        &mut self,
        id: ChosenId,
        order: Option<&Order>,
        cancel: &Arc<AtomicBool>,
    ) -> Result<Box<dyn ExecIterator>> {
        let node = self.nodes[id.0].clone();
        match node {
            ChosenNode::Single {
                choice: Some(choice),
                ..
            } => {
                if order.is_some() && !choice.provides_order {
                    return Err(Error::NotSupported(
                        "the required ordering needs an external sort".to_string(),
                    ));
                }
                let scan = self.make_file_scan(choice, None, cancel, true)?;
                Ok(Box::new(scan))
            }
            ChosenNode::Single { choice: None, .. } => Err(Error::NotSupported(
                "no usable index; fall back to a scan".to_string(),
            )),
            ChosenNode::Partial { checked, unchecked } => {
                let choice = self.single_use(checked)?;
                if order.is_some() && !choice.provides_order {
                    return Err(Error::NotSupported(
                        "the required ordering needs an external sort".to_string(),
                    ));
                }
                let check = self.make_check(choice.file_index, &unchecked)?;
                let scan = self.make_file_scan(choice, Some(check), cancel, true)?;
                Ok(Box::new(scan))
            }
            ChosenNode::And { operands } => self.emit_and(&operands, order, cancel),
            ChosenNode::Or { operands } => self.emit_or(&operands, order, cancel),
            ChosenNode::Not { .. } => Err(Error::NotSupported(
                "a lone NOT has no narrowing set to complement".to_string(),
            )),
        }
    }

    fn emit_and(
        &mut self,
        operands: &[ChosenId],
        order: Option<&Order>,
        cancel: &Arc<AtomicBool>,
    ) -> Result<Box<dyn ExecIterator>> {
        // NOT operands complement the running bitset
        let mut positives = Vec::new();
        let mut nots = Vec::new();
        for id in operands {
            match self.nodes[id.0] {
                ChosenNode::Not { operand } => nots.push(operand),
                _ => positives.push(*id),
            }
        }
        if positives.is_empty() {
            return Err(Error::NotSupported(
                "an AND of only NOT operands has no narrowing set".to_string(),
            ));
        }
        for id in nots.iter() {
            if self.classify(*id) != Bucket::BitSet {
                return Err(Error::NotSupported(
                    "a NOT operand must produce a bitset".to_string(),
                ));
            }
        }

        let mut arg = CheckIndexArgument::default();
        arg.set_and();
        for id in positives.iter() {
            match self.classify(*id) {
                Bucket::NeedScan => arg.need_scan.push(*id),
                Bucket::Fetch => arg.fetch.push(*id),
                Bucket::IndexScan => arg.index_scan.push(*id),
                Bucket::SearchByBitSet => arg.search_by_bitset.push(*id),
                Bucket::BitSet => arg.bit_set.push(*id),
            }
        }
        let nodes = &*self;
        arg.sort_by_estimate(|id| nodes.node_estimate(id));
        let arg = arg;

        if !arg.need_scan.is_empty() {
            return Err(Error::NotSupported(
                "an AND operand has no usable index".to_string(),
            ));
        }

        if !arg.fetch.is_empty() {
            // the smallest fetching operand drives; everything else is
            // checked per tuple
            let scan_id = arg.fetch[0];
            let choice = self.single_use(scan_id)?;
            let mut residual: Vec<Predicate> = positives
                .iter()
                .filter(|id| **id != scan_id)
                .map(|id| self.predicate_of(*id))
                .collect();
            residual.extend(
                nots.iter()
                    .map(|id| Predicate::Not(Box::new(self.predicate_of(*id)))),
            );
            let check = if residual.is_empty() {
                None
            } else {
                let pred = if residual.len() == 1 {
                    residual.pop().expect("non-empty")
                } else {
                    Predicate::And(residual)
                };
                Some(self.make_check(choice.file_index, &pred)?)
            };
            let scan = self.make_file_scan(choice, check, cancel, true)?;
            return Ok(Box::new(scan));
        }

        let single_search = arg.search_by_bitset.len() == 1 && arg.index_scan.is_empty();

        if order.is_some() && !single_search {
            return Err(Error::NotSupported(
                "the required ordering needs an external sort".to_string(),
            ));
        }

        if single_search {
            // the ordered operand scans; the rest narrows it by bitset
            let scan_id = arg.search_by_bitset[0];
            let mut choice = self.single_use(scan_id)?;
            if arg.bit_set.is_empty() && nots.is_empty() {
                let scan = self.make_file_scan(choice, None, cancel, true)?;
                return Ok(Box::new(scan));
            }

            let narrowing = TupleBitSet::new_ptr();
            let mut startup = vec![StartUpAction::CheckCancel(cancel.clone())];
            self.collect_and_bitset(
                &arg.bit_set,
                &nots,
                narrowing.clone(),
                None,
                cancel,
                &mut startup,
            )?;
            choice
                .option
                .set_bitset(OptionKey::SearchByBitSet, narrowing);
            let scan = self.make_file_scan(choice, None, cancel, true)?;
            return Ok(Box::new(LoopOnceIter::new(startup, Box::new(scan))));
        }

        if arg.is_only_bit_set() {
            // chain of bitsets: the first pays full cost, later ones are
            // narrowed by the running set
            let target = TupleBitSet::new_ptr();
            let mut startup = vec![StartUpAction::CheckCancel(cancel.clone())];
            self.collect_and_bitset(&arg.bit_set, &nots, target.clone(), None, cancel, &mut startup)?;
            if let Some(locker) = &self.locker {
                startup.push(StartUpAction::LockBitSet {
                    target: target.clone(),
                    locker: locker.clone(),
                });
            }
            let scan = BitSetScanIter::new(
                target,
                vec![RowAction::CheckCancel(cancel.clone())],
            );
            return Ok(Box::new(LoopOnceIter::new(startup, Box::new(scan))));
        }

        // scan the leading index and re-check the other operands
        let leading = arg
            .index_scan
            .first()
            .or_else(|| arg.search_by_bitset.first())
            .or_else(|| arg.bit_set.first())
            .copied()
            .ok_or_else(|| Error::NotSupported("nothing to scan".to_string()))?;
        let choice = self.single_use(leading)?;
        let mut residual: Vec<Predicate> = positives
            .iter()
            .filter(|id| **id != leading)
            .map(|id| self.predicate_of(*id))
            .collect();
        residual.extend(
            nots.iter()
                .map(|id| Predicate::Not(Box::new(self.predicate_of(*id)))),
        );
        let check = if residual.is_empty() {
            None
        } else {
            let pred = if residual.len() == 1 {
                residual.pop().expect("non-empty")
            } else {
                Predicate::And(residual)
            };
            Some(self.make_check(choice.file_index, &pred)?)
        };
        let scan = self.make_file_scan(choice, check, cancel, true)?;
        Ok(Box::new(scan))
    }

    fn emit_or(
        &mut self,
        operands: &[ChosenId],
        order: Option<&Order>,
        cancel: &Arc<AtomicBool>,
    ) -> Result<Box<dyn ExecIterator>> {
        if let Some(order) = order {
            // sub-orderings merge only when the order key admits
            // alternative values
            if !order.alternative {
                return Err(Error::NotSupported(
                    "the required ordering needs an external sort".to_string(),
                ));
            }
            let mut children: Vec<Box<dyn ExecIterator>> = Vec::new();
            let mut position: Option<usize> = None;
            let mut field: Option<FieldDef> = None;
            for id in operands {
                let choice = self.single_use(*id)?;
                if !choice.provides_order {
                    return Err(Error::NotSupported(
                        "an OR operand cannot stream in the required order".to_string(),
                    ));
                }
                let cand = &self.files[choice.file_index];
                let file = cand.file.as_ref().ok_or_else(|| {
                    Error::NotSupported("the plan needs the same file twice".to_string())
                })?;
                let pos = cand
                    .key_position(order.field)
                    .ok_or_else(|| Error::Unexpected("order key not in file".to_string()))?;
                let def = row_fields(file.as_ref())[pos];
                match position {
                    None => {
                        position = Some(pos);
                        field = Some(def);
                    }
                    Some(existing) if existing == pos => {}
                    Some(_) => {
                        return Err(Error::NotSupported(
                            "order keys sit at different positions across operands".to_string(),
                        ))
                    }
                }
                let scan = self.make_file_scan(choice, None, cancel, false)?;
                children.push(Box::new(scan));
            }

            let mut actions = vec![RowAction::CheckCancel(cancel.clone())];
            if let Some(locker) = &self.locker {
                actions.push(RowAction::Lock(locker.clone()));
            }
            let merge = MergeSortIter::new(
                children,
                vec![position.expect("at least one operand")],
                vec![field.expect("at least one operand")],
                vec![order.direction],
                actions,
            );
            return Ok(Box::new(merge));
        }

        // every operand a plain file: merge their ordered streams
        // distinct on tuple id
        if operands
            .iter()
            .all(|id| matches!(&self.nodes[id.0], ChosenNode::Single { choice: Some(_), .. }))
        {
            let mut children: Vec<Box<dyn ExecIterator>> = Vec::new();
            for id in operands {
                let choice = self.single_use(*id)?;
                let scan = self.make_file_scan(choice, None, cancel, false)?;
                children.push(Box::new(scan));
            }
            let mut actions = vec![RowAction::CheckCancel(cancel.clone())];
            if let Some(locker) = &self.locker {
                actions.push(RowAction::Lock(locker.clone()));
            }
            return Ok(Box::new(UnionDistinctIter::new(children, actions)));
        }

        // composite operands: union their bitsets
        if operands.iter().all(|id| self.classify(*id) == Bucket::BitSet) {
            let target = TupleBitSet::new_ptr();
            let mut startup = vec![StartUpAction::CheckCancel(cancel.clone())];
            let mut first = true;
            for id in operands {
                if first {
                    self.bitset_actions(*id, target.clone(), None, cancel, &mut startup)?;
                    first = false;
                } else {
                    let temp = TupleBitSet::new_ptr();
                    self.bitset_actions(*id, temp.clone(), None, cancel, &mut startup)?;
                    startup.push(StartUpAction::Combine {
                        source: temp,
                        target: target.clone(),
                        op: BitSetOp::Or,
                    });
                }
            }
            if let Some(locker) = &self.locker {
                startup.push(StartUpAction::LockBitSet {
                    target: target.clone(),
                    locker: locker.clone(),
                });
            }
            // branches are independent; without locking they could be
            // built in parallel
            self.parallel = true;
            let scan = BitSetScanIter::new(
                target,
                vec![RowAction::CheckCancel(cancel.clone())],
            );
            return Ok(Box::new(LoopOnceIter::new(startup, Box::new(scan))));
        }

        Err(Error::NotSupported(
            "the OR operands have no common strategy".to_string(),
        ))
    }

    /// Startup actions for an AND chain: sorted positives narrowed one
    /// after another, then the NOT operands subtracted.
    fn collect_and_bitset(
        &mut self,
        positives: &[ChosenId],
        nots: &[ChosenId],
        target: TupleBitSetPtr,
        narrowing: Option<TupleBitSetPtr>,
        cancel: &Arc<AtomicBool>,
        startup: &mut Vec<StartUpAction>,
    ) -> Result<()> {
        let mut first = true;
        for id in positives {
            if first {
                self.bitset_actions(*id, target.clone(), narrowing.clone(), cancel, startup)?;
                first = false;
            } else {
                let temp = TupleBitSet::new_ptr();
                self.bitset_actions(*id, temp.clone(), Some(target.clone()), cancel, startup)?;
                startup.push(StartUpAction::Combine {
                    source: temp,
                    target: target.clone(),
                    op: BitSetOp::Assign,
                });
            }
        }
        for id in nots {
            let temp = TupleBitSet::new_ptr();
            self.bitset_actions(*id, temp.clone(), Some(target.clone()), cancel, startup)?;
            startup.push(StartUpAction::Combine {
                source: temp,
                target: target.clone(),
                op: BitSetOp::Diff,
            });
        }
        Ok(())
    }

    /// Emit the startup actions leaving `target` equal to the node's
    /// result set, optionally narrowed by a caller-owned bitset.
    fn bitset_actions(
        &mut self,
        id: ChosenId,
        target: TupleBitSetPtr,
        narrowing: Option<TupleBitSetPtr>,
        cancel: &Arc<AtomicBool>,
        startup: &mut Vec<StartUpAction>,
    ) -> Result<()> {
        let node = self.nodes[id.0].clone();
        match node {
            ChosenNode::Single {
                choice: Some(mut choice),
                ..
            } => {
                let file = self.files[choice.file_index]
                    .file
                    .take()
                    .ok_or_else(|| Error::NotSupported("the plan needs the same file twice".to_string()))?;
                choice.option.set_bool(OptionKey::GetByBitSet, true);
                if let Some(narrowing) = narrowing {
                    choice
                        .option
                        .set_bitset(OptionKey::SearchByBitSet, narrowing);
                }
                self.files[choice.file_index].parameter.is_get_by_bitset = true;
                startup.push(StartUpAction::GetBitSet {
                    file,
                    option: choice.option,
                    target,
                });
                Ok(())
            }
            ChosenNode::And { operands } => {
                let mut positives = Vec::new();
                let mut nots = Vec::new();
                for id in operands {
                    match self.nodes[id.0] {
                        ChosenNode::Not { operand } => nots.push(operand),
                        _ => positives.push(id),
                    }
                }
                positives.sort_by(|a, b| {
                    self.node_estimate(*a)
                        .partial_cmp(&self.node_estimate(*b))
                        .unwrap()
                });
                self.collect_and_bitset(&positives, &nots, target, narrowing, cancel, startup)
            }
            ChosenNode::Or { operands } => {
                let mut first = true;
                for id in operands {
                    if first {
                        self.bitset_actions(id, target.clone(), narrowing.clone(), cancel, startup)?;
                        first = false;
                    } else {
                        let temp = TupleBitSet::new_ptr();
                        self.bitset_actions(id, temp.clone(), narrowing.clone(), cancel, startup)?;
                        startup.push(StartUpAction::Combine {
                            source: temp,
                            target: target.clone(),
                            op: BitSetOp::Or,
                        });
                    }
                }
                Ok(())
            }
            _ => Err(Error::NotSupported(
                "this operand cannot produce a bitset".to_string(),
            )),
        }
    }

    fn make_file_scan(
        &mut self,
        choice: FileUse,
        check: Option<CheckPredicate>,
        cancel: &Arc<AtomicBool>,
        lock_rows: bool,
    ) -> Result<FileScanIter> {
        let file = self.files[choice.file_index]
            .file
            .take()
            .ok_or_else(|| Error::NotSupported("the plan needs the same file twice".to_string()))?;

        let mut actions = vec![RowAction::CheckCancel(cancel.clone())];
        if lock_rows {
            if let Some(locker) = &self.locker {
                actions.push(RowAction::Lock(locker.clone()));
            }
        }
        Ok(FileScanIter::new(file, choice.option, check, actions))
    }

    fn make_check(&self, file_index: usize, pred: &Predicate) -> Result<CheckPredicate> {
        let cand = &self.files[file_index];
        let file = cand
            .file
            .as_ref()
            .ok_or_else(|| Error::NotSupported("the plan needs the same file twice".to_string()))?;
        let mapped = cand.remap_predicate(pred).ok_or_else(|| {
            Error::NotSupported(
                "a residual predicate reads columns the plan does not retrieve".to_string(),
            )
        })?;
        Ok(CheckPredicate {
            predicate: mapped,
            fields: row_fields(file.as_ref()),
        })
    }
}

fn predicate_has_fetch(pred: &Predicate) -> bool {
    match pred {
        Predicate::Fetch { .. } => true,
        Predicate::And(children) | Predicate::Or(children) => {
            children.iter().any(predicate_has_fetch)
        }
        Predicate::Not(child) => predicate_has_fetch(child),
        _ => false,
    }
}

/// Field layout of the rows a file scan produces: key fields first,
/// then the value fields; the vector driver's implicit key leads.
fn row_fields(file: &dyn IndexFile) -> Vec<FieldDef> {
    let file_id = file.file_id();
    if file_id.key.is_empty() {
        let mut fields = vec![FieldDef::new(DataType::UInt32)];
        fields.extend_from_slice(file_id.value.fields());
        fields
    } else {
        file_id.entry_layout().fields().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        am::{
            btree::BtreeFile,
            datum::{RowLayout, Value},
            FileId,
        },
        plan::iterator::Row,
        test_util::get_temp_db,
    };

    use std::cell::RefCell;

    /// The three-row table of the bitset scenarios:
    /// (1, 2) -> A(1), (1, 3) -> B(2), (4, 2) -> C(3).
    const ROWS: [(i32, i32, u32); 3] = [(1, 2, 1), (1, 3, 2), (4, 2, 3)];

    fn index_on(db: &DB, rel_id: crate::OID, column: usize) -> BtreeFile {
        let file_id = FileId {
            db: 0,
            rel_id,
            key: RowLayout::new(vec![FieldDef::new(DataType::Int32)]),
            value: RowLayout::new(vec![FieldDef::new(DataType::UInt32)]),
            unique: false,
            top_null: true,
        };
        let mut file = BtreeFile::new(file_id);
        file.create(db).unwrap();

        let mut opt = OpenOption::new();
        opt.set_open_mode(crate::am::open_option::OpenMode::Update);
        IndexFile::open(&mut file, db, &opt).unwrap();
        for (c0, c1, rowid) in ROWS.iter() {
            let key = if column == 0 { *c0 } else { *c1 };
            file.insert(db, &[Value::Int32(key), Value::UInt32(*rowid)])
                .unwrap();
        }
        IndexFile::close(&mut file, db).unwrap();
        file
    }

    fn ids(rows: &[Row]) -> Vec<u32> {
        rows.iter().map(|r| r.tuple_id).collect()
    }

    #[test]
    fn and_of_bitsets_intersects() {
        let (db, _dir) = get_temp_db();
        let f1 = index_on(&db, 10, 0);
        let f2 = index_on(&db, 11, 1);

        let mut planner = Planner::new(&db, CandidateTable::new(3));
        planner.add_file(Box::new(f1), vec![0]);
        planner.add_file(Box::new(f2), vec![1]);

        // f1 = 1 AND f2 = 2 -> { A }
        let pred = Predicate::And(vec![
            Predicate::eq(0, Value::Int32(1)),
            Predicate::eq(1, Value::Int32(2)),
        ]);
        let mut program = planner.plan(Some(&pred), None, None).unwrap();
        let rows = program.run(&db).unwrap();
        assert_eq!(ids(&rows), vec![1]);
    }

    #[test]
    fn or_unions_distinct_in_row_id_order() {
        let (db, _dir) = get_temp_db();
        let f1 = index_on(&db, 10, 0);
        let f2 = index_on(&db, 11, 1);

        let mut planner = Planner::new(&db, CandidateTable::new(3));
        planner.add_file(Box::new(f1), vec![0]);
        planner.add_file(Box::new(f2), vec![1]);

        // f1 = 1 OR f2 = 2 -> { A, B, C }, each exactly once
        let pred = Predicate::Or(vec![
            Predicate::eq(0, Value::Int32(1)),
            Predicate::eq(1, Value::Int32(2)),
        ]);
        let mut program = planner.plan(Some(&pred), None, None).unwrap();
        let rows = program.run(&db).unwrap();
        assert_eq!(ids(&rows), vec![1, 2, 3]);
    }

    #[test]
    fn same_column_or_becomes_one_multi_condition_scan() {
        let (db, _dir) = get_temp_db();
        let f1 = index_on(&db, 10, 0);

        let mut planner = Planner::new(&db, CandidateTable::new(3));
        planner.add_file(Box::new(f1), vec![0]);

        let pred = Predicate::Or(vec![
            Predicate::eq(0, Value::Int32(1)),
            Predicate::eq(0, Value::Int32(4)),
        ]);
        let mut program = planner.plan(Some(&pred), None, None).unwrap();
        let rows = program.run(&db).unwrap();
        assert_eq!(ids(&rows), vec![1, 2, 3]);
    }

    #[test]
    fn not_complements_the_running_bitset() {
        let (db, _dir) = get_temp_db();
        let f1 = index_on(&db, 10, 0);
        let f2 = index_on(&db, 11, 1);

        let mut planner = Planner::new(&db, CandidateTable::new(3));
        planner.add_file(Box::new(f1), vec![0]);
        planner.add_file(Box::new(f2), vec![1]);

        // f1 = 1 AND NOT f2 = 2 -> { B }
        let pred = Predicate::And(vec![
            Predicate::eq(0, Value::Int32(1)),
            Predicate::Not(Box::new(Predicate::eq(1, Value::Int32(2)))),
        ]);
        let mut program = planner.plan(Some(&pred), None, None).unwrap();
        let rows = program.run(&db).unwrap();
        assert_eq!(ids(&rows), vec![2]);
    }

    #[test]
    fn lone_not_is_not_supported() {
        let (db, _dir) = get_temp_db();
        let f1 = index_on(&db, 10, 0);

        let mut planner = Planner::new(&db, CandidateTable::new(3));
        planner.add_file(Box::new(f1), vec![0]);

        let pred = Predicate::Not(Box::new(Predicate::eq(0, Value::Int32(1))));
        match planner.plan(Some(&pred), None, None) {
            Err(Error::NotSupported(_)) => {}
            other => panic!("expected not-supported, got {:?}", other.err()),
        }
    }

    #[test]
    fn unindexed_column_falls_back_to_scan() {
        let (db, _dir) = get_temp_db();
        let f1 = index_on(&db, 10, 0);

        let mut planner = Planner::new(&db, CandidateTable::new(3));
        planner.add_file(Box::new(f1), vec![0]);

        let pred = Predicate::eq(5, Value::Int32(1));
        match planner.plan(Some(&pred), None, None) {
            Err(Error::NotSupported(_)) => {}
            other => panic!("expected not-supported, got {:?}", other.err()),
        }
    }

    #[test]
    fn ordered_scans_stream_from_the_index() {
        let (db, _dir) = get_temp_db();
        let f1 = index_on(&db, 10, 0);

        let mut planner = Planner::new(&db, CandidateTable::new(3));
        planner.add_file(Box::new(f1), vec![0]);

        let pred = Predicate::ge(0, Value::Int32(0));
        let order = Order::descending(0);
        let mut program = planner.plan(Some(&pred), Some(&order), None).unwrap();
        let rows = program.run(&db).unwrap();
        let keys: Vec<i32> = rows
            .iter()
            .map(|r| match r.values[0] {
                Value::Int32(v) => v,
                _ => panic!("unexpected value"),
            })
            .collect();
        assert_eq!(keys, vec![4, 1, 1]);
    }

    #[test]
    fn merge_sort_combines_ordered_branches() {
        let (db, _dir) = get_temp_db();
        // two cursors over the same index, one per OR branch
        let f1a = index_on(&db, 10, 0);
        let f1b = {
            let file_id = f1a.file_id().clone();
            let mut file = BtreeFile::new(file_id);
            file.mount(&db).unwrap();
            file
        };

        let mut planner = Planner::new(&db, CandidateTable::new(3));
        planner.add_file(Box::new(f1a), vec![0]);
        planner.add_file(Box::new(f1b), vec![0]);

        let pred = Predicate::Or(vec![
            Predicate::eq(0, Value::Int32(4)),
            Predicate::eq(0, Value::Int32(1)),
        ]);
        let order = Order::ascending(0).with_alternative();
        let mut program = planner.plan(Some(&pred), Some(&order), None).unwrap();
        let rows = program.run(&db).unwrap();
        let keys: Vec<i32> = rows
            .iter()
            .map(|r| match r.values[0] {
                Value::Int32(v) => v,
                _ => panic!("unexpected value"),
            })
            .collect();
        assert_eq!(keys, vec![1, 1, 4]);
        assert_eq!(ids(&rows), vec![1, 2, 3]);
    }

    #[test]
    fn fetch_plans_bind_at_runtime() {
        let (db, _dir) = get_temp_db();
        let f1 = index_on(&db, 10, 0);

        let mut planner = Planner::new(&db, CandidateTable::new(3));
        planner.add_file(Box::new(f1), vec![0]);

        let pred = Predicate::Fetch { fields: vec![0] };
        let mut program = planner.plan(Some(&pred), None, None).unwrap();
        program.open(&db).unwrap();

        program.bind(&[Value::Int32(1)]).unwrap();
        let mut found = Vec::new();
        while let Some(row) = program.next(&db).unwrap() {
            found.push(row.tuple_id);
        }
        assert_eq!(found, vec![1, 2]);

        program.bind(&[Value::Int32(4)]).unwrap();
        let mut found = Vec::new();
        while let Some(row) = program.next(&db).unwrap() {
            found.push(row.tuple_id);
        }
        assert_eq!(found, vec![3]);
        program.close(&db).unwrap();
    }

    struct RecordingLocker {
        locked: RefCell<Vec<u32>>,
    }

    impl Locker for RecordingLocker {
        fn lock(&self, tuple_id: u32) -> Result<()> {
            self.locked.borrow_mut().push(tuple_id);
            Ok(())
        }
    }

    #[test]
    fn bitset_plans_lock_at_build_time() {
        let (db, _dir) = get_temp_db();
        let f1 = index_on(&db, 10, 0);
        let f2 = index_on(&db, 11, 1);

        let locker = Rc::new(RecordingLocker {
            locked: RefCell::new(Vec::new()),
        });

        let mut planner = Planner::new(&db, CandidateTable::with_lock(3));
        planner.add_file(Box::new(f1), vec![0]);
        planner.add_file(Box::new(f2), vec![1]);
        planner.set_locker(locker.clone());

        let pred = Predicate::And(vec![
            Predicate::eq(0, Value::Int32(1)),
            Predicate::eq(1, Value::Int32(2)),
        ]);
        let mut program = planner.plan(Some(&pred), None, None).unwrap();
        assert!(!program.is_parallel_safe());

        // the locks land when the final bitset is built, before any row
        // is fetched
        program.open(&db).unwrap();
        assert_eq!(*locker.locked.borrow(), vec![1]);
        let mut rows = Vec::new();
        while let Some(row) = program.next(&db).unwrap() {
            rows.push(row.tuple_id);
        }
        assert_eq!(rows, vec![1]);
        program.close(&db).unwrap();
    }

    #[test]
    fn or_of_composites_unions_bitsets() {
        let (db, _dir) = get_temp_db();
        let f1 = index_on(&db, 10, 0);
        let f2 = index_on(&db, 11, 1);
        let f3 = {
            // a second cursor over the row-id index of column 0
            let mut file = BtreeFile::new(f1.file_id().clone());
            file.mount(&db).unwrap();
            file
        };

        let mut planner = Planner::new(&db, CandidateTable::new(3));
        planner.add_file(Box::new(f1), vec![0]);
        planner.add_file(Box::new(f2), vec![1]);
        planner.add_file(Box::new(f3), vec![0]);

        // (f1 = 1 AND f2 = 2) OR f1 = 4 -> { A, C }
        let pred = Predicate::Or(vec![
            Predicate::And(vec![
                Predicate::eq(0, Value::Int32(1)),
                Predicate::eq(1, Value::Int32(2)),
            ]),
            Predicate::eq(0, Value::Int32(4)),
        ]);
        let mut program = planner.plan(Some(&pred), None, None).unwrap();
        // independent branches without locking could build in parallel
        assert!(program.is_parallel_safe());
        let rows = program.run(&db).unwrap();
        assert_eq!(ids(&rows), vec![1, 3]);
    }

    #[test]
    fn cancellation_aborts_between_rows() {
        let (db, _dir) = get_temp_db();
        let f1 = index_on(&db, 10, 0);

        let mut planner = Planner::new(&db, CandidateTable::new(3));
        planner.add_file(Box::new(f1), vec![0]);

        let pred = Predicate::ge(0, Value::Int32(0));
        let mut program = planner.plan(Some(&pred), None, None).unwrap();
        program.open(&db).unwrap();
        assert!(program.next(&db).unwrap().is_some());

        program.cancel_handle().store(true, std::sync::atomic::Ordering::Relaxed);
        match program.next(&db) {
            Err(Error::Cancelled) => {}
            other => panic!("expected cancellation, got {:?}", other.err()),
        }
    }
}
