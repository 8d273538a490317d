//! Candidate bookkeeping: the files a table offers to the planner and
//! the per-table classification of chosen predicates.

use crate::{
    am::index::IndexFile,
    plan::{
        chosen::ChosenId,
        cost::Cost,
        predicate::{Operand, Predicate},
        Order,
    },
};

use std::collections::HashSet;

/// The logical table a plan runs against.
pub struct CandidateTable {
    pub tuple_count: u64,
    /// Row-level locking required; bitset plans then lock at build time
    /// and branch parallelism is off.
    pub needs_lock: bool,
}

impl CandidateTable {
    pub fn new(tuple_count: u64) -> Self {
        Self {
            tuple_count,
            needs_lock: false,
        }
    }

    pub fn with_lock(tuple_count: u64) -> Self {
        Self {
            tuple_count,
            needs_lock: true,
        }
    }
}

/// What the chosen plan asks of one file.
#[derive(Default)]
pub struct Parameter {
    pub predicate: Option<Predicate>,
    pub order: Option<Order>,
    pub is_limited: bool,
    pub is_get_by_bitset: bool,
    pub is_search_by_bitset: bool,
}

/// A file bound to a candidate table.
pub struct CandidateFile {
    pub file: Option<Box<dyn IndexFile>>,
    /// Table column behind each key position of the file.
    pub key_columns: Vec<usize>,
    pub parameter: Parameter,
    pub scan_better: bool,
    /// Claimed by a chosen leaf; one file drives at most one leaf.
    pub reserved: bool,
    // field bookkeeping for update planning
    pub retrieved: HashSet<usize>,
    pub put_key: HashSet<usize>,
    pub inserted: HashSet<usize>,
    pub undo: HashSet<usize>,
}

impl CandidateFile {
    pub fn new(file: Box<dyn IndexFile>, key_columns: Vec<usize>) -> Self {
        Self {
            file: Some(file),
            key_columns,
            parameter: Parameter::default(),
            scan_better: false,
            reserved: false,
            retrieved: HashSet::new(),
            put_key: HashSet::new(),
            inserted: HashSet::new(),
            undo: HashSet::new(),
        }
    }

    pub fn key_position(&self, column: usize) -> Option<usize> {
        self.key_columns.iter().position(|c| *c == column)
    }

    /// Rewrite a table-column predicate into this file's key positions.
    /// `None` when the predicate touches a column the file has no key
    /// for.
    pub fn remap_predicate(&self, pred: &Predicate) -> Option<Predicate> {
        match pred {
            Predicate::Comparison { op, left, right } => {
                let left = self.remap_operand(left)?;
                let right = self.remap_operand(right)?;
                Some(Predicate::Comparison {
                    op: *op,
                    left,
                    right,
                })
            }
            Predicate::Like {
                field,
                pattern,
                escape,
            } => Some(Predicate::Like {
                field: self.key_position(*field)?,
                pattern: pattern.clone(),
                escape: *escape,
            }),
            Predicate::EqualsToNull { field } => Some(Predicate::EqualsToNull {
                field: self.key_position(*field)?,
            }),
            Predicate::Unknown => Some(Predicate::Unknown),
            Predicate::And(children) => {
                let mapped: Option<Vec<Predicate>> =
                    children.iter().map(|c| self.remap_predicate(c)).collect();
                Some(Predicate::And(mapped?))
            }
            Predicate::Or(children) => {
                let mapped: Option<Vec<Predicate>> =
                    children.iter().map(|c| self.remap_predicate(c)).collect();
                Some(Predicate::Or(mapped?))
            }
            Predicate::Not(child) => Some(Predicate::Not(Box::new(
                self.remap_predicate(child)?,
            ))),
            Predicate::Fetch { fields } => {
                let mapped: Option<Vec<usize>> =
                    fields.iter().map(|f| self.key_position(*f)).collect();
                Some(Predicate::Fetch { fields: mapped? })
            }
        }
    }

    fn remap_operand(&self, operand: &Operand) -> Option<Operand> {
        match operand {
            Operand::Field(column) => Some(Operand::Field(self.key_position(*column)?)),
            other => Some(other.clone()),
        }
    }
}

/// The per-table classification built while visiting the chosen tree:
/// every leaf lands in exactly one bucket.
#[derive(Default, Debug)]
pub struct CheckIndexArgument {
    pub need_scan: Vec<ChosenId>,
    pub fetch: Vec<ChosenId>,
    pub index_scan: Vec<ChosenId>,
    pub search_by_bitset: Vec<ChosenId>,
    pub bit_set: Vec<ChosenId>,
    pub in_and: bool,
    pub in_or: bool,
}

impl CheckIndexArgument {
    pub fn set_and(&mut self) {
        self.in_and = true;
        self.in_or = false;
    }

    pub fn set_or(&mut self) {
        self.in_or = true;
        self.in_and = false;
    }

    pub fn is_empty(&self) -> bool {
        self.need_scan.is_empty()
            && self.fetch.is_empty()
            && self.index_scan.is_empty()
            && self.search_by_bitset.is_empty()
            && self.bit_set.is_empty()
    }

    pub fn is_only_bit_set(&self) -> bool {
        self.need_scan.is_empty()
            && self.fetch.is_empty()
            && self.index_scan.is_empty()
            && self.search_by_bitset.is_empty()
            && !self.bit_set.is_empty()
    }

    pub fn is_only_search_by_bit_set(&self) -> bool {
        self.need_scan.is_empty()
            && self.fetch.is_empty()
            && self.index_scan.is_empty()
            && self.bit_set.is_empty()
            && !self.search_by_bitset.is_empty()
    }

    /// Stable order by estimated result size, cheapest first.
    pub fn sort_by_estimate<F>(&mut self, estimate: F)
    where
        F: Fn(ChosenId) -> f64,
    {
        self.bit_set
            .sort_by(|a, b| estimate(*a).partial_cmp(&estimate(*b)).unwrap());
        self.search_by_bitset
            .sort_by(|a, b| estimate(*a).partial_cmp(&estimate(*b)).unwrap());
        self.fetch
            .sort_by(|a, b| estimate(*a).partial_cmp(&estimate(*b)).unwrap());
        self.index_scan
            .sort_by(|a, b| estimate(*a).partial_cmp(&estimate(*b)).unwrap());
    }
}

/// Cost and capability summary of one leaf's chosen file.
#[derive(Clone)]
pub struct FileUse {
    pub file_index: usize,
    pub option: crate::am::open_option::OpenOption,
    pub cost: Cost,
    pub is_fetch: bool,
    pub provides_order: bool,
}
