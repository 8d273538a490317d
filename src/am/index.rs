use crate::{
    am::{datum::Value, open_option::OpenOption, FileId},
    plan::predicate::Predicate,
    Result, TupleBitSetPtr, DB,
};

/// Projection handed to `get_projection_parameter`. Min/Max ask for a
/// single-sided seek over the leading key instead of a full scan.
#[derive(Clone, Debug, PartialEq)]
pub enum Projection {
    Fields(Vec<usize>),
    Min(usize),
    Max(usize),
}

/// Result of a `verify` walk. Inconsistencies are collected rather than
/// raised; the walker's internal abort never escapes the entry point.
#[derive(Debug, Default)]
pub struct Progress {
    pub consistent: bool,
    pub messages: Vec<String>,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            consistent: true,
            messages: Vec::new(),
        }
    }

    pub fn fail(&mut self, message: String) {
        self.consistent = false;
        self.messages.push(message);
    }
}

/// The driver surface the planner chooses over and the execution
/// iterators drive.
///
/// The planning half (`get_*_parameter`, costs and capabilities) fills
/// the open option map; the execution half re-parses it at `open` and
/// runs the cursor.
pub trait IndexFile {
    fn file_id(&self) -> &FileId;

    // --- planning surface ---

    fn get_search_parameter(&self, pred: &Predicate, opt: &mut OpenOption) -> bool;

    /// Whether this file can stream in the order of the given key
    /// fields; sets the reverse flag for descending order.
    fn get_sort_parameter(&self, keys: &[usize], descending: bool, opt: &mut OpenOption) -> bool;

    fn get_projection_parameter(&self, projection: &Projection, opt: &mut OpenOption) -> bool;

    fn get_count(&self, db: &DB) -> Result<u64>;

    fn get_estimate_count(&self, db: &DB, opt: &OpenOption) -> Result<u64>;

    /// Cost of positioning a scan, in arbitrary planner units.
    fn get_overhead(&self) -> f64;

    /// Cost of producing one tuple.
    fn get_process_cost(&self) -> f64;

    fn is_get_by_bitset(&self) -> bool;

    fn is_search_by_bitset(&self) -> bool;

    // --- execution surface ---

    fn open(&mut self, db: &DB, opt: &OpenOption) -> Result<()>;

    fn close(&mut self, db: &DB) -> Result<()>;

    /// Bind the runtime key of a fetch-mode open.
    fn fetch(&mut self, key: &[Value]) -> Result<()>;

    /// Advance the cursor; the projected fields land in `out` and the
    /// tuple id is returned, or `None` on exhaustion.
    fn get(&mut self, db: &DB, out: &mut Vec<Value>) -> Result<Option<u32>>;

    /// Union every matching tuple id into the caller's bitset.
    fn get_by_bitset(&mut self, db: &DB, out: &TupleBitSetPtr) -> Result<()>;

    fn mark(&mut self) -> Result<()>;

    fn rewind(&mut self, db: &DB) -> Result<()>;

    fn reset(&mut self) -> Result<()>;
}
