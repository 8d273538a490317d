//! The planner's cost record.

use std::cmp::Ordering;

/// Estimated cost of driving one access path. A cost is infinity until
/// somebody populates it.
#[derive(Clone, Copy, Debug)]
pub struct Cost {
    pub overhead: f64,
    pub total_cost: f64,
    pub tuple_count: f64,
    pub tuple_size: f64,
    /// Selectivity: result tuples over table tuples.
    pub rate: f64,
    pub table_count: f64,
    pub is_fetch: bool,
    pub is_set_count: bool,
    pub is_set_rate: bool,
    pub is_limited: bool,
}

impl Default for Cost {
    fn default() -> Self {
        Cost::infinity()
    }
}

impl Cost {
    pub fn infinity() -> Self {
        Self {
            overhead: f64::INFINITY,
            total_cost: f64::INFINITY,
            tuple_count: f64::INFINITY,
            tuple_size: 0.0,
            rate: 1.0,
            table_count: 0.0,
            is_fetch: false,
            is_set_count: false,
            is_set_rate: false,
            is_limited: false,
        }
    }

    pub fn is_infinity(&self) -> bool {
        self.total_cost.is_infinite()
    }

    /// Populate from a driver's figures.
    pub fn calculate(
        overhead: f64,
        process_cost: f64,
        tuple_count: u64,
        table_count: u64,
    ) -> Self {
        let tuple_count = tuple_count as f64;
        let table_count = (table_count as f64).max(1.0);
        Self {
            overhead,
            total_cost: overhead + process_cost * tuple_count,
            tuple_count,
            tuple_size: 0.0,
            rate: (tuple_count / table_count).min(1.0),
            table_count,
            is_fetch: false,
            is_set_count: true,
            is_set_rate: true,
            is_limited: false,
        }
    }

    /// Full-scan cost of the same file, used both for the locking
    /// penalty and for the scan-is-better decision.
    pub fn scan_cost(overhead: f64, process_cost: f64, table_count: u64) -> f64 {
        overhead + process_cost * table_count as f64
    }

    /// Row-level locking makes a narrowing index progressively less
    /// attractive as its result grows.
    pub fn add_locking_penalty(&mut self, scan_cost: f64) {
        let factor = self.tuple_count / 10.0;
        self.total_cost += scan_cost * factor * factor * factor;
    }

    /// Selectivity inversion for a NOT operand.
    pub fn invert(&mut self) {
        if self.is_set_rate {
            self.rate = 1.0 - self.rate;
        }
        if self.is_set_count {
            self.tuple_count = (self.table_count - self.tuple_count).max(1.0);
        }
    }

    /// A limited plan beats an unlimited one; otherwise the cheaper
    /// total wins, with the smaller result as tie-breaker.
    pub fn compare(&self, other: &Cost) -> Ordering {
        if self.is_limited != other.is_limited {
            return if self.is_limited {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
        let mine = self.overhead + self.total_cost;
        let theirs = other.overhead + other.total_cost;
        match mine.partial_cmp(&theirs) {
            Some(Ordering::Equal) | None => self
                .tuple_count
                .partial_cmp(&other.tuple_count)
                .unwrap_or(Ordering::Equal),
            Some(ord) => ord,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_infinity() {
        let cost = Cost::infinity();
        assert!(cost.is_infinity());
        let populated = Cost::calculate(0.001, 0.0001, 10, 1000);
        assert!(!populated.is_infinity());
        assert!(populated.compare(&cost) == Ordering::Less);
    }

    #[test]
    fn selectivity_inversion() {
        let mut cost = Cost::calculate(0.0, 0.0001, 100, 1000);
        assert!((cost.rate - 0.1).abs() < 1e-9);

        cost.invert();
        assert!((cost.rate - 0.9).abs() < 1e-9);
        assert!((cost.tuple_count - 900.0).abs() < 1e-9);

        // inverting an almost-total operand still leaves one tuple
        let mut cost = Cost::calculate(0.0, 0.0001, 1000, 1000);
        cost.invert();
        assert!((cost.tuple_count - 1.0).abs() < 1e-9);
    }

    #[test]
    fn locking_penalty_grows_with_the_result() {
        let scan = Cost::scan_cost(0.001, 0.0001, 10_000);
        let mut narrow = Cost::calculate(0.001, 0.0001, 10, 10_000);
        let mut wide = Cost::calculate(0.001, 0.0001, 1000, 10_000);
        let narrow_before = narrow.total_cost;
        let wide_before = wide.total_cost;

        narrow.add_locking_penalty(scan);
        wide.add_locking_penalty(scan);
        assert!(narrow.total_cost - narrow_before < wide.total_cost - wide_before);
    }

    #[test]
    fn limited_plans_win() {
        let mut limited = Cost::calculate(0.1, 0.01, 100, 1000);
        limited.is_limited = true;
        let cheap = Cost::calculate(0.0001, 0.0001, 10, 1000);
        assert_eq!(limited.compare(&cheap), Ordering::Less);
    }
}
