//! The predicate tree handed to the condition compiler and the planner.

use crate::am::datum::{compare_values, like_match, FieldDef, Value};
use crate::{Error, Result};

use std::cmp::Ordering;

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Field(usize),
    Constant(Value),
    /// A runtime-bound parameter, as in the inner side of a nested loop.
    Variable(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanEquals,
    LessThan,
    LessThanEquals,
}

impl CompareOp {
    /// The operator after swapping the two operands.
    pub fn flip(self) -> Self {
        match self {
            CompareOp::Equals => CompareOp::Equals,
            CompareOp::NotEquals => CompareOp::NotEquals,
            CompareOp::GreaterThan => CompareOp::LessThan,
            CompareOp::GreaterThanEquals => CompareOp::LessThanEquals,
            CompareOp::LessThan => CompareOp::GreaterThan,
            CompareOp::LessThanEquals => CompareOp::GreaterThanEquals,
        }
    }

    pub fn matches(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Equals => ord == Ordering::Equal,
            CompareOp::NotEquals => ord != Ordering::Equal,
            CompareOp::GreaterThan => ord == Ordering::Greater,
            CompareOp::GreaterThanEquals => ord != Ordering::Less,
            CompareOp::LessThan => ord == Ordering::Less,
            CompareOp::LessThanEquals => ord != Ordering::Greater,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Comparison {
        op: CompareOp,
        left: Operand,
        right: Operand,
    },
    Like {
        field: usize,
        pattern: String,
        escape: Option<char>,
    },
    EqualsToNull {
        field: usize,
    },
    Unknown,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    /// Evaluation mode in which the outer operator supplies the key at
    /// runtime; `fields` names the key fields that will be bound.
    Fetch {
        fields: Vec<usize>,
    },
}

impl Predicate {
    pub fn eq(field: usize, value: Value) -> Predicate {
        Predicate::Comparison {
            op: CompareOp::Equals,
            left: Operand::Field(field),
            right: Operand::Constant(value),
        }
    }

    pub fn ne(field: usize, value: Value) -> Predicate {
        Predicate::Comparison {
            op: CompareOp::NotEquals,
            left: Operand::Field(field),
            right: Operand::Constant(value),
        }
    }

    pub fn gt(field: usize, value: Value) -> Predicate {
        Predicate::Comparison {
            op: CompareOp::GreaterThan,
            left: Operand::Field(field),
            right: Operand::Constant(value),
        }
    }

    pub fn ge(field: usize, value: Value) -> Predicate {
        Predicate::Comparison {
            op: CompareOp::GreaterThanEquals,
            left: Operand::Field(field),
            right: Operand::Constant(value),
        }
    }

    pub fn lt(field: usize, value: Value) -> Predicate {
        Predicate::Comparison {
            op: CompareOp::LessThan,
            left: Operand::Field(field),
            right: Operand::Constant(value),
        }
    }

    pub fn le(field: usize, value: Value) -> Predicate {
        Predicate::Comparison {
            op: CompareOp::LessThanEquals,
            left: Operand::Field(field),
            right: Operand::Constant(value),
        }
    }

    pub fn like(field: usize, pattern: &str, escape: Option<char>) -> Predicate {
        Predicate::Like {
            field,
            pattern: pattern.to_string(),
            escape,
        }
    }

    pub fn is_null(field: usize) -> Predicate {
        Predicate::EqualsToNull { field }
    }

    /// Evaluate against a tuple. Comparisons involving null are false,
    /// as is `Unknown`.
    pub fn evaluate(&self, values: &[Value], fields: &[FieldDef]) -> Result<bool> {
        match self {
            Predicate::Comparison { op, left, right } => {
                let (field, value, op) = alternate(*op, left, right)?;
                let lhs = values.get(field).ok_or_else(|| {
                    Error::BadArgument(format!("field {} out of range", field))
                })?;
                if lhs.is_null() || value.is_null() {
                    return Ok(false);
                }
                let def = fields.get(field).ok_or_else(|| {
                    Error::BadArgument(format!("field {} out of range", field))
                })?;
                Ok(op.matches(compare_values(lhs, value, def)))
            }
            Predicate::Like {
                field,
                pattern,
                escape,
            } => {
                let lhs = values.get(*field).ok_or_else(|| {
                    Error::BadArgument(format!("field {} out of range", field))
                })?;
                match lhs {
                    Value::Null => Ok(false),
                    Value::String(s) => Ok(like_match(s, pattern, *escape)),
                    _ => Err(Error::BadArgument(
                        "LIKE applied to a non-string field".to_string(),
                    )),
                }
            }
            Predicate::EqualsToNull { field } => {
                let lhs = values.get(*field).ok_or_else(|| {
                    Error::BadArgument(format!("field {} out of range", field))
                })?;
                Ok(lhs.is_null())
            }
            Predicate::Unknown => Ok(false),
            Predicate::And(children) => {
                for child in children {
                    if !child.evaluate(values, fields)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(children) => {
                for child in children {
                    if child.evaluate(values, fields)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(child) => Ok(!child.evaluate(values, fields)?),
            Predicate::Fetch { .. } => Err(Error::Unexpected(
                "a fetch node cannot be evaluated against a tuple".to_string(),
            )),
        }
    }
}

/// Rearrange a binary comparison so the field reference is the left
/// operand, flipping the operator when the operands swap.
pub fn alternate<'a>(
    op: CompareOp,
    left: &'a Operand,
    right: &'a Operand,
) -> Result<(usize, &'a Value, CompareOp)> {
    match (left, right) {
        (Operand::Field(f), Operand::Constant(v)) => Ok((*f, v, op)),
        (Operand::Constant(v), Operand::Field(f)) => Ok((*f, v, op.flip())),
        _ => Err(Error::NotSupported(
            "comparison does not pair a field with a constant".to_string(),
        )),
    }
}

/// Like `alternate` but also admitting a variable on the non-field side.
pub fn alternate_term<'a>(
    op: CompareOp,
    left: &'a Operand,
    right: &'a Operand,
) -> Option<(usize, &'a Operand, CompareOp)> {
    match (left, right) {
        (Operand::Field(f), other @ Operand::Constant(_))
        | (Operand::Field(f), other @ Operand::Variable(_)) => Some((*f, other, op)),
        (other @ Operand::Constant(_), Operand::Field(f))
        | (other @ Operand::Variable(_), Operand::Field(f)) => Some((*f, other, op.flip())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::am::datum::{Collation, DataType};

    fn fields() -> Vec<FieldDef> {
        vec![
            FieldDef::new(DataType::Int32),
            FieldDef {
                data_type: DataType::Varchar(16),
                collation: Collation::PadSpace,
            },
        ]
    }

    #[test]
    fn comparison_is_alternated() {
        // 5 > f0 must behave as f0 < 5
        let pred = Predicate::Comparison {
            op: CompareOp::GreaterThan,
            left: Operand::Constant(Value::Int32(5)),
            right: Operand::Field(0),
        };
        let row = vec![Value::Int32(3), Value::String("x".to_string())];
        assert!(pred.evaluate(&row, &fields()).unwrap());
        let row = vec![Value::Int32(7), Value::String("x".to_string())];
        assert!(!pred.evaluate(&row, &fields()).unwrap());
    }

    #[test]
    fn null_comparisons_are_false() {
        let pred = Predicate::eq(0, Value::Int32(1));
        let row = vec![Value::Null, Value::String("x".to_string())];
        assert!(!pred.evaluate(&row, &fields()).unwrap());
        assert!(!Predicate::ne(0, Value::Int32(1))
            .evaluate(&row, &fields())
            .unwrap());
        assert!(Predicate::is_null(0).evaluate(&row, &fields()).unwrap());
    }

    #[test]
    fn combinators_evaluate() {
        let row = vec![Value::Int32(3), Value::String("abc".to_string())];
        let both = Predicate::And(vec![
            Predicate::gt(0, Value::Int32(1)),
            Predicate::like(1, "ab%", None),
        ]);
        assert!(both.evaluate(&row, &fields()).unwrap());

        let either = Predicate::Or(vec![
            Predicate::lt(0, Value::Int32(0)),
            Predicate::like(1, "zz%", None),
        ]);
        assert!(!either.evaluate(&row, &fields()).unwrap());

        let negated = Predicate::Not(Box::new(either));
        assert!(negated.evaluate(&row, &fields()).unwrap());
    }
}
