// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Attribute predicate tree (`spec.md` §4.8). Compiled against a schema once,
//! then evaluated per decoded cell slab. Grounded on the teacher's
//! `range_tombstone_filter.rs` shape (a small predicate tree walked per
//! value) rather than a general expression VM, since the condition language
//! here is fixed and small.

use crate::datatype::Datatype;
use crate::error::{Error, Result};
use crate::schema::Schema;

/// A leaf comparison operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

impl CompareOp {
    fn matches(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            Self::Lt => ord == Less,
            Self::Le => ord != Greater,
            Self::Eq => ord == Equal,
            Self::Ne => ord != Equal,
            Self::Ge => ord != Less,
            Self::Gt => ord == Greater,
        }
    }
}

/// A tree of per-attribute predicates (`spec.md` §4.8). `Predicate` compares
/// an attribute's decoded value against a literal; `IsNull`/`IsNotNull` are
/// the only operators that examine a nullable attribute's validity lane
/// directly; `And`/`Or` combine subtrees and may be evaluated in either
/// order (both are associative/commutative for the result).
#[derive(Clone, Debug)]
pub enum QueryCondition {
    Predicate {
        attribute: String,
        op: CompareOp,
        value: Vec<u8>,
    },
    IsNull(String),
    IsNotNull(String),
    And(Box<QueryCondition>, Box<QueryCondition>),
    Or(Box<QueryCondition>, Box<QueryCondition>),
}

impl QueryCondition {
    #[must_use]
    pub fn predicate(attribute: impl Into<String>, op: CompareOp, value: Vec<u8>) -> Self {
        Self::Predicate {
            attribute: attribute.into(),
            op,
            value,
        }
    }

    #[must_use]
    pub fn is_null(attribute: impl Into<String>) -> Self {
        Self::IsNull(attribute.into())
    }

    #[must_use]
    pub fn is_not_null(attribute: impl Into<String>) -> Self {
        Self::IsNotNull(attribute.into())
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// Collects the attribute names this condition reads, so a reader can
    /// fetch a superset of the caller's requested output attributes.
    pub fn referenced_attributes(&self, out: &mut Vec<String>) {
        match self {
            Self::Predicate { attribute, .. } | Self::IsNull(attribute) | Self::IsNotNull(attribute) => {
                out.push(attribute.clone());
            }
            Self::And(l, r) | Self::Or(l, r) => {
                l.referenced_attributes(out);
                r.referenced_attributes(out);
            }
        }
    }

    /// Binds every leaf's attribute name to the schema and checks the
    /// literal's type matches, failing fast rather than at evaluation time.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if an attribute is unknown or a predicate's
    /// literal length doesn't match the attribute's fixed byte width.
    pub fn compile(&self, schema: &Schema) -> Result<()> {
        match self {
            Self::Predicate { attribute, value, .. } => {
                let attr = schema
                    .attribute(attribute)
                    .ok_or_else(|| Error::Schema(format!("no such attribute '{attribute}'")))?;
                if let Some(width) = attr.datatype().byte_width() {
                    if !attr.cell_val_num().is_var() && value.len() != width {
                        return Err(Error::Schema(format!(
                            "condition literal for '{attribute}' is {} bytes, expected {width}",
                            value.len()
                        )));
                    }
                }
                Ok(())
            }
            Self::IsNull(attribute) | Self::IsNotNull(attribute) => {
                let attr = schema
                    .attribute(attribute)
                    .ok_or_else(|| Error::Schema(format!("no such attribute '{attribute}'")))?;
                if !attr.is_nullable() {
                    return Err(Error::Schema(format!(
                        "'{attribute}' is not nullable, IS_NULL/IS_NOT_NULL does not apply"
                    )));
                }
                Ok(())
            }
            Self::And(l, r) | Self::Or(l, r) => {
                l.compile(schema)?;
                r.compile(schema)
            }
        }
    }

    /// Evaluates the condition for one cell, given a lookup from attribute
    /// name to `(value_bytes, validity)`. `validity` is `None` for
    /// non-nullable attributes and `Some(is_valid)` otherwise.
    ///
    /// `NULL op value` is false for comparison operators (`spec.md` §4.8);
    /// `NULL` only participates through `IsNull`/`IsNotNull`.
    #[must_use]
    pub fn eval(&self, datatype_of: &dyn Fn(&str) -> Datatype, cell: &dyn Fn(&str) -> (Option<&[u8]>, Option<bool>)) -> bool {
        match self {
            Self::Predicate { attribute, op, value } => {
                let (bytes, validity) = cell(attribute);
                if validity == Some(false) {
                    return false;
                }
                let Some(bytes) = bytes else { return false };
                let datatype = datatype_of(attribute);
                op.matches(datatype.compare(bytes, value))
            }
            Self::IsNull(attribute) => cell(attribute).1 == Some(false),
            Self::IsNotNull(attribute) => cell(attribute).1 != Some(false),
            Self::And(l, r) => l.eval(datatype_of, cell) && r.eval(datatype_of, cell),
            Self::Or(l, r) => l.eval(datatype_of, cell) || r.eval(datatype_of, cell),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::CellValNum;
    use crate::domain::Dimension;
    use crate::schema::{ArrayType, Attribute};
    use test_log::test;

    fn schema() -> Schema {
        let mut schema = Schema::new(ArrayType::Sparse);
        schema
            .add_dimension(Dimension::new_numeric("x", Datatype::Int32, 0i32, 9i32, Some(10i32)).unwrap())
            .unwrap();
        schema
            .add_attribute(Attribute::new("a", Datatype::Int32, CellValNum::Fixed(1), true).unwrap())
            .unwrap();
        schema
    }

    #[test]
    fn compile_rejects_unknown_attribute() {
        let cond = QueryCondition::predicate("missing", CompareOp::Eq, vec![0; 4]);
        assert!(cond.compile(&schema()).is_err());
    }

    #[test]
    fn null_fails_comparison_but_satisfies_is_null() {
        let cond = QueryCondition::predicate("a", CompareOp::Ge, 4i32.to_le_bytes().to_vec());
        let datatype_of = |_: &str| Datatype::Int32;
        let cell = |_: &str| (None, Some(false));
        assert!(!cond.eval(&datatype_of, &cell));

        let is_null = QueryCondition::is_null("a");
        assert!(is_null.eval(&datatype_of, &cell));
    }

    #[test]
    fn and_or_short_circuit_semantics() {
        let datatype_of = |_: &str| Datatype::Int32;
        let a_is_5 = |name: &str| -> (Option<&[u8]>, Option<bool>) {
            static V: [u8; 4] = 5i32.to_le_bytes();
            if name == "a" { (Some(&V), Some(true)) } else { (None, None) }
        };

        let cond = QueryCondition::predicate("a", CompareOp::Eq, 5i32.to_le_bytes().to_vec())
            .and(QueryCondition::predicate("a", CompareOp::Gt, 0i32.to_le_bytes().to_vec()));
        assert!(cond.eval(&datatype_of, &a_is_5));

        let cond = QueryCondition::predicate("a", CompareOp::Eq, 1i32.to_le_bytes().to_vec())
            .or(QueryCondition::predicate("a", CompareOp::Eq, 5i32.to_le_bytes().to_vec()));
        assert!(cond.eval(&datatype_of, &a_is_5));
    }
}
