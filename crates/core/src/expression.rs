//! Key expressions and their evaluation.
//!
//! An expression projects a record into zero or more key tuples. Field
//! extraction is multi-valued; a field that extracts nothing produces no
//! entries at all (null fields are not indexed), and a cartesian product
//! with an empty side is empty.

use serde::{Deserialize, Serialize};

use crate::record::{Record, RecordAccess};
use crate::tuple::Tuple;
use crate::IndexError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyExpression {
    /// Multi-valued field extraction by name.
    Field(String),
    /// Cartesian product of child entry sets, columns concatenated.
    Concat(Vec<KeyExpression>),
    /// A constant column.
    Literal(crate::tuple::TupleElement),
    /// No columns, exactly one (empty) entry.
    Empty,
}

impl KeyExpression {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }

    pub fn concat(children: Vec<KeyExpression>) -> Self {
        Self::Concat(children)
    }

    /// Number of key columns this expression contributes.
    pub fn column_count(&self) -> usize {
        match self {
            Self::Field(_) => 1,
            Self::Literal(_) => 1,
            Self::Empty => 0,
            Self::Concat(children) => children.iter().map(|c| c.column_count()).sum(),
        }
    }
}

/// Evaluate `expression` against `record`, yielding the set of index
/// entries (each one key tuple).
pub fn evaluate<R: Record>(
    access: &dyn RecordAccess<R>,
    record: &R,
    expression: &KeyExpression,
) -> Result<Vec<Tuple>, IndexError> {
    match expression {
        KeyExpression::Field(name) => {
            let values = access.extract_field(record, name)?;
            Ok(values.into_iter().map(Tuple::single).collect())
        }
        KeyExpression::Literal(element) => Ok(vec![Tuple::single(element.clone())]),
        KeyExpression::Empty => Ok(vec![Tuple::new()]),
        KeyExpression::Concat(children) => {
            let mut entries = vec![Tuple::new()];

            for child in children {
                let child_entries = evaluate(access, record, child)?;

                // the null-field rule: an empty side empties the product
                if child_entries.is_empty() {
                    return Ok(Vec::new());
                }

                let mut next = Vec::with_capacity(entries.len() * child_entries.len());
                for head in &entries {
                    for tail in &child_entries {
                        next.push(head.clone().concat(tail));
                    }
                }
                entries = next;
            }

            Ok(entries)
        }
    }
}
