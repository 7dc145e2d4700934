//! Record contracts.
//!
//! The layer never parses records itself. Callers hand it records
//! implementing [`Record`] plus a [`RecordAccess`] capability that knows
//! how to pull typed field values out of them and how to revive a record
//! from its stored bytes (needed by backfill and the scrubber's
//! record-to-index phase).

use crate::expression::{self, KeyExpression};
use crate::tuple::{Tuple, TupleElement};
use crate::IndexError;

/// A structured record with a tuple primary key.
pub trait Record: Clone + Send + Sync + 'static {
    fn record_type(&self) -> &'static str;

    fn primary_key(&self) -> Tuple;
}

/// External capability for evaluating records.
pub trait RecordAccess<R: Record>: Send + Sync {
    /// Multi-valued field extraction; an absent field extracts nothing.
    fn extract_field(&self, record: &R, name: &str)
        -> Result<Vec<TupleElement>, IndexError>;

    /// Revive a record of the named type from its stored bytes.
    fn deserialize(&self, record_type: &str, bytes: &[u8]) -> Result<R, IndexError>;

    /// Evaluate a key expression into the set of index entries for this
    /// record.
    fn evaluate(
        &self,
        record: &R,
        expression: &KeyExpression,
    ) -> Result<Vec<Tuple>, IndexError>
    where
        Self: Sized,
    {
        expression::evaluate(self, record, expression)
    }
}

/// Object-safe evaluation for callers holding `&dyn RecordAccess`.
pub fn evaluate_entries<R: Record>(
    access: &dyn RecordAccess<R>,
    record: &R,
    expression: &KeyExpression,
) -> Result<Vec<Tuple>, IndexError> {
    expression::evaluate(access, record, expression)
}
