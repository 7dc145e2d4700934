//! Per-index state machine.
//!
//! Each index carries a single state byte in the KVS. Transitions are
//! validated by read-modify-write inside one transaction, so two racing
//! administrators cannot both believe their transition won.
//!
//! | byte | state | maintained | query-visible |
//! |------|-------|------------|---------------|
//! | 0 | disabled | no | no |
//! | 1 | write-only | yes | no |
//! | 2 | readable | yes | yes |

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::kvs::Transaction;
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use crate::IndexError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Disabled,
    WriteOnly,
    Readable,
}

impl IndexState {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::WriteOnly => 1,
            Self::Readable => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Disabled),
            1 => Some(Self::WriteOnly),
            2 => Some(Self::Readable),
            _ => None,
        }
    }

    /// An index receives maintenance unless disabled.
    pub fn is_maintained(self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn is_readable(self) -> bool {
        matches!(self, Self::Readable)
    }

    /// Legal forward transitions; `disable` is legal from anywhere and a
    /// same-state transition is a no-op.
    fn allows(self, to: IndexState) -> bool {
        match (self, to) {
            _ if self == to => true,
            (_, Self::Disabled) => true,
            (Self::Disabled, Self::WriteOnly) => true,
            (Self::WriteOnly, Self::Readable) => true,
            _ => false,
        }
    }
}

/// Reads and transitions index states inside caller transactions.
#[derive(Debug, Clone)]
pub struct IndexStateManager {
    subspace: Subspace,
}

impl IndexStateManager {
    pub fn new(subspace: Subspace) -> Self {
        Self { subspace }
    }

    fn state_key(&self, name: &str) -> Vec<u8> {
        self.subspace.pack(&Tuple::new().with(name))
    }

    /// Current state; an index with no state byte is disabled.
    pub fn state<T: Transaction>(&self, name: &str, txn: &T) -> Result<IndexState, IndexError> {
        let raw = txn.get(&self.state_key(name))?;

        let state = match raw.as_deref() {
            None | Some([]) => IndexState::Disabled,
            Some([byte, ..]) => IndexState::from_byte(*byte).ok_or_else(|| {
                IndexError::internal(format!("corrupt state byte {byte} for index {name}"))
            })?,
        };

        Ok(state)
    }

    pub fn states<T: Transaction>(
        &self,
        names: &[&str],
        txn: &T,
    ) -> Result<std::collections::HashMap<String, IndexState>, IndexError> {
        let mut out = std::collections::HashMap::with_capacity(names.len());
        for name in names {
            out.insert(name.to_string(), self.state(name, txn)?);
        }
        Ok(out)
    }

    fn transition<T: Transaction>(
        &self,
        name: &str,
        to: IndexState,
        txn: &mut T,
    ) -> Result<IndexState, IndexError> {
        let from = self.state(name, txn)?;

        if !from.allows(to) {
            return Err(IndexError::InvalidStateTransition {
                index: name.to_string(),
                from,
                to,
            });
        }

        if from != to {
            txn.set(&self.state_key(name), &[to.to_byte()]);
            info!(index = name, ?from, ?to, "index state transition");
        }

        Ok(from)
    }

    /// `disabled -> write_only`; the index starts receiving maintenance.
    pub fn enable<T: Transaction>(&self, name: &str, txn: &mut T) -> Result<(), IndexError> {
        self.transition(name, IndexState::WriteOnly, txn)?;
        Ok(())
    }

    /// `write_only -> readable`; the index becomes query-visible.
    pub fn make_readable<T: Transaction>(
        &self,
        name: &str,
        txn: &mut T,
    ) -> Result<(), IndexError> {
        self.transition(name, IndexState::Readable, txn)?;
        Ok(())
    }

    /// Back to `disabled` from any state. Index data is untouched; callers
    /// that want a clean slate clear the index subspace themselves.
    pub fn disable<T: Transaction>(&self, name: &str, txn: &mut T) -> Result<(), IndexError> {
        self.transition(name, IndexState::Disabled, txn)?;
        Ok(())
    }

    /// Idempotently drive the index to `readable`, whatever its current
    /// state, in this one transaction.
    pub fn ensure_readable<T: Transaction>(
        &self,
        name: &str,
        txn: &mut T,
    ) -> Result<(), IndexError> {
        let from = self.state(name, txn)?;

        if !from.is_readable() {
            txn.set(&self.state_key(name), &[IndexState::Readable.to_byte()]);
            info!(index = name, ?from, "index forced readable");
        }

        Ok(())
    }

    /// Guard for query paths.
    pub fn expect_readable<T: Transaction>(
        &self,
        name: &str,
        txn: &T,
    ) -> Result<(), IndexError> {
        match self.state(name, txn)? {
            IndexState::Readable => Ok(()),
            _ => Err(IndexError::IndexNotReadable(name.to_string())),
        }
    }
}
