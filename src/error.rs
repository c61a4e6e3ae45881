//! # Index Error Kinds
//!
//! Typed error kinds for the index core. Fallible paths return
//! `eyre::Result`; callers that need to distinguish recoverable conditions
//! (a missing key, a duplicate insert) from structural failures downcast
//! the report to [`IndexError`].
//!
//! ## Policy
//!
//! - `KeyNotFound` and `DuplicateKey` are ordinary outcomes and are
//!   surfaced to the caller.
//! - `IteratorInvalidatedByCommit` and `ConcurrentModification` mean the
//!   cursor must be discarded; the tree itself is intact.
//! - `Corruption` means a page image failed structural checks or an
//!   unknown page id was dereferenced; the enclosing session must abort.
//! - `InvariantViolation` is a programming error inside the index core.
//!
//! The core never retries; retry belongs to higher layers.

use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    KeyNotFound { key: i64, value: i64 },
    DuplicateKey { key: i64 },
    IteratorInvalidatedByCommit { iterator_tx: u64, current_tx: u64 },
    ConcurrentModification { iterator_mod: u64, current_mod: u64 },
    Corruption(String),
    InvariantViolation(&'static str),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::KeyNotFound { key, value } => {
                write!(f, "entry not found: key={} value={}", key, value)
            }
            IndexError::DuplicateKey { key } => {
                write!(f, "duplicate key: {}", key)
            }
            IndexError::IteratorInvalidatedByCommit {
                iterator_tx,
                current_tx,
            } => write!(
                f,
                "iterator invalidated by commit or rollback (iterator tx {}, current tx {})",
                iterator_tx, current_tx
            ),
            IndexError::ConcurrentModification {
                iterator_mod,
                current_mod,
            } => write!(
                f,
                "concurrent modification: tree changed under iterator (seen {}, current {})",
                iterator_mod, current_mod
            ),
            IndexError::Corruption(msg) => write!(f, "index corruption: {}", msg),
            IndexError::InvariantViolation(msg) => write!(f, "invariant violation: {}", msg),
        }
    }
}

impl Error for IndexError {}
