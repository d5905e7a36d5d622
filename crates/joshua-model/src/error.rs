//! Model error taxonomy.
//!
//! Conflicts are retryable and absorbed by the transaction retry loop;
//! `InvariantViolation` is fatal by contract and must never be masked.

use joshua_kv::{KvError, Retryable, TupleError};
use thiserror::Error;

use crate::schema::EnsembleId;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("ensemble not found: {0}")]
    NotFound(EnsembleId),
    /// The KV transport signalled a commit conflict. Callers retry.
    #[error("transaction conflict")]
    Conflict,
    #[error("write exceeds the transaction budget: {0}")]
    TooLarge(String),
    /// Counters observed inconsistent with `ended == pass + fail`.
    #[error("counter invariant violated for {id}: ended={ended} pass={pass} fail={fail}")]
    InvariantViolation {
        id: EnsembleId,
        ended: u64,
        pass: u64,
        fail: u64,
    },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("kv error: {0}")]
    Kv(KvError),
}

impl From<KvError> for ModelError {
    fn from(error: KvError) -> Self {
        match error {
            KvError::Conflict => ModelError::Conflict,
            KvError::TooLarge(reason) => ModelError::TooLarge(reason),
            other => ModelError::Kv(other),
        }
    }
}

impl From<TupleError> for ModelError {
    fn from(error: TupleError) -> Self {
        ModelError::Corrupt(error.to_string())
    }
}

impl Retryable for ModelError {
    fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Conflict)
    }
}
