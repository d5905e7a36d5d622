//! Transactional store contract.
//!
//! Implementations are responsible for making the coordination semantics
//! the fabric depends on explicit:
//! - reads register conflicts unless performed through the snapshot
//!   variants, and a commit that raced a conflicting write must fail with
//!   [KvError::Conflict] rather than apply;
//! - `atomic_add` must not register a read conflict on the added key;
//! - `set_versionstamped_key` must splice the 10-byte commit stamp into
//!   the key template at the given offset before the write becomes
//!   visible;
//! - a watch resolves no later than the first commit that mutates the
//!   watched key after registration.

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

/// Length in bytes of a commit versionstamp.
pub const VERSIONSTAMP_LEN: usize = 10;

/// Largest value a single key may carry.
pub const MAX_VALUE_BYTES: usize = 100_000;

/// Budget for the mutations of one transaction. Sized so a fully capped
/// run result (10 MiB of output) plus its counter updates still commits
/// as a single transaction.
pub const MAX_TRANSACTION_BYTES: usize = 16 * 1024 * 1024;

/// A 10-byte, monotonically increasing commit token. Big-endian byte
/// order equals commit order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Versionstamp([u8; VERSIONSTAMP_LEN]);

impl Versionstamp {
    pub fn from_bytes(bytes: [u8; VERSIONSTAMP_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERSIONSTAMP_LEN] {
        &self.0
    }

    pub fn to_vec(self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl std::fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum KvError {
    /// The commit raced another writer. Retryable.
    #[error("transaction conflict")]
    Conflict,
    /// A key or value exceeded the store's size limits.
    #[error("transaction too large: {0}")]
    TooLarge(String),
    /// The database handle is no longer usable.
    #[error("database closed")]
    Closed,
    #[error("kv transport error: {0}")]
    Transport(String),
}

/// Options for a range read.
#[derive(Clone, Copy, Debug, Default)]
pub struct RangeOptions {
    /// Maximum number of key-value pairs to return; `None` is unbounded.
    pub limit: Option<usize>,
    /// Return pairs in descending key order.
    pub reverse: bool,
    /// Do not register a read conflict for the range.
    pub snapshot: bool,
}

impl RangeOptions {
    pub fn snapshot() -> Self {
        Self {
            snapshot: true,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

#[async_trait]
pub trait Transaction: Send {
    /// Point read that registers a read conflict on the key.
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Point read at snapshot isolation (no read conflict).
    async fn get_snapshot(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Range read over the half-open interval `[start, end)`.
    async fn get_range(
        &mut self,
        start: &[u8],
        end: &[u8],
        options: RangeOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError>;

    fn set(&mut self, key: &[u8], value: &[u8]);

    fn clear(&mut self, key: &[u8]);

    fn clear_range(&mut self, start: &[u8], end: &[u8]);

    /// 8-byte little-endian wrapping addition; an absent key reads as
    /// zero. Does not register a read conflict.
    fn atomic_add(&mut self, key: &[u8], delta: i64);

    /// Writes `value` under `key_template` with the commit stamp spliced
    /// in at `stamp_offset`.
    fn set_versionstamped_key(&mut self, key_template: &[u8], stamp_offset: usize, value: &[u8]);

    /// Validates and applies the transaction, returning the commit stamp.
    async fn commit(self) -> Result<Versionstamp, KvError>;
}

#[async_trait]
pub trait Database: Clone + Send + Sync + 'static {
    type Tx: Transaction;

    async fn begin(&self) -> Result<Self::Tx, KvError>;

    /// Future resolving once `key` is mutated by a commit that happens
    /// after registration. Spurious wakeups are permitted; callers pair
    /// watches with a poll interval.
    fn watch(&self, key: &[u8]) -> BoxFuture<'static, ()>;
}
