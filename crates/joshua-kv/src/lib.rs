//! Ordered transactional key-value contract for the joshua fabric.
//!
//! The fabric never talks to a concrete store directly: every operation is
//! written against [Database]/[Transaction], which promise snapshot reads,
//! atomic 8-byte little-endian addition, versionstamped keys, range clears,
//! and key watches. [MemoryDatabase] is the embedded backend used by tests
//! and local development; production deployments supply their own transport
//! behind the same traits.

pub mod cluster;
pub mod database;
pub mod memory;
pub mod retry;
pub mod subspace;
pub mod tuple;

pub use cluster::open_cluster;
pub use database::{
    Database, KvError, RangeOptions, Transaction, Versionstamp, MAX_TRANSACTION_BYTES,
    MAX_VALUE_BYTES, VERSIONSTAMP_LEN,
};
pub use memory::{MemoryDatabase, MemoryTransaction};
pub use retry::{run_transaction, run_transaction_with, Retryable, RetryPolicy};
pub use subspace::Subspace;
pub use tuple::{pack, unpack, Element, TupleError};
