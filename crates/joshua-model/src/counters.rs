//! Ensemble counters.
//!
//! A fixed record with a named field per counter; the set is closed.
//! Every field is maintained with the store's atomic add so concurrent
//! reporting transactions never conflict on them.

use joshua_kv::{Element, RangeOptions, Transaction};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::schema::{EnsembleId, Layout};

pub const COUNTER_STARTED: &str = "started";
pub const COUNTER_ENDED: &str = "ended";
pub const COUNTER_PASS: &str = "pass";
pub const COUNTER_FAIL: &str = "fail";
pub const COUNTER_RUNTIME: &str = "runtime";
pub const COUNTER_PASS_5MIN: &str = "pass_5min";
pub const COUNTER_FAIL_5MIN: &str = "fail_5min";

pub const COUNTER_NAMES: [&str; 7] = [
    COUNTER_STARTED,
    COUNTER_ENDED,
    COUNTER_PASS,
    COUNTER_FAIL,
    COUNTER_RUNTIME,
    COUNTER_PASS_5MIN,
    COUNTER_FAIL_5MIN,
];

/// Threshold in seconds above which a run lands in the 5-minute buckets.
pub const LONG_RUN_SECS: u64 = 5 * 60;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleCounters {
    pub started: u64,
    pub ended: u64,
    pub pass: u64,
    pub fail: u64,
    /// Accumulated wall-clock seconds across all ended runs.
    pub runtime: u64,
    pub pass_5min: u64,
    pub fail_5min: u64,
}

impl EnsembleCounters {
    fn apply(&mut self, name: &str, value: u64) {
        match name {
            COUNTER_STARTED => self.started = value,
            COUNTER_ENDED => self.ended = value,
            COUNTER_PASS => self.pass = value,
            COUNTER_FAIL => self.fail = value,
            COUNTER_RUNTIME => self.runtime = value,
            COUNTER_PASS_5MIN => self.pass_5min = value,
            COUNTER_FAIL_5MIN => self.fail_5min = value,
            // The set of counters is closed; anything else is a stray key.
            _ => {}
        }
    }

    /// Fails with the fatal [ModelError::InvariantViolation] when
    /// `ended != pass + fail`.
    pub fn check_invariant(&self, id: EnsembleId) -> Result<(), ModelError> {
        if self.ended != self.pass + self.fail {
            return Err(ModelError::InvariantViolation {
                id,
                ended: self.ended,
                pass: self.pass,
                fail: self.fail,
            });
        }
        Ok(())
    }
}

pub(crate) fn decode_counter_value(value: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    let len = value.len().min(8);
    raw[..len].copy_from_slice(&value[..len]);
    u64::from_le_bytes(raw)
}

/// Reads the full counter record for one ensemble. Snapshot isolation,
/// so reporting transactions from other agents never conflict with it.
pub async fn read_counters<T: Transaction>(
    tx: &mut T,
    layout: &Layout,
    id: EnsembleId,
) -> Result<EnsembleCounters, ModelError> {
    let space = layout.counters_of(id);
    let (start, end) = space.range();
    let pairs = tx.get_range(&start, &end, RangeOptions::snapshot()).await?;
    let mut counters = EnsembleCounters::default();
    for (key, value) in pairs {
        let elements = space.unpack(&key)?;
        if let Some(Element::Str(name)) = elements.first() {
            counters.apply(name, decode_counter_value(&value));
        }
    }
    Ok(counters)
}
