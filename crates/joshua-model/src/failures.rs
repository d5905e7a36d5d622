//! Agent failure log.
//!
//! The last thing a dying agent does is record why, so operators can
//! tell "orchestrator recycled a pod" from "every agent hit the same
//! environmental fault". Keyed by timestamp, scans are naturally
//! time-ordered.

use chrono::{DateTime, TimeZone, Utc};
use futures::FutureExt;
use joshua_kv::{Database, Element, RangeOptions, Transaction};

use crate::error::ModelError;
use crate::retry::run_model_transaction;
use crate::schema::Layout;

#[derive(Clone, Debug)]
pub struct AgentFailure {
    pub at: DateTime<Utc>,
    pub hostname: String,
    pub message: String,
}

pub async fn log_agent_failure<D: Database>(
    db: &D,
    layout: &Layout,
    hostname: &str,
    message: &str,
) -> Result<(), ModelError> {
    let nonce: [u8; 16] = rand::random();
    let unix_secs = Utc::now().timestamp().max(0) as u64;
    run_model_transaction(db, |tx| {
        let nonce = nonce;
        let layout = layout.clone();
        let hostname = hostname.to_string();
        let message = message.to_string();
        async move {
            tx.set(
                &layout.failure_key(unix_secs, &hostname, &nonce),
                message.as_bytes(),
            );
            Ok(())
        }
        .boxed()
    })
    .await?;
    Ok(())
}

/// Failures recorded at or after `since` (all of them when `None`).
pub async fn agent_failures<D: Database>(
    db: &D,
    layout: &Layout,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<AgentFailure>, ModelError> {
    let space = layout.failures_root().clone();
    let (range_start, range_end) = space.range();
    let start = match since {
        Some(at) => {
            let mut key = space.key().to_vec();
            key.extend_from_slice(&joshua_kv::pack(&[Element::Int(at.timestamp().max(0) as u64)]));
            key
        }
        None => range_start,
    };

    let (failures, _) = run_model_transaction(db, |tx| {
        let space = space.clone();
        let start = start.clone();
        let range_end = range_end.clone();
        async move {
            let pairs = tx
                .get_range(&start, &range_end, RangeOptions::snapshot())
                .await?;
            let mut failures = Vec::with_capacity(pairs.len());
            for (key, value) in pairs {
                let elements = space.unpack(&key)?;
                let (Some(Element::Int(unix_secs)), Some(Element::Str(hostname))) =
                    (elements.first(), elements.get(1))
                else {
                    return Err(ModelError::Corrupt("malformed failure log key".into()));
                };
                failures.push(AgentFailure {
                    at: Utc
                        .timestamp_opt(*unix_secs as i64, 0)
                        .single()
                        .unwrap_or_default(),
                    hostname: hostname.clone(),
                    message: String::from_utf8_lossy(&value).into_owned(),
                });
            }
            Ok(failures)
        }
        .boxed()
    })
    .await?;
    Ok(failures)
}
