//! Read-only surface the autoscaler consumes.
//!
//! The scaler sizes the fleet from the active-index cardinality and the
//! outstanding-run estimate; it never writes, and nothing here touches
//! results.

use futures::FutureExt;
use joshua_kv::{Database, RangeOptions, Transaction};

use crate::counters::read_counters;
use crate::ensemble::read_properties;
use crate::error::ModelError;
use crate::retry::run_model_transaction;
use crate::schema::{IndexKind, Layout};

/// Number of ensembles currently in the given scheduling index.
pub async fn queue_depth<D: Database>(
    db: &D,
    layout: &Layout,
    kind: IndexKind,
) -> Result<usize, ModelError> {
    let (depth, _) = run_model_transaction(db, |tx| {
        let layout = layout.clone();
        async move {
            let (start, end) = layout.index(kind).range();
            let pairs = tx.get_range(&start, &end, RangeOptions::snapshot()).await?;
            Ok(pairs.len())
        }
        .boxed()
    })
    .await?;
    Ok(depth)
}

/// Estimate of how many agents the active queue could keep busy: the sum
/// over active ensembles of their remaining bounded runs, with unbounded
/// ensembles each counting for one.
pub async fn desired_agents<D: Database>(db: &D, layout: &Layout) -> Result<u64, ModelError> {
    let (desired, _) = run_model_transaction(db, |tx| {
        let layout = layout.clone();
        async move {
            let space = layout.index(IndexKind::Active);
            let (start, end) = space.range();
            let pairs = tx.get_range(&start, &end, RangeOptions::snapshot()).await?;
            let mut desired = 0u64;
            for (key, _) in pairs {
                let elements = space.unpack(&key)?;
                let Some(id) = elements.first().and_then(crate::schema::id_from_element) else {
                    continue;
                };
                let Some(properties) = read_properties(tx, &layout, id).await? else {
                    continue;
                };
                if properties.max_runs == 0 {
                    desired += 1;
                    continue;
                }
                let counters = read_counters(tx, &layout, id).await?;
                desired += properties.max_runs.saturating_sub(counters.ended);
            }
            Ok(desired)
        }
        .boxed()
    })
    .await?;
    Ok(desired)
}
