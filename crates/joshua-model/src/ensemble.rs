//! Ensemble lifecycle operations: create, list, stop, resume, delete,
//! package reads, and the agent-side acquire step.

use chrono::Utc;
use futures::FutureExt;
use joshua_kv::{Database, Element, RangeOptions, Transaction};
use sha2::{Digest, Sha256};

use crate::codec;
use crate::counters::{read_counters, EnsembleCounters, COUNTER_NAMES};
use crate::error::ModelError;
use crate::properties::{EnsembleProperties, PROP_STOPPED, PROP_USERNAME};
use crate::retry::run_model_transaction;
use crate::schema::{EnsembleId, IndexKind, Layout, CHUNK_BYTES, UPLOAD_TXN_BYTES};

/// Chunks fetched per transaction when reassembling a package.
const CHUNKS_PER_READ: usize = 32;

#[derive(Clone, Debug)]
pub struct EnsembleSummary {
    pub id: EnsembleId,
    pub properties: EnsembleProperties,
    pub counters: EnsembleCounters,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    ById,
    ByOwner,
}

#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    /// List retired/stopped ensembles instead of an index.
    pub stopped: bool,
    /// Read the sanity index instead of the default active index.
    pub sanity: bool,
    pub username: Option<String>,
    pub sort: SortOrder,
}

/// Everything an agent needs in hand before invoking the sandbox.
#[derive(Clone, Debug)]
pub struct PreparedRun {
    pub id: EnsembleId,
    pub properties: EnsembleProperties,
    pub package: Vec<u8>,
}

/// Creates an ensemble: writes the chunked package, the properties, the
/// zeroed counters, and the index entry, and returns the id minted from
/// the commit versionstamp.
///
/// Packages above the per-transaction upload budget are split across
/// transactions; the properties and the index insert land only in the
/// final transaction, so a concurrent reader never observes a partially
/// installed ensemble.
pub async fn create<D: Database>(
    db: &D,
    layout: &Layout,
    properties: &EnsembleProperties,
    package: &[u8],
) -> Result<EnsembleId, ModelError> {
    let mut properties = properties.clone();
    if properties.submitted.is_none() {
        properties.submitted = Some(Utc::now());
    }
    let stored = if properties.compressed {
        codec::compress(package)
    } else {
        package.to_vec()
    };
    let digest = hex::encode(Sha256::digest(package));
    let kind = IndexKind::for_sanity(properties.sanity);
    let pairs = properties.to_pairs();

    let id = if stored.len() <= UPLOAD_TXN_BYTES {
        let ((), stamp) = run_model_transaction(db, |tx| {
            let stored = stored.clone();
            let pairs = pairs.clone();
            let layout = layout.clone();
            async move {
                for (index, chunk) in stored.chunks(CHUNK_BYTES).enumerate() {
                    let (key, offset) = layout.stamped_chunk_key(index as u64);
                    tx.set_versionstamped_key(&key, offset, chunk);
                }
                install_stamped(tx, &layout, &pairs, kind);
                Ok(())
            }
            .boxed()
        })
        .await?;
        EnsembleId::from_stamp(stamp)
    } else {
        create_chunked(db, layout, &stored, &pairs, kind).await?
    };

    tracing::info!(
        ensemble = %id,
        bytes = package.len(),
        sha256 = %&digest[..12],
        sanity = properties.sanity,
        "created ensemble"
    );
    Ok(id)
}

async fn create_chunked<D: Database>(
    db: &D,
    layout: &Layout,
    stored: &[u8],
    pairs: &[(String, String)],
    kind: IndexKind,
) -> Result<EnsembleId, ModelError> {
    // Reserve the id first; the pending marker is the only key the
    // allocation writes, and delete() clears it, so a crashed upload
    // leaves nothing an index reader can observe.
    let ((), stamp) = run_model_transaction(db, |tx| {
        let layout = layout.clone();
        async move {
            let (key, offset) = layout.stamped_pending_key();
            tx.set_versionstamped_key(&key, offset, b"");
            Ok(())
        }
        .boxed()
    })
    .await?;
    let id = EnsembleId::from_stamp(stamp);

    let chunks: Vec<(u64, Vec<u8>)> = stored
        .chunks(CHUNK_BYTES)
        .enumerate()
        .map(|(index, chunk)| (index as u64, chunk.to_vec()))
        .collect();
    for batch in chunks.chunks(UPLOAD_TXN_BYTES / CHUNK_BYTES) {
        let batch = batch.to_vec();
        run_model_transaction(db, |tx| {
            let batch = batch.clone();
            let layout = layout.clone();
            async move {
                for (index, chunk) in &batch {
                    tx.set(&layout.chunk_key(id, *index), chunk);
                }
                Ok(())
            }
            .boxed()
        })
        .await?;
    }

    run_model_transaction(db, |tx| {
        let layout = layout.clone();
        let pairs = pairs.to_vec();
        async move {
            if tx.get(&layout.pending_key(id)).await?.is_none() {
                // Deleted out from under the upload.
                return Err(ModelError::NotFound(id));
            }
            install_concrete(tx, &layout, id, &pairs, kind);
            tx.clear(&layout.pending_key(id));
            Ok(())
        }
        .boxed()
    })
    .await?;
    Ok(id)
}

fn install_stamped<T: Transaction>(
    tx: &mut T,
    layout: &Layout,
    pairs: &[(String, String)],
    kind: IndexKind,
) {
    for (name, value) in pairs {
        let (key, offset) = layout.stamped_property_key(name);
        tx.set_versionstamped_key(&key, offset, value.as_bytes());
    }
    for name in COUNTER_NAMES {
        let (key, offset) = layout.stamped_counter_key(name);
        tx.set_versionstamped_key(&key, offset, &0u64.to_le_bytes());
    }
    let (key, offset) = layout.stamped_index_key(kind);
    tx.set_versionstamped_key(&key, offset, b"");
    tx.atomic_add(layout.index(kind).key(), 1);
}

fn install_concrete<T: Transaction>(
    tx: &mut T,
    layout: &Layout,
    id: EnsembleId,
    pairs: &[(String, String)],
    kind: IndexKind,
) {
    for (name, value) in pairs {
        tx.set(&layout.property_key(id, name), value.as_bytes());
    }
    for name in COUNTER_NAMES {
        tx.set(&layout.counter_key(id, name), &0u64.to_le_bytes());
    }
    tx.set(&layout.index_key(kind, id), b"");
    tx.atomic_add(layout.index(kind).key(), 1);
}

/// Reads the full property record; `None` when the ensemble does not
/// exist. Snapshot isolation.
pub(crate) async fn read_properties<T: Transaction>(
    tx: &mut T,
    layout: &Layout,
    id: EnsembleId,
) -> Result<Option<EnsembleProperties>, ModelError> {
    let space = layout.properties_of(id);
    let (start, end) = space.range();
    let pairs = tx.get_range(&start, &end, RangeOptions::snapshot()).await?;
    if pairs.is_empty() {
        return Ok(None);
    }
    let mut decoded = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        let elements = space.unpack(&key)?;
        if let Some(Element::Str(name)) = elements.first() {
            decoded.push((name.clone(), String::from_utf8_lossy(&value).into_owned()));
        }
    }
    Ok(Some(EnsembleProperties::from_pairs(decoded)))
}

async fn index_ids<T: Transaction>(
    tx: &mut T,
    layout: &Layout,
    kind: IndexKind,
) -> Result<Vec<EnsembleId>, ModelError> {
    let space = layout.index(kind);
    let (start, end) = space.range();
    let pairs = tx.get_range(&start, &end, RangeOptions::snapshot()).await?;
    let mut ids = Vec::with_capacity(pairs.len());
    for (key, _) in pairs {
        let elements = space.unpack(&key)?;
        match elements.first().and_then(crate::schema::id_from_element) {
            Some(id) => ids.push(id),
            None => {
                return Err(ModelError::Corrupt(format!(
                    "non-id key in {kind:?} index"
                )))
            }
        }
    }
    Ok(ids)
}

/// Snapshot listing of ensembles with their properties and counters.
pub async fn list<D: Database>(
    db: &D,
    layout: &Layout,
    filter: &ListFilter,
) -> Result<Vec<EnsembleSummary>, ModelError> {
    let (summaries, _) = run_model_transaction(db, |tx| {
        let filter = filter.clone();
        let layout = layout.clone();
        async move {
            let ids = if filter.stopped {
                let mut indexed: Vec<EnsembleId> = index_ids(tx, &layout, IndexKind::Active).await?;
                indexed.extend(index_ids(tx, &layout, IndexKind::Sanity).await?);
                let mut all = all_known_ids(tx, &layout).await?;
                all.retain(|id| !indexed.contains(id));
                all
            } else {
                index_ids(tx, &layout, IndexKind::for_sanity(filter.sanity)).await?
            };

            let mut summaries = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(properties) = read_properties(tx, &layout, id).await? else {
                    // Deleted between the index scan and this read.
                    tracing::debug!(ensemble = %id, "skipping id that vanished mid-listing");
                    continue;
                };
                if let Some(wanted) = &filter.username {
                    if properties.username.as_deref() != Some(wanted.as_str()) {
                        continue;
                    }
                }
                let counters = read_counters(tx, &layout, id).await?;
                summaries.push(EnsembleSummary {
                    id,
                    properties,
                    counters,
                });
            }
            Ok(summaries)
        }
        .boxed()
    })
    .await?;

    let mut summaries = summaries;
    match filter.sort {
        SortOrder::ById => summaries.sort_by_key(|s| s.id),
        SortOrder::ByOwner => {
            summaries.sort_by(|a, b| {
                (a.properties.username.as_deref(), a.id)
                    .cmp(&(b.properties.username.as_deref(), b.id))
            });
        }
    }
    Ok(summaries)
}

async fn all_known_ids<T: Transaction>(
    tx: &mut T,
    layout: &Layout,
) -> Result<Vec<EnsembleId>, ModelError> {
    let space = layout.properties_root();
    let (start, end) = space.range();
    let pairs = tx.get_range(&start, &end, RangeOptions::snapshot()).await?;
    let mut ids: Vec<EnsembleId> = Vec::new();
    for (key, _) in pairs {
        let elements = space.unpack(&key)?;
        if let Some(id) = elements.first().and_then(crate::schema::id_from_element) {
            if ids.last() != Some(&id) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

/// Removes the ensemble from both scheduling indices and records the
/// stop time. Idempotent; returns whether it was still indexed.
pub async fn stop<D: Database>(
    db: &D,
    layout: &Layout,
    id: EnsembleId,
) -> Result<bool, ModelError> {
    let (removed, _) = run_model_transaction(db, |tx| {
        let layout = layout.clone();
        async move {
            if read_properties(tx, &layout, id).await?.is_none() {
                return Err(ModelError::NotFound(id));
            }
            let mut removed = false;
            for kind in [IndexKind::Active, IndexKind::Sanity] {
                let key = layout.index_key(kind, id);
                if tx.get(&key).await?.is_some() {
                    tx.clear(&key);
                    tx.atomic_add(layout.index(kind).key(), 1);
                    removed = true;
                }
            }
            if removed {
                mark_stopped(tx, &layout, id);
            }
            Ok(removed)
        }
        .boxed()
    })
    .await?;
    if removed {
        tracing::info!(ensemble = %id, "stopped ensemble");
    }
    Ok(removed)
}

/// Stops every indexed ensemble owned by `username`, atomically.
pub async fn stop_username<D: Database>(
    db: &D,
    layout: &Layout,
    username: &str,
) -> Result<Vec<EnsembleId>, ModelError> {
    let (stopped, _) = run_model_transaction(db, |tx| {
        let layout = layout.clone();
        let username = username.to_string();
        async move {
            let mut stopped = Vec::new();
            for kind in [IndexKind::Active, IndexKind::Sanity] {
                for id in index_ids(tx, &layout, kind).await? {
                    let owner = tx
                        .get_snapshot(&layout.property_key(id, PROP_USERNAME))
                        .await?;
                    if owner.as_deref() == Some(username.as_bytes()) {
                        tx.clear(&layout.index_key(kind, id));
                        tx.atomic_add(layout.index(kind).key(), 1);
                        mark_stopped(tx, &layout, id);
                        stopped.push(id);
                    }
                }
            }
            Ok(stopped)
        }
        .boxed()
    })
    .await?;
    Ok(stopped)
}

pub(crate) fn mark_stopped<T: Transaction>(tx: &mut T, layout: &Layout, id: EnsembleId) {
    tx.set(
        &layout.property_key(id, PROP_STOPPED),
        Utc::now().to_rfc3339().as_bytes(),
    );
}

/// Puts a stopped ensemble back into its scheduling index. Returns
/// whether it actually resumed (false when already indexed).
pub async fn resume<D: Database>(
    db: &D,
    layout: &Layout,
    id: EnsembleId,
) -> Result<bool, ModelError> {
    let (resumed, _) = run_model_transaction(db, |tx| {
        let layout = layout.clone();
        async move {
            let Some(properties) = read_properties(tx, &layout, id).await? else {
                return Err(ModelError::NotFound(id));
            };
            let kind = IndexKind::for_sanity(properties.sanity);
            let key = layout.index_key(kind, id);
            if tx.get(&key).await?.is_some() {
                return Ok(false);
            }
            tx.set(&key, b"");
            tx.atomic_add(layout.index(kind).key(), 1);
            tx.clear(&layout.property_key(id, PROP_STOPPED));
            Ok(true)
        }
        .boxed()
    })
    .await?;
    Ok(resumed)
}

/// Clears every subspace belonging to the ensemble in one transaction.
/// The only operation that destroys state; idempotent.
pub async fn delete<D: Database>(
    db: &D,
    layout: &Layout,
    id: EnsembleId,
) -> Result<bool, ModelError> {
    let (existed, _) = run_model_transaction(db, |tx| {
        let layout = layout.clone();
        async move {
            let space = layout.properties_of(id);
            let (start, end) = space.range();
            let existed = !tx
                .get_range(&start, &end, RangeOptions::default().with_limit(1))
                .await?
                .is_empty();

            for space in [
                layout.properties_of(id),
                layout.counters_of(id),
                layout.package_of(id),
                layout.results_of(id),
            ] {
                let (start, end) = space.range();
                tx.clear_range(&start, &end);
            }
            tx.clear(&layout.pending_key(id));
            for kind in [IndexKind::Active, IndexKind::Sanity] {
                tx.clear(&layout.index_key(kind, id));
                tx.atomic_add(layout.index(kind).key(), 1);
            }
            Ok(existed)
        }
        .boxed()
    })
    .await?;
    tracing::info!(ensemble = %id, existed, "deleted ensemble");
    Ok(existed)
}

/// Reassembles the package, decompressing when the ensemble was created
/// with `compressed`.
pub async fn read_package<D: Database>(
    db: &D,
    layout: &Layout,
    id: EnsembleId,
) -> Result<Vec<u8>, ModelError> {
    let (compressed, _) = run_model_transaction(db, |tx| {
        let layout = layout.clone();
        async move {
            match read_properties(tx, &layout, id).await? {
                Some(properties) => Ok(properties.compressed),
                None => Err(ModelError::NotFound(id)),
            }
        }
        .boxed()
    })
    .await?;

    let space = layout.package_of(id);
    let (range_start, range_end) = space.range();
    let mut data = Vec::new();
    let mut next_index = 0u64;
    let mut cursor = range_start;
    loop {
        let (batch, _) = run_model_transaction(db, |tx| {
            let cursor = cursor.clone();
            let range_end = range_end.clone();
            async move {
                Ok(tx
                    .get_range(
                        &cursor,
                        &range_end,
                        RangeOptions::snapshot().with_limit(CHUNKS_PER_READ),
                    )
                    .await?)
            }
            .boxed()
        })
        .await?;
        let batch_len = batch.len();
        for (key, value) in batch {
            let elements = space.unpack(&key)?;
            match elements.first() {
                Some(Element::Int(index)) if *index == next_index => {}
                _ => {
                    // Either true corruption or a delete racing this
                    // multi-transaction read; tell them apart.
                    ensure_exists(db, layout, id).await?;
                    return Err(ModelError::Corrupt(format!(
                        "package of {id} has a gap at chunk {next_index}"
                    )));
                }
            }
            next_index += 1;
            data.extend_from_slice(&value);
        }
        if batch_len < CHUNKS_PER_READ {
            break;
        }
        cursor = layout.chunk_key(id, next_index);
    }

    // The chunk scan spans transactions; a concurrent delete can tear
    // it. Properties still being present proves the scan was whole.
    ensure_exists(db, layout, id).await?;

    if compressed {
        codec::decompress(&data)
    } else {
        Ok(data)
    }
}

async fn ensure_exists<D: Database>(
    db: &D,
    layout: &Layout,
    id: EnsembleId,
) -> Result<(), ModelError> {
    let (exists, _) = run_model_transaction(db, |tx| {
        let layout = layout.clone();
        async move {
            let (start, end) = layout.properties_of(id).range();
            Ok(!tx
                .get_range(&start, &end, RangeOptions::snapshot().with_limit(1))
                .await?
                .is_empty())
        }
        .boxed()
    })
    .await?;
    if exists {
        Ok(())
    } else {
        Err(ModelError::NotFound(id))
    }
}

/// Agent-side prepare: snapshot the properties and package for a chosen
/// id, abandoning with `None` when the id has left the index by the time
/// the prepare completes.
pub async fn acquire_run<D: Database>(
    db: &D,
    layout: &Layout,
    id: EnsembleId,
    kind: IndexKind,
) -> Result<Option<PreparedRun>, ModelError> {
    let (properties, _) = run_model_transaction(db, |tx| {
        let layout = layout.clone();
        async move {
            if tx
                .get_snapshot(&layout.index_key(kind, id))
                .await?
                .is_none()
            {
                return Ok(None);
            }
            read_properties(tx, &layout, id).await
        }
        .boxed()
    })
    .await?;
    let Some(properties) = properties else {
        return Ok(None);
    };

    let package = match read_package(db, layout, id).await {
        Ok(package) => package,
        Err(ModelError::NotFound(_)) => return Ok(None),
        Err(other) => return Err(other),
    };

    // The package fetch spans transactions; only hand the run out if the
    // ensemble is still schedulable now that everything is local.
    let (still_indexed, _) = run_model_transaction(db, |tx| {
        let layout = layout.clone();
        async move {
            Ok(tx
                .get_snapshot(&layout.index_key(kind, id))
                .await?
                .is_some())
        }
        .boxed()
    })
    .await?;
    if !still_indexed {
        tracing::debug!(ensemble = %id, "abandoning prepared run, ensemble left the index");
        return Ok(None);
    }
    Ok(Some(PreparedRun {
        id,
        properties,
        package,
    }))
}
