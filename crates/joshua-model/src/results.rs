//! Run results: the reporting transaction and the tail reader.
//!
//! One result is a family of frames under
//! `results/<id>/<run_token>/<seq>`: frame 0 carries the elapsed time
//! and the exit class, frames 1.. carry the captured output in order.
//! All frames of a result land in the same transaction as the counter
//! updates, so any snapshot that sees a result sees counters that
//! include it.

use std::collections::VecDeque;
use std::time::Duration;

use futures::FutureExt;
use joshua_kv::{Database, Element, RangeOptions, Transaction};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::counters::{
    decode_counter_value, read_counters, EnsembleCounters, COUNTER_ENDED, COUNTER_FAIL,
    COUNTER_FAIL_5MIN, COUNTER_PASS, COUNTER_PASS_5MIN, COUNTER_RUNTIME, COUNTER_STARTED,
    LONG_RUN_SECS,
};
use crate::ensemble::{mark_stopped, read_properties};
use crate::error::ModelError;
use crate::retry::run_model_transaction;
use crate::schema::{
    EnsembleId, IndexKind, Layout, RunToken, CHUNK_BYTES, RUN_TOKEN_SUFFIX_LEN,
};

/// Frames fetched per tail transaction.
const TAIL_BATCH_FRAMES: usize = 512;

const HEADER_LEN: usize = 9;

/// Deterministic exit classification of one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitClass {
    Pass,
    Fail,
}

impl ExitClass {
    pub fn as_byte(self) -> u8 {
        match self {
            ExitClass::Pass => 0,
            ExitClass::Fail => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ModelError> {
        match byte {
            0 => Ok(ExitClass::Pass),
            1 => Ok(ExitClass::Fail),
            other => Err(ModelError::Corrupt(format!("unknown exit class {other}"))),
        }
    }
}

/// What the sandbox hands back for one completed run.
#[derive(Clone, Debug)]
pub struct CompletedRun {
    pub class: ExitClass,
    pub elapsed: Duration,
    pub output: Vec<u8>,
}

/// Result of the reporting transaction.
#[derive(Clone, Debug)]
pub struct ReportOutcome {
    /// False when the report was a no-op: the ensemble was deleted, or
    /// the run outlived a terminal condition another report tripped.
    pub recorded: bool,
    /// Whether this report observed a terminal condition.
    pub retired: bool,
    pub counters: EnsembleCounters,
}

fn encode_header(run: &CompletedRun) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..8].copy_from_slice(&(run.elapsed.as_millis() as u64).to_be_bytes());
    header[8] = run.class.as_byte();
    header
}

fn decode_header(value: &[u8]) -> Result<(Duration, ExitClass), ModelError> {
    if value.len() != HEADER_LEN {
        return Err(ModelError::Corrupt(format!(
            "result header of {} bytes",
            value.len()
        )));
    }
    let millis = u64::from_be_bytes(value[..8].try_into().expect("8-byte slice"));
    Ok((Duration::from_millis(millis), ExitClass::from_byte(value[8])?))
}

/// Appends a run result and advances the aggregate counters in one
/// transaction, retiring the ensemble when a terminal condition is met.
///
/// The commit proceeds even when the id has already left the index:
/// counters and results remain meaningful for a stopped ensemble. A
/// deleted ensemble, or one whose terminal condition was already met
/// before this run, turns the report into a no-op.
pub async fn submit_result<D: Database>(
    db: &D,
    layout: &Layout,
    id: EnsembleId,
    run: &CompletedRun,
) -> Result<ReportOutcome, ModelError> {
    let suffix: [u8; RUN_TOKEN_SUFFIX_LEN] = rand::random();
    let (outcome, _) = run_model_transaction(db, |tx| {
        let layout = layout.clone();
        let run = run.clone();
        async move {
            // Conflict-protected existence guard: a racing delete writes
            // this range, so either the report commits first (and the
            // delete then clears its rows) or the retry observes the
            // ensemble gone and the report becomes a no-op.
            let (props_start, props_end) = layout.properties_of(id).range();
            let exists = !tx
                .get_range(
                    &props_start,
                    &props_end,
                    RangeOptions::default().with_limit(1),
                )
                .await?
                .is_empty();
            if !exists {
                return Ok(ReportOutcome {
                    recorded: false,
                    retired: false,
                    counters: EnsembleCounters::default(),
                });
            }
            let Some(properties) = read_properties(tx, &layout, id).await? else {
                return Ok(ReportOutcome {
                    recorded: false,
                    retired: false,
                    counters: EnsembleCounters::default(),
                });
            };
            let kind = IndexKind::for_sanity(properties.sanity);

            // For bounded ensembles the terminal counters are read with
            // conflict protection: concurrent boundary reports serialize
            // through retries, so `ended` never exceeds `max_runs` and
            // `fail` never exceeds `fail_fast`. Unbounded ensembles keep
            // the conflict-free snapshot path.
            let mut pre = read_counters(tx, &layout, id).await?;
            if properties.max_runs > 0 {
                let ended = tx.get(&layout.counter_key(id, COUNTER_ENDED)).await?;
                pre.ended = ended.as_deref().map(decode_counter_value).unwrap_or(0);
            }
            if properties.fail_fast > 0 {
                let fail = tx.get(&layout.counter_key(id, COUNTER_FAIL)).await?;
                pre.fail = fail.as_deref().map(decode_counter_value).unwrap_or(0);
            }
            let already_terminal = (properties.max_runs > 0 && pre.ended >= properties.max_runs)
                || (properties.fail_fast > 0 && pre.fail >= properties.fail_fast);
            if already_terminal {
                // A straggler whose run outlived retirement. Its result
                // is dropped so the terminal bounds stay exact; the
                // retirement itself is re-asserted idempotently.
                retire(tx, &layout, id, kind).await?;
                return Ok(ReportOutcome {
                    recorded: false,
                    retired: true,
                    counters: pre,
                });
            }

            let (header_key, offset) = layout.stamped_result_key(id, &suffix, 0);
            tx.set_versionstamped_key(&header_key, offset, &encode_header(&run));
            let output = if properties.compressed {
                codec::compress(&run.output)
            } else {
                run.output.clone()
            };
            for (index, chunk) in output.chunks(CHUNK_BYTES).enumerate() {
                let (key, offset) = layout.stamped_result_key(id, &suffix, index as u64 + 1);
                tx.set_versionstamped_key(&key, offset, chunk);
            }

            let seconds = run.elapsed.as_secs().max(1);
            tx.atomic_add(&layout.counter_key(id, COUNTER_STARTED), 1);
            tx.atomic_add(&layout.counter_key(id, COUNTER_ENDED), 1);
            tx.atomic_add(&layout.counter_key(id, COUNTER_RUNTIME), seconds as i64);
            let class_counter = match run.class {
                ExitClass::Pass => COUNTER_PASS,
                ExitClass::Fail => COUNTER_FAIL,
            };
            tx.atomic_add(&layout.counter_key(id, class_counter), 1);
            if run.elapsed.as_secs() > LONG_RUN_SECS {
                let bucket = match run.class {
                    ExitClass::Pass => COUNTER_PASS_5MIN,
                    ExitClass::Fail => COUNTER_FAIL_5MIN,
                };
                tx.atomic_add(&layout.counter_key(id, bucket), 1);
            }

            // Reads-your-writes: the counters below include this run.
            let counters = read_counters(tx, &layout, id).await?;
            counters.check_invariant(id)?;

            let terminal = (properties.max_runs > 0 && counters.ended >= properties.max_runs)
                || (properties.fail_fast > 0 && counters.fail >= properties.fail_fast);
            if terminal {
                retire(tx, &layout, id, kind).await?;
            }

            Ok(ReportOutcome {
                recorded: true,
                retired: terminal,
                counters,
            })
        }
        .boxed()
    })
    .await?;

    if outcome.recorded {
        tracing::debug!(
            ensemble = %id,
            class = ?run.class,
            elapsed_secs = run.elapsed.as_secs(),
            retired = outcome.retired,
            "recorded run result"
        );
    }
    Ok(outcome)
}

/// Removes the id from its scheduling index. Idempotent; the membership
/// check is a snapshot read so concurrent retirers never conflict on it.
async fn retire<T: Transaction>(
    tx: &mut T,
    layout: &Layout,
    id: EnsembleId,
    kind: IndexKind,
) -> Result<(), ModelError> {
    let index_key = layout.index_key(kind, id);
    if tx.get_snapshot(&index_key).await?.is_some() {
        tx.clear(&index_key);
        tx.atomic_add(layout.index(kind).key(), 1);
        mark_stopped(tx, layout, id);
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailMode {
    /// Every result, framed.
    All,
    /// Only results whose exit class is fail.
    ErrorsOnly,
    /// Every result, output bytes only.
    Raw,
}

/// One decoded run result.
#[derive(Clone, Debug)]
pub struct ResultRow {
    pub token: RunToken,
    pub class: ExitClass,
    pub elapsed: Duration,
    pub output: Vec<u8>,
}

impl ResultRow {
    /// Byte rendering for the given tail mode.
    pub fn render(&self, mode: TailMode) -> Vec<u8> {
        match mode {
            TailMode::Raw => self.output.clone(),
            TailMode::All | TailMode::ErrorsOnly => {
                let mut out = format!(
                    "{} {} {:.3}s\n",
                    self.token,
                    match self.class {
                        ExitClass::Pass => "pass",
                        ExitClass::Fail => "fail",
                    },
                    self.elapsed.as_secs_f64()
                )
                .into_bytes();
                out.extend_from_slice(&self.output);
                out
            }
        }
    }
}

/// Pull-based reader over an ensemble's results, latest first. Each
/// `next` call touches at most one transaction, so a caller can stop
/// mid-stream without holding anything open.
pub struct ResultTail<D: Database> {
    db: D,
    layout: Layout,
    id: EnsembleId,
    mode: TailMode,
    compressed: Option<bool>,
    lower: Vec<u8>,
    upper: Vec<u8>,
    done: bool,
    buffered: VecDeque<ResultRow>,
}

impl<D: Database> ResultTail<D> {
    pub fn new(db: &D, layout: &Layout, id: EnsembleId, mode: TailMode) -> Self {
        let (lower, upper) = layout.results_of(id).range();
        Self {
            db: db.clone(),
            layout: layout.clone(),
            id,
            mode,
            compressed: None,
            lower,
            upper,
            done: false,
            buffered: VecDeque::new(),
        }
    }

    pub async fn next(&mut self) -> Result<Option<ResultRow>, ModelError> {
        loop {
            if let Some(row) = self.buffered.pop_front() {
                if self.mode == TailMode::ErrorsOnly && row.class == ExitClass::Pass {
                    continue;
                }
                return Ok(Some(row));
            }
            if self.done {
                return Ok(None);
            }
            self.fetch_batch().await?;
        }
    }

    async fn fetch_batch(&mut self) -> Result<(), ModelError> {
        if self.compressed.is_none() {
            let layout = self.layout.clone();
            let id = self.id;
            let (compressed, _) = run_model_transaction(&self.db, |tx| {
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
            self.compressed = Some(compressed);
        }

        let lower = self.lower.clone();
        let upper = self.upper.clone();
        let (batch, _) = run_model_transaction(&self.db, |tx| {
            let lower = lower.clone();
            let upper = upper.clone();
            async move {
                Ok(tx
                    .get_range(
                        &lower,
                        &upper,
                        RangeOptions::snapshot()
                            .reversed()
                            .with_limit(TAIL_BATCH_FRAMES),
                    )
                    .await?)
            }
            .boxed()
        })
        .await?;

        let exhausted = batch.len() < TAIL_BATCH_FRAMES;
        let mut groups = self.group_frames(batch)?;
        if exhausted {
            self.done = true;
        } else if let Some(&(last_token, ref frames)) = groups.last() {
            // The limit may have cut the lowest group mid-result; drop it
            // and arrange for the next batch to re-read it in full.
            let complete = frames.iter().any(|(seq, _)| *seq == 0);
            let token_range = self.layout.result_of(self.id, last_token).range();
            if complete {
                self.upper = token_range.0;
            } else {
                groups.pop();
                self.upper = token_range.1;
            }
        }

        let compressed = self.compressed.unwrap_or(false);
        for (token, mut frames) in groups {
            frames.sort_by_key(|(seq, _)| *seq);
            let Some((0, header)) = frames.first() else {
                return Err(ModelError::Corrupt(format!(
                    "result {token} of {} has no header frame",
                    self.id
                )));
            };
            let (elapsed, class) = decode_header(header)?;
            let mut output = Vec::new();
            for (_, chunk) in frames.iter().skip(1) {
                output.extend_from_slice(chunk);
            }
            let output = if compressed && !output.is_empty() {
                codec::decompress(&output)?
            } else {
                output
            };
            self.buffered.push_back(ResultRow {
                token,
                class,
                elapsed,
                output,
            });
        }
        Ok(())
    }

    /// Splits a descending frame scan into per-token groups, preserving
    /// the latest-first encounter order.
    #[allow(clippy::type_complexity)]
    fn group_frames(
        &self,
        batch: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<Vec<(RunToken, Vec<(u64, Vec<u8>)>)>, ModelError> {
        let space = self.layout.results_of(self.id);
        let mut groups: Vec<(RunToken, Vec<(u64, Vec<u8>)>)> = Vec::new();
        for (key, value) in batch {
            let elements = space.unpack(&key)?;
            let token = match (elements.first(), elements.get(1)) {
                (Some(Element::Stamp(stamp)), Some(Element::Bytes(suffix)))
                    if suffix.len() == RUN_TOKEN_SUFFIX_LEN =>
                {
                    let mut fixed = [0u8; RUN_TOKEN_SUFFIX_LEN];
                    fixed.copy_from_slice(suffix);
                    RunToken::from_parts(*stamp, fixed)
                }
                _ => {
                    return Err(ModelError::Corrupt(format!(
                        "malformed result key for {}",
                        self.id
                    )))
                }
            };
            let seq = match elements.get(2) {
                Some(Element::Int(seq)) => *seq,
                _ => {
                    return Err(ModelError::Corrupt(format!(
                        "result frame without sequence for {}",
                        self.id
                    )))
                }
            };
            match groups.last_mut() {
                Some((current, frames)) if *current == token => frames.push((seq, value)),
                _ => groups.push((token, vec![(seq, value)])),
            }
        }
        Ok(groups)
    }
}
