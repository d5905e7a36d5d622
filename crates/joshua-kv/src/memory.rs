//! Embedded in-memory backend.
//!
//! Optimistic concurrency: a transaction records the keys and ranges it
//! read, and commit fails with [KvError::Conflict] when any of them was
//! mutated by a commit after the transaction's read version. Atomic adds
//! and snapshot reads register no conflicts, matching the contract the
//! fabric's counter updates depend on.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Included};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::database::{
    Database, KvError, RangeOptions, Transaction, Versionstamp, MAX_TRANSACTION_BYTES,
    MAX_VALUE_BYTES, VERSIONSTAMP_LEN,
};

#[derive(Default)]
struct Store {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Last commit sequence that mutated each key. Entries persist across
    /// clears so range-conflict checks see deletions.
    versions: BTreeMap<Vec<u8>, u64>,
    commit_seq: u64,
    watchers: HashMap<Vec<u8>, watch::Sender<u64>>,
}

impl Store {
    fn stamp(seq: u64) -> Versionstamp {
        let mut bytes = [0u8; VERSIONSTAMP_LEN];
        bytes[..8].copy_from_slice(&seq.to_be_bytes());
        Versionstamp::from_bytes(bytes)
    }
}

/// In-memory [Database]. Cloning shares the underlying store, which is
/// how tests run several agents against one fabric.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    store: Arc<Mutex<Store>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug)]
enum Effect {
    Set(Vec<u8>, Vec<u8>),
    Clear(Vec<u8>),
    ClearRange(Vec<u8>, Vec<u8>),
    Add(Vec<u8>, i64),
    Stamped {
        template: Vec<u8>,
        offset: usize,
        value: Vec<u8>,
    },
}

pub struct MemoryTransaction {
    store: Arc<Mutex<Store>>,
    read_version: u64,
    read_keys: BTreeSet<Vec<u8>>,
    read_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    effects: Vec<Effect>,
    mutation_bytes: usize,
    oversize: Option<String>,
}

impl MemoryTransaction {
    fn charge(&mut self, key: &[u8], value_len: usize) {
        if value_len > MAX_VALUE_BYTES {
            self.oversize = Some(format!(
                "value of {value_len} bytes exceeds the {MAX_VALUE_BYTES}-byte limit"
            ));
        }
        self.mutation_bytes += key.len() + value_len;
        if self.mutation_bytes > MAX_TRANSACTION_BYTES {
            self.oversize = Some(format!(
                "mutations of {} bytes exceed the {MAX_TRANSACTION_BYTES}-byte budget",
                self.mutation_bytes
            ));
        }
    }

    /// Read-your-writes view of one key: the committed value with this
    /// transaction's effects replayed on top.
    fn view_key(&self, store: &Store, key: &[u8]) -> Option<Vec<u8>> {
        let mut value = store.data.get(key).cloned();
        for effect in &self.effects {
            match effect {
                Effect::Set(k, v) if k.as_slice() == key => value = Some(v.clone()),
                Effect::Clear(k) if k.as_slice() == key => value = None,
                Effect::ClearRange(start, end)
                    if key >= start.as_slice() && key < end.as_slice() =>
                {
                    value = None
                }
                Effect::Add(k, delta) if k.as_slice() == key => {
                    value = Some(apply_add(value.as_deref(), *delta));
                }
                // Stamped keys do not exist until commit.
                _ => {}
            }
        }
        value
    }

    fn view_range(&self, store: &Store, start: &[u8], end: &[u8]) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut view: BTreeMap<Vec<u8>, Vec<u8>> = store
            .data
            .range::<[u8], _>((Included(start), Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for effect in &self.effects {
            match effect {
                Effect::Set(k, v) => {
                    if k.as_slice() >= start && k.as_slice() < end {
                        view.insert(k.clone(), v.clone());
                    }
                }
                Effect::Clear(k) => {
                    view.remove(k);
                }
                Effect::ClearRange(s, e) => {
                    let doomed: Vec<Vec<u8>> = view
                        .range::<[u8], _>((Included(s.as_slice()), Excluded(e.as_slice())))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        view.remove(&key);
                    }
                }
                Effect::Add(k, delta) => {
                    if k.as_slice() >= start && k.as_slice() < end {
                        let next = apply_add(view.get(k).map(Vec::as_slice), *delta);
                        view.insert(k.clone(), next);
                    }
                }
                Effect::Stamped { .. } => {}
            }
        }
        view
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.read_keys.insert(key.to_vec());
        let store = self.store.lock().expect("kv store lock");
        Ok(self.view_key(&store, key))
    }

    async fn get_snapshot(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        let store = self.store.lock().expect("kv store lock");
        Ok(self.view_key(&store, key))
    }

    async fn get_range(
        &mut self,
        start: &[u8],
        end: &[u8],
        options: RangeOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        if !options.snapshot {
            self.read_ranges.push((start.to_vec(), end.to_vec()));
        }
        let store = self.store.lock().expect("kv store lock");
        let view = self.view_range(&store, start, end);
        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = if options.reverse {
            view.into_iter().rev().collect()
        } else {
            view.into_iter().collect()
        };
        if let Some(limit) = options.limit {
            pairs.truncate(limit);
        }
        Ok(pairs)
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.charge(key, value.len());
        self.effects.push(Effect::Set(key.to_vec(), value.to_vec()));
    }

    fn clear(&mut self, key: &[u8]) {
        self.charge(key, 0);
        self.effects.push(Effect::Clear(key.to_vec()));
    }

    fn clear_range(&mut self, start: &[u8], end: &[u8]) {
        self.charge(start, end.len());
        self.effects
            .push(Effect::ClearRange(start.to_vec(), end.to_vec()));
    }

    fn atomic_add(&mut self, key: &[u8], delta: i64) {
        self.charge(key, 8);
        self.effects.push(Effect::Add(key.to_vec(), delta));
    }

    fn set_versionstamped_key(&mut self, key_template: &[u8], stamp_offset: usize, value: &[u8]) {
        debug_assert!(stamp_offset + VERSIONSTAMP_LEN <= key_template.len());
        self.charge(key_template, value.len());
        self.effects.push(Effect::Stamped {
            template: key_template.to_vec(),
            offset: stamp_offset,
            value: value.to_vec(),
        });
    }

    async fn commit(self) -> Result<Versionstamp, KvError> {
        if let Some(reason) = self.oversize {
            return Err(KvError::TooLarge(reason));
        }
        let mut store = self.store.lock().expect("kv store lock");

        for key in &self.read_keys {
            if store.versions.get(key).copied().unwrap_or(0) > self.read_version {
                return Err(KvError::Conflict);
            }
        }
        for (start, end) in &self.read_ranges {
            let stale = store
                .versions
                .range::<[u8], _>((Included(start.as_slice()), Excluded(end.as_slice())))
                .any(|(_, version)| *version > self.read_version);
            if stale {
                return Err(KvError::Conflict);
            }
        }

        store.commit_seq += 1;
        let seq = store.commit_seq;
        let stamp = Store::stamp(seq);

        let mut mutated: BTreeSet<Vec<u8>> = BTreeSet::new();
        for effect in self.effects {
            match effect {
                Effect::Set(key, value) => {
                    store.data.insert(key.clone(), value);
                    mutated.insert(key);
                }
                Effect::Clear(key) => {
                    store.data.remove(&key);
                    mutated.insert(key);
                }
                Effect::ClearRange(start, end) => {
                    let doomed: Vec<Vec<u8>> = store
                        .data
                        .range::<[u8], _>((Included(start.as_slice()), Excluded(end.as_slice())))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        store.data.remove(&key);
                        mutated.insert(key);
                    }
                }
                Effect::Add(key, delta) => {
                    let next = apply_add(store.data.get(&key).map(Vec::as_slice), delta);
                    store.data.insert(key.clone(), next);
                    mutated.insert(key);
                }
                Effect::Stamped {
                    mut template,
                    offset,
                    value,
                } => {
                    template[offset..offset + VERSIONSTAMP_LEN]
                        .copy_from_slice(stamp.as_bytes());
                    store.data.insert(template.clone(), value);
                    mutated.insert(template);
                }
            }
        }

        for key in mutated {
            store.versions.insert(key.clone(), seq);
            if let Some(sender) = store.watchers.get(&key) {
                sender.send_replace(seq);
            }
        }
        Ok(stamp)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, KvError> {
        let read_version = self.store.lock().expect("kv store lock").commit_seq;
        Ok(MemoryTransaction {
            store: Arc::clone(&self.store),
            read_version,
            read_keys: BTreeSet::new(),
            read_ranges: Vec::new(),
            effects: Vec::new(),
            mutation_bytes: 0,
            oversize: None,
        })
    }

    fn watch(&self, key: &[u8]) -> BoxFuture<'static, ()> {
        let mut store = self.store.lock().expect("kv store lock");
        let seen = store.versions.get(key).copied().unwrap_or(0);
        let sender = store
            .watchers
            .entry(key.to_vec())
            .or_insert_with(|| watch::channel(seen).0);
        let mut receiver = sender.subscribe();
        Box::pin(async move {
            let _ = receiver.changed().await;
        })
    }
}

fn apply_add(current: Option<&[u8]>, delta: i64) -> Vec<u8> {
    let mut raw = [0u8; 8];
    if let Some(bytes) = current {
        let len = bytes.len().min(8);
        raw[..len].copy_from_slice(&bytes[..len]);
    }
    let sum = u64::from_le_bytes(raw).wrapping_add(delta as u64);
    sum.to_le_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_committed(db: &MemoryDatabase, key: &[u8]) -> Option<Vec<u8>> {
        let mut tx = db.begin().await.unwrap();
        tx.get(key).await.unwrap()
    }

    #[tokio::test]
    async fn set_get_clear_roundtrip() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        tx.set(b"k", b"v");
        assert_eq!(tx.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        tx.commit().await.unwrap();
        assert_eq!(get_committed(&db, b"k").await, Some(b"v".to_vec()));

        let mut tx = db.begin().await.unwrap();
        tx.clear(b"k");
        tx.commit().await.unwrap();
        assert_eq!(get_committed(&db, b"k").await, None);
    }

    #[tokio::test]
    async fn conflicting_commit_fails() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        tx.set(b"k", b"0");
        tx.commit().await.unwrap();

        let mut reader = db.begin().await.unwrap();
        reader.get(b"k").await.unwrap();

        let mut writer = db.begin().await.unwrap();
        writer.set(b"k", b"1");
        writer.commit().await.unwrap();

        reader.set(b"other", b"x");
        assert!(matches!(reader.commit().await, Err(KvError::Conflict)));
    }

    #[tokio::test]
    async fn snapshot_reads_do_not_conflict() {
        let db = MemoryDatabase::new();
        let mut reader = db.begin().await.unwrap();
        reader.get_snapshot(b"k").await.unwrap();

        let mut writer = db.begin().await.unwrap();
        writer.set(b"k", b"1");
        writer.commit().await.unwrap();

        reader.set(b"other", b"x");
        reader.commit().await.unwrap();
    }

    #[tokio::test]
    async fn atomic_adds_merge_without_conflict() {
        let db = MemoryDatabase::new();
        let mut a = db.begin().await.unwrap();
        let mut b = db.begin().await.unwrap();
        a.atomic_add(b"count", 2);
        b.atomic_add(b"count", 3);
        a.commit().await.unwrap();
        b.commit().await.unwrap();

        let value = get_committed(&db, b"count").await.unwrap();
        assert_eq!(u64::from_le_bytes(value.try_into().unwrap()), 5);
    }

    #[tokio::test]
    async fn read_your_own_atomic_add() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        tx.atomic_add(b"count", 7);
        let value = tx.get_snapshot(b"count").await.unwrap().unwrap();
        assert_eq!(u64::from_le_bytes(value.try_into().unwrap()), 7);
    }

    #[tokio::test]
    async fn versionstamps_increase_with_commit_order() {
        let db = MemoryDatabase::new();
        let mut first = db.begin().await.unwrap();
        first.set(b"a", b"");
        let s1 = first.commit().await.unwrap();
        let mut second = db.begin().await.unwrap();
        second.set(b"b", b"");
        let s2 = second.commit().await.unwrap();
        assert!(s2 > s1);
    }

    #[tokio::test]
    async fn stamped_key_lands_in_order() {
        let db = MemoryDatabase::new();
        let mut template = b"results/".to_vec();
        let offset = template.len();
        template.extend_from_slice(&[0u8; VERSIONSTAMP_LEN]);

        let mut tx = db.begin().await.unwrap();
        tx.set_versionstamped_key(&template, offset, b"first");
        let stamp = tx.commit().await.unwrap();

        let mut expected = b"results/".to_vec();
        expected.extend_from_slice(stamp.as_bytes());
        assert_eq!(get_committed(&db, &expected).await, Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn range_read_sees_overlayed_writes() {
        let db = MemoryDatabase::new();
        let mut setup = db.begin().await.unwrap();
        setup.set(b"r/a", b"1");
        setup.set(b"r/b", b"2");
        setup.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        tx.set(b"r/c", b"3");
        tx.clear(b"r/a");
        let pairs = tx
            .get_range(b"r/", b"r0", RangeOptions::default())
            .await
            .unwrap();
        let keys: Vec<&[u8]> = pairs.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"r/b".as_slice(), b"r/c".as_slice()]);
    }

    #[tokio::test]
    async fn reverse_range_with_limit() {
        let db = MemoryDatabase::new();
        let mut setup = db.begin().await.unwrap();
        for i in 0u8..5 {
            setup.set(&[b'k', i], &[i]);
        }
        setup.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        let pairs = tx
            .get_range(
                &[b'k', 0],
                &[b'k', 0xFF],
                RangeOptions::snapshot().reversed().with_limit(2),
            )
            .await
            .unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, vec![b'k', 4]);
        assert_eq!(pairs[1].0, vec![b'k', 3]);
    }

    #[tokio::test]
    async fn oversized_value_is_rejected_at_commit() {
        let db = MemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        tx.set(b"big", &vec![0u8; MAX_VALUE_BYTES + 1]);
        assert!(matches!(tx.commit().await, Err(KvError::TooLarge(_))));
    }

    #[tokio::test]
    async fn watch_fires_on_mutation() {
        let db = MemoryDatabase::new();
        let fired = db.watch(b"active");

        let writer = db.clone();
        tokio::spawn(async move {
            let mut tx = writer.begin().await.unwrap();
            tx.atomic_add(b"active", 1);
            tx.commit().await.unwrap();
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), fired)
            .await
            .expect("watch did not fire");
    }

    #[tokio::test]
    async fn clear_range_conflicts_with_range_readers() {
        let db = MemoryDatabase::new();
        let mut setup = db.begin().await.unwrap();
        setup.set(b"p/a", b"1");
        setup.commit().await.unwrap();

        let mut reader = db.begin().await.unwrap();
        reader
            .get_range(b"p/", b"p0", RangeOptions::default())
            .await
            .unwrap();

        let mut eraser = db.begin().await.unwrap();
        eraser.clear_range(b"p/", b"p0");
        eraser.commit().await.unwrap();

        reader.set(b"q", b"x");
        assert!(matches!(reader.commit().await, Err(KvError::Conflict)));
    }
}
