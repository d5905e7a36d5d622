//! Key layout of the joshua namespace.
//!
//! All state lives under one namespace, partitioned into the ensemble
//! subspaces (`properties`, `counters`, `package`, `results`), the two
//! scheduling indices (`active`, `active_sanity`), a `pending` marker
//! for in-flight package uploads, and the agent failure log.

use std::fmt;
use std::str::FromStr;

use joshua_kv::{Element, Subspace, Versionstamp, VERSIONSTAMP_LEN};
use serde::{Deserialize, Serialize};

/// Package and result-output chunk size. Each chunk fits well under the
/// store's per-value limit.
pub const CHUNK_BYTES: usize = 100_000;

/// How many package bytes one upload transaction carries before the
/// create operation splits across transactions.
pub const UPLOAD_TXN_BYTES: usize = 4 * 1024 * 1024;

/// Random suffix length of a run token.
pub const RUN_TOKEN_SUFFIX_LEN: usize = 6;

/// Ensemble identifier: the 10-byte commit versionstamp of the creating
/// transaction. Natural byte order equals submission order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnsembleId([u8; VERSIONSTAMP_LEN]);

impl EnsembleId {
    pub fn from_stamp(stamp: Versionstamp) -> Self {
        Self(*stamp.as_bytes())
    }

    pub fn from_bytes(bytes: [u8; VERSIONSTAMP_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERSIONSTAMP_LEN] {
        &self.0
    }

    pub(crate) fn element(&self) -> Element {
        Element::Stamp(self.0)
    }
}

impl fmt::Display for EnsembleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for EnsembleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnsembleId({self})")
    }
}

impl FromStr for EnsembleId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| format!("invalid ensemble id: {e}"))?;
        let bytes: [u8; VERSIONSTAMP_LEN] = raw
            .try_into()
            .map_err(|_| format!("ensemble id must be {VERSIONSTAMP_LEN} bytes"))?;
        Ok(Self(bytes))
    }
}

/// Per-run token: the 10-byte commit stamp of the reporting transaction
/// followed by 6 agent-chosen random bytes. Stamp-first ordering makes
/// result keys sort by run completion time; the suffix keeps tokens from
/// concurrent agents distinct.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunToken {
    stamp: [u8; VERSIONSTAMP_LEN],
    suffix: [u8; RUN_TOKEN_SUFFIX_LEN],
}

impl RunToken {
    pub fn from_parts(stamp: [u8; VERSIONSTAMP_LEN], suffix: [u8; RUN_TOKEN_SUFFIX_LEN]) -> Self {
        Self { stamp, suffix }
    }

    pub fn stamp(&self) -> &[u8; VERSIONSTAMP_LEN] {
        &self.stamp
    }

    pub fn suffix(&self) -> &[u8; RUN_TOKEN_SUFFIX_LEN] {
        &self.suffix
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..VERSIONSTAMP_LEN].copy_from_slice(&self.stamp);
        out[VERSIONSTAMP_LEN..].copy_from_slice(&self.suffix);
        out
    }
}

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.to_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunToken({self})")
    }
}

/// Which scheduling index an ensemble belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    Active,
    Sanity,
}

impl IndexKind {
    pub fn for_sanity(sanity: bool) -> Self {
        if sanity {
            IndexKind::Sanity
        } else {
            IndexKind::Active
        }
    }
}

/// Resolved subspaces of one joshua namespace.
#[derive(Clone, Debug)]
pub struct Layout {
    properties: Subspace,
    counters: Subspace,
    package: Subspace,
    results: Subspace,
    pending: Subspace,
    active: Subspace,
    active_sanity: Subspace,
    failures: Subspace,
}

impl Layout {
    pub fn new(namespace: &str) -> Self {
        let root = Subspace::new(&[Element::Str(namespace.to_string())]);
        let ensembles = root.push(Element::Str("ensembles".into()));
        Self {
            properties: ensembles.push(Element::Str("properties".into())),
            counters: ensembles.push(Element::Str("counters".into())),
            package: ensembles.push(Element::Str("package".into())),
            results: ensembles.push(Element::Str("results".into())),
            pending: ensembles.push(Element::Str("pending".into())),
            active: root.push(Element::Str("active".into())),
            active_sanity: root.push(Element::Str("active_sanity".into())),
            failures: root.push(Element::Str("failures".into())),
        }
    }

    pub fn properties_of(&self, id: EnsembleId) -> Subspace {
        self.properties.push(id.element())
    }

    pub fn property_key(&self, id: EnsembleId, name: &str) -> Vec<u8> {
        self.properties
            .pack(&[id.element(), Element::Str(name.to_string())])
    }

    /// Property key for the ensemble being created in this transaction.
    pub fn stamped_property_key(&self, name: &str) -> (Vec<u8>, usize) {
        self.properties
            .pack_with_stamp(&[Element::StampPlaceholder, Element::Str(name.to_string())])
    }

    pub fn properties_root(&self) -> &Subspace {
        &self.properties
    }

    pub fn counters_of(&self, id: EnsembleId) -> Subspace {
        self.counters.push(id.element())
    }

    pub fn counter_key(&self, id: EnsembleId, name: &str) -> Vec<u8> {
        self.counters
            .pack(&[id.element(), Element::Str(name.to_string())])
    }

    pub fn stamped_counter_key(&self, name: &str) -> (Vec<u8>, usize) {
        self.counters
            .pack_with_stamp(&[Element::StampPlaceholder, Element::Str(name.to_string())])
    }

    pub fn package_of(&self, id: EnsembleId) -> Subspace {
        self.package.push(id.element())
    }

    pub fn chunk_key(&self, id: EnsembleId, index: u64) -> Vec<u8> {
        self.package.pack(&[id.element(), Element::Int(index)])
    }

    pub fn stamped_chunk_key(&self, index: u64) -> (Vec<u8>, usize) {
        self.package
            .pack_with_stamp(&[Element::StampPlaceholder, Element::Int(index)])
    }

    pub fn results_of(&self, id: EnsembleId) -> Subspace {
        self.results.push(id.element())
    }

    /// Subspace holding the frames of one result.
    pub fn result_of(&self, id: EnsembleId, token: RunToken) -> Subspace {
        self.results_of(id)
            .push(Element::Stamp(*token.stamp()))
            .push(Element::Bytes(token.suffix().to_vec()))
    }

    /// Frame key for the result being appended in this transaction; the
    /// store fills the token's stamp half at commit.
    pub fn stamped_result_key(
        &self,
        id: EnsembleId,
        suffix: &[u8; RUN_TOKEN_SUFFIX_LEN],
        seq: u64,
    ) -> (Vec<u8>, usize) {
        self.results_of(id).pack_with_stamp(&[
            Element::StampPlaceholder,
            Element::Bytes(suffix.to_vec()),
            Element::Int(seq),
        ])
    }

    pub fn pending_key(&self, id: EnsembleId) -> Vec<u8> {
        self.pending.pack(&[id.element()])
    }

    pub fn stamped_pending_key(&self) -> (Vec<u8>, usize) {
        self.pending.pack_with_stamp(&[Element::StampPlaceholder])
    }

    pub fn index(&self, kind: IndexKind) -> &Subspace {
        match kind {
            IndexKind::Active => &self.active,
            IndexKind::Sanity => &self.active_sanity,
        }
    }

    pub fn index_key(&self, kind: IndexKind, id: EnsembleId) -> Vec<u8> {
        self.index(kind).pack(&[id.element()])
    }

    pub fn stamped_index_key(&self, kind: IndexKind) -> (Vec<u8>, usize) {
        self.index(kind).pack_with_stamp(&[Element::StampPlaceholder])
    }

    pub fn failures_root(&self) -> &Subspace {
        &self.failures
    }

    pub fn failure_key(&self, unix_secs: u64, hostname: &str, nonce: &[u8]) -> Vec<u8> {
        self.failures.pack(&[
            Element::Int(unix_secs),
            Element::Str(hostname.to_string()),
            Element::Bytes(nonce.to_vec()),
        ])
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new("joshua")
    }
}

/// Decodes the ensemble id element at the front of an unpacked key.
pub(crate) fn id_from_element(element: &Element) -> Option<EnsembleId> {
    match element {
        Element::Stamp(bytes) => Some(EnsembleId::from_bytes(*bytes)),
        _ => None,
    }
}
