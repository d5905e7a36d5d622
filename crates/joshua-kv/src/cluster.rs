//! Cluster handle construction.

use std::path::Path;

use crate::database::KvError;
use crate::memory::MemoryDatabase;

/// Opens the fabric database described by a cluster file.
///
/// The wire transport to a production store is supplied by the
/// deployment; this crate ships only the embedded backend, which backs
/// tests, local development, and single-process fabrics. The cluster
/// file must exist so that misconfigured agents fail fast instead of
/// idling against a store nobody else can see.
pub fn open_cluster(cluster_file: &Path) -> Result<MemoryDatabase, KvError> {
    if !cluster_file.exists() {
        return Err(KvError::Transport(format!(
            "cluster file not found: {}",
            cluster_file.display()
        )));
    }
    tracing::info!(
        cluster_file = %cluster_file.display(),
        "opening embedded fabric database"
    );
    Ok(MemoryDatabase::new())
}
