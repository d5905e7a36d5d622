//! Per-run working directories.
//!
//! Each run gets a fresh directory under `<work-dir>/runs`, populated
//! from the package blob: gzipped tarballs are extracted (entries that
//! escape the extraction root are refused), anything else is written as
//! the test executable itself. The directory is removed after the run
//! unless the failure-retention policy renames it aside.

use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::SandboxError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Suffix appended when a failed run's directory is retained.
pub const FAILED_SUFFIX: &str = ".failed";

pub struct RunWorkspace {
    path: PathBuf,
}

impl RunWorkspace {
    /// Creates `<work_root>/runs/<name>` fresh, with a `tmp` scratch
    /// subdirectory for the test process.
    pub async fn create(work_root: &Path, name: &str) -> Result<Self, SandboxError> {
        let path = work_root.join("runs").join(name);
        let workspace_err = |source| SandboxError::Workspace {
            path: path.clone(),
            source,
        };
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await.map_err(workspace_err)?;
        }
        tokio::fs::create_dir_all(path.join("tmp"))
            .await
            .map_err(workspace_err)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Materialises the package into the run directory.
    pub fn materialise(&self, package: &[u8], command_name: &str) -> Result<(), SandboxError> {
        if package.starts_with(&GZIP_MAGIC) {
            self.extract_tarball(package)
        } else {
            self.write_executable(package, command_name)
        }
    }

    fn extract_tarball(&self, package: &[u8]) -> Result<(), SandboxError> {
        let decoder = GzDecoder::new(package);
        let mut archive = tar::Archive::new(decoder);
        let entries = archive
            .entries()
            .map_err(|e| SandboxError::Materialise(format!("unreadable tar archive: {e}")))?;
        for entry in entries {
            let mut entry =
                entry.map_err(|e| SandboxError::Materialise(format!("corrupt tar entry: {e}")))?;
            let unpacked = entry.unpack_in(&self.path).map_err(|e| {
                SandboxError::Materialise(format!("failed to unpack tar entry: {e}"))
            })?;
            if !unpacked {
                // unpack_in refuses entries that escape the extraction root.
                let name = entry.path().map(|p| p.display().to_string());
                tracing::warn!(entry = ?name, "skipped tar entry outside the extraction root");
            }
        }
        Ok(())
    }

    fn write_executable(&self, package: &[u8], command_name: &str) -> Result<(), SandboxError> {
        let target = self.path.join(command_name);
        std::fs::write(&target, package)
            .map_err(|e| SandboxError::Materialise(format!("failed to write package: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| SandboxError::Materialise(format!("failed to mark executable: {e}")))?;
        }
        Ok(())
    }

    /// Removes the run directory, or renames it aside when the retention
    /// policy keeps failures. Returns the retained path, if any.
    pub async fn finish(self, retain: bool) -> Result<Option<PathBuf>, SandboxError> {
        if retain {
            let mut retained = self.path.clone().into_os_string();
            retained.push(FAILED_SUFFIX);
            let retained = PathBuf::from(retained);
            if retained.exists() {
                tokio::fs::remove_dir_all(&retained)
                    .await
                    .map_err(|source| SandboxError::Workspace {
                        path: retained.clone(),
                        source,
                    })?;
            }
            tokio::fs::rename(&self.path, &retained)
                .await
                .map_err(|source| SandboxError::Workspace {
                    path: self.path.clone(),
                    source,
                })?;
            tracing::info!(path = %retained.display(), "retained failed run directory");
            Ok(Some(retained))
        } else {
            tokio::fs::remove_dir_all(&self.path)
                .await
                .map_err(|source| SandboxError::Workspace {
                    path: self.path.clone(),
                    source,
                })?;
            Ok(None)
        }
    }
}

/// Packs a directory into the gzipped tarball format test packages use.
/// Shared by tests and local tooling; the fabric itself only unpacks.
pub fn pack_directory(dir: &Path) -> Result<Vec<u8>, SandboxError> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all("", dir)
        .map_err(|e| SandboxError::Materialise(format!("failed to append directory: {e}")))?;
    let encoder = builder
        .into_inner()
        .map_err(|e| SandboxError::Materialise(format!("failed to finish archive: {e}")))?;
    encoder
        .finish()
        .map_err(|e| SandboxError::Materialise(format!("failed to finish gzip stream: {e}")))
}

/// Sniffs whether a package is a gzipped tarball.
pub fn is_tarball(package: &[u8]) -> bool {
    package.starts_with(&GZIP_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tarball_roundtrips_into_workspace() {
        let scratch = tempfile::tempdir().unwrap();
        let source = scratch.path().join("source");
        std::fs::create_dir_all(source.join("lib")).unwrap();
        std::fs::write(source.join("joshua_test"), b"#!/bin/sh\nexit 0\n").unwrap();
        std::fs::write(source.join("lib/data.txt"), b"fixture").unwrap();
        let package = pack_directory(&source).unwrap();
        assert!(is_tarball(&package));

        let workspace = RunWorkspace::create(scratch.path(), "run-1").await.unwrap();
        workspace.materialise(&package, "joshua_test").unwrap();
        assert!(workspace.path().join("joshua_test").is_file());
        assert_eq!(
            std::fs::read(workspace.path().join("lib/data.txt")).unwrap(),
            b"fixture"
        );
        assert!(workspace.path().join("tmp").is_dir());
        workspace.finish(false).await.unwrap();
    }

    #[tokio::test]
    async fn raw_package_becomes_the_test_executable() {
        let scratch = tempfile::tempdir().unwrap();
        let workspace = RunWorkspace::create(scratch.path(), "run-raw").await.unwrap();
        workspace
            .materialise(b"#!/bin/sh\necho raw\n", "joshua_test")
            .unwrap();
        let target = workspace.path().join("joshua_test");
        assert!(target.is_file());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&target).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
        workspace.finish(false).await.unwrap();
    }

    #[tokio::test]
    async fn finish_retains_failed_directories() {
        let scratch = tempfile::tempdir().unwrap();
        let workspace = RunWorkspace::create(scratch.path(), "run-keep").await.unwrap();
        std::fs::write(workspace.path().join("evidence.log"), b"trace").unwrap();

        let retained = workspace.finish(true).await.unwrap().unwrap();
        assert!(retained.ends_with("run-keep.failed"));
        assert!(retained.join("evidence.log").is_file());
        assert!(!scratch.path().join("runs/run-keep").exists());
    }

    #[tokio::test]
    async fn create_wipes_leftovers_from_a_previous_run() {
        let scratch = tempfile::tempdir().unwrap();
        let first = RunWorkspace::create(scratch.path(), "run-x").await.unwrap();
        std::fs::write(first.path().join("stale.txt"), b"old").unwrap();
        // Simulate a crashed agent: the directory is left behind.
        drop(first);

        let second = RunWorkspace::create(scratch.path(), "run-x").await.unwrap();
        assert!(!second.path().join("stale.txt").exists());
        second.finish(false).await.unwrap();
    }

    #[test]
    fn traversal_entries_are_refused() {
        let scratch = tempfile::tempdir().unwrap();
        // Hand-build an archive with an escaping path.
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "../escape.txt", &b"oops"[..])
            .unwrap();
        let package = builder.into_inner().unwrap().finish().unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let workspace = RunWorkspace::create(scratch.path(), "run-evil").await.unwrap();
            workspace.materialise(&package, "joshua_test").unwrap();
            workspace.finish(false).await.unwrap();
        });
        assert!(!scratch.path().join("escape.txt").exists());
    }
}
