//! MJ-018: Environment backend abstraction.
//!
//! The execution engine never talks to containers directly; it goes through
//! this narrow async surface. Backends own Environment State (services and
//! file artifacts) and are allowed to report conflicts as ordinary errors —
//! the engine wraps them into the failing phase's error kind.

pub mod local;

use crate::core::types::ServiceConfig;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// A registered, running service as the backend sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub name: String,
    pub uuid: String,
}

/// Outcome of one shell task.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub exit_code: i64,
    /// Combined stdout and stderr.
    pub output: String,
    /// Names of the artifacts produced from the task's store paths, in
    /// store-path order.
    pub artifacts: Vec<String>,
}

/// Minimal HTTP response used by readiness polling.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("service '{0}' not found")]
    ServiceNotFound(String),
    #[error("service name '{0}' is already registered")]
    NameAlreadyRegistered(String),
    #[error("files artifact '{0}' not found")]
    ArtifactNotFound(String),
    #[error("The exec request timed out after {0} seconds")]
    ExecTimeout(u64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// The backend collaborator surface. Per-name partial failure is modeled as
/// a second map rather than a short-circuiting error so one bad service does
/// not abort its siblings.
#[async_trait]
pub trait EnvironmentBackend: Send + Sync {
    /// Claim a logical service name. Returns false when the name is already
    /// registered.
    async fn register_if_absent(&self, name: &str) -> Result<bool, BackendError>;

    /// Bulk-create services, at most `parallelism` concurrently. Returns the
    /// per-name successes and failures.
    async fn add_services(
        &self,
        configs: IndexMap<String, ServiceConfig>,
        parallelism: usize,
    ) -> Result<(IndexMap<String, ServiceHandle>, IndexMap<String, BackendError>), BackendError>;

    /// Reconfigure already-running services.
    async fn update_services(
        &self,
        configs: IndexMap<String, ServiceConfig>,
        parallelism: usize,
    ) -> Result<(IndexMap<String, ServiceHandle>, IndexMap<String, BackendError>), BackendError>;

    /// Remove a service by name, returning its identifier.
    async fn remove_service(&self, name: &str) -> Result<String, BackendError>;

    async fn start_service(&self, name: &str) -> Result<(), BackendError>;

    async fn stop_service(&self, name: &str) -> Result<(), BackendError>;

    /// Issue one HTTP request against a service port. Used by readiness
    /// polling; a refused or failing check is an `Err` or a non-expected
    /// status, both of which the poller retries.
    async fn http_request_service(
        &self,
        service: &str,
        port_id: &str,
        method: &str,
        content_type: &str,
        endpoint: &str,
        body: &str,
    ) -> Result<HttpResponse, BackendError>;

    /// Store an artifact under `name`, returning its identifier.
    async fn upload_files_artifact(
        &self,
        data: Vec<u8>,
        hash: &str,
        name: &str,
    ) -> Result<String, BackendError>;

    /// Look up an artifact's identifier and content hash by name. `None`
    /// when no artifact has that name.
    async fn get_files_artifact_hash(
        &self,
        name: &str,
    ) -> Result<Option<(String, String)>, BackendError>;

    /// Generate a fresh, unused artifact name.
    async fn get_unique_name_for_file_artifact(&self) -> Result<String, BackendError>;

    /// Run a shell command, waiting at most `wait` for it to finish. Paths
    /// in `store_paths` are packed into fresh artifacts after a successful
    /// run; `files_mounts` maps mount points to artifact names extracted
    /// before the command starts.
    async fn run_shell_task(
        &self,
        command: &str,
        image: &str,
        store_paths: &[String],
        files_mounts: &IndexMap<String, String>,
        wait: Duration,
    ) -> Result<TaskRun, BackendError>;

    /// Read-only snapshot of registered service names, for validation.
    async fn existing_service_names(&self) -> Result<Vec<String>, BackendError>;

    /// Read-only snapshot of stored artifact names, for validation.
    async fn existing_artifact_names(&self) -> Result<Vec<String>, BackendError>;
}

/// Pack a file or directory into a gzipped tar archive and hash the tar
/// bytes. A file is archived under its file name; a directory keeps its own
/// name as the top-level entry.
pub fn pack_path(path: &Path) -> Result<(Vec<u8>, String), BackendError> {
    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        let entry_name = path
            .file_name()
            .ok_or_else(|| BackendError::Other(format!("cannot archive '{}'", path.display())))?;
        if path.is_dir() {
            builder.append_dir_all(entry_name, path)?;
        } else {
            builder.append_path_with_name(path, entry_name)?;
        }
        builder.finish()?;
    }

    let hash = format!("sha256:{:x}", Sha256::digest(&tar_bytes));

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    let compressed = encoder.finish()?;
    Ok((compressed, hash))
}

/// Unpack a gzipped tar archive into `dest`.
pub fn unpack_archive(data: &[u8], dest: &Path) -> Result<(), BackendError> {
    std::fs::create_dir_all(dest)?;
    let decoder = GzDecoder::new(data);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mj018_pack_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tech.txt");
        std::fs::write(&src, "kurtosis\n").unwrap();

        let (data, hash) = pack_path(&src).unwrap();
        assert!(hash.starts_with("sha256:"));

        let dest = tempfile::tempdir().unwrap();
        unpack_archive(&data, dest.path()).unwrap();
        let content = std::fs::read_to_string(dest.path().join("tech.txt")).unwrap();
        assert_eq!(content, "kurtosis\n");
    }

    #[test]
    fn test_mj018_pack_dir_keeps_dir_name() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("tech.txt"), "kurtosis\n").unwrap();

        let (data, _) = pack_path(&src).unwrap();
        let dest = tempfile::tempdir().unwrap();
        unpack_archive(&data, dest.path()).unwrap();
        let content = std::fs::read_to_string(dest.path().join("src/tech.txt")).unwrap();
        assert_eq!(content, "kurtosis\n");
    }

    #[test]
    fn test_mj018_pack_same_content_same_hash() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, "stable").unwrap();
        let (_, h1) = pack_path(&src).unwrap();
        let (_, h2) = pack_path(&src).unwrap();
        assert_eq!(h1, h2);
    }
}
