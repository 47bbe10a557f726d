//! MJ-019: Local backend — in-process environment state, host-shell tasks.
//!
//! Services are registry entries, artifacts live in memory as gzipped tars,
//! and shell tasks run via the host shell inside a scratch directory per
//! task. Mount points and store paths are taken relative to that scratch
//! directory (a leading `/` is stripped), so scripts written against a
//! containerized backend keep working locally as long as their commands use
//! relative paths. Identifiers are digests of a per-backend counter, so two
//! identical runs against fresh backends produce identical traces.

use super::{
    pack_path, unpack_archive, BackendError, EnvironmentBackend, HttpResponse, ServiceHandle,
    TaskRun,
};
use crate::core::types::ServiceConfig;
use async_trait::async_trait;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

const NAME_ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusty", "eager", "fuzzy", "green", "husky", "icy", "jolly", "keen",
    "lucid",
];

const NAME_NOUNS: &[&str] = &[
    "otter", "falcon", "maple", "comet", "harbor", "ridge", "meadow", "quartz", "willow", "badger",
    "lagoon", "summit",
];

#[derive(Debug, Clone)]
struct LocalService {
    handle: ServiceHandle,
    #[allow(dead_code)]
    config: Option<ServiceConfig>,
    running: bool,
}

#[derive(Debug, Clone)]
struct LocalArtifact {
    uuid: String,
    hash: String,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct LocalState {
    services: IndexMap<String, LocalService>,
    artifacts: IndexMap<String, LocalArtifact>,
    http_responses: HashMap<(String, String), HttpResponse>,
    counter: u64,
}

impl LocalState {
    fn next_uuid(&mut self) -> String {
        self.counter += 1;
        let digest = Sha256::digest(format!("montaje-{}", self.counter));
        format!("{:x}", digest)[..32].to_string()
    }

    fn next_artifact_name(&mut self) -> String {
        self.counter += 1;
        let adj = NAME_ADJECTIVES[(self.counter as usize) % NAME_ADJECTIVES.len()];
        let noun = NAME_NOUNS[(self.counter as usize / NAME_ADJECTIVES.len()) % NAME_NOUNS.len()];
        let base = format!("{}-{}", adj, noun);
        if self.artifacts.contains_key(&base) {
            format!("{}-{}", base, self.counter)
        } else {
            base
        }
    }
}

/// In-process backend used by the CLI and the test suite.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    state: Arc<Mutex<LocalState>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a canned HTTP response for `(service, endpoint)`. Unknown
    /// endpoints answer 503, which keeps readiness polls retrying.
    pub fn set_http_response(&self, service: &str, endpoint: &str, status: u16, body: &str) {
        self.lock().http_responses.insert(
            (service.to_string(), endpoint.to_string()),
            HttpResponse {
                status,
                body: body.to_string(),
            },
        );
    }

    fn create_one(
        state: &Arc<Mutex<LocalState>>,
        name: &str,
        config: ServiceConfig,
    ) -> Result<ServiceHandle, BackendError> {
        let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = state.services.get(name) {
            if existing.running {
                return Err(BackendError::NameAlreadyRegistered(name.to_string()));
            }
            let handle = existing.handle.clone();
            let entry = state
                .services
                .get_mut(name)
                .ok_or_else(|| BackendError::ServiceNotFound(name.to_string()))?;
            entry.config = Some(config);
            entry.running = true;
            return Ok(handle);
        }
        let uuid = state.next_uuid();
        let handle = ServiceHandle {
            name: name.to_string(),
            uuid,
        };
        state.services.insert(
            name.to_string(),
            LocalService {
                handle: handle.clone(),
                config: Some(config),
                running: true,
            },
        );
        Ok(handle)
    }

    async fn fan_out_services(
        &self,
        configs: IndexMap<String, ServiceConfig>,
        parallelism: usize,
        update: bool,
    ) -> Result<(IndexMap<String, ServiceHandle>, IndexMap<String, BackendError>), BackendError>
    {
        let order: Vec<String> = configs.keys().cloned().collect();
        let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut handles = Vec::new();

        for (name, config) in configs {
            let semaphore = Arc::clone(&semaphore);
            let state = Arc::clone(&self.state);
            handles.push(tokio::spawn(async move {
                let result = match semaphore.acquire().await {
                    Err(e) => Err(BackendError::Other(e.to_string())),
                    Ok(_permit) => {
                        if update {
                            Self::update_one(&state, &name, config)
                        } else {
                            Self::create_one(&state, &name, config)
                        }
                    }
                };
                (name, result)
            }));
        }

        let mut outcomes: HashMap<String, Result<ServiceHandle, BackendError>> = HashMap::new();
        for joined in futures::future::join_all(handles).await {
            let (name, result) = joined
                .map_err(|e| BackendError::Other(format!("service task panicked: {}", e)))?;
            outcomes.insert(name, result);
        }

        // Deterministic result maps regardless of completion order.
        let mut succeeded = IndexMap::new();
        let mut failed = IndexMap::new();
        for name in order {
            match outcomes.remove(&name) {
                Some(Ok(handle)) => {
                    succeeded.insert(name, handle);
                }
                Some(Err(err)) => {
                    failed.insert(name, err);
                }
                None => {
                    failed.insert(
                        name.clone(),
                        BackendError::Other(format!("no outcome recorded for '{}'", name)),
                    );
                }
            }
        }
        Ok((succeeded, failed))
    }

    fn update_one(
        state: &Arc<Mutex<LocalState>>,
        name: &str,
        config: ServiceConfig,
    ) -> Result<ServiceHandle, BackendError> {
        let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = state
            .services
            .get_mut(name)
            .ok_or_else(|| BackendError::ServiceNotFound(name.to_string()))?;
        entry.config = Some(config);
        Ok(entry.handle.clone())
    }
}

#[async_trait]
impl EnvironmentBackend for LocalBackend {
    async fn register_if_absent(&self, name: &str) -> Result<bool, BackendError> {
        let mut state = self.lock();
        if state.services.contains_key(name) {
            return Ok(false);
        }
        let uuid = state.next_uuid();
        state.services.insert(
            name.to_string(),
            LocalService {
                handle: ServiceHandle {
                    name: name.to_string(),
                    uuid,
                },
                config: None,
                running: false,
            },
        );
        Ok(true)
    }

    async fn add_services(
        &self,
        configs: IndexMap<String, ServiceConfig>,
        parallelism: usize,
    ) -> Result<(IndexMap<String, ServiceHandle>, IndexMap<String, BackendError>), BackendError>
    {
        self.fan_out_services(configs, parallelism, false).await
    }

    async fn update_services(
        &self,
        configs: IndexMap<String, ServiceConfig>,
        parallelism: usize,
    ) -> Result<(IndexMap<String, ServiceHandle>, IndexMap<String, BackendError>), BackendError>
    {
        self.fan_out_services(configs, parallelism, true).await
    }

    async fn remove_service(&self, name: &str) -> Result<String, BackendError> {
        let mut state = self.lock();
        let service = state
            .services
            .shift_remove(name)
            .ok_or_else(|| BackendError::ServiceNotFound(name.to_string()))?;
        Ok(service.handle.uuid)
    }

    async fn start_service(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        let entry = state
            .services
            .get_mut(name)
            .ok_or_else(|| BackendError::ServiceNotFound(name.to_string()))?;
        entry.running = true;
        Ok(())
    }

    async fn stop_service(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        let entry = state
            .services
            .get_mut(name)
            .ok_or_else(|| BackendError::ServiceNotFound(name.to_string()))?;
        entry.running = false;
        Ok(())
    }

    async fn http_request_service(
        &self,
        service: &str,
        _port_id: &str,
        _method: &str,
        _content_type: &str,
        endpoint: &str,
        _body: &str,
    ) -> Result<HttpResponse, BackendError> {
        let state = self.lock();
        if !state.services.contains_key(service) {
            return Err(BackendError::ServiceNotFound(service.to_string()));
        }
        let canned = state
            .http_responses
            .get(&(service.to_string(), endpoint.to_string()));
        Ok(canned.cloned().unwrap_or(HttpResponse {
            status: 503,
            body: String::new(),
        }))
    }

    async fn upload_files_artifact(
        &self,
        data: Vec<u8>,
        hash: &str,
        name: &str,
    ) -> Result<String, BackendError> {
        let mut state = self.lock();
        if let Some(existing) = state.artifacts.get_mut(name) {
            existing.data = data;
            existing.hash = hash.to_string();
            return Ok(existing.uuid.clone());
        }
        let uuid = state.next_uuid();
        state.artifacts.insert(
            name.to_string(),
            LocalArtifact {
                uuid: uuid.clone(),
                hash: hash.to_string(),
                data,
            },
        );
        Ok(uuid)
    }

    async fn get_files_artifact_hash(
        &self,
        name: &str,
    ) -> Result<Option<(String, String)>, BackendError> {
        let state = self.lock();
        Ok(state
            .artifacts
            .get(name)
            .map(|a| (a.uuid.clone(), a.hash.clone())))
    }

    async fn get_unique_name_for_file_artifact(&self) -> Result<String, BackendError> {
        Ok(self.lock().next_artifact_name())
    }

    async fn run_shell_task(
        &self,
        command: &str,
        image: &str,
        store_paths: &[String],
        files_mounts: &IndexMap<String, String>,
        wait: Duration,
    ) -> Result<TaskRun, BackendError> {
        debug!(command, image, "running shell task");
        let task_dir = tempfile::tempdir()?;

        // Extract mounted artifacts before the command starts.
        for (mount_point, artifact_name) in files_mounts {
            let data = {
                let state = self.lock();
                state
                    .artifacts
                    .get(artifact_name)
                    .map(|a| a.data.clone())
                    .ok_or_else(|| BackendError::ArtifactNotFound(artifact_name.clone()))?
            };
            let dest = task_dir.path().join(mount_point.trim_start_matches('/'));
            unpack_archive(&data, &dest)?;
        }

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(task_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(wait, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => return Err(BackendError::ExecTimeout(wait.as_secs())),
        };

        let exit_code = i64::from(output.status.code().unwrap_or(-1));
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        // Store paths only become artifacts when the command succeeded.
        let mut artifacts = Vec::new();
        if exit_code == 0 {
            for store_path in store_paths {
                let path = task_dir.path().join(store_path.trim_start_matches('/'));
                if !path.exists() {
                    return Err(BackendError::Other(format!(
                        "store path '{}' was not produced by the task",
                        store_path
                    )));
                }
                let (data, hash) = pack_path(&path)?;
                let (name, uuid) = {
                    let mut state = self.lock();
                    let name = state.next_artifact_name();
                    let uuid = state.next_uuid();
                    state.artifacts.insert(
                        name.clone(),
                        LocalArtifact {
                            uuid: uuid.clone(),
                            hash,
                            data,
                        },
                    );
                    (name, uuid)
                };
                debug!(name, uuid, "stored task artifact");
                artifacts.push(name);
            }
        }

        Ok(TaskRun {
            exit_code,
            output: combined,
            artifacts,
        })
    }

    async fn existing_service_names(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.lock().services.keys().cloned().collect())
    }

    async fn existing_artifact_names(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.lock().artifacts.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(image: &str) -> ServiceConfig {
        serde_json::from_value(serde_json::json!({ "image": image })).unwrap()
    }

    #[tokio::test]
    async fn test_mj019_register_if_absent() {
        let backend = LocalBackend::new();
        assert!(backend.register_if_absent("api").await.unwrap());
        assert!(!backend.register_if_absent("api").await.unwrap());
    }

    #[tokio::test]
    async fn test_mj019_add_services_partial_failure() {
        let backend = LocalBackend::new();
        let mut configs = IndexMap::new();
        configs.insert("api".to_string(), config("nginx:1.25"));
        let (ok, failed) = backend.add_services(configs, 4).await.unwrap();
        assert_eq!(ok.len(), 1);
        assert!(failed.is_empty());

        // Same name again: running, so it lands in the failure map.
        let mut configs = IndexMap::new();
        configs.insert("api".to_string(), config("nginx:1.25"));
        configs.insert("db".to_string(), config("postgres:16"));
        let (ok, failed) = backend.add_services(configs, 4).await.unwrap();
        assert_eq!(ok.len(), 1);
        assert!(ok.contains_key("db"));
        assert_eq!(failed.len(), 1);
        assert!(failed.contains_key("api"));
    }

    #[tokio::test]
    async fn test_mj019_add_after_registration_keeps_uuid() {
        let backend = LocalBackend::new();
        backend.register_if_absent("api").await.unwrap();
        let registered_uuid = backend.lock().services["api"].handle.uuid.clone();

        let mut configs = IndexMap::new();
        configs.insert("api".to_string(), config("nginx:1.25"));
        let (ok, failed) = backend.add_services(configs, 4).await.unwrap();
        assert!(failed.is_empty());
        assert_eq!(ok["api"].uuid, registered_uuid);
    }

    #[tokio::test]
    async fn test_mj019_remove_service_returns_uuid() {
        let backend = LocalBackend::new();
        let mut configs = IndexMap::new();
        configs.insert("api".to_string(), config("nginx:1.25"));
        let (ok, _) = backend.add_services(configs, 4).await.unwrap();
        let uuid = ok["api"].uuid.clone();

        assert_eq!(backend.remove_service("api").await.unwrap(), uuid);
        assert!(matches!(
            backend.remove_service("api").await,
            Err(BackendError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mj019_deterministic_identifiers() {
        let a = LocalBackend::new();
        let b = LocalBackend::new();
        let mut configs = IndexMap::new();
        configs.insert("api".to_string(), config("nginx:1.25"));
        let (ok_a, _) = a.add_services(configs.clone(), 4).await.unwrap();
        let (ok_b, _) = b.add_services(configs, 4).await.unwrap();
        assert_eq!(ok_a["api"].uuid, ok_b["api"].uuid);
        assert_eq!(ok_a["api"].uuid.len(), 32);
    }

    #[tokio::test]
    async fn test_mj019_http_responses() {
        let backend = LocalBackend::new();
        let mut configs = IndexMap::new();
        configs.insert("api".to_string(), config("nginx:1.25"));
        backend.add_services(configs, 4).await.unwrap();

        let response = backend
            .http_request_service("api", "http", "GET", "", "/health", "")
            .await
            .unwrap();
        assert_eq!(response.status, 503);

        backend.set_http_response("api", "/health", 200, "{}");
        let response = backend
            .http_request_service("api", "http", "GET", "", "/health", "")
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        assert!(matches!(
            backend
                .http_request_service("ghost", "http", "GET", "", "/", "")
                .await,
            Err(BackendError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mj019_run_shell_task_captures_output() {
        let backend = LocalBackend::new();
        let run = backend
            .run_shell_task("echo kurtosis", "busybox", &[], &IndexMap::new(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(run.exit_code, 0);
        assert_eq!(run.output, "kurtosis\n");
        assert!(run.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_mj019_run_shell_task_timeout() {
        let backend = LocalBackend::new();
        let err = backend
            .run_shell_task("sleep 5", "busybox", &[], &IndexMap::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The exec request timed out after 0 seconds"
        );
    }

    #[tokio::test]
    async fn test_mj019_store_and_mount_roundtrip() {
        let backend = LocalBackend::new();
        let run = backend
            .run_shell_task(
                "mkdir -p src && echo kurtosis > src/tech.txt",
                "busybox",
                &["src/tech.txt".to_string(), "src".to_string()],
                &IndexMap::new(),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(run.artifacts.len(), 2);

        let mut mounts = IndexMap::new();
        mounts.insert("/temp".to_string(), run.artifacts[0].clone());
        let cat = backend
            .run_shell_task("cat temp/tech.txt", "busybox", &[], &mounts, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(cat.output, "kurtosis\n");

        let mut mounts = IndexMap::new();
        mounts.insert("/task".to_string(), run.artifacts[1].clone());
        let cat = backend
            .run_shell_task("cat task/src/tech.txt", "busybox", &[], &mounts, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(cat.output, "kurtosis\n");
    }

    #[tokio::test]
    async fn test_mj019_upload_idempotent_hash() {
        let backend = LocalBackend::new();
        let uuid = backend
            .upload_files_artifact(vec![1, 2, 3], "sha256:abc", "blue-whale")
            .await
            .unwrap();
        let found = backend.get_files_artifact_hash("blue-whale").await.unwrap();
        assert_eq!(found, Some((uuid, "sha256:abc".to_string())));
        assert_eq!(backend.get_files_artifact_hash("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mj019_unique_artifact_names() {
        let backend = LocalBackend::new();
        let a = backend.get_unique_name_for_file_artifact().await.unwrap();
        let b = backend.get_unique_name_for_file_artifact().await.unwrap();
        assert_ne!(a, b);
    }
}
