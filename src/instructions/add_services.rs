//! MJ-009: `add_services` — bulk service creation with readiness polling.
//!
//! The one instruction with real internal fan-out: names are claimed first
//! (registration phase), services are bulk-created through the backend, and
//! readiness checks then poll each service concurrently up to the configured
//! parallelism. Per-service failures are collected; siblings always run to
//! completion before the instruction decides the aggregate outcome.

use super::{bind_args, ArgKind, ArgSpec, Arguments, ExecutionContext};
use crate::backend::EnvironmentBackend;
use crate::core::error::ExecError;
use crate::core::types::{parse_duration, FeatureFlag, ReadyCondition, ScriptValue, ServiceConfig};
use crate::core::validator::ValidatorEnvironment;
use crate::core::values::{RuntimeValueStore, ValueId};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SCHEMA: &[ArgSpec] = &[ArgSpec::required("configs", ArgKind::Dict)];

#[derive(Debug, Clone)]
pub struct AddServices {
    pub configs: IndexMap<String, ServiceConfig>,
    pub value_id: ValueId,
}

impl AddServices {
    pub fn bind(
        args: Arguments,
        store: &RuntimeValueStore,
    ) -> Result<(Self, ScriptValue), String> {
        let bound = bind_args("add_services", SCHEMA, args)?;
        let configs_value = match bound.get("configs") {
            Some(ScriptValue::Dict(dict)) => dict,
            _ => return Err("missing required argument 'configs' for 'add_services'".to_string()),
        };
        if configs_value.is_empty() {
            return Err("'add_services' requires at least one service config".to_string());
        }

        let mut configs = IndexMap::new();
        for (name, value) in configs_value {
            let config: ServiceConfig = serde_json::from_value(value.to_json()).map_err(|e| {
                format!(
                    "type mismatch for service '{}' of 'add_services': {}",
                    name, e
                )
            })?;
            configs.insert(name.clone(), config);
        }

        let value_id = store.create();
        let mut interp = IndexMap::new();
        for name in configs.keys() {
            interp.insert(
                name.clone(),
                ScriptValue::Str(RuntimeValueStore::marker(
                    value_id,
                    &format!("{}.uuid", name),
                )),
            );
        }
        Ok((Self { configs, value_id }, ScriptValue::Dict(interp)))
    }

    pub fn render(&self) -> String {
        let rendered: Vec<String> = self
            .configs
            .iter()
            .map(|(name, config)| format!("{:?}: {}", name, config.render()))
            .collect();
        format!("add_services(configs={{{}}})", rendered.join(", "))
    }

    pub fn validate(&self, env: &mut ValidatorEnvironment) -> Result<(), String> {
        for (name, config) in &self.configs {
            if env.service_planned(name) {
                return Err(format!(
                    "service name '{}' is added more than once in this plan",
                    name
                ));
            }
            if config.image.is_empty() {
                return Err(format!("service '{}' has an empty image", name));
            }
            if let Some(ref ready) = config.ready_conditions {
                parse_duration(&ready.interval)
                    .map_err(|e| format!("service '{}' ready_conditions interval: {}", name, e))?;
                parse_duration(&ready.timeout)
                    .map_err(|e| format!("service '{}' ready_conditions timeout: {}", name, e))?;
            }
            env.add_service(name);
        }
        Ok(())
    }

    pub async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<String, ExecError> {
        if ctx.dry_run {
            return Ok(self.success_trace(
                self.configs
                    .keys()
                    .map(|name| {
                        (
                            name.clone(),
                            RuntimeValueStore::marker(self.value_id, &format!("{}.uuid", name)),
                        )
                    })
                    .collect(),
            ));
        }

        let configs = self.rendered_configs(ctx.store)?;

        // Registration phase: claim every name before creating anything.
        // Already-registered names become updates rather than additions.
        let mut to_add = IndexMap::new();
        let mut to_update = IndexMap::new();
        for (name, config) in configs {
            let fresh = ctx
                .backend
                .register_if_absent(&name)
                .await
                .map_err(|e| ExecError::failed(format!("failed to register '{}': {}", name, e)))?;
            if fresh {
                to_add.insert(name, config);
            } else {
                to_update.insert(name, config);
            }
        }

        let (updated, update_failed) = ctx
            .backend
            .update_services(to_update, ctx.parallelism)
            .await
            .map_err(|e| ExecError::failed(format!("failed to update services: {}", e)))?;
        let (added, add_failed) = ctx
            .backend
            .add_services(to_add, ctx.parallelism)
            .await
            .map_err(|e| ExecError::failed(format!("failed to add services: {}", e)))?;

        let mut succeeded: IndexMap<String, String> = IndexMap::new();
        for (name, handle) in added.into_iter().chain(updated) {
            succeeded.insert(name, handle.uuid);
        }
        let mut failures: Vec<(String, String)> = add_failed
            .into_iter()
            .chain(update_failed)
            .map(|(name, err)| (name, err.to_string()))
            .collect();

        // Readiness phase: poll every healthy service concurrently, bounded.
        if !ctx.has_feature(FeatureFlag::SkipReadyChecks) {
            failures.extend(self.poll_ready_conditions(ctx, &succeeded).await?);
        }

        debug!("{} services added, {} failed", succeeded.len(), failures.len());

        if !failures.is_empty() {
            failures.sort();
            let detail: Vec<String> = failures
                .iter()
                .map(|(name, msg)| format!("'{}': {}", name, msg))
                .collect();
            return Err(ExecError::failed(format!(
                "failed to add service(s): {}",
                detail.join("; ")
            )));
        }

        let mut fields = IndexMap::new();
        for (name, uuid) in &succeeded {
            fields.insert(format!("{}.uuid", name), ScriptValue::Str(uuid.clone()));
        }
        ctx.store
            .resolve(self.value_id, fields)
            .map_err(|e| ExecError::failed(format!("internal consistency error: {}", e)))?;

        Ok(self.success_trace(succeeded))
    }

    /// Argument strings may embed runtime markers; materialize them before
    /// the backend sees the configs.
    fn rendered_configs(
        &self,
        store: &RuntimeValueStore,
    ) -> Result<IndexMap<String, ServiceConfig>, ExecError> {
        let mut rendered = IndexMap::new();
        for (name, config) in &self.configs {
            let mut config = config.clone();
            config.image = store
                .render_str(&config.image)
                .map_err(|e| ExecError::failed(e.to_string()))?;
            let mut env_vars = IndexMap::new();
            for (key, value) in &config.env {
                env_vars.insert(
                    key.clone(),
                    store
                        .render_str(value)
                        .map_err(|e| ExecError::failed(e.to_string()))?,
                );
            }
            config.env = env_vars;
            rendered.insert(name.clone(), config);
        }
        Ok(rendered)
    }

    async fn poll_ready_conditions(
        &self,
        ctx: &ExecutionContext<'_>,
        succeeded: &IndexMap<String, String>,
    ) -> Result<Vec<(String, String)>, ExecError> {
        let semaphore = Arc::new(Semaphore::new(ctx.parallelism.max(1)));
        let mut handles = Vec::new();

        for name in succeeded.keys() {
            let Some(ready) = self
                .configs
                .get(name)
                .and_then(|c| c.ready_conditions.clone())
            else {
                continue;
            };
            let semaphore = Arc::clone(&semaphore);
            let backend = Arc::clone(ctx.backend);
            let cancel = ctx.cancel.clone();
            let name = name.clone();
            handles.push(tokio::spawn(async move {
                let permit = semaphore.acquire().await;
                if permit.is_err() {
                    return (name, Err("readiness pool closed".to_string()));
                }
                let outcome = wait_until_ready(backend, &name, &ready, &cancel).await;
                (name, outcome)
            }));
        }

        let mut failures = Vec::new();
        for joined in futures::future::join_all(handles).await {
            let (name, outcome) = joined
                .map_err(|e| ExecError::failed(format!("readiness task panicked: {}", e)))?;
            if let Err(msg) = outcome {
                failures.push((name, msg));
            }
        }
        if ctx.cancel.is_cancelled() {
            return Err(ExecError::cancelled(
                "run cancelled while waiting for services to become ready",
            ));
        }
        Ok(failures)
    }

    fn success_trace(&self, services: IndexMap<String, String>) -> String {
        let mut lines: Vec<(String, String)> = services.into_iter().collect();
        lines.sort();
        let mut out = format!(
            "Successfully added the following '{}' services:\n",
            lines.len()
        );
        for (name, uuid) in lines {
            out.push_str(&format!("Service '{}' added with UUID '{}'\n", name, uuid));
        }
        out
    }
}

/// Poll-with-timeout protocol: issue the check, wait one interval on
/// failure, retry until the condition holds or the budget elapses.
async fn wait_until_ready(
    backend: Arc<dyn EnvironmentBackend>,
    name: &str,
    ready: &ReadyCondition,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let interval = parse_duration(&ready.interval)?;
    let timeout = parse_duration(&ready.timeout)?;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err("readiness check cancelled".to_string());
        }
        let response = backend
            .http_request_service(
                name,
                &ready.port_id,
                &ready.method,
                &ready.content_type,
                &ready.endpoint,
                &ready.body,
            )
            .await;
        match response {
            Ok(response) if response.status == ready.expected_status => return Ok(()),
            Ok(response) => {
                debug!(
                    service = name,
                    status = response.status,
                    "readiness check not passing yet"
                );
            }
            Err(err) => {
                debug!(service = name, error = %err, "readiness request failed");
            }
        }
        if tokio::time::Instant::now() + interval > deadline {
            return Err(format!(
                "service '{}' did not pass its readiness check within {}",
                name, ready.timeout
            ));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err("readiness check cancelled".to_string()),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
