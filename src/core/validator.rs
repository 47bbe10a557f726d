//! MJ-005: Validation — one pass, every problem, no mutation.
//!
//! The validator seeds a projection of Environment State from a read-only
//! backend snapshot, then walks the plan in order letting each instruction
//! check its preconditions against the projection and record its planned
//! effects into it. Live state is never touched. Failures accumulate; a
//! later instruction is validated even when an earlier one failed.

use crate::backend::EnvironmentBackend;
use crate::core::error::ValidationError;
use crate::core::types::Plan;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Projection of Environment State as it will look while the plan executes.
/// `planned_*` tracks names introduced by this plan, so duplicate additions
/// are caught while idempotent re-additions of live names are not.
#[derive(Debug, Clone, Default)]
pub struct ValidatorEnvironment {
    services: BTreeSet<String>,
    planned_services: BTreeSet<String>,
    artifacts: BTreeSet<String>,
    planned_artifacts: BTreeSet<String>,
}

impl ValidatorEnvironment {
    /// Seed the projection from the backend's current registrations.
    pub async fn snapshot(
        backend: &Arc<dyn EnvironmentBackend>,
    ) -> Result<Self, crate::backend::BackendError> {
        let mut env = Self::default();
        for name in backend.existing_service_names().await? {
            env.services.insert(name);
        }
        for name in backend.existing_artifact_names().await? {
            env.artifacts.insert(name);
        }
        Ok(env)
    }

    pub fn service_exists(&self, name: &str) -> bool {
        self.services.contains(name)
    }

    /// True when this plan already adds a service of that name.
    pub fn service_planned(&self, name: &str) -> bool {
        self.planned_services.contains(name)
    }

    pub fn add_service(&mut self, name: &str) {
        self.services.insert(name.to_string());
        self.planned_services.insert(name.to_string());
    }

    pub fn remove_service(&mut self, name: &str) {
        self.services.remove(name);
        self.planned_services.remove(name);
    }

    pub fn artifact_exists(&self, name: &str) -> bool {
        self.artifacts.contains(name)
    }

    pub fn artifact_planned(&self, name: &str) -> bool {
        self.planned_artifacts.contains(name)
    }

    pub fn add_artifact(&mut self, name: &str) {
        self.artifacts.insert(name.to_string());
        self.planned_artifacts.insert(name.to_string());
    }
}

/// Validate every instruction in plan order, collecting all failures.
pub async fn validate_plan(
    plan: &Plan,
    backend: &Arc<dyn EnvironmentBackend>,
) -> Vec<ValidationError> {
    let mut env = match ValidatorEnvironment::snapshot(backend).await {
        Ok(env) => env,
        Err(err) => {
            return vec![ValidationError {
                position: None,
                message: format!("failed to snapshot environment state: {}", err),
            }]
        }
    };

    let mut errors = Vec::new();
    for planned in &plan.instructions {
        if let Err(message) = planned.instruction.validate(&mut env) {
            errors.push(ValidationError::at(planned.position, message));
        }
    }
    debug!(
        instructions = plan.len(),
        errors = errors.len(),
        "validation pass finished"
    );
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::core::builder;
    use crate::core::script;
    use crate::core::values::RuntimeValueStore;
    use indexmap::IndexMap;

    async fn plan_for(script_text: &str) -> (Plan, Arc<dyn EnvironmentBackend>) {
        let backend: Arc<dyn EnvironmentBackend> = Arc::new(LocalBackend::new());
        let parsed = script::parse(script_text).unwrap();
        let calls = script::invocations(script::select_flow(&parsed, None).unwrap()).unwrap();
        let store = RuntimeValueStore::new();
        let output = builder::build_plan(calls, &IndexMap::new(), &store, &backend)
            .await
            .unwrap();
        (output.plan, backend)
    }

    #[tokio::test]
    async fn test_mj005_all_errors_collected() {
        // Both instructions are invalid; both must be reported.
        let (plan, backend) = plan_for(
            r#"
name: bad
run:
  - remove_service:
      name: ghost-one
  - remove_service:
      name: ghost-two
"#,
        )
        .await;
        let errors = validate_plan(&plan, &backend).await;
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("ghost-one"));
        assert!(errors[1].message.contains("ghost-two"));
        assert_eq!(errors[0].position.map(|p| p.index), Some(0));
        assert_eq!(errors[1].position.map(|p| p.index), Some(1));
    }

    #[tokio::test]
    async fn test_mj005_projection_sees_planned_services() {
        // remove after add in the same plan is valid even though the live
        // environment is empty.
        let (plan, backend) = plan_for(
            r#"
name: add-then-remove
run:
  - add_services:
      configs:
        api:
          image: nginx:1.25
  - remove_service:
      name: api
"#,
        )
        .await;
        let errors = validate_plan(&plan, &backend).await;
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    }

    #[tokio::test]
    async fn test_mj005_snapshot_seeds_live_state() {
        let (plan, backend) = plan_for(
            r#"
name: remove-live
run:
  - remove_service:
      name: api
"#,
        )
        .await;
        // Invalid against the empty environment...
        assert_eq!(validate_plan(&plan, &backend).await.len(), 1);

        // ...valid once the service is live.
        backend.register_if_absent("api").await.unwrap();
        assert!(validate_plan(&plan, &backend).await.is_empty());
    }

    #[tokio::test]
    async fn test_mj005_validation_does_not_mutate_state() {
        let (plan, backend) = plan_for(
            r#"
name: add-only
run:
  - add_services:
      configs:
        api:
          image: nginx:1.25
"#,
        )
        .await;
        let before = backend.existing_service_names().await.unwrap();
        let errors = validate_plan(&plan, &backend).await;
        assert!(errors.is_empty());
        let after = backend.existing_service_names().await.unwrap();
        assert_eq!(before, after, "validation must not mutate live state");
    }
}
