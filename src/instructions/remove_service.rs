//! MJ-010: `remove_service` — delete one registered service by name.

use super::{bind_args, ArgKind, ArgSpec, Arguments, ExecutionContext};
use crate::core::error::ExecError;
use crate::core::types::ScriptValue;
use crate::core::validator::ValidatorEnvironment;
use crate::core::values::{RuntimeValueStore, ValueId};
use indexmap::IndexMap;

const SCHEMA: &[ArgSpec] = &[ArgSpec::required("name", ArgKind::Str)];

#[derive(Debug, Clone)]
pub struct RemoveService {
    pub name: String,
    pub value_id: ValueId,
}

impl RemoveService {
    pub fn bind(
        args: Arguments,
        store: &RuntimeValueStore,
    ) -> Result<(Self, ScriptValue), String> {
        let bound = bind_args("remove_service", SCHEMA, args)?;
        let name = match bound.get("name").and_then(ScriptValue::as_str) {
            Some(name) => name.to_string(),
            None => return Err("missing required argument 'name' for 'remove_service'".to_string()),
        };
        let value_id = store.create();
        Ok((Self { name, value_id }, ScriptValue::Null))
    }

    pub fn render(&self) -> String {
        format!("remove_service(name={:?})", self.name)
    }

    pub fn validate(&self, env: &mut ValidatorEnvironment) -> Result<(), String> {
        if !env.service_exists(&self.name) {
            return Err(format!(
                "service '{}' does not exist in the environment",
                self.name
            ));
        }
        env.remove_service(&self.name);
        Ok(())
    }

    pub async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<String, ExecError> {
        if ctx.dry_run {
            return Ok(format!(
                "Service '{}' with service UUID '{}' removed",
                self.name,
                RuntimeValueStore::marker(self.value_id, "uuid")
            ));
        }

        let name = ctx
            .store
            .render_str(&self.name)
            .map_err(|e| ExecError::failed(e.to_string()))?;
        let uuid = ctx
            .backend
            .remove_service(&name)
            .await
            .map_err(|e| ExecError::failed(format!("failed to remove service '{}': {}", name, e)))?;

        let mut fields = IndexMap::new();
        fields.insert("uuid".to_string(), ScriptValue::Str(uuid.clone()));
        ctx.store
            .resolve(self.value_id, fields)
            .map_err(|e| ExecError::failed(format!("internal consistency error: {}", e)))?;

        Ok(format!(
            "Service '{}' with service UUID '{}' removed",
            name, uuid
        ))
    }
}
