//! MJ-011: `start_service`.

use super::{bind_args, ArgKind, ArgSpec, Arguments, ExecutionContext};
use crate::core::error::ExecError;
use crate::core::types::ScriptValue;
use crate::core::validator::ValidatorEnvironment;

const SCHEMA: &[ArgSpec] = &[ArgSpec::required("name", ArgKind::Str)];

#[derive(Debug, Clone)]
pub struct StartService {
    pub name: String,
}

impl StartService {
    pub fn bind(args: Arguments) -> Result<Self, String> {
        let bound = bind_args("start_service", SCHEMA, args)?;
        let name = match bound.get("name").and_then(ScriptValue::as_str) {
            Some(name) => name.to_string(),
            None => return Err("missing required argument 'name' for 'start_service'".to_string()),
        };
        Ok(Self { name })
    }

    pub fn render(&self) -> String {
        format!("start_service(name={:?})", self.name)
    }

    pub fn validate(&self, env: &mut ValidatorEnvironment) -> Result<(), String> {
        if !env.service_exists(&self.name) {
            return Err(format!(
                "service '{}' does not exist in the environment",
                self.name
            ));
        }
        Ok(())
    }

    pub async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<String, ExecError> {
        if !ctx.dry_run {
            let name = ctx
                .store
                .render_str(&self.name)
                .map_err(|e| ExecError::failed(e.to_string()))?;
            ctx.backend.start_service(&name).await.map_err(|e| {
                ExecError::failed(format!("failed to start service '{}': {}", name, e))
            })?;
        }
        Ok(format!("Service '{}' started", self.name))
    }
}
