//! MJ-012: `stop_service`.

use super::{bind_args, ArgKind, ArgSpec, Arguments, ExecutionContext};
use crate::core::error::ExecError;
use crate::core::types::ScriptValue;
use crate::core::validator::ValidatorEnvironment;

const SCHEMA: &[ArgSpec] = &[ArgSpec::required("name", ArgKind::Str)];

#[derive(Debug, Clone)]
pub struct StopService {
    pub name: String,
}

impl StopService {
    pub fn bind(args: Arguments) -> Result<Self, String> {
        let bound = bind_args("stop_service", SCHEMA, args)?;
        let name = match bound.get("name").and_then(ScriptValue::as_str) {
            Some(name) => name.to_string(),
            None => return Err("missing required argument 'name' for 'stop_service'".to_string()),
        };
        Ok(Self { name })
    }

    pub fn render(&self) -> String {
        format!("stop_service(name={:?})", self.name)
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
            ctx.backend.stop_service(&name).await.map_err(|e| {
                ExecError::failed(format!("failed to stop service '{}': {}", name, e))
            })?;
        }
        Ok(format!("Service '{}' stopped", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn test_mj012_bind_and_render() {
        let args = Arguments {
            positional: vec![ScriptValue::Str("api".into())],
            kwargs: IndexMap::new(),
        };
        let instr = StopService::bind(args).unwrap();
        assert_eq!(instr.render(), "stop_service(name=\"api\")");
    }

    #[test]
    fn test_mj012_validate_requires_existing_service() {
        let args = Arguments {
            positional: vec![ScriptValue::Str("db".into())],
            kwargs: IndexMap::new(),
        };
        let instr = StopService::bind(args).unwrap();
        let mut env = ValidatorEnvironment::default();
        assert!(instr.validate(&mut env).is_err());
        env.add_service("db");
        assert!(instr.validate(&mut env).is_ok());
    }
}
