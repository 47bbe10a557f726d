//! MJ-016: `print` — append a message to the run trace.

use super::{bind_args, ArgKind, ArgSpec, Arguments, ExecutionContext};
use crate::core::error::ExecError;
use crate::core::types::ScriptValue;
use crate::core::validator::ValidatorEnvironment;

const SCHEMA: &[ArgSpec] = &[ArgSpec::required("msg", ArgKind::Any)];

#[derive(Debug, Clone)]
pub struct Print {
    pub msg: ScriptValue,
}

impl Print {
    pub fn bind(args: Arguments) -> Result<Self, String> {
        let mut bound = bind_args("print", SCHEMA, args)?;
        let msg = bound
            .shift_remove("msg")
            .ok_or_else(|| "missing required argument 'msg' for 'print'".to_string())?;
        Ok(Self { msg })
    }

    pub fn render(&self) -> String {
        format!("print(msg={})", self.msg)
    }

    pub fn validate(&self, _env: &mut ValidatorEnvironment) -> Result<(), String> {
        Ok(())
    }

    pub async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<String, ExecError> {
        if ctx.dry_run {
            return Ok(ctx.store.render_value_lenient(&self.msg).to_plain_string());
        }
        let rendered = ctx
            .store
            .render_value(&self.msg)
            .map_err(|e| ExecError::failed(e.to_string()))?;
        Ok(rendered.to_plain_string())
    }
}
