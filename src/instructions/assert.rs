//! MJ-015: `assert` — compare a (usually runtime) value against a target.

use super::{bind_args, ArgKind, ArgSpec, Arguments, ExecutionContext};
use crate::core::error::ExecError;
use crate::core::types::ScriptValue;
use crate::core::validator::ValidatorEnvironment;

const SCHEMA: &[ArgSpec] = &[
    ArgSpec::required("value", ArgKind::Any),
    ArgSpec::required("assertion", ArgKind::Str),
    ArgSpec::required("target_value", ArgKind::Any),
];

const OPERATORS: &[&str] = &["==", "!=", ">=", "<=", ">", "<"];

#[derive(Debug, Clone)]
pub struct Assert {
    pub value: ScriptValue,
    pub assertion: String,
    pub target: ScriptValue,
}

impl Assert {
    pub fn bind(args: Arguments) -> Result<Self, String> {
        let mut bound = bind_args("assert", SCHEMA, args)?;
        let assertion = match bound.get("assertion").and_then(ScriptValue::as_str) {
            Some(op) => op.to_string(),
            None => return Err("missing required argument 'assertion' for 'assert'".to_string()),
        };
        if !OPERATORS.contains(&assertion.as_str()) {
            return Err(format!(
                "invalid assertion '{}' (expected one of {})",
                assertion,
                OPERATORS.join(", ")
            ));
        }
        let value = bound
            .shift_remove("value")
            .ok_or_else(|| "missing required argument 'value' for 'assert'".to_string())?;
        let target = bound
            .shift_remove("target_value")
            .ok_or_else(|| "missing required argument 'target_value' for 'assert'".to_string())?;
        Ok(Self {
            value,
            assertion,
            target,
        })
    }

    pub fn render(&self) -> String {
        format!(
            "assert(value={}, assertion={:?}, target_value={})",
            self.value, self.assertion, self.target
        )
    }

    pub fn validate(&self, _env: &mut ValidatorEnvironment) -> Result<(), String> {
        Ok(())
    }

    pub async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<String, ExecError> {
        if ctx.dry_run {
            let symbolic = ctx.store.render_value_lenient(&self.value);
            return Ok(format!("Assertion succeeded. Value is '{}'.", symbolic));
        }

        let value = ctx
            .store
            .render_value(&self.value)
            .map_err(|e| ExecError::failed(e.to_string()))?;
        let target = ctx
            .store
            .render_value(&self.target)
            .map_err(|e| ExecError::failed(e.to_string()))?;

        let holds = evaluate(&value, &self.assertion, &target)?;
        if !holds {
            return Err(ExecError::failed(format!(
                "assertion failed: value '{}' {} target '{}'",
                value, self.assertion, target
            )));
        }
        Ok(format!("Assertion succeeded. Value is '{}'.", value))
    }
}

/// Evaluate `value <op> target`. Numeric comparison applies when both sides
/// are ints or int-parseable strings; equality falls back to structural
/// comparison.
fn evaluate(value: &ScriptValue, op: &str, target: &ScriptValue) -> Result<bool, ExecError> {
    let numeric = as_int_pair(value, target);
    match op {
        "==" => Ok(match numeric {
            Some((a, b)) => a == b,
            None => value == target,
        }),
        "!=" => Ok(match numeric {
            Some((a, b)) => a != b,
            None => value != target,
        }),
        _ => {
            let (a, b) = numeric.ok_or_else(|| {
                ExecError::failed(format!(
                    "cannot order-compare '{}' and '{}' with '{}'",
                    value, target, op
                ))
            })?;
            Ok(match op {
                ">=" => a >= b,
                "<=" => a <= b,
                ">" => a > b,
                "<" => a < b,
                _ => false,
            })
        }
    }
}

fn as_int(value: &ScriptValue) -> Option<i64> {
    match value {
        ScriptValue::Int(i) => Some(*i),
        ScriptValue::Str(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_int_pair(a: &ScriptValue, b: &ScriptValue) -> Option<(i64, i64)> {
    Some((as_int(a)?, as_int(b)?))
}
