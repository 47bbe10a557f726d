//! MJ-004: Plan builder — pure interpretation of invocations into a plan.
//!
//! Resolves `{{params.*}}` templates, rewrites `{{runtime.<id>.<field>}}`
//! references onto freshly minted value-store ids (backward references
//! only), binds each invocation against its variant's schema, and collects
//! the bound instructions into an ordered plan. No Environment State is
//! mutated here; the only backend call permitted is unique-name generation
//! for nameless uploads.

use crate::backend::EnvironmentBackend;
use crate::core::error::InterpretationError;
use crate::core::script::Invocation;
use crate::core::types::{Plan, PlannedInstruction, ScriptValue};
use crate::core::values::{RuntimeValueStore, ValueId};
use crate::instructions::{self, Arguments};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What interpretation hands to the later phases.
#[derive(Debug)]
pub struct InterpretationOutput {
    pub plan: Plan,
    /// Value of the flow's last invocation; `Null` when the flow is empty or
    /// its last builtin produces nothing.
    pub return_value: ScriptValue,
}

/// Build a plan from an ordered invocation sequence.
pub async fn build_plan(
    invocations: Vec<Invocation>,
    params: &IndexMap<String, ScriptValue>,
    store: &RuntimeValueStore,
    backend: &Arc<dyn EnvironmentBackend>,
) -> Result<InterpretationOutput, InterpretationError> {
    let mut aliases: HashMap<String, ValueId> = HashMap::new();
    let mut plan = Plan::default();
    let mut return_value = ScriptValue::Null;

    for invocation in invocations {
        let position = invocation.position;

        let args = Arguments {
            positional: invocation
                .args
                .positional
                .iter()
                .map(|v| resolve_value(v, params, &aliases))
                .collect::<Result<_, _>>()
                .map_err(|e| InterpretationError::at(position, e))?,
            kwargs: invocation
                .args
                .kwargs
                .iter()
                .map(|(k, v)| resolve_value(v, params, &aliases).map(|v| (k.clone(), v)))
                .collect::<Result<_, _>>()
                .map_err(|e| InterpretationError::at(position, e))?,
        };

        let (instruction, interp_value) =
            instructions::bind_invocation(&invocation.name, args, store, backend)
                .await
                .map_err(|e| InterpretationError::at(position, e))?;

        if let Some(id) = invocation.id {
            if aliases.contains_key(&id) {
                return Err(InterpretationError::at(
                    position,
                    format!("duplicate invocation id '{}'", id),
                ));
            }
            if let Some(value_id) = produced_value_id(&instruction) {
                aliases.insert(id, value_id);
            }
        }

        debug!(
            builtin = invocation.name.as_str(),
            index = position.index,
            "bound instruction"
        );
        return_value = interp_value;
        plan.instructions.push(PlannedInstruction {
            position,
            instruction,
        });
    }

    Ok(InterpretationOutput { plan, return_value })
}

fn produced_value_id(instruction: &instructions::Instruction) -> Option<ValueId> {
    use instructions::Instruction;
    match instruction {
        Instruction::AddServices(i) => Some(i.value_id),
        Instruction::RemoveService(i) => Some(i.value_id),
        Instruction::UploadFiles(i) => Some(i.value_id),
        Instruction::RunSh(i) => Some(i.value_id),
        Instruction::StartService(_)
        | Instruction::StopService(_)
        | Instruction::Assert(_)
        | Instruction::Print(_) => None,
    }
}

/// Resolve templates in one argument value. `{{params.x}}` substitutes the
/// parameter (typed when the string is exactly one template); runtime
/// references are rewritten onto store ids.
fn resolve_value(
    value: &ScriptValue,
    params: &IndexMap<String, ScriptValue>,
    aliases: &HashMap<String, ValueId>,
) -> Result<ScriptValue, String> {
    match value {
        ScriptValue::Str(s) => resolve_str(s, params, aliases),
        ScriptValue::List(items) => {
            let items = items
                .iter()
                .map(|v| resolve_value(v, params, aliases))
                .collect::<Result<_, _>>()?;
            Ok(ScriptValue::List(items))
        }
        ScriptValue::Dict(dict) => {
            let mut resolved = IndexMap::new();
            for (k, v) in dict {
                resolved.insert(k.clone(), resolve_value(v, params, aliases)?);
            }
            Ok(ScriptValue::Dict(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_str(
    s: &str,
    params: &IndexMap<String, ScriptValue>,
    aliases: &HashMap<String, ValueId>,
) -> Result<ScriptValue, String> {
    // A string that is exactly one param template keeps the param's type.
    if let Some(key) = exact_template(s) {
        if let Some(param) = key.strip_prefix("params.") {
            return lookup_param(param, params).cloned();
        }
    }

    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        result.push_str(&rest[..open]);
        let after = &rest[open..];
        let close = after
            .find("}}")
            .ok_or_else(|| format!("unclosed template in '{}'", s))?;
        let key = after[2..close].trim();

        if let Some(param) = key.strip_prefix("params.") {
            result.push_str(&lookup_param(param, params)?.to_plain_string());
        } else if let Some(reference) = key.strip_prefix("runtime.") {
            let (alias, field) = reference
                .split_once('.')
                .ok_or_else(|| format!("invalid runtime reference '{{{{{}}}}}'", key))?;
            let value_id = aliases
                .get(alias)
                .ok_or_else(|| format!("reference to unknown runtime value '{}'", alias))?;
            result.push_str(&RuntimeValueStore::marker(*value_id, field));
        } else {
            return Err(format!("unknown template variable '{}'", key));
        }
        rest = &after[close + 2..];
    }
    result.push_str(rest);
    Ok(ScriptValue::Str(result))
}

fn lookup_param<'a>(
    name: &str,
    params: &'a IndexMap<String, ScriptValue>,
) -> Result<&'a ScriptValue, String> {
    match params.get(name) {
        Some(ScriptValue::Null) => Err(format!("required param '{}' was not provided", name)),
        Some(value) => Ok(value),
        None => Err(format!("unknown param '{}'", name)),
    }
}

/// Some(key) when `s` is `{{key}}` and nothing else.
fn exact_template(s: &str) -> Option<&str> {
    let body = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if body.contains("{{") || body.contains("}}") {
        return None;
    }
    Some(body.trim())
}
