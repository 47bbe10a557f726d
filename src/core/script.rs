//! MJ-002: Script front-end — YAML scripts and package directories.
//!
//! The engine itself consumes an ordered sequence of builtin invocations;
//! this module is the thin front-end that produces one from a YAML script.
//! A script has a `name`, declared `params`, a default `run` flow, and
//! optional additional named flows. Package directories hold several script
//! files; the `main_file` override selects the entry file.

use crate::core::error::{InterpretationError, SourcePosition};
use crate::core::types::ScriptValue;
use crate::instructions::Arguments;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_FLOW: &str = "run";
pub const DEFAULT_MAIN_FILE: &str = "main.yaml";

/// Where a script comes from.
#[derive(Debug, Clone)]
pub enum ScriptSource {
    /// A single YAML file.
    File(PathBuf),
    /// A package directory containing one or more YAML files.
    Dir(PathBuf),
    /// Inline YAML, used by tests and the API.
    Literal(String),
}

/// One builtin call as written in YAML: a single-key map from builtin name
/// to its body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawCall(pub IndexMap<String, CallBody>);

/// Body of one call: optional `id` for later runtime references, optional
/// positional `args`, and everything else as keyword arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallBody {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub args: Vec<serde_yaml_ng::Value>,

    #[serde(flatten)]
    pub kwargs: IndexMap<String, serde_yaml_ng::Value>,
}

/// A parsed script file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptFile {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Declared parameters with their defaults. A null default marks the
    /// parameter as required.
    #[serde(default)]
    pub params: IndexMap<String, serde_yaml_ng::Value>,

    /// The default flow.
    #[serde(default)]
    pub run: Vec<RawCall>,

    /// Additional named flows, selectable via the function-name override.
    #[serde(default)]
    pub flows: IndexMap<String, Vec<RawCall>>,
}

/// One invocation, position-stamped and converted to script values.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub name: String,
    pub id: Option<String>,
    pub position: SourcePosition,
    pub args: Arguments,
}

/// Load a script from its source. For a directory source, `main_file`
/// selects the entry file (default `main.yaml`).
pub fn load(
    source: &ScriptSource,
    main_file: Option<&str>,
) -> Result<ScriptFile, InterpretationError> {
    let text = match source {
        ScriptSource::Literal(text) => text.clone(),
        ScriptSource::File(path) => std::fs::read_to_string(path).map_err(|e| {
            InterpretationError::new(format!("cannot read script '{}': {}", path.display(), e))
        })?,
        ScriptSource::Dir(dir) => {
            let entry = dir.join(main_file.unwrap_or(DEFAULT_MAIN_FILE));
            std::fs::read_to_string(&entry).map_err(|e| {
                InterpretationError::new(format!(
                    "cannot read package entry file '{}': {}",
                    entry.display(),
                    e
                ))
            })?
        }
    };
    parse(&text)
}

/// Parse YAML script text.
pub fn parse(text: &str) -> Result<ScriptFile, InterpretationError> {
    serde_yaml_ng::from_str(text)
        .map_err(|e| InterpretationError::new(format!("malformed script: {}", e)))
}

/// Select a flow by name. `None` selects the default `run` flow.
pub fn select_flow<'a>(
    script: &'a ScriptFile,
    function_name: Option<&str>,
) -> Result<&'a [RawCall], InterpretationError> {
    let name = function_name.unwrap_or(DEFAULT_FLOW);
    if name == DEFAULT_FLOW {
        if !script.run.is_empty() {
            return Ok(&script.run);
        }
        // An absent or empty default flow is a valid, empty plan.
        return Ok(script
            .flows
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&script.run));
    }
    script
        .flows
        .get(name)
        .map(Vec::as_slice)
        .ok_or_else(|| InterpretationError::new(format!("script has no flow named '{}'", name)))
}

/// Convert raw calls into position-stamped invocations.
pub fn invocations(calls: &[RawCall]) -> Result<Vec<Invocation>, InterpretationError> {
    let mut result = Vec::with_capacity(calls.len());
    for (index, call) in calls.iter().enumerate() {
        let position = SourcePosition::at(index);
        if call.0.len() != 1 {
            return Err(InterpretationError::at(
                position,
                format!(
                    "each call must name exactly one builtin, got {}",
                    call.0.len()
                ),
            ));
        }
        let (name, body) = match call.0.iter().next() {
            Some(entry) => entry,
            None => continue,
        };

        let mut positional = Vec::with_capacity(body.args.len());
        for value in &body.args {
            positional.push(
                ScriptValue::from_yaml(value)
                    .map_err(|e| InterpretationError::at(position, e))?,
            );
        }
        let mut kwargs = IndexMap::new();
        for (key, value) in &body.kwargs {
            kwargs.insert(
                key.clone(),
                ScriptValue::from_yaml(value)
                    .map_err(|e| InterpretationError::at(position, e))?,
            );
        }

        result.push(Invocation {
            name: name.clone(),
            id: body.id.clone(),
            position,
            args: Arguments { positional, kwargs },
        });
    }
    Ok(result)
}

/// Merge declared parameter defaults with the serialized JSON params passed
/// to Interpret. Provided params win; a parameter left at its null default
/// stays null and fails at its first use site.
pub fn merge_params(
    script: &ScriptFile,
    serialized_params: Option<&str>,
) -> Result<IndexMap<String, ScriptValue>, InterpretationError> {
    let mut merged = IndexMap::new();
    for (name, default) in &script.params {
        merged.insert(
            name.clone(),
            ScriptValue::from_yaml(default).map_err(InterpretationError::new)?,
        );
    }

    if let Some(serialized) = serialized_params {
        if !serialized.trim().is_empty() {
            let provided: serde_json::Value = serde_json::from_str(serialized).map_err(|e| {
                InterpretationError::new(format!("malformed serialized params: {}", e))
            })?;
            let object = provided.as_object().ok_or_else(|| {
                InterpretationError::new("serialized params must be a JSON object".to_string())
            })?;
            for (name, value) in object {
                merged.insert(
                    name.clone(),
                    ScriptValue::from_json(value).map_err(InterpretationError::new)?,
                );
            }
        }
    }

    Ok(merged)
}
