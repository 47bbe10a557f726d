//! MJ-001: Core data model — script values, service configs, plans, runs.
//!
//! Everything the three run phases exchange lives here: the closed value
//! type scripts are made of, the per-service configuration, the immutable
//! plan, and the terminal run result.

use crate::core::error::{ExecutionError, InterpretationError, SourcePosition, ValidationError};
use crate::instructions::Instruction;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default width of an instruction's internal fan-out.
pub const DEFAULT_PARALLELISM: usize = 4;

// ============================================================================
// Script values
// ============================================================================

/// A value as it appears in a script argument: YAML scalars, lists, and
/// string-keyed dicts. Closed on purpose so binding and rendering are
/// exhaustive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<ScriptValue>),
    Dict(IndexMap<String, ScriptValue>),
}

impl ScriptValue {
    /// Convert a YAML node into a script value. Floats and non-string keys
    /// have no place in a script and are rejected.
    pub fn from_yaml(value: &serde_yaml_ng::Value) -> Result<Self, String> {
        match value {
            serde_yaml_ng::Value::Null => Ok(Self::Null),
            serde_yaml_ng::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_yaml_ng::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .ok_or_else(|| format!("unsupported numeric value: {}", n)),
            serde_yaml_ng::Value::String(s) => Ok(Self::Str(s.clone())),
            serde_yaml_ng::Value::Sequence(seq) => {
                let items = seq.iter().map(Self::from_yaml).collect::<Result<_, _>>()?;
                Ok(Self::List(items))
            }
            serde_yaml_ng::Value::Mapping(map) => {
                let mut dict = IndexMap::new();
                for (k, v) in map {
                    let key = k
                        .as_str()
                        .ok_or_else(|| "dict keys must be strings".to_string())?;
                    dict.insert(key.to_string(), Self::from_yaml(v)?);
                }
                Ok(Self::Dict(dict))
            }
            serde_yaml_ng::Value::Tagged(_) => Err("YAML tags are not supported".to_string()),
        }
    }

    /// JSON projection, used for typed re-parsing (service configs) and for
    /// the assertion trace rendering.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::Number((*i).into()),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Dict(dict) => serde_json::Value::Object(
                dict.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::Null => Ok(Self::Null),
            serde_json::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .ok_or_else(|| format!("unsupported numeric value: {}", n)),
            serde_json::Value::String(s) => Ok(Self::Str(s.clone())),
            serde_json::Value::Array(items) => {
                let items = items.iter().map(Self::from_json).collect::<Result<_, _>>()?;
                Ok(Self::List(items))
            }
            serde_json::Value::Object(map) => {
                let mut dict = IndexMap::new();
                for (k, v) in map {
                    dict.insert(k.clone(), Self::from_json(v)?);
                }
                Ok(Self::Dict(dict))
            }
        }
    }

    /// Render for embedding inside a larger string: strings stay unquoted,
    /// everything else uses the canonical rendering.
    pub fn to_plain_string(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
        }
    }
}

impl fmt::Display for ScriptValue {
    /// Canonical rendering: JSON-shaped, deterministic, used for plan
    /// previews and assertion traces.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Dict(dict) => {
                write!(f, "{{")?;
                for (i, (k, v)) in dict.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

// ============================================================================
// Durations
// ============================================================================

/// Parse a wait/interval string such as `500ms`, `30s`, `2m`, or `1h`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{}' is missing a unit", s))?;
    let (digits, unit) = s.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;
    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        _ => Err(format!("unknown duration unit '{}' in '{}'", unit, s)),
    }
}

// ============================================================================
// Service configuration
// ============================================================================

fn default_method() -> String {
    "GET".to_string()
}

fn default_interval() -> String {
    "1s".to_string()
}

fn default_ready_timeout() -> String {
    "15s".to_string()
}

fn default_expected_status() -> u16 {
    200
}

/// Desired configuration for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Container image to run.
    pub image: String,

    /// Environment variables.
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// CPU allocation in millicpus. 0 means unlimited.
    #[serde(default)]
    pub cpu_allocation: u64,

    /// Memory allocation in megabytes. 0 means unlimited.
    #[serde(default)]
    pub memory_allocation: u64,

    /// HTTP readiness check polled after the service starts.
    #[serde(default)]
    pub ready_conditions: Option<ReadyCondition>,
}

/// HTTP poll-until-ready condition for a freshly added service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadyCondition {
    /// Which declared port to hit.
    pub port_id: String,

    /// Request path.
    pub endpoint: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub content_type: String,

    #[serde(default)]
    pub body: String,

    /// Delay between poll attempts.
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Total budget before the check fails.
    #[serde(default = "default_ready_timeout")]
    pub timeout: String,

    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

impl ServiceConfig {
    /// Canonical single-line rendering for plan previews.
    pub fn render(&self) -> String {
        let mut parts = vec![format!("image={:?}", self.image)];
        if self.cpu_allocation > 0 {
            parts.push(format!("cpu_allocation={}", self.cpu_allocation));
        }
        if self.memory_allocation > 0 {
            parts.push(format!("memory_allocation={}", self.memory_allocation));
        }
        if let Some(ref ready) = self.ready_conditions {
            parts.push(format!(
                "ready_conditions=ReadyCondition(port_id={:?}, endpoint={:?})",
                ready.port_id, ready.endpoint
            ));
        }
        format!("ServiceConfig({})", parts.join(", "))
    }
}

// ============================================================================
// Plan
// ============================================================================

/// One bound instruction with its source attribution.
#[derive(Debug, Clone)]
pub struct PlannedInstruction {
    pub position: SourcePosition,
    pub instruction: Instruction,
}

/// The ordered, immutable sequence of bound instructions produced by
/// interpretation. Owned exclusively by one run.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub instructions: Vec<PlannedInstruction>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Canonical renderings of every instruction, in plan order.
    pub fn preview(&self) -> Vec<String> {
        self.instructions
            .iter()
            .map(|p| p.instruction.render())
            .collect()
    }
}

// ============================================================================
// Run lifecycle
// ============================================================================

/// Phases of a run. A run is single-shot: once a terminal phase is reached
/// it cannot be re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Created,
    Interpreting,
    Interpreted,
    InterpretationFailed,
    Validating,
    Validated,
    ValidationFailed,
    Executing,
    Completed,
    ExecutionFailed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::InterpretationFailed
                | Self::ValidationFailed
                | Self::Completed
                | Self::ExecutionFailed
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Interpreting => "interpreting",
            Self::Interpreted => "interpreted",
            Self::InterpretationFailed => "interpretation failed",
            Self::Validating => "validating",
            Self::Validated => "validated",
            Self::ValidationFailed => "validation failed",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::ExecutionFailed => "execution failed",
        };
        write!(f, "{}", s)
    }
}

/// Experimental behavior toggles threaded through Execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureFlag {
    /// Skip readiness polling in `add_services`. Useful for fast local
    /// iteration when the services' health endpoints are known-good.
    SkipReadyChecks,
}

/// Immutable snapshot of a terminal run. At most one of the three error
/// slots is populated; the trace accumulated up to termination is always
/// preserved.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub phase: RunPhase,
    pub interpretation_error: Option<InterpretationError>,
    pub validation_errors: Vec<ValidationError>,
    pub execution_error: Option<ExecutionError>,
    /// Value of the flow's last invocation, as interpreted (markers resolved
    /// where execution produced them).
    pub return_value: ScriptValue,
    /// Cumulative trace output, in strict plan order.
    pub run_output: String,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.interpretation_error.is_none()
            && self.validation_errors.is_empty()
            && self.execution_error.is_none()
    }
}
