//! MJ-008: Instruction variants — the typed units of a plan.
//!
//! Every builtin a script can call is one variant of the closed
//! [`Instruction`] enum, so validator and executor dispatch are exhaustive.
//! Binding maps an invocation's positional/keyword arguments onto the
//! variant's declared schema, with defaults applied and mismatches reported
//! as interpretation failures.

pub mod add_services;
pub mod assert;
pub mod print;
pub mod remove_service;
pub mod run_sh;
pub mod start_service;
pub mod stop_service;
pub mod upload_files;

use crate::backend::EnvironmentBackend;
use crate::core::error::ExecError;
use crate::core::types::{FeatureFlag, ScriptValue};
use crate::core::validator::ValidatorEnvironment;
use crate::core::values::RuntimeValueStore;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use add_services::AddServices;
pub use assert::Assert;
pub use print::Print;
pub use remove_service::RemoveService;
pub use run_sh::RunSh;
pub use start_service::StartService;
pub use stop_service::StopService;
pub use upload_files::UploadFiles;

/// Builtin names the plan builder accepts, in registry order.
pub const KNOWN_BUILTINS: &[&str] = &[
    "add_services",
    "remove_service",
    "start_service",
    "stop_service",
    "upload_files",
    "run_sh",
    "assert",
    "print",
];

/// Everything an instruction needs while executing.
pub struct ExecutionContext<'a> {
    pub backend: &'a Arc<dyn EnvironmentBackend>,
    pub store: &'a RuntimeValueStore,
    pub dry_run: bool,
    pub parallelism: usize,
    pub features: &'a [FeatureFlag],
    pub cancel: &'a CancellationToken,
}

impl ExecutionContext<'_> {
    pub fn has_feature(&self, flag: FeatureFlag) -> bool {
        self.features.contains(&flag)
    }
}

/// One typed operation in a plan.
#[derive(Debug, Clone)]
pub enum Instruction {
    AddServices(AddServices),
    RemoveService(RemoveService),
    StartService(StartService),
    StopService(StopService),
    UploadFiles(UploadFiles),
    RunSh(RunSh),
    Assert(Assert),
    Print(Print),
}

impl Instruction {
    pub fn builtin_name(&self) -> &'static str {
        match self {
            Self::AddServices(_) => "add_services",
            Self::RemoveService(_) => "remove_service",
            Self::StartService(_) => "start_service",
            Self::StopService(_) => "stop_service",
            Self::UploadFiles(_) => "upload_files",
            Self::RunSh(_) => "run_sh",
            Self::Assert(_) => "assert",
            Self::Print(_) => "print",
        }
    }

    /// Canonical rendering for plan previews and idempotent re-serialization.
    pub fn render(&self) -> String {
        match self {
            Self::AddServices(i) => i.render(),
            Self::RemoveService(i) => i.render(),
            Self::StartService(i) => i.render(),
            Self::StopService(i) => i.render(),
            Self::UploadFiles(i) => i.render(),
            Self::RunSh(i) => i.render(),
            Self::Assert(i) => i.render(),
            Self::Print(i) => i.render(),
        }
    }

    /// Check preconditions against the projected environment. Read-only with
    /// respect to live Environment State; only the projection is updated.
    pub fn validate(&self, env: &mut ValidatorEnvironment) -> Result<(), String> {
        match self {
            Self::AddServices(i) => i.validate(env),
            Self::RemoveService(i) => i.validate(env),
            Self::StartService(i) => i.validate(env),
            Self::StopService(i) => i.validate(env),
            Self::UploadFiles(i) => i.validate(env),
            Self::RunSh(i) => i.validate(env),
            Self::Assert(i) => i.validate(env),
            Self::Print(i) => i.validate(env),
        }
    }

    /// Execute the effect and return the instruction's trace fragment.
    pub async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<String, ExecError> {
        match self {
            Self::AddServices(i) => i.execute(ctx).await,
            Self::RemoveService(i) => i.execute(ctx).await,
            Self::StartService(i) => i.execute(ctx).await,
            Self::StopService(i) => i.execute(ctx).await,
            Self::UploadFiles(i) => i.execute(ctx).await,
            Self::RunSh(i) => i.execute(ctx).await,
            Self::Assert(i) => i.execute(ctx).await,
            Self::Print(i) => i.execute(ctx).await,
        }
    }
}

/// Bind one invocation to its variant. Returns the bound instruction and its
/// interpretation-time value (`Null` when the variant produces none).
pub async fn bind_invocation(
    name: &str,
    args: Arguments,
    store: &RuntimeValueStore,
    backend: &Arc<dyn EnvironmentBackend>,
) -> Result<(Instruction, ScriptValue), String> {
    match name {
        "add_services" => AddServices::bind(args, store)
            .map(|(i, v)| (Instruction::AddServices(i), v)),
        "remove_service" => RemoveService::bind(args, store)
            .map(|(i, v)| (Instruction::RemoveService(i), v)),
        "start_service" => {
            StartService::bind(args).map(|i| (Instruction::StartService(i), ScriptValue::Null))
        }
        "stop_service" => {
            StopService::bind(args).map(|i| (Instruction::StopService(i), ScriptValue::Null))
        }
        "upload_files" => UploadFiles::bind(args, store, backend)
            .await
            .map(|(i, v)| (Instruction::UploadFiles(i), v)),
        "run_sh" => RunSh::bind(args, store).map(|(i, v)| (Instruction::RunSh(i), v)),
        "assert" => Assert::bind(args).map(|i| (Instruction::Assert(i), ScriptValue::Null)),
        "print" => Print::bind(args).map(|i| (Instruction::Print(i), ScriptValue::Null)),
        other => Err(format!("unknown instruction '{}'", other)),
    }
}

// ============================================================================
// Argument binding
// ============================================================================

/// Raw arguments of one invocation, before schema binding.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    pub positional: Vec<ScriptValue>,
    pub kwargs: IndexMap<String, ScriptValue>,
}

/// Expected type of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Any,
    Str,
    Int,
    Bool,
    List,
    Dict,
}

impl ArgKind {
    fn accepts(self, value: &ScriptValue) -> bool {
        match self {
            Self::Any => true,
            Self::Str => matches!(value, ScriptValue::Str(_)),
            Self::Int => matches!(value, ScriptValue::Int(_)),
            Self::Bool => matches!(value, ScriptValue::Bool(_)),
            Self::List => matches!(value, ScriptValue::List(_)),
            Self::Dict => matches!(value, ScriptValue::Dict(_)),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Str => "string",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Dict => "dict",
        }
    }
}

/// One entry of a variant's argument schema, in positional order.
#[derive(Debug, Clone, Copy)]
pub struct ArgSpec {
    pub name: &'static str,
    pub required: bool,
    pub kind: ArgKind,
}

impl ArgSpec {
    pub const fn required(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            required: true,
            kind,
        }
    }

    pub const fn optional(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            required: false,
            kind,
        }
    }
}

/// Bind positional and keyword arguments against a schema. The result maps
/// argument names to values; omitted optional arguments are simply absent
/// (variants apply their declared defaults when extracting).
pub fn bind_args(
    builtin: &str,
    schema: &[ArgSpec],
    args: Arguments,
) -> Result<IndexMap<String, ScriptValue>, String> {
    if args.positional.len() > schema.len() {
        return Err(format!(
            "unexpected argument: '{}' accepts at most {} positional argument(s), got {}",
            builtin,
            schema.len(),
            args.positional.len()
        ));
    }

    let mut bound = IndexMap::new();
    for (spec, value) in schema.iter().zip(args.positional.into_iter()) {
        bound.insert(spec.name.to_string(), value);
    }

    for (name, value) in args.kwargs {
        if !schema.iter().any(|spec| spec.name == name) {
            return Err(format!("unexpected argument '{}' for '{}'", name, builtin));
        }
        if bound.contains_key(&name) {
            return Err(format!(
                "argument '{}' for '{}' given both positionally and by keyword",
                name, builtin
            ));
        }
        bound.insert(name, value);
    }

    for spec in schema {
        match bound.get(spec.name) {
            Some(value) => {
                if !spec.kind.accepts(value) {
                    return Err(format!(
                        "type mismatch for argument '{}' of '{}': expected {}, got {}",
                        spec.name,
                        builtin,
                        spec.kind.name(),
                        value.type_name()
                    ));
                }
            }
            None => {
                if spec.required {
                    return Err(format!(
                        "missing required argument '{}' for '{}'",
                        spec.name, builtin
                    ));
                }
            }
        }
    }

    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &[ArgSpec] = &[
        ArgSpec::required("run", ArgKind::Str),
        ArgSpec::optional("wait", ArgKind::Str),
    ];

    #[test]
    fn test_mj008_bind_positional() {
        let args = Arguments {
            positional: vec![ScriptValue::Str("echo hi".into())],
            kwargs: IndexMap::new(),
        };
        let bound = bind_args("run_sh", SCHEMA, args).unwrap();
        assert_eq!(bound["run"], ScriptValue::Str("echo hi".into()));
        assert!(!bound.contains_key("wait"));
    }

    #[test]
    fn test_mj008_bind_keyword() {
        let mut kwargs = IndexMap::new();
        kwargs.insert("run".to_string(), ScriptValue::Str("echo hi".into()));
        kwargs.insert("wait".to_string(), ScriptValue::Str("30s".into()));
        let args = Arguments {
            positional: vec![],
            kwargs,
        };
        let bound = bind_args("run_sh", SCHEMA, args).unwrap();
        assert_eq!(bound["wait"], ScriptValue::Str("30s".into()));
    }

    #[test]
    fn test_mj008_missing_required() {
        let err = bind_args("run_sh", SCHEMA, Arguments::default()).unwrap_err();
        assert_eq!(err, "missing required argument 'run' for 'run_sh'");
    }

    #[test]
    fn test_mj008_unexpected_kwarg() {
        let mut kwargs = IndexMap::new();
        kwargs.insert("run".to_string(), ScriptValue::Str("x".into()));
        kwargs.insert("bogus".to_string(), ScriptValue::Int(1));
        let err = bind_args(
            "run_sh",
            SCHEMA,
            Arguments {
                positional: vec![],
                kwargs,
            },
        )
        .unwrap_err();
        assert_eq!(err, "unexpected argument 'bogus' for 'run_sh'");
    }

    #[test]
    fn test_mj008_too_many_positional() {
        let args = Arguments {
            positional: vec![
                ScriptValue::Str("a".into()),
                ScriptValue::Str("b".into()),
                ScriptValue::Str("c".into()),
            ],
            kwargs: IndexMap::new(),
        };
        let err = bind_args("run_sh", SCHEMA, args).unwrap_err();
        assert!(err.starts_with("unexpected argument"));
    }

    #[test]
    fn test_mj008_duplicate_positional_and_keyword() {
        let mut kwargs = IndexMap::new();
        kwargs.insert("run".to_string(), ScriptValue::Str("dup".into()));
        let args = Arguments {
            positional: vec![ScriptValue::Str("echo hi".into())],
            kwargs,
        };
        let err = bind_args("run_sh", SCHEMA, args).unwrap_err();
        assert!(err.contains("both positionally and by keyword"));
    }

    #[test]
    fn test_mj008_registry_has_no_duplicates() {
        let unique: std::collections::BTreeSet<_> = KNOWN_BUILTINS.iter().collect();
        assert_eq!(unique.len(), KNOWN_BUILTINS.len());
    }

    #[test]
    fn test_mj008_type_mismatch() {
        let args = Arguments {
            positional: vec![ScriptValue::Int(7)],
            kwargs: IndexMap::new(),
        };
        let err = bind_args("run_sh", SCHEMA, args).unwrap_err();
        assert_eq!(
            err,
            "type mismatch for argument 'run' of 'run_sh': expected string, got int"
        );
    }
}
