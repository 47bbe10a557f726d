//! MJ-014: `run_sh` — one shell task with stored outputs and file mounts.
//!
//! Produces three kinds of runtime values: the exit code, the combined
//! output, and one artifact name per store path. A command that outlives its
//! wait budget fails with the backend's timeout message and contributes
//! nothing to the trace.

use super::{bind_args, ArgKind, ArgSpec, Arguments, ExecutionContext};
use crate::backend::BackendError;
use crate::core::error::ExecError;
use crate::core::types::{parse_duration, ScriptValue};
use crate::core::validator::ValidatorEnvironment;
use crate::core::values::{RuntimeValueStore, ValueId};
use indexmap::IndexMap;

pub const DEFAULT_TASK_IMAGE: &str = "badouralix/curl-jq";
pub const DEFAULT_WAIT: &str = "180s";

const SCHEMA: &[ArgSpec] = &[
    ArgSpec::required("run", ArgKind::Str),
    ArgSpec::optional("image", ArgKind::Str),
    ArgSpec::optional("store", ArgKind::List),
    ArgSpec::optional("files", ArgKind::Dict),
    ArgSpec::optional("wait", ArgKind::Str),
];

#[derive(Debug, Clone)]
pub struct RunSh {
    pub run: String,
    pub image: String,
    pub store: Vec<String>,
    pub files: IndexMap<String, String>,
    pub wait: String,
    pub value_id: ValueId,
}

impl RunSh {
    pub fn bind(
        args: Arguments,
        store: &RuntimeValueStore,
    ) -> Result<(Self, ScriptValue), String> {
        let bound = bind_args("run_sh", SCHEMA, args)?;
        let run = match bound.get("run").and_then(ScriptValue::as_str) {
            Some(run) => run.to_string(),
            None => return Err("missing required argument 'run' for 'run_sh'".to_string()),
        };
        let image = bound
            .get("image")
            .and_then(ScriptValue::as_str)
            .unwrap_or(DEFAULT_TASK_IMAGE)
            .to_string();
        let wait = bound
            .get("wait")
            .and_then(ScriptValue::as_str)
            .unwrap_or(DEFAULT_WAIT)
            .to_string();

        let mut store_paths = Vec::new();
        if let Some(ScriptValue::List(items)) = bound.get("store") {
            for item in items {
                match item.as_str() {
                    Some(path) => store_paths.push(path.to_string()),
                    None => {
                        return Err(format!(
                            "type mismatch for argument 'store' of 'run_sh': expected string, got {}",
                            item.type_name()
                        ))
                    }
                }
            }
        }

        let mut files = IndexMap::new();
        if let Some(ScriptValue::Dict(dict)) = bound.get("files") {
            for (mount, artifact) in dict {
                match artifact.as_str() {
                    Some(artifact) => {
                        files.insert(mount.clone(), artifact.to_string());
                    }
                    None => {
                        return Err(format!(
                            "type mismatch for argument 'files' of 'run_sh': expected string, got {}",
                            artifact.type_name()
                        ))
                    }
                }
            }
        }

        let value_id = store.create();
        let mut interp = IndexMap::new();
        interp.insert(
            "code".to_string(),
            ScriptValue::Str(RuntimeValueStore::marker(value_id, "code")),
        );
        interp.insert(
            "output".to_string(),
            ScriptValue::Str(RuntimeValueStore::marker(value_id, "output")),
        );
        interp.insert(
            "files_artifacts".to_string(),
            ScriptValue::List(
                (0..store_paths.len())
                    .map(|i| {
                        ScriptValue::Str(RuntimeValueStore::marker(
                            value_id,
                            &format!("files_artifacts.{}", i),
                        ))
                    })
                    .collect(),
            ),
        );

        Ok((
            Self {
                run,
                image,
                store: store_paths,
                files,
                wait,
                value_id,
            },
            ScriptValue::Dict(interp),
        ))
    }

    pub fn render(&self) -> String {
        let mut parts = vec![format!("run={:?}", self.run)];
        if self.image != DEFAULT_TASK_IMAGE {
            parts.push(format!("image={:?}", self.image));
        }
        if !self.store.is_empty() {
            let paths: Vec<String> = self.store.iter().map(|p| format!("{:?}", p)).collect();
            parts.push(format!("store=[{}]", paths.join(", ")));
        }
        if !self.files.is_empty() {
            let mounts: Vec<String> = self
                .files
                .iter()
                .map(|(mount, artifact)| format!("{:?}: {:?}", mount, artifact))
                .collect();
            parts.push(format!("files={{{}}}", mounts.join(", ")));
        }
        if self.wait != DEFAULT_WAIT {
            parts.push(format!("wait={:?}", self.wait));
        }
        format!("run_sh({})", parts.join(", "))
    }

    pub fn validate(&self, env: &mut ValidatorEnvironment) -> Result<(), String> {
        parse_duration(&self.wait).map_err(|e| format!("wait budget: {}", e))?;
        for path in &self.store {
            if path.is_empty() {
                return Err("store paths must not be empty".to_string());
            }
        }
        for artifact in self.files.values() {
            // Runtime references are only checkable at execution time.
            if !artifact.contains("{{runtime.") && !env.artifact_exists(artifact) {
                return Err(format!(
                    "files artifact '{}' does not exist in the environment",
                    artifact
                ));
            }
        }
        Ok(())
    }

    pub async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<String, ExecError> {
        if ctx.dry_run {
            return Ok(format!(
                "Command returned with exit code '{}' and the following output:\n--------------------\n{}\n--------------------\n",
                RuntimeValueStore::marker(self.value_id, "code"),
                RuntimeValueStore::marker(self.value_id, "output"),
            ));
        }

        let command = ctx
            .store
            .render_str(&self.run)
            .map_err(|e| ExecError::failed(e.to_string()))?;
        let mut files = IndexMap::new();
        for (mount, artifact) in &self.files {
            files.insert(
                mount.clone(),
                ctx.store
                    .render_str(artifact)
                    .map_err(|e| ExecError::failed(e.to_string()))?,
            );
        }
        let wait = parse_duration(&self.wait).map_err(ExecError::failed)?;

        let task = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(ExecError::cancelled("the shell task was cancelled"));
            }
            task = ctx.backend.run_shell_task(&command, &self.image, &self.store, &files, wait) => task,
        };

        let task = task.map_err(|e| match e {
            BackendError::ExecTimeout(_) => ExecError::timeout(e.to_string()),
            other => ExecError::failed(format!("shell task failed: {}", other)),
        })?;

        if task.exit_code != 0 {
            return Err(ExecError::failed(format!(
                "command '{}' returned non-zero exit code '{}' with output: {}",
                command, task.exit_code, task.output
            )));
        }

        let mut fields = IndexMap::new();
        fields.insert("code".to_string(), ScriptValue::Int(task.exit_code));
        fields.insert("output".to_string(), ScriptValue::Str(task.output.clone()));
        for (i, artifact) in task.artifacts.iter().enumerate() {
            fields.insert(
                format!("files_artifacts.{}", i),
                ScriptValue::Str(artifact.clone()),
            );
        }
        ctx.store
            .resolve(self.value_id, fields)
            .map_err(|e| ExecError::failed(format!("internal consistency error: {}", e)))?;

        if task.output.is_empty() {
            Ok(format!(
                "Command returned with exit code '{}' with no output\n",
                task.exit_code
            ))
        } else {
            Ok(format!(
                "Command returned with exit code '{}' and the following output:\n--------------------\n{}\n--------------------\n",
                task.exit_code, task.output
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwargs(pairs: &[(&str, ScriptValue)]) -> Arguments {
        Arguments {
            positional: vec![],
            kwargs: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn test_mj014_bind_defaults() {
        let store = RuntimeValueStore::new();
        let (instr, _) = RunSh::bind(
            kwargs(&[("run", ScriptValue::Str("echo hi".into()))]),
            &store,
        )
        .unwrap();
        assert_eq!(instr.image, DEFAULT_TASK_IMAGE);
        assert_eq!(instr.wait, "180s");
        assert!(instr.store.is_empty());
        assert!(instr.files.is_empty());
    }

    #[test]
    fn test_mj014_bind_interp_value_shape() {
        let store = RuntimeValueStore::new();
        let (_, interp) = RunSh::bind(
            kwargs(&[
                ("run", ScriptValue::Str("echo hi".into())),
                (
                    "store",
                    ScriptValue::List(vec![
                        ScriptValue::Str("out.txt".into()),
                        ScriptValue::Str("data".into()),
                    ]),
                ),
            ]),
            &store,
        )
        .unwrap();
        match interp {
            ScriptValue::Dict(dict) => {
                assert_eq!(dict["code"], ScriptValue::Str("{{runtime.1.code}}".into()));
                assert_eq!(
                    dict["output"],
                    ScriptValue::Str("{{runtime.1.output}}".into())
                );
                assert_eq!(
                    dict["files_artifacts"],
                    ScriptValue::List(vec![
                        ScriptValue::Str("{{runtime.1.files_artifacts.0}}".into()),
                        ScriptValue::Str("{{runtime.1.files_artifacts.1}}".into()),
                    ])
                );
            }
            other => panic!("expected dict, got {:?}", other),
        }
    }

    #[test]
    fn test_mj014_bind_rejects_non_string_store_entry() {
        let store = RuntimeValueStore::new();
        let err = RunSh::bind(
            kwargs(&[
                ("run", ScriptValue::Str("x".into())),
                ("store", ScriptValue::List(vec![ScriptValue::Int(1)])),
            ]),
            &store,
        )
        .unwrap_err();
        assert!(err.contains("expected string, got int"));
    }

    #[test]
    fn test_mj014_validate_bad_wait() {
        let store = RuntimeValueStore::new();
        let (instr, _) = RunSh::bind(
            kwargs(&[
                ("run", ScriptValue::Str("x".into())),
                ("wait", ScriptValue::Str("later".into())),
            ]),
            &store,
        )
        .unwrap();
        let mut env = ValidatorEnvironment::default();
        assert!(instr.validate(&mut env).unwrap_err().contains("wait budget"));
    }

    #[test]
    fn test_mj014_validate_unknown_artifact_mount() {
        let store = RuntimeValueStore::new();
        let mut files = IndexMap::new();
        files.insert("/temp".to_string(), ScriptValue::Str("ghost".into()));
        let (instr, _) = RunSh::bind(
            kwargs(&[
                ("run", ScriptValue::Str("x".into())),
                ("files", ScriptValue::Dict(files)),
            ]),
            &store,
        )
        .unwrap();
        let mut env = ValidatorEnvironment::default();
        let err = instr.validate(&mut env).unwrap_err();
        assert!(err.contains("files artifact 'ghost' does not exist"));
    }

    #[test]
    fn test_mj014_validate_accepts_runtime_reference_mount() {
        let store = RuntimeValueStore::new();
        let mut files = IndexMap::new();
        files.insert(
            "/temp".to_string(),
            ScriptValue::Str("{{runtime.1.files_artifacts.0}}".into()),
        );
        let (instr, _) = RunSh::bind(
            kwargs(&[
                ("run", ScriptValue::Str("x".into())),
                ("files", ScriptValue::Dict(files)),
            ]),
            &store,
        )
        .unwrap();
        let mut env = ValidatorEnvironment::default();
        assert!(instr.validate(&mut env).is_ok());
    }

    #[test]
    fn test_mj014_render_non_defaults_only() {
        let store = RuntimeValueStore::new();
        let (instr, _) = RunSh::bind(
            kwargs(&[
                ("run", ScriptValue::Str("echo hi".into())),
                (
                    "store",
                    ScriptValue::List(vec![ScriptValue::Str("out.txt".into())]),
                ),
                ("wait", ScriptValue::Str("30s".into())),
            ]),
            &store,
        )
        .unwrap();
        assert_eq!(
            instr.render(),
            "run_sh(run=\"echo hi\", store=[\"out.txt\"], wait=\"30s\")"
        );
    }
}
