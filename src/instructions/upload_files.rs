//! MJ-013: `upload_files` — store a local file or directory as an artifact.
//!
//! When no artifact name is given the backend generates a unique one at
//! interpretation time, and that name is the invocation's interpretation
//! value. Re-uploading identical content to an existing name is a no-op on
//! the backend; the trace is identical either way.

use super::{bind_args, ArgKind, ArgSpec, Arguments, ExecutionContext};
use crate::backend::{pack_path, EnvironmentBackend};
use crate::core::error::ExecError;
use crate::core::types::ScriptValue;
use crate::core::validator::ValidatorEnvironment;
use crate::core::values::{RuntimeValueStore, ValueId};
use indexmap::IndexMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const SCHEMA: &[ArgSpec] = &[
    ArgSpec::required("src", ArgKind::Str),
    ArgSpec::optional("name", ArgKind::Str),
];

#[derive(Debug, Clone)]
pub struct UploadFiles {
    pub src: String,
    pub name: String,
    pub value_id: ValueId,
}

impl UploadFiles {
    pub async fn bind(
        args: Arguments,
        store: &RuntimeValueStore,
        backend: &Arc<dyn EnvironmentBackend>,
    ) -> Result<(Self, ScriptValue), String> {
        let bound = bind_args("upload_files", SCHEMA, args)?;
        let src = match bound.get("src").and_then(ScriptValue::as_str) {
            Some(src) => src.to_string(),
            None => return Err("missing required argument 'src' for 'upload_files'".to_string()),
        };
        let name = match bound.get("name").and_then(ScriptValue::as_str) {
            Some(name) => name.to_string(),
            None => backend
                .get_unique_name_for_file_artifact()
                .await
                .map_err(|e| format!("failed to generate an artifact name: {}", e))?,
        };
        let value_id = store.create();
        let interp = ScriptValue::Str(name.clone());
        Ok((
            Self {
                src,
                name,
                value_id,
            },
            interp,
        ))
    }

    pub fn render(&self) -> String {
        format!("upload_files(src={:?}, name={:?})", self.src, self.name)
    }

    pub fn validate(&self, env: &mut ValidatorEnvironment) -> Result<(), String> {
        if !Path::new(&self.src).exists() {
            return Err(format!("source path '{}' is unreachable", self.src));
        }
        if env.artifact_planned(&self.name) {
            return Err(format!(
                "files artifact name '{}' is uploaded more than once in this plan",
                self.name
            ));
        }
        env.add_artifact(&self.name);
        Ok(())
    }

    pub async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<String, ExecError> {
        if ctx.dry_run {
            return Ok(format!(
                "Files with artifact name '{}' uploaded with artifact UUID '{}'",
                self.name,
                RuntimeValueStore::marker(self.value_id, "uuid")
            ));
        }

        let (data, hash) = pack_path(Path::new(&self.src))
            .map_err(|e| ExecError::failed(format!("failed to pack '{}': {}", self.src, e)))?;

        let existing = ctx
            .backend
            .get_files_artifact_hash(&self.name)
            .await
            .map_err(|e| ExecError::failed(format!("failed to look up '{}': {}", self.name, e)))?;

        let uuid = match existing {
            Some((uuid, existing_hash)) if existing_hash == hash => {
                debug!(artifact = %self.name, "content unchanged, skipping upload");
                uuid
            }
            _ => ctx
                .backend
                .upload_files_artifact(data, &hash, &self.name)
                .await
                .map_err(|e| {
                    ExecError::failed(format!("failed to upload '{}': {}", self.name, e))
                })?,
        };

        let mut fields = IndexMap::new();
        fields.insert("uuid".to_string(), ScriptValue::Str(uuid.clone()));
        ctx.store
            .resolve(self.value_id, fields)
            .map_err(|e| ExecError::failed(format!("internal consistency error: {}", e)))?;

        Ok(format!(
            "Files with artifact name '{}' uploaded with artifact UUID '{}'",
            self.name, uuid
        ))
    }
}
