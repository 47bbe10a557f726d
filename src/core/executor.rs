//! MJ-006: Executor — strict plan order, byte-stable trace, halt on failure.
//!
//! Instructions run one at a time in declared order; concurrency only ever
//! exists inside an instruction's own fan-out. Each instruction's trace
//! fragment is appended before the next instruction starts, so a failed run
//! always carries exactly the output of its completed prefix. Cancellation
//! is checked between instructions and raced against the in-flight one.

use crate::backend::EnvironmentBackend;
use crate::core::error::{ExecError, ExecutionError};
use crate::core::types::{FeatureFlag, Plan, DEFAULT_PARALLELISM};
use crate::core::values::RuntimeValueStore;
use crate::instructions::ExecutionContext;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Knobs for one execution pass.
#[derive(Debug, Clone)]
pub struct ExecuteParams {
    /// Report intended actions without touching Environment State.
    pub dry_run: bool,
    /// Width of per-instruction internal fan-out.
    pub parallelism: usize,
    pub features: Vec<FeatureFlag>,
    pub cancel: CancellationToken,
}

impl Default for ExecuteParams {
    fn default() -> Self {
        Self {
            dry_run: false,
            parallelism: DEFAULT_PARALLELISM,
            features: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Execute the plan, returning the cumulative trace and the error that
/// stopped it, if any. Partial output is always preserved.
pub async fn execute_plan(
    plan: &Plan,
    store: &RuntimeValueStore,
    backend: &Arc<dyn EnvironmentBackend>,
    params: &ExecuteParams,
) -> (String, Option<ExecutionError>) {
    let mut output = String::new();
    let ctx = ExecutionContext {
        backend,
        store,
        dry_run: params.dry_run,
        parallelism: params.parallelism.max(1),
        features: &params.features,
        cancel: &params.cancel,
    };

    for planned in &plan.instructions {
        if params.cancel.is_cancelled() {
            let err = ExecError::cancelled("run cancelled")
                .into_execution_error(planned.position);
            return (output, Some(err));
        }

        info!(
            builtin = planned.instruction.builtin_name(),
            index = planned.position.index,
            dry_run = params.dry_run,
            "executing instruction"
        );

        let result = tokio::select! {
            _ = params.cancel.cancelled() => {
                Err(ExecError::cancelled("run cancelled while the instruction was in flight"))
            }
            result = planned.instruction.execute(&ctx) => result,
        };

        match result {
            Ok(fragment) => {
                output.push_str(&fragment);
                if !fragment.ends_with('\n') {
                    output.push('\n');
                }
            }
            Err(err) => {
                debug!(
                    builtin = planned.instruction.builtin_name(),
                    index = planned.position.index,
                    "instruction failed, halting plan"
                );
                return (output, Some(err.into_execution_error(planned.position)));
            }
        }
    }

    (output, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::core::builder;
    use crate::core::error::ExecutionErrorKind;
    use crate::core::script;
    use indexmap::IndexMap;
    use std::time::Duration;

    async fn build(
        text: &str,
        backend: &Arc<dyn EnvironmentBackend>,
    ) -> (Plan, RuntimeValueStore) {
        let parsed = script::parse(text).unwrap();
        let calls = script::invocations(script::select_flow(&parsed, None).unwrap()).unwrap();
        let store = RuntimeValueStore::new();
        let output = builder::build_plan(calls, &IndexMap::new(), &store, backend)
            .await
            .unwrap();
        (output.plan, store)
    }

    #[tokio::test]
    async fn test_mj006_trace_in_plan_order() {
        let backend: Arc<dyn EnvironmentBackend> = Arc::new(LocalBackend::new());
        let (plan, store) = build(
            r#"
name: order
run:
  - run_sh:
      run: "echo one"
  - run_sh:
      run: "echo two"
"#,
            &backend,
        )
        .await;
        let (output, err) =
            execute_plan(&plan, &store, &backend, &ExecuteParams::default()).await;
        assert!(err.is_none(), "unexpected error: {:?}", err);
        assert_eq!(
            output,
            "Command returned with exit code '0' and the following output:\n\
             --------------------\none\n\n--------------------\n\
             Command returned with exit code '0' and the following output:\n\
             --------------------\ntwo\n\n--------------------\n"
        );
    }

    #[tokio::test]
    async fn test_mj006_failure_preserves_prefix_output() {
        let backend: Arc<dyn EnvironmentBackend> = Arc::new(LocalBackend::new());
        let (plan, store) = build(
            r#"
name: partial
run:
  - run_sh:
      run: "echo before"
  - run_sh:
      run: "exit 3"
  - run_sh:
      run: "echo never"
"#,
            &backend,
        )
        .await;
        let (output, err) =
            execute_plan(&plan, &store, &backend, &ExecuteParams::default()).await;
        let err = err.expect("second instruction must fail");
        assert_eq!(err.kind, ExecutionErrorKind::Failed);
        assert_eq!(err.position.index, 1);
        assert!(err.message.contains("non-zero exit code '3'"));
        // Exactly the first instruction's output, nothing from the third.
        assert_eq!(
            output,
            "Command returned with exit code '0' and the following output:\n\
             --------------------\nbefore\n\n--------------------\n"
        );
    }

    #[tokio::test]
    async fn test_mj006_timeout_contributes_no_trace() {
        let backend: Arc<dyn EnvironmentBackend> = Arc::new(LocalBackend::new());
        let (plan, store) = build(
            r#"
name: slow
run:
  - run_sh:
      run: "sleep 30"
      wait: "1s"
"#,
            &backend,
        )
        .await;
        let (output, err) =
            execute_plan(&plan, &store, &backend, &ExecuteParams::default()).await;
        let err = err.expect("task must time out");
        assert_eq!(err.kind, ExecutionErrorKind::Timeout);
        assert!(err
            .message
            .contains("The exec request timed out after 1 seconds"));
        assert_eq!(output, "");
    }

    #[tokio::test]
    async fn test_mj006_cancellation_stops_plan() {
        let backend: Arc<dyn EnvironmentBackend> = Arc::new(LocalBackend::new());
        let (plan, store) = build(
            r#"
name: cancel
run:
  - run_sh:
      run: "sleep 30"
"#,
            &backend,
        )
        .await;
        let params = ExecuteParams::default();
        let cancel = params.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let (output, err) = execute_plan(&plan, &store, &backend, &params).await;
        let err = err.expect("run must be cancelled");
        assert_eq!(err.kind, ExecutionErrorKind::Cancelled);
        assert_eq!(output, "");
    }

    #[tokio::test]
    async fn test_mj006_dry_run_mutates_nothing_and_keeps_markers() {
        let backend: Arc<dyn EnvironmentBackend> = Arc::new(LocalBackend::new());
        let (plan, store) = build(
            r#"
name: dry
run:
  - add_services:
      configs:
        api:
          image: nginx:1.25
"#,
            &backend,
        )
        .await;
        let params = ExecuteParams {
            dry_run: true,
            ..ExecuteParams::default()
        };
        let (output, err) = execute_plan(&plan, &store, &backend, &params).await;
        assert!(err.is_none());
        assert_eq!(
            output,
            "Successfully added the following '1' services:\n\
             Service 'api' added with UUID '{{runtime.1.api.uuid}}'\n"
        );
        assert!(backend.existing_service_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mj006_placeholder_roundtrip_between_tasks() {
        let backend: Arc<dyn EnvironmentBackend> = Arc::new(LocalBackend::new());
        let (plan, store) = build(
            r#"
name: chain
run:
  - run_sh:
      id: producer
      run: "printf kurtosis > tech.txt"
      store: ["tech.txt"]
  - run_sh:
      run: "cat temp/tech.txt"
      files:
        /temp: "{{runtime.producer.files_artifacts.0}}"
"#,
            &backend,
        )
        .await;
        let (output, err) =
            execute_plan(&plan, &store, &backend, &ExecuteParams::default()).await;
        assert!(err.is_none(), "unexpected error: {:?}", err);
        assert!(
            output.ends_with(
                "Command returned with exit code '0' and the following output:\n\
                 --------------------\nkurtosis\n--------------------\n"
            ),
            "got: {}",
            output
        );
    }
}
