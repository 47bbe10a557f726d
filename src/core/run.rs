//! MJ-007: Run — one single-shot pass through interpret, validate, execute.
//!
//! A run owns its plan and value store, drives the phases in order, and
//! assembles the terminal result. Each phase is strictly upstream-blocking:
//! an interpretation failure prevents validation, validation failures
//! prevent execution. A run that reached a terminal phase is not
//! re-enterable.

use crate::backend::EnvironmentBackend;
use crate::core::builder;
use crate::core::error::{InterpretationError, ValidationError};
use crate::core::executor::{self, ExecuteParams};
use crate::core::script::{self, ScriptSource};
use crate::core::types::{Plan, RunPhase, RunResult, ScriptValue};
use crate::core::validator;
use crate::core::values::RuntimeValueStore;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct Run {
    run_id: String,
    backend: Arc<dyn EnvironmentBackend>,
    store: RuntimeValueStore,
    phase: RunPhase,
    plan: Option<Plan>,
    return_value: ScriptValue,
    interpretation_error: Option<InterpretationError>,
    validation_errors: Vec<ValidationError>,
}

impl Run {
    pub fn new(backend: Arc<dyn EnvironmentBackend>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            backend,
            store: RuntimeValueStore::new(),
            phase: RunPhase::Created,
            plan: None,
            return_value: ScriptValue::Null,
            interpretation_error: None,
            validation_errors: Vec::new(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    /// Interpret a script into a plan. Returns the interpretation-time
    /// return value and the plan preview.
    pub async fn interpret(
        &mut self,
        source: &ScriptSource,
        main_file: Option<&str>,
        function_name: Option<&str>,
        serialized_params: Option<&str>,
    ) -> Result<(ScriptValue, Vec<String>), InterpretationError> {
        if self.phase != RunPhase::Created {
            return Err(InterpretationError::new(format!(
                "run is single-shot; interpretation is not allowed in phase '{}'",
                self.phase
            )));
        }
        self.phase = RunPhase::Interpreting;
        info!(run_id = %self.run_id, "interpreting script");

        let outcome = async {
            let parsed = script::load(source, main_file)?;
            let flow = script::select_flow(&parsed, function_name)?;
            let calls = script::invocations(flow)?;
            let params = script::merge_params(&parsed, serialized_params)?;
            builder::build_plan(calls, &params, &self.store, &self.backend).await
        }
        .await;

        match outcome {
            Ok(output) => {
                let preview = output.plan.preview();
                self.plan = Some(output.plan);
                self.return_value = output.return_value.clone();
                self.phase = RunPhase::Interpreted;
                Ok((output.return_value, preview))
            }
            Err(err) => {
                self.phase = RunPhase::InterpretationFailed;
                self.interpretation_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Validate the interpreted plan. All problems are returned in one batch.
    pub async fn validate(&mut self) -> Vec<ValidationError> {
        if self.phase != RunPhase::Interpreted {
            return vec![ValidationError {
                position: None,
                message: format!(
                    "validation requires an interpreted plan, run is in phase '{}'",
                    self.phase
                ),
            }];
        }
        self.phase = RunPhase::Validating;
        info!(run_id = %self.run_id, "validating plan");

        let plan = match self.plan.as_ref() {
            Some(plan) => plan,
            None => return Vec::new(),
        };
        let errors = validator::validate_plan(plan, &self.backend).await;
        if errors.is_empty() {
            self.phase = RunPhase::Validated;
        } else {
            self.phase = RunPhase::ValidationFailed;
            self.validation_errors = errors.clone();
        }
        errors
    }

    /// Execute the validated plan and assemble the terminal result. Called
    /// in any other phase it assembles the run's current (failed) state.
    pub async fn execute(&mut self, params: ExecuteParams) -> RunResult {
        if self.phase != RunPhase::Validated {
            return self.assemble(String::new(), None);
        }
        self.phase = RunPhase::Executing;
        info!(
            run_id = %self.run_id,
            dry_run = params.dry_run,
            parallelism = params.parallelism,
            "executing plan"
        );

        let (run_output, execution_error) = match self.plan.as_ref() {
            Some(plan) => executor::execute_plan(plan, &self.store, &self.backend, &params).await,
            None => (String::new(), None),
        };

        self.phase = if execution_error.is_none() {
            RunPhase::Completed
        } else {
            RunPhase::ExecutionFailed
        };
        self.assemble(run_output, execution_error)
    }

    /// Blocking convenience: all three phases, one terminal result.
    pub async fn run_to_completion(
        backend: Arc<dyn EnvironmentBackend>,
        source: &ScriptSource,
        main_file: Option<&str>,
        function_name: Option<&str>,
        serialized_params: Option<&str>,
        params: ExecuteParams,
    ) -> RunResult {
        let mut run = Self::new(backend);
        if run
            .interpret(source, main_file, function_name, serialized_params)
            .await
            .is_err()
        {
            return run.assemble(String::new(), None);
        }
        if !run.validate().await.is_empty() {
            return run.assemble(String::new(), None);
        }
        run.execute(params).await
    }

    /// Package the run's outcome. Exactly one error slot is populated for a
    /// failed run, none for a completed one; the return value is rendered
    /// with whatever runtime values execution resolved.
    fn assemble(
        &self,
        run_output: String,
        execution_error: Option<crate::core::error::ExecutionError>,
    ) -> RunResult {
        RunResult {
            phase: self.phase,
            interpretation_error: self.interpretation_error.clone(),
            validation_errors: self.validation_errors.clone(),
            execution_error,
            return_value: self.store.render_value_lenient(&self.return_value),
            run_output,
        }
    }
}
