//! MJ-017: CLI subcommands — preview, run.

use crate::backend::local::LocalBackend;
use crate::backend::EnvironmentBackend;
use crate::core::executor::ExecuteParams;
use crate::core::run::Run;
use crate::core::script::ScriptSource;
use crate::core::types::{FeatureFlag, RunResult, DEFAULT_PARALLELISM};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interpret and validate a script, printing the instruction plan
    Preview {
        /// Path to the script file or package directory
        #[arg(short, long, default_value = "montaje.yaml")]
        file: PathBuf,

        /// Serialized JSON params merged over the script's declared defaults
        #[arg(short, long)]
        params: Option<String>,

        /// Flow to interpret (default: run)
        #[arg(long)]
        flow: Option<String>,

        /// Entry file inside a package directory
        #[arg(long)]
        main_file: Option<String>,
    },

    /// Interpret, validate, and execute a script against the local backend
    Run {
        /// Path to the script file or package directory
        #[arg(short, long, default_value = "montaje.yaml")]
        file: PathBuf,

        /// Serialized JSON params merged over the script's declared defaults
        #[arg(short, long)]
        params: Option<String>,

        /// Flow to execute (default: run)
        #[arg(long)]
        flow: Option<String>,

        /// Entry file inside a package directory
        #[arg(long)]
        main_file: Option<String>,

        /// Report intended actions without mutating the environment
        #[arg(long)]
        dry_run: bool,

        /// Width of per-instruction internal fan-out
        #[arg(long, default_value_t = DEFAULT_PARALLELISM)]
        parallelism: usize,

        /// Skip readiness polling in add_services
        #[arg(long)]
        skip_ready_checks: bool,
    },
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Preview {
            file,
            params,
            flow,
            main_file,
        } => cmd_preview(&file, params.as_deref(), flow.as_deref(), main_file.as_deref()).await,
        Commands::Run {
            file,
            params,
            flow,
            main_file,
            dry_run,
            parallelism,
            skip_ready_checks,
        } => {
            cmd_run(
                &file,
                params.as_deref(),
                flow.as_deref(),
                main_file.as_deref(),
                dry_run,
                parallelism,
                skip_ready_checks,
            )
            .await
        }
    }
}

fn source_for(path: &Path) -> ScriptSource {
    if path.is_dir() {
        ScriptSource::Dir(path.to_path_buf())
    } else {
        ScriptSource::File(path.to_path_buf())
    }
}

async fn cmd_preview(
    file: &Path,
    params: Option<&str>,
    flow: Option<&str>,
    main_file: Option<&str>,
) -> Result<(), String> {
    let backend: Arc<dyn EnvironmentBackend> = Arc::new(LocalBackend::new());
    let mut run = Run::new(backend);

    let (return_value, preview) = run
        .interpret(&source_for(file), main_file, flow, params)
        .await
        .map_err(|e| e.to_string())?;

    println!("Plan ({} instructions):", preview.len());
    for (index, line) in preview.iter().enumerate() {
        println!("  {}. {}", index + 1, line);
    }
    println!("Interpretation value: {}", return_value);

    let errors = run.validate().await;
    if errors.is_empty() {
        println!("Validation: OK");
        Ok(())
    } else {
        for error in &errors {
            eprintln!("  ERROR: {}", error);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

async fn cmd_run(
    file: &Path,
    params: Option<&str>,
    flow: Option<&str>,
    main_file: Option<&str>,
    dry_run: bool,
    parallelism: usize,
    skip_ready_checks: bool,
) -> Result<(), String> {
    let backend: Arc<dyn EnvironmentBackend> = Arc::new(LocalBackend::new());

    let mut features = Vec::new();
    if skip_ready_checks {
        features.push(FeatureFlag::SkipReadyChecks);
    }
    let exec_params = ExecuteParams {
        dry_run,
        parallelism,
        features,
        ..ExecuteParams::default()
    };

    let result = Run::run_to_completion(
        backend,
        &source_for(file),
        main_file,
        flow,
        params,
        exec_params,
    )
    .await;

    report(&result)
}

/// Print a terminal run result and map it onto the process exit status.
fn report(result: &RunResult) -> Result<(), String> {
    if !result.run_output.is_empty() {
        print!("{}", result.run_output);
    }

    if let Some(ref err) = result.interpretation_error {
        return Err(format!("interpretation failed: {}", err));
    }
    if !result.validation_errors.is_empty() {
        for error in &result.validation_errors {
            eprintln!("  ERROR: {}", error);
        }
        return Err(format!(
            "{} validation error(s)",
            result.validation_errors.len()
        ));
    }
    if let Some(ref err) = result.execution_error {
        return Err(format!("execution failed: {}", err));
    }

    println!("Run {} ({})", result.phase, result.return_value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{ExecutionError, ExecutionErrorKind, SourcePosition};
    use crate::core::types::{RunPhase, ScriptValue};

    fn completed() -> RunResult {
        RunResult {
            phase: RunPhase::Completed,
            interpretation_error: None,
            validation_errors: Vec::new(),
            execution_error: None,
            return_value: ScriptValue::Null,
            run_output: "Service 'api' started\n".to_string(),
        }
    }

    #[test]
    fn test_mj017_report_success() {
        assert!(report(&completed()).is_ok());
    }

    #[test]
    fn test_mj017_report_execution_failure() {
        let mut result = completed();
        result.phase = RunPhase::ExecutionFailed;
        result.execution_error = Some(ExecutionError {
            position: SourcePosition::at(1),
            kind: ExecutionErrorKind::Timeout,
            message: "The exec request timed out after 30 seconds".to_string(),
        });
        let err = report(&result).unwrap_err();
        assert!(err.contains("execution failed"));
        assert!(err.contains("timed out"));
    }

    #[tokio::test]
    async fn test_mj017_cmd_run_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("montaje.yaml");
        std::fs::write(
            &script,
            "name: smoke\nrun:\n  - print:\n      msg: hello\n",
        )
        .unwrap();
        cmd_run(&script, None, None, None, false, 4, false)
            .await
            .unwrap();
    }
}
