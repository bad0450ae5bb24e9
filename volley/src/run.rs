use std::path::Path;

use tracing::{debug, info};
use volley_core::{CliOverrides, HttpClient, RunOutcome};

use crate::cli::{RunArgs, ValidateArgs};
use crate::exit_codes::ExitCode;
use crate::output;
use crate::run_error::{RunError, classify_core_error};
use crate::run_support::build_plan;

pub async fn run(args: RunArgs) -> Result<ExitCode, RunError> {
    let cli = CliOverrides {
        vus: args.vus,
        duration: args.duration,
        iterations: args.iterations,
        seed: args.seed,
        no_data: args.no_data,
    };

    let plan = build_plan(&args.plan, &args.env, &cli).await?;
    debug!(profile = ?plan.config.profile, scenarios = plan.scenarios.len(), "plan loaded");

    let out = output::formatter(args.output);
    out.print_header(&args.plan, &plan);

    let outcome = volley_core::run(plan, HttpClient::default(), out.progress())
        .await
        .map_err(|err| classify_core_error("run failed", err))?;

    out.print_summary(&outcome)
        .map_err(RunError::RuntimeError)?;

    let code = exit_code(&outcome, args.fail_on_checks);
    info!(
        run_id = %outcome.summary.run_id,
        exit_code = code.as_i32(),
        "run finished"
    );
    Ok(code)
}

pub async fn validate(args: ValidateArgs) -> Result<ExitCode, RunError> {
    let plan = build_plan(&args.plan, &args.env, &CliOverrides::default()).await?;
    print_validated(&args.plan, plan.scenarios.len());
    Ok(ExitCode::Success)
}

fn print_validated(path: &Path, scenarios: usize) {
    println!("{}: ok ({scenarios} scenario(s))", path.display());
}

fn exit_code(outcome: &RunOutcome, fail_on_checks: bool) -> ExitCode {
    let checks_failed = fail_on_checks && outcome.checks_failed() > 0;
    ExitCode::from_quality_gates(checks_failed, !outcome.thresholds_passed())
        .with_teardown(outcome.teardown_error.is_some())
}
