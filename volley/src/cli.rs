use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use volley_core::NoDataPolicy;

fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("duration cannot be empty (expected e.g. 10s, 250ms, 1m)".to_string());
    }

    let number_end = s
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map_or(s.len(), |(idx, _)| idx);

    if number_end == 0 {
        return Err(format!(
            "invalid duration '{s}' (expected e.g. 10s, 250ms, 1m)"
        ));
    }

    let (number_str, unit_str) = s.split_at(number_end);
    let value: u64 = number_str
        .parse()
        .map_err(|_| format!("invalid duration '{s}' (expected e.g. 10s, 250ms, 1m)"))?;

    match unit_str.trim() {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => Ok(Duration::from_secs(value)),
        "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => {
            Ok(Duration::from_millis(value))
        }
        "m" | "min" | "mins" | "minute" | "minutes" => {
            let secs = value
                .checked_mul(60)
                .ok_or_else(|| format!("duration '{s}' is too large"))?;
            Ok(Duration::from_secs(secs))
        }
        "h" | "hr" | "hrs" | "hour" | "hours" => {
            let secs = value
                .checked_mul(60)
                .and_then(|v| v.checked_mul(60))
                .ok_or_else(|| format!("duration '{s}' is too large"))?;
            Ok(Duration::from_secs(secs))
        }
        _ => Err(format!(
            "invalid duration '{s}' (expected e.g. 10s, 250ms, 1m)"
        )),
    }
}

fn parse_no_data(input: &str) -> Result<NoDataPolicy, String> {
    input
        .trim()
        .parse()
        .map_err(|_| format!("invalid no-data policy '{input}' (expected pass or fail)"))
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    /// Progress bar and end-of-run summary.
    HumanReadable,
    /// Emit JSON progress and summary lines (NDJSON) to stdout.
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "volley",
    author,
    version,
    about = "Load generator for HTTP services",
    long_about = "volley drives an HTTP service with a population of virtual users.\n\nA YAML plan declares the load profile (fixed VUs or ramp stages), thresholds, an optional setup/teardown and weighted multi-step scenarios.\n\nBy default, environment variables from the current process are visible to plan templates as `{{env.NAME}}`; use `--env KEY=VALUE` to add/override values.",
    after_help = "Examples:\n  volley run demos/easy.yaml\n  volley run demos/heavy.yaml --output json\n  volley run demos/easy.yaml --vus 50 --duration 30s\n  volley run demos/easy.yaml --env BASE_URL=http://127.0.0.1:8080\n  volley validate demos/heavy.yaml"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load test plan
    #[command(
        long_about = "Run setup, drive the scenarios with the configured VU profile, run teardown and evaluate thresholds.\n\nCLI flags override values from the plan's `options`; `--vus`, `--duration` or `--iterations` replace `stages`."
    )]
    Run(RunArgs),

    /// Load and validate a plan without sending any request
    Validate(ValidateArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the plan (.yaml)
    pub plan: PathBuf,

    /// Shared iteration budget across all VUs
    #[arg(long)]
    pub iterations: Option<u64>,

    /// Number of virtual users
    #[arg(long)]
    pub vus: Option<u64>,

    /// Test duration (e.g. 10s, 250ms, 1m)
    #[arg(long, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Add/override env vars visible to the plan (repeatable, KEY=VALUE).
    /// CLI-provided vars override the current process env.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Seed scenario selection and template randomness for a reproducible run
    #[arg(long)]
    pub seed: Option<u64>,

    /// How thresholds without samples are judged (pass or fail)
    #[arg(long, value_name = "POLICY", value_parser = parse_no_data)]
    pub no_data: Option<NoDataPolicy>,

    /// Exit non-zero when any check failed
    #[arg(long)]
    pub fail_on_checks: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::HumanReadable)]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Path to the plan (.yaml)
    pub plan: PathBuf,

    /// Add/override env vars (repeatable, KEY=VALUE)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
}
