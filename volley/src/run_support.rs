use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use volley_core::{CliOverrides, EnvVars, RunPlan};

use crate::plan::load_plan;
use crate::run_error::RunError;

/// Process env overlaid with `--env KEY=VALUE` overrides.
pub(crate) fn merged_env(overrides: &[String]) -> anyhow::Result<EnvVars> {
    merge_env(std::env::vars(), overrides)
}

fn merge_env(
    base: impl IntoIterator<Item = (String, String)>,
    overrides: &[String],
) -> anyhow::Result<EnvVars> {
    let mut map: BTreeMap<String, String> = base.into_iter().collect();

    for raw in overrides {
        let (k, v) = parse_env_override(raw)?;
        map.insert(k, v);
    }

    let vars: Vec<(Arc<str>, Arc<str>)> = map
        .into_iter()
        .map(|(k, v)| (Arc::<str>::from(k), Arc::<str>::from(v)))
        .collect();

    Ok(Arc::from(vars.into_boxed_slice()))
}

fn parse_env_override(s: &str) -> anyhow::Result<(String, String)> {
    let (k, v) = s
        .split_once('=')
        .with_context(|| format!("invalid --env (expected KEY=VALUE): {s}"))?;
    if k.is_empty() {
        anyhow::bail!("invalid --env (empty KEY): {s}");
    }
    Ok((k.to_string(), v.to_string()))
}

/// Reads, parses and validates a plan. Every failure here is invalid input.
pub(crate) async fn build_plan(
    path: &Path,
    env_overrides: &[String],
    cli: &CliOverrides,
) -> Result<RunPlan, RunError> {
    let env = merged_env(env_overrides).map_err(RunError::InvalidInput)?;
    let doc = load_plan(path).await.map_err(RunError::InvalidInput)?;
    doc.into_run_plan(cli, env)
        .with_context(|| format!("plan {}", path.display()))
        .map_err(RunError::InvalidInput)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_over_process_env() {
        let base = [
            ("BASE_URL".to_string(), "http://a".to_string()),
            ("KEEP".to_string(), "1".to_string()),
        ];
        let env = merge_env(
            base,
            &["BASE_URL=http://b".to_string(), "EMPTY=".to_string()],
        )
        .unwrap_or_else(|e| panic!("{e:#}"));

        let get = |name: &str| {
            env.iter()
                .find(|(k, _)| k.as_ref() == name)
                .map(|(_, v)| v.to_string())
        };
        assert_eq!(get("BASE_URL").as_deref(), Some("http://b"));
        assert_eq!(get("KEEP").as_deref(), Some("1"));
        assert_eq!(get("EMPTY").as_deref(), Some(""));
    }

    #[test]
    fn malformed_overrides_are_rejected() {
        assert!(parse_env_override("NOVALUE").is_err());
        assert!(parse_env_override("=x").is_err());
        assert_eq!(
            parse_env_override("A=b=c").ok(),
            Some(("A".to_string(), "b=c".to_string()))
        );
    }
}
