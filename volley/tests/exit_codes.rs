use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::Context as _;
use volley_testserver::TestServer;

fn status_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn write_plan(dir: &Path, yaml: &str) -> anyhow::Result<PathBuf> {
    let path = dir.join("plan.yaml");
    std::fs::write(&path, yaml).context("write plan")?;
    Ok(path)
}

async fn volley(args: Vec<String>) -> anyhow::Result<Output> {
    let exe = env!("CARGO_BIN_EXE_volley");
    tokio::task::spawn_blocking(move || Command::new(exe).args(&args).output())
        .await
        .context("spawn_blocking join")?
        .context("run volley binary")
}

fn ensure_exit(out: &Output, expected: i32) -> anyhow::Result<()> {
    anyhow::ensure!(
        status_code(out.status) == expected,
        "expected exit code {expected}, got {}\nstdout:\n{}\nstderr:\n{}",
        status_code(out.status),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    Ok(())
}

fn run_args(plan: &Path, base_url: &str, extra: &[&str]) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        plan.display().to_string(),
        "--env".to_string(),
        format!("BASE_URL={base_url}"),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    args
}

const HEALTH_PLAN: &str = r#"
scenarios:
  - name: health
    steps:
      - name: get_health
        request:
          url: "{{env.BASE_URL}}/health"
        checks:
          - status: 200
          - jsonPath: status
            equals: ok
"#;

#[test]
fn invalid_flags_exit_30() -> anyhow::Result<()> {
    let exe = env!("CARGO_BIN_EXE_volley");

    let out = Command::new(exe)
        .arg("run")
        .arg("./does-not-matter.yaml")
        .arg("--duration")
        .arg("10x")
        .output()
        .context("run volley binary")?;

    ensure_exit(&out, 30)
}

#[tokio::test]
async fn missing_plan_exit_30() -> anyhow::Result<()> {
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = dir.path().join("nope.yaml");

    let out = volley(run_args(&plan, "http://127.0.0.1:1", &[])).await?;
    ensure_exit(&out, 30)
}

#[tokio::test]
async fn invalid_threshold_exit_30() -> anyhow::Result<()> {
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = write_plan(
        dir.path(),
        r#"
options:
  thresholds:
    http_req_duration: "p(95)<<300"
scenarios:
  - name: s
    steps:
      - request: { url: "{{env.BASE_URL}}/health" }
"#,
    )?;

    let out = volley(run_args(&plan, "http://127.0.0.1:1", &[])).await?;
    ensure_exit(&out, 30)?;
    let stderr = String::from_utf8_lossy(&out.stderr);
    anyhow::ensure!(stderr.contains("http_req_duration"), "stderr:\n{stderr}");
    Ok(())
}

#[tokio::test]
async fn passing_run_exit_0() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = write_plan(dir.path(), HEALTH_PLAN)?;

    let out = volley(run_args(&plan, server.base_url(), &["--iterations", "3"])).await?;
    let requests = server.stats().requests_total();
    server.shutdown().await;

    ensure_exit(&out, 0)?;
    anyhow::ensure!(requests == 3, "expected 3 requests, got {requests}");
    Ok(())
}

#[tokio::test]
async fn checks_failed_exit_10_only_when_requested() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = write_plan(
        dir.path(),
        r#"
scenarios:
  - name: health
    steps:
      - request:
          url: "{{env.BASE_URL}}/health"
        checks:
          - status: 201
"#,
    )?;

    let lenient = volley(run_args(&plan, server.base_url(), &["--iterations", "1"])).await?;
    let strict = volley(run_args(
        &plan,
        server.base_url(),
        &["--iterations", "1", "--fail-on-checks"],
    ))
    .await?;
    server.shutdown().await;

    ensure_exit(&lenient, 0)?;
    ensure_exit(&strict, 10)
}

#[tokio::test]
async fn thresholds_failed_exit_11() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = write_plan(
        dir.path(),
        r#"
options:
  thresholds:
    http_req_duration: "p(95)<1"
scenarios:
  - name: slow
    steps:
      - request:
          url: "{{env.BASE_URL}}/slow?ms=20"
"#,
    )?;

    let out = volley(run_args(&plan, server.base_url(), &["--iterations", "2"])).await?;
    server.shutdown().await;

    ensure_exit(&out, 11)?;
    let stderr = String::from_utf8_lossy(&out.stderr);
    anyhow::ensure!(stderr.contains("thresholds failed"), "stderr:\n{stderr}");
    Ok(())
}

#[tokio::test]
async fn setup_failed_exit_20() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = write_plan(
        dir.path(),
        r#"
setup:
  steps:
    - request:
        url: "{{env.BASE_URL}}/team/get?team_name=missing"
scenarios:
  - name: health
    steps:
      - request: { url: "{{env.BASE_URL}}/health" }
"#,
    )?;

    let out = volley(run_args(&plan, server.base_url(), &["--iterations", "5"])).await?;
    let requests = server.stats().requests_total();
    server.shutdown().await;

    ensure_exit(&out, 20)?;
    anyhow::ensure!(requests == 1, "no VU may run after setup fails, got {requests}");
    Ok(())
}

#[tokio::test]
async fn teardown_failed_exit_21() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = write_plan(
        dir.path(),
        r#"
teardown:
  steps:
    - request:
        url: "{{env.BASE_URL}}/team/get?team_name=missing"
scenarios:
  - name: health
    steps:
      - request: { url: "{{env.BASE_URL}}/health" }
"#,
    )?;

    let out = volley(run_args(&plan, server.base_url(), &["--iterations", "2"])).await?;
    server.shutdown().await;

    ensure_exit(&out, 21)?;
    let stderr = String::from_utf8_lossy(&out.stderr);
    anyhow::ensure!(stderr.contains("teardown failed"), "stderr:\n{stderr}");
    Ok(())
}

#[tokio::test]
async fn validate_accepts_demo_plans() -> anyhow::Result<()> {
    let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos");

    for name in ["easy.yaml", "heavy.yaml"] {
        let out = volley(vec![
            "validate".to_string(),
            demos.join(name).display().to_string(),
        ])
        .await?;
        ensure_exit(&out, 0)?;
    }
    Ok(())
}

#[tokio::test]
async fn validate_rejects_bad_plan() -> anyhow::Result<()> {
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = write_plan(dir.path(), "scenarios: []\n")?;

    let out = volley(vec!["validate".to_string(), plan.display().to_string()]).await?;
    ensure_exit(&out, 30)
}

#[tokio::test]
async fn zero_vus_idle_out_the_duration() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let dir = tempfile::tempdir().context("tempdir")?;
    let plan = write_plan(
        dir.path(),
        r#"
options:
  thresholds:
    http_req_duration: "p(95)<300"
scenarios:
  - name: health
    steps:
      - request: { url: "{{env.BASE_URL}}/health" }
"#,
    )?;

    let out = volley(run_args(
        &plan,
        server.base_url(),
        &["--vus", "0", "--duration", "200ms"],
    ))
    .await?;
    ensure_exit(&out, 0)?;

    let out = volley(run_args(
        &plan,
        server.base_url(),
        &["--vus", "0", "--duration", "200ms", "--no-data", "fail"],
    ))
    .await?;
    ensure_exit(&out, 11)?;

    let requests = server.stats().requests_total();
    server.shutdown().await;
    anyhow::ensure!(requests == 0, "expected no requests, got {requests}");
    Ok(())
}
