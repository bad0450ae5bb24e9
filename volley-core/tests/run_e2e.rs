use std::time::{Duration, Instant};

use anyhow::Context as _;
use serde_json::json;
use volley_core::{
    Check, Error, Guard, HttpClient, HttpStep, LoadProfile, NoDataPolicy, RunConfig, RunPlan,
    Scenario, Stage, Step, StepLifecycle, ThresholdExprConfig, ThresholdSet, run,
};
use volley_testserver::{
    PATH_HEALTH, PATH_PR_CREATE, PATH_PR_MERGE, PATH_PR_REASSIGN, PATH_SLOW, PATH_TEAM_ADD,
    PATH_TEAM_GET, TestServer,
};

fn iterations(vus: u64, n: u64) -> RunConfig {
    RunConfig::with_profile(LoadProfile::Fixed {
        vus,
        duration: None,
        iterations: Some(n),
    })
}

/// Creates a team whose members are `u1..=u{members}`, suffixed with the run id.
fn team_setup(base: &str, members: usize) -> anyhow::Result<StepLifecycle> {
    let users: Vec<String> = (1..=members).map(|i| format!("u{i}-{{{{run_id}}}}")).collect();
    let body = json!({
        "team_name": "team-{{run_id}}",
        "members": users
            .iter()
            .map(|id| json!({"user_id": id, "username": id, "is_active": true}))
            .collect::<Vec<_>>(),
    });

    let step = HttpStep::post(&format!("{base}{PATH_TEAM_ADD}"))?
        .with_body(&body)?
        .with_check(Check::status("team created", [201]));

    Ok(StepLifecycle::new()
        .with_step(Step::http("create_team", step))
        .with_output(&json!({"team": "team-{{run_id}}", "users": users}))?)
}

#[tokio::test]
async fn create_think_merge_round_trip() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let base = server.base_url().to_string();

    let create = HttpStep::post(&format!("{base}{PATH_PR_CREATE}"))?
        .with_body(&json!({
            "pull_request_id": "{{vars.pr_id}}",
            "pull_request_name": "load",
            "author_id": "{{vars.author}}",
        }))?
        .with_check(Check::status("status is 201", [201]))
        .with_check(Check::json_path("has id", "pr.pull_request_id")?)
        .fatal();
    let merge = HttpStep::post(&format!("{base}{PATH_PR_MERGE}"))?
        .with_body(&json!({"pull_request_id": "{{vars.pr_id}}"}))?
        .with_check(Check::status("status is 200", [200]))
        .with_check(Check::json_equals("merged", "pr.status", json!("MERGED"))?);

    let scenario = Scenario::new("create_merge", 1.0)
        .with_var("pr_id", &json!("pr-{{uuid}}"))?
        .with_var("author", &json!("{{random setup.users}}"))?
        .with_step(Step::http("create", create))
        .with_step(Step::think("think", Duration::from_millis(200), None))
        .with_step(Step::http("merge", merge));

    let plan = RunPlan::new(iterations(1, 2), vec![scenario]).with_setup(team_setup(&base, 3)?);
    let outcome = run(plan, HttpClient::default(), None)
        .await
        .context("run plan")?;

    let stats = server.stats().clone();
    server.shutdown().await;

    let s = &outcome.summary;
    anyhow::ensure!(s.totals.requests_total == 4, "requests: {:?}", s.totals);
    anyhow::ensure!(s.totals.failed_requests_total == 0, "failed: {:?}", s.totals);
    anyhow::ensure!(s.checks_total() == 8, "checks: {:?}", s.checks);
    anyhow::ensure!(outcome.checks_failed() == 0, "checks: {:?}", s.checks);
    anyhow::ensure!(s.totals.iterations_total == 2);
    anyhow::ensure!(
        s.totals.iteration_duration.min.is_some_and(|ms| ms >= 200.0),
        "iteration duration: {:?}",
        s.totals.iteration_duration
    );

    // Setup traffic reaches the server but stays out of the run totals.
    anyhow::ensure!(stats.teams_created() == 1);
    anyhow::ensure!(stats.requests_total() == 5);
    anyhow::ensure!(stats.prs_created() == 2);
    anyhow::ensure!(stats.prs_merged() == 2);
    anyhow::ensure!(outcome.thresholds_passed());
    anyhow::ensure!(outcome.teardown_error.is_none());

    Ok(())
}

#[tokio::test]
async fn guarded_step_follows_extraction() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let base = server.base_url().to_string();

    let reassign = || -> anyhow::Result<Step> {
        let step = HttpStep::post(&format!("{base}{PATH_PR_REASSIGN}"))?
            .with_body(&json!({
                "pull_request_id": "{{vars.pr_id}}",
                "old_user_id": "{{vars.reviewer}}",
            }))?
            .with_expected_statuses([200, 409]);
        Ok(Step::http("reassign", step).with_guard(Guard::Present("reviewer".to_string())))
    };

    // The health body has no reviewers, so the extract misses, reassign is skipped and the
    // iteration carries on with the next step.
    let miss = Scenario::new("miss", 1.0)
        .with_var("pr_id", &json!("pr-{{uuid}}"))?
        .with_step(Step::http("health", HttpStep::get(&format!("{base}{PATH_HEALTH}"))?))
        .with_step(Step::extract("reviewer", "reviewer", "pr.assigned_reviewers[0]")?)
        .with_step(reassign()?)
        .with_step(Step::http(
            "after",
            HttpStep::get(&format!("{base}{PATH_HEALTH}"))?
                .with_check(Check::status("still running", [200])),
        ));

    let plan = RunPlan::new(iterations(1, 1), vec![miss]);
    let outcome = run(plan, HttpClient::default(), None)
        .await
        .context("run miss plan")?;
    let s = &outcome.summary;
    anyhow::ensure!(s.totals.requests_total == 2, "requests: {:?}", s.totals);
    anyhow::ensure!(s.totals.iterations_total == 1 && s.totals.iterations_failed == 0);
    anyhow::ensure!(
        s.checks
            .iter()
            .any(|c| c.step == "after" && c.passes == 1 && c.fails == 0),
        "checks: {:?}",
        s.checks
    );
    anyhow::ensure!(server.stats().requests_total() == 2);
    anyhow::ensure!(server.stats().reassigned() + server.stats().reassign_conflicts() == 0);

    // Two-member team: the only candidate is already assigned, so reassign conflicts.
    let hit = Scenario::new("hit", 1.0)
        .with_var("pr_id", &json!("pr-{{uuid}}"))?
        .with_step(Step::http(
            "create",
            HttpStep::post(&format!("{base}{PATH_PR_CREATE}"))?.with_body(&json!({
                "pull_request_id": "{{vars.pr_id}}",
                "pull_request_name": "load",
                "author_id": "{{setup.users[0]}}",
            }))?,
        ))
        .with_step(Step::extract("reviewer", "reviewer", "pr.assigned_reviewers[0]")?)
        .with_step(reassign()?);

    let plan = RunPlan::new(iterations(1, 1), vec![hit]).with_setup(team_setup(&base, 2)?);
    let outcome = run(plan, HttpClient::default(), None)
        .await
        .context("run hit plan")?;

    let conflicts = server.stats().reassign_conflicts();
    server.shutdown().await;

    anyhow::ensure!(outcome.summary.totals.requests_total == 2);
    anyhow::ensure!(
        outcome.summary.totals.failed_requests_total == 0,
        "409 is expected for reassign: {:?}",
        outcome.summary.totals
    );
    anyhow::ensure!(conflicts == 1);

    Ok(())
}

#[tokio::test]
async fn ramping_profile_reaches_peak_and_winds_down() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let url = server.url(PATH_HEALTH);

    let mut config = RunConfig::with_profile(LoadProfile::Ramping {
        start_vus: 0,
        stages: vec![
            Stage {
                duration: Duration::from_millis(400),
                target: 3,
            },
            Stage {
                duration: Duration::from_millis(400),
                target: 3,
            },
            Stage {
                duration: Duration::from_millis(200),
                target: 0,
            },
        ],
    });
    config.control_interval = Duration::from_millis(20);

    let scenario = Scenario::new("health", 1.0).with_step(Step::http("get", HttpStep::get(&url)?));
    let started = Instant::now();
    let outcome = run(RunPlan::new(config, vec![scenario]), HttpClient::default(), None)
        .await
        .context("run plan")?;
    let took = started.elapsed();
    server.shutdown().await;

    anyhow::ensure!(outcome.summary.vus_max == 3, "vus_max: {}", outcome.summary.vus_max);
    anyhow::ensure!(outcome.summary.totals.requests_total > 0);
    anyhow::ensure!(!outcome.hard_stopped);
    anyhow::ensure!(
        took >= Duration::from_millis(1_000) && took < Duration::from_secs(10),
        "took {took:?}"
    );

    Ok(())
}

#[tokio::test]
async fn latency_threshold_fails_run() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let url = format!("{}?ms=30", server.url(PATH_SLOW));

    let mut config = iterations(2, 6);
    config.thresholds = vec![
        ThresholdSet::from_key(
            "http_req_duration",
            vec![ThresholdExprConfig::new("p(95)<5")],
        )?,
        ThresholdSet::from_key(
            "http_req_failed",
            vec![ThresholdExprConfig::new("rate<0.01")],
        )?,
    ];

    let scenario = Scenario::new("slow", 1.0).with_step(Step::http("get", HttpStep::get(&url)?));
    let outcome = run(RunPlan::new(config, vec![scenario]), HttpClient::default(), None)
        .await
        .context("run plan")?;
    server.shutdown().await;

    anyhow::ensure!(!outcome.thresholds_passed());
    let violations: Vec<_> = outcome.thresholds.violations().collect();
    anyhow::ensure!(violations.len() == 1, "violations: {violations:?}");
    anyhow::ensure!(violations[0].metric == "http_req_duration");
    anyhow::ensure!(violations[0].observed.is_some_and(|ms| ms >= 30.0));
    anyhow::ensure!(!outcome.aborted_by_threshold);

    Ok(())
}

#[tokio::test]
async fn abort_on_fail_stops_run_early() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    // Missing query parameter: every call is a 400.
    let url = server.url(PATH_TEAM_GET);

    let mut config = RunConfig::fixed(2, Duration::from_secs(30));
    config.thresholds = vec![ThresholdSet::from_key(
        "http_req_failed",
        vec![ThresholdExprConfig::aborting("rate<0.5")],
    )?];

    let scenario = Scenario::new("bad", 1.0).with_step(Step::http("get", HttpStep::get(&url)?));
    let started = Instant::now();
    let outcome = run(RunPlan::new(config, vec![scenario]), HttpClient::default(), None)
        .await
        .context("run plan")?;
    let took = started.elapsed();
    server.shutdown().await;

    anyhow::ensure!(outcome.aborted_by_threshold);
    anyhow::ensure!(!outcome.thresholds_passed());
    anyhow::ensure!(took < Duration::from_secs(10), "took {took:?}");

    Ok(())
}

#[tokio::test]
async fn setup_failure_starts_no_vus() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;

    let setup = StepLifecycle::new().with_step(Step::http(
        "lookup",
        HttpStep::get(&server.url(&format!("{PATH_TEAM_GET}?team_name=missing")))?,
    ));
    let scenario = Scenario::new("health", 1.0)
        .with_step(Step::http("get", HttpStep::get(&server.url(PATH_HEALTH))?));

    let res = run(
        RunPlan::new(iterations(1, 5), vec![scenario]).with_setup(setup),
        HttpClient::default(),
        None,
    )
    .await;

    let requests = server.stats().requests_total();
    server.shutdown().await;

    anyhow::ensure!(
        matches!(res, Err(Error::SetupFailed(_))),
        "expected setup failure, got {res:?}"
    );
    anyhow::ensure!(requests == 1, "requests: {requests}");

    Ok(())
}

#[tokio::test]
async fn teardown_failure_is_reported_separately() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;

    let teardown = StepLifecycle::new().with_step(Step::http(
        "cleanup",
        HttpStep::get(&server.url(&format!("{PATH_TEAM_GET}?team_name=missing")))?,
    ));
    let scenario = Scenario::new("health", 1.0)
        .with_step(Step::http("get", HttpStep::get(&server.url(PATH_HEALTH))?));

    let outcome = run(
        RunPlan::new(iterations(1, 3), vec![scenario]).with_teardown(teardown),
        HttpClient::default(),
        None,
    )
    .await
    .context("run plan")?;
    server.shutdown().await;

    anyhow::ensure!(outcome.teardown_error.is_some());
    anyhow::ensure!(outcome.thresholds_passed());
    anyhow::ensure!(outcome.summary.totals.requests_total == 3);
    anyhow::ensure!(outcome.summary.totals.failed_requests_total == 0);

    Ok(())
}

#[tokio::test]
async fn zero_vus_still_run_lifecycle_and_thresholds() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let base = server.base_url().to_string();

    let teardown = StepLifecycle::new().with_step(Step::http(
        "lookup",
        HttpStep::get(&format!("{base}{PATH_TEAM_GET}?team_name={{{{setup.team}}}}"))?,
    ));
    let scenario = Scenario::new("health", 1.0)
        .with_step(Step::http("get", HttpStep::get(&server.url(PATH_HEALTH))?));

    let plan = |no_data| -> anyhow::Result<RunPlan> {
        let mut config = RunConfig::fixed(0, Duration::from_millis(300));
        config.no_data = no_data;
        config.thresholds = vec![ThresholdSet::from_key(
            "http_req_duration",
            vec![ThresholdExprConfig::new("p(95)<100")],
        )?];
        Ok(RunPlan::new(config, vec![scenario.clone()])
            .with_setup(team_setup(&base, 2)?)
            .with_teardown(teardown.clone()))
    };

    let started = Instant::now();
    let passing = run(plan(NoDataPolicy::Pass)?, HttpClient::default(), None)
        .await
        .context("run idle plan")?;
    let took = started.elapsed();

    anyhow::ensure!(took >= Duration::from_millis(300), "took {took:?}");
    anyhow::ensure!(passing.summary.vus_max == 0);
    anyhow::ensure!(passing.summary.totals.requests_total == 0);
    anyhow::ensure!(passing.summary.totals.iterations_total == 0);
    anyhow::ensure!(passing.teardown_error.is_none(), "{:?}", passing.teardown_error);
    anyhow::ensure!(passing.thresholds_passed());

    let failing = run(plan(NoDataPolicy::Fail)?, HttpClient::default(), None)
        .await
        .context("run idle plan failing closed")?;
    anyhow::ensure!(!failing.thresholds_passed());
    anyhow::ensure!(failing.thresholds.violations().all(|v| v.no_data));

    let stats = server.stats().clone();
    server.shutdown().await;

    // Setup and teardown once per run, nothing from the empty population.
    anyhow::ensure!(stats.teams_created() == 2);
    anyhow::ensure!(stats.requests_total() == 4, "requests: {}", stats.requests_total());

    Ok(())
}

#[tokio::test]
async fn hard_stop_cancels_in_flight_requests() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let url = format!("{}?ms=20000", server.url(PATH_SLOW));

    let mut config = RunConfig::fixed(2, Duration::from_millis(100));
    config.graceful_stop = Duration::from_millis(200);
    config.request_timeout = None;

    let scenario = Scenario::new("slow", 1.0).with_step(Step::http("get", HttpStep::get(&url)?));
    let started = Instant::now();
    let outcome = run(RunPlan::new(config, vec![scenario]), HttpClient::default(), None)
        .await
        .context("run plan")?;
    let took = started.elapsed();
    // The server still has handlers sleeping; dropping it aborts them.
    drop(server);

    let t = &outcome.summary.totals;
    anyhow::ensure!(outcome.hard_stopped);
    anyhow::ensure!(
        took >= Duration::from_millis(300) && took < Duration::from_secs(5),
        "took {took:?}"
    );
    anyhow::ensure!(t.requests_total == 2, "requests: {t:?}");
    anyhow::ensure!(t.failed_requests_total == t.requests_total, "failed: {t:?}");

    Ok(())
}
