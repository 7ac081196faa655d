//! End-to-end scenarios against a fake application.
//!
//! Shell scripts stand in for the build and run tools. The run script
//! touches a `started` flag and, on SIGTERM, prints its shutdown line and
//! touches `stopped`. An in-process axum server follows those flags so the
//! port opens and closes with the fake application.

#![cfg(unix)]

use axum::routing::get;
use axum::Router;
use startstop::orchestrator::OrchestratorError;
use startstop::Orchestrator;
use startstop_core::logcheck::LogError;
use startstop_core::threshold::{
    rss_key, time_to_first_ok_request_key, time_to_reload_key, ThresholdError,
};
use startstop_core::{AppRegistry, HarnessConfig, Mode, OsFamily};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

const APPS: &str = r#"
[[app]]
name = "fake"
dir = "fake"

[[app.url]]
path = "/hello"
expected = "Hello"

[app.reload]
file = "greeting.txt"
from = "Hello"
to = "Bye"
path = "/hello"
expected = "Bye"
"#;

struct Fixture {
    dir: TempDir,
    port: u16,
}

impl Fixture {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn flags(&self) -> PathBuf {
        self.root().join("flags")
    }

    fn config(&self, iterations: u32) -> HarnessConfig {
        let scripts = self.root().join("scripts");
        let sh = |name: &str| {
            Some(vec![
                "sh".to_string(),
                scripts.join(name).display().to_string(),
            ])
        };

        let mut config = HarnessConfig {
            repo_dir: self.root().join("repo"),
            workspace_dir: self.root().join("work"),
            archive_dir: self.root().join("archive"),
            host: "127.0.0.1".to_string(),
            port: self.port,
            iterations,
            build_timeout_sec: 30,
            start_timeout_sec: 20,
            stop_wait_sec: 10,
            port_close_timeout_sec: 10,
            probe_poll_ms: 50,
            port_poll_ms: 50,
            ..Default::default()
        };
        config.templates.build = sh("build.sh");
        config.templates.run = sh("run.sh");
        config.templates.dev = sh("run.sh");
        config
    }

    fn write_thresholds(&self, content: &str) {
        fs::write(self.root().join("repo/fake/threshold.conf"), content).unwrap();
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn fixture(build_output: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let flags = root.join("flags");
    let scripts = root.join("scripts");
    let app = root.join("repo/fake");
    fs::create_dir_all(&flags).unwrap();
    fs::create_dir_all(&scripts).unwrap();
    fs::create_dir_all(app.join("target")).unwrap();
    fs::write(app.join("greeting.txt"), "Hello from fake").unwrap();
    fs::write(app.join("target/stale.jar"), "stale").unwrap();

    fs::write(
        scripts.join("build.sh"),
        format!("echo '{build_output}'\n"),
    )
    .unwrap();
    fs::write(
        scripts.join("run.sh"),
        format!(
            "trap 'echo \"INFO fake stopped in 0.011s\"; touch {stopped}; exit 0' TERM\n\
             touch {started}\n\
             echo \"INFO fake 1.0 on JVM started in 0.512s. Listening on: http://127.0.0.1\"\n\
             while true; do sleep 0.1; done\n",
            started = flags.join("started").display(),
            stopped = flags.join("stopped").display(),
        ),
    )
    .unwrap();

    Fixture {
        dir,
        port: free_port().await,
    }
}

/// Consume `flag` once it exists.
async fn wait_for_flag(flag: &Path) {
    while fs::remove_file(flag).is_err() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Serve `body_file` on `port` between each `started` and `stopped` flag.
fn spawn_fake_server(port: u16, flags: PathBuf, body_file: PathBuf) {
    tokio::spawn(async move {
        loop {
            wait_for_flag(&flags.join("started")).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let body_file = body_file.clone();
            let app = Router::new().route(
                "/hello",
                get(move || {
                    let body_file = body_file.clone();
                    async move { fs::read_to_string(body_file).unwrap_or_default() }
                }),
            );
            let stopped = flags.join("stopped");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { wait_for_flag(&stopped).await })
                .await
                .unwrap();
        }
    });
}

fn thresholds(mode: Mode, rss_kb: u64) -> String {
    let os = OsFamily::current();
    format!(
        "{}={rss_kb}\n{}=60000\n{}=60000\n",
        rss_key(os, mode),
        time_to_first_ok_request_key(os, mode),
        time_to_reload_key(os, mode),
    )
}

fn single_bundle(archive: &Path) -> PathBuf {
    let bundles: Vec<PathBuf> = fs::read_dir(archive)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    assert_eq!(bundles.len(), 1, "bundles: {bundles:?}");
    bundles.into_iter().next().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn start_stop_measures_every_iteration() {
    let fx = fixture("BUILD SUCCESS").await;
    fx.write_thresholds(&thresholds(Mode::Jvm, 100_000_000));
    spawn_fake_server(
        fx.port,
        fx.flags(),
        fx.root().join("work/fake-jvm/app/greeting.txt"),
    );

    let registry = AppRegistry::parse(APPS, Path::new("apps.toml")).unwrap();
    let app = registry.get("fake").unwrap();
    let config = fx.config(3);
    let orchestrator = Orchestrator::new(config.clone(), startstop::detect()).unwrap();

    let report = orchestrator.run_start_stop(app, Mode::Jvm).await.unwrap();

    assert_eq!(report.measurements.len(), 3);
    for m in &report.measurements {
        assert!(m.build_time_ms.unwrap() >= 1);
        assert!(m.time_to_first_ok_request_ms.unwrap() >= 1);
        assert_eq!(m.started_in_ms, Some(512));
        assert_eq!(m.stopped_in_ms, Some(11));
    }
    assert!(report.trimmed_time_to_first_ok_request_ms.is_some());

    let csv = fs::read_to_string(config.measurements_log(Mode::Jvm)).unwrap();
    let mut lines = csv.lines();
    assert!(lines.next().unwrap().starts_with("App,Mode,buildTimeMs"));
    assert_eq!(lines.count(), 3);

    let bundle = single_bundle(&config.archive_dir);
    assert_eq!(report.archive.as_deref(), Some(bundle.to_str().unwrap()));
    let manifest = fs::read_to_string(bundle.join("MANIFEST.sha256")).unwrap();
    for log in ["build.log", "run-1.log", "run-2.log", "run-3.log"] {
        assert!(manifest.contains(log), "{log} missing from manifest");
    }
    let text = fs::read_to_string(bundle.join("report.txt")).unwrap();
    assert!(text.contains("PASSED"));

    assert!(!config.workspace_dir.join("fake-jvm").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn dev_loop_measures_reload() {
    let fx = fixture("BUILD SUCCESS").await;
    fx.write_thresholds(&thresholds(Mode::Dev, 100_000_000));
    spawn_fake_server(
        fx.port,
        fx.flags(),
        fx.root().join("work/fake-dev/app/greeting.txt"),
    );

    let registry = AppRegistry::parse(APPS, Path::new("apps.toml")).unwrap();
    let mut config = fx.config(1);
    config.cleanup = false;
    let orchestrator = Orchestrator::new(config.clone(), startstop::detect()).unwrap();

    let report = orchestrator
        .run_dev_loop(registry.get("fake").unwrap())
        .await
        .unwrap();

    assert_eq!(report.mode, Mode::Dev);
    let m = &report.measurements[0];
    assert!(m.time_to_reload_ms.unwrap() >= 1);
    assert_eq!(m.build_time_ms, None);

    let app_dir = config.workspace_dir.join("fake-dev/app");
    assert_eq!(
        fs::read_to_string(app_dir.join("greeting.txt")).unwrap(),
        "Bye from fake"
    );
    assert!(!app_dir.join("target").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn offending_build_output_fails_and_archives() {
    let fx = fixture("ERROR could not resolve dependencies").await;
    fx.write_thresholds(&thresholds(Mode::Jvm, 100_000_000));

    let registry = AppRegistry::parse(APPS, Path::new("apps.toml")).unwrap();
    let config = fx.config(1);
    let orchestrator = Orchestrator::new(config.clone(), startstop::detect()).unwrap();

    let err = orchestrator
        .run_start_stop(registry.get("fake").unwrap(), Mode::Jvm)
        .await
        .unwrap_err();
    assert!(
        matches!(err, OrchestratorError::Log(LogError::Offending { .. })),
        "unexpected error: {err:?}"
    );

    let bundle = single_bundle(&config.archive_dir);
    assert!(bundle.join("build.log").exists());
    let text = fs::read_to_string(bundle.join("report.txt")).unwrap();
    assert!(text.contains("FAILED"));
    assert!(!config.workspace_dir.join("fake-jvm").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn exceeded_threshold_fails_the_scenario() {
    let fx = fixture("BUILD SUCCESS").await;
    fx.write_thresholds(&thresholds(Mode::Jvm, 1));
    spawn_fake_server(
        fx.port,
        fx.flags(),
        fx.root().join("work/fake-jvm/app/greeting.txt"),
    );

    let registry = AppRegistry::parse(APPS, Path::new("apps.toml")).unwrap();
    let orchestrator = Orchestrator::new(fx.config(1), startstop::detect()).unwrap();

    let err = orchestrator
        .run_start_stop(registry.get("fake").unwrap(), Mode::Jvm)
        .await
        .unwrap_err();
    match err {
        OrchestratorError::Threshold(ThresholdError::Exceeded(violations)) => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].key, rss_key(OsFamily::current(), Mode::Jvm));
        }
        other => panic!("expected threshold violation, got {other:?}"),
    }
}

/// Alive and not a zombie waiting for a reaper.
fn is_running(pid: u32) -> bool {
    if !startstop::detect().is_alive(pid) {
        return false;
    }
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        // State is the first field after the parenthesised command name.
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => true,
    }
}

fn read_pid(path: &Path) -> u32 {
    fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn readiness_timeout_stops_the_whole_tree_and_archives() {
    let fx = fixture("BUILD SUCCESS").await;
    fx.write_thresholds(&thresholds(Mode::Jvm, 100_000_000));

    // Never serves anything; leaves a background child behind it.
    let root_pid = fx.flags().join("root.pid");
    let child_pid = fx.flags().join("child.pid");
    let hang = fx.root().join("scripts/hang.sh");
    fs::write(
        &hang,
        format!(
            "echo $$ > {root}\n\
             sleep 300 &\n\
             echo $! > {child}\n\
             echo \"INFO fake starting\"\n\
             while true; do sleep 0.1; done\n",
            root = root_pid.display(),
            child = child_pid.display(),
        ),
    )
    .unwrap();

    let registry = AppRegistry::parse(APPS, Path::new("apps.toml")).unwrap();
    let mut config = fx.config(1);
    config.start_timeout_sec = 2;
    config.templates.run = Some(vec!["sh".to_string(), hang.display().to_string()]);
    let orchestrator = Orchestrator::new(config.clone(), startstop::detect()).unwrap();

    let err = orchestrator
        .run_start_stop(registry.get("fake").unwrap(), Mode::Jvm)
        .await
        .unwrap_err();
    assert!(
        matches!(err, OrchestratorError::Probe(_)),
        "unexpected error: {err:?}"
    );

    let root = read_pid(&root_pid);
    let child = read_pid(&child_pid);
    // The orphaned child is reaped asynchronously by init.
    for _ in 0..50 {
        if !is_running(root) && !is_running(child) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!is_running(root), "root {root} still running");
    assert!(!is_running(child), "child {child} still running");

    let bundle = single_bundle(&config.archive_dir);
    assert!(bundle.join("run-1.log").exists());
    let manifest = fs::read_to_string(bundle.join("MANIFEST.sha256")).unwrap();
    assert!(manifest.contains("run-1.log"));
    let text = fs::read_to_string(bundle.join("report.txt")).unwrap();
    assert!(text.contains("FAILED"));
    assert!(!config.workspace_dir.join("fake-jvm").exists());
}
