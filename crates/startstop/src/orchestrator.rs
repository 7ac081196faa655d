//! Scenario orchestration.
//!
//! A scenario runs one application in one mode:
//!
//! 1. prepare a fresh workspace under `<workspace>/<app>-<mode>`
//! 2. build (or generate) and validate the build log
//! 3. start / probe / sample / stop cycles, validating each run log
//! 4. trimmed means of RSS and time to first OK request
//! 5. threshold gate
//! 6. cleanup: stop leftovers, archive logs, write the report, drop the workspace
//!
//! Step 6 runs no matter how steps 1-5 ended. Cleanup errors are logged and
//! never replace the scenario result.

use crate::archive;
use crate::platform::Platform;
use crate::prober::{join_url, ProbeError, Prober, ProberConfig};
use crate::sampler::{ResourceSample, ResourceSampler};
use crate::supervisor::{RunningProcess, Supervisor, SupervisorConfig, SupervisorError};
use startstop_core::apps::AppsError;
use startstop_core::command::CommandError;
use startstop_core::logcheck::LogError;
use startstop_core::measurement::MeasurementError;
use startstop_core::threshold::ThresholdError;
use startstop_core::whitelist::WhitelistError;
use startstop_core::{
    log_measurements, trimmed_mean, AppDescriptor, CommandBuilder, HarnessConfig, LogAnalyzer,
    Measurement, MeasurementBuilder, Mode, Observed, ScenarioReport, StepRecord, Template,
    ThresholdSet, WhitelistSet,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Bound on each page cache command.
const DROP_CACHES_TIMEOUT: Duration = Duration::from_secs(60);

/// Build output skipped when copying application sources.
const SKIPPED_SOURCE_DIRS: &[&str] = &["target", ".git"];

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Whitelist(#[from] WhitelistError),
    #[error(transparent)]
    Measurement(#[from] MeasurementError),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error(transparent)]
    Apps(#[from] AppsError),
    #[error("{step} failed with exit code {code:?}; see {}", log.display())]
    StepFailed {
        step: &'static str,
        code: Option<i32>,
        log: PathBuf,
    },
    #[error("{host}:{port} still accepting connections {timeout_sec}s after stop")]
    PortStillOpen {
        host: String,
        port: u16,
        timeout_sec: u64,
    },
    #[error("reload edit not applied: {from:?} not found in {}", file.display())]
    ReloadEditNotApplied { file: PathBuf, from: String },
    #[error("application sources not found: {}", .0.display())]
    MissingSources(PathBuf),
    #[error("mode {0} is not supported by this scenario")]
    UnsupportedMode(Mode),
    #[error("application {0} declares no probe URL")]
    NoReadinessUrl(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Per-scenario state owned by the coordinating task.
#[derive(Debug)]
struct Scenario<'a> {
    app: &'a AppDescriptor,
    mode: Mode,
    root: PathBuf,
    app_dir: PathBuf,
    logs_dir: PathBuf,
    whitelist: WhitelistSet,
    thresholds: ThresholdSet,
    commands: CommandBuilder,
    report: ScenarioReport,
    /// Process to force-stop during cleanup if a stage bailed out.
    process: Option<RunningProcess>,
}

impl Scenario<'_> {
    fn log(&self, name: &str) -> PathBuf {
        self.logs_dir.join(name)
    }
}

/// Sequences builds, runs, probes and measurements for one application.
#[derive(Debug)]
pub struct Orchestrator {
    config: HarnessConfig,
    platform: Arc<dyn Platform>,
    supervisor: Supervisor,
    prober: Prober,
    sampler: ResourceSampler,
    analyzer: LogAnalyzer,
}

impl Orchestrator {
    pub fn new(config: HarnessConfig, platform: Arc<dyn Platform>) -> Result<Self> {
        let supervisor = Supervisor::new(
            Arc::clone(&platform),
            SupervisorConfig {
                stop_wait: config.stop_wait(),
                ..Default::default()
            },
        );
        let prober = Prober::new(ProberConfig {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            poll_interval: Duration::from_millis(config.probe_poll_ms),
            port_poll_interval: Duration::from_millis(config.port_poll_ms),
            accept_invalid_certs: config.accept_invalid_certs,
        })?;
        let sampler = ResourceSampler::new(Arc::clone(&platform));
        let analyzer = LogAnalyzer::new()?;

        Ok(Self {
            config,
            platform,
            supervisor,
            prober,
            sampler,
            analyzer,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Build once, then start and stop the application `iterations` times.
    pub async fn run_start_stop(&self, app: &AppDescriptor, mode: Mode) -> Result<ScenarioReport> {
        if mode.is_dev_loop() {
            return Err(OrchestratorError::UnsupportedMode(mode));
        }
        let mut scenario = self.scenario(app, mode)?;
        info!(app = %app.name, %mode, iterations = self.config.iterations, "start-stop scenario");

        let result = self.start_stop_stages(&mut scenario).await;
        self.cleanup(&mut scenario, result.as_ref().err()).await;
        result.map(|()| scenario.report)
    }

    /// Start in dev mode, edit a source file and measure the reload.
    ///
    /// Applications marked `generated` are first created with the generator.
    pub async fn run_dev_loop(&self, app: &AppDescriptor) -> Result<ScenarioReport> {
        let mode = if app.generated {
            Mode::Generator
        } else {
            Mode::Dev
        };
        let mut scenario = self.scenario(app, mode)?;
        info!(app = %app.name, %mode, "dev-loop scenario");

        let result = self.dev_loop_stages(&mut scenario).await;
        self.cleanup(&mut scenario, result.as_ref().err()).await;
        result.map(|()| scenario.report)
    }

    fn scenario<'a>(&self, app: &'a AppDescriptor, mode: Mode) -> Result<Scenario<'a>> {
        let os = self.platform.os();
        let root = self
            .config
            .workspace_dir
            .join(format!("{}-{}", app.name, mode));
        let app_dir = if mode == Mode::Generator {
            root.join(&app.name)
        } else {
            root.join("app")
        };
        let commands = CommandBuilder::from_config(&self.config, os)
            .with_param("app", app.name.clone())
            .with_param("extensions", app.extensions.join(","))
            .with_env("QUARKUS_HTTP_PORT", self.config.port.to_string());

        Ok(Scenario {
            app,
            mode,
            logs_dir: root.join("logs"),
            app_dir,
            root,
            whitelist: WhitelistSet::new(&app.whitelist, os)?,
            thresholds: app.load_thresholds(&self.config.repo_dir)?,
            commands,
            report: ScenarioReport::new(app.name.clone(), mode, os),
            process: None,
        })
    }

    /// Clear and recreate the workspace; copy sources unless generated.
    fn prepare(&self, s: &mut Scenario<'_>) -> Result<()> {
        if s.root.exists() {
            std::fs::remove_dir_all(&s.root)?;
        }
        std::fs::create_dir_all(&s.logs_dir)?;

        if s.mode != Mode::Generator {
            let source = s.app.source_dir(&self.config.repo_dir);
            if !source.is_dir() {
                return Err(OrchestratorError::MissingSources(source));
            }
            copy_sources(&source, &s.app_dir)?;
        }

        s.report.step(
            StepRecord::new("PREPARE").with_message(s.root.display().to_string()),
        );
        Ok(())
    }

    async fn start_stop_stages(&self, s: &mut Scenario<'_>) -> Result<()> {
        self.prepare(s)?;
        let build_ms = self.build_step(s, Template::build_for(s.mode)?, "build").await?;

        let mut rss = Vec::new();
        let mut ttfr = Vec::new();
        for iteration in 1..=self.config.iterations {
            let m = self.start_stop_iteration(s, iteration, build_ms).await?;
            rss.extend(m.rss_kb);
            ttfr.extend(m.time_to_first_ok_request_ms);
            s.report.measurements.push(m);
        }

        s.report.trimmed_rss_kb = trimmed_mean(&rss);
        s.report.trimmed_time_to_first_ok_request_ms = trimmed_mean(&ttfr);
        info!(
            app = %s.app.name,
            mode = %s.mode,
            rss_kb = ?s.report.trimmed_rss_kb,
            time_to_first_ok_request_ms = ?s.report.trimmed_time_to_first_ok_request_ms,
            "trimmed means"
        );

        let observed = Observed {
            rss_kb: s.report.trimmed_rss_kb.map(|v| v as u64),
            time_to_first_ok_request_ms: s
                .report
                .trimmed_time_to_first_ok_request_ms
                .map(|v| v as u64),
            time_to_reload_ms: None,
        };
        self.check_thresholds(s, observed)
    }

    /// Run a build-like step to completion and validate its log.
    async fn build_step(
        &self,
        s: &mut Scenario<'_>,
        template: Template,
        step: &'static str,
    ) -> Result<i64> {
        let log = s.log(&format!("{step}.log"));
        let workdir = if template == Template::Generate {
            &s.root
        } else {
            &s.app_dir
        };
        let command = s.commands.build(template, workdir, &log)?;
        s.report.command(command.display());

        let started = Instant::now();
        let status = self
            .supervisor
            .run_and_wait_bounded(&command, self.config.build_timeout())
            .await?;
        let elapsed_ms = (started.elapsed().as_millis() as u64).max(1);

        s.report.step(
            StepRecord::new(step.to_uppercase())
                .with_duration_ms(elapsed_ms)
                .with_message(format!("exit code {:?}", status.code())),
        );
        info!(app = %s.app.name, step, elapsed_ms, exit_code = ?status.code(), "step finished");

        if !status.success() {
            return Err(OrchestratorError::StepFailed {
                step,
                code: status.code(),
                log,
            });
        }
        self.analyzer.ensure_clean(&log, &s.whitelist)?;
        Ok(elapsed_ms as i64)
    }

    async fn start_stop_iteration(
        &self,
        s: &mut Scenario<'_>,
        iteration: u32,
        build_ms: i64,
    ) -> Result<Measurement> {
        if self.config.cold_start {
            self.drop_caches().await;
        }

        let log = s.log(&format!("run-{iteration}.log"));
        let command = s
            .commands
            .build(Template::run_for(s.mode), &s.app_dir, &log)?;
        if iteration == 1 {
            s.report.command(command.display());
        }

        let (time_to_first_ok, sample) = self.start_and_probe(s, &command, iteration).await?;
        self.stop_and_verify(s, iteration).await?;

        let start_stop = self.validate_run_log(s, &log)?;
        let builder = MeasurementBuilder::new(self.platform.os())
            .app(s.app.name.clone())
            .mode(s.mode)
            .build_time_ms(build_ms)?
            .time_to_first_ok_request_ms(time_to_first_ok as i64)?
            .started_in_ms(start_stop.started_ms())?
            .stopped_in_ms(start_stop.stopped_ms())?;
        let measurement = with_sample(builder, sample, &s.app.name)?.build();

        self.record(s, &measurement);
        Ok(measurement)
    }

    async fn dev_loop_stages(&self, s: &mut Scenario<'_>) -> Result<()> {
        self.prepare(s)?;
        if s.mode == Mode::Generator {
            self.build_step(s, Template::Generate, "generate").await?;
            if !s.app_dir.is_dir() {
                return Err(OrchestratorError::MissingSources(s.app_dir.clone()));
            }
        }

        let log = s.log("dev.log");
        let command = s.commands.build(Template::Dev, &s.app_dir, &log)?;
        s.report.command(command.display());

        let (time_to_first_ok, sample) = self.start_and_probe(s, &command, 1).await?;
        let time_to_reload = match s.app.reload.clone() {
            Some(edit) => {
                let file = s.app_dir.join(&edit.file);
                apply_edit(&file, &edit.from, &edit.to)?;
                let url = join_url(&self.config.base_url(), &edit.path);
                let elapsed = self
                    .prober
                    .wait_for_content(&url, self.config.start_timeout(), &edit.expected, true)
                    .await?
                    .unwrap_or(1);
                s.report.step(
                    StepRecord::new("RELOAD")
                        .with_duration_ms(elapsed)
                        .with_message(edit.file.display().to_string()),
                );
                info!(app = %s.app.name, time_to_reload_ms = elapsed, "reload observed");
                Some(elapsed)
            }
            None => None,
        };

        self.stop_and_verify(s, 1).await?;
        let start_stop = self.validate_run_log(s, &log)?;

        let mut builder = MeasurementBuilder::new(self.platform.os())
            .app(s.app.name.clone())
            .mode(s.mode)
            .time_to_first_ok_request_ms(time_to_first_ok as i64)?
            .started_in_ms(start_stop.started_ms())?
            .stopped_in_ms(start_stop.stopped_ms())?;
        if let Some(ms) = time_to_reload {
            builder = builder.time_to_reload_ms(ms as i64)?;
        }
        let measurement = with_sample(builder, sample, &s.app.name)?.build();
        self.record(s, &measurement);

        let observed = Observed {
            rss_kb: measurement.rss_kb.map(|v| v as u64),
            time_to_first_ok_request_ms: Some(time_to_first_ok),
            time_to_reload_ms: time_to_reload,
        };
        s.report.measurements.push(measurement);
        self.check_thresholds(s, observed)
    }

    /// Start the process, wait for readiness, probe the other URLs and sample.
    async fn start_and_probe(
        &self,
        s: &mut Scenario<'_>,
        command: &startstop_core::Command,
        iteration: u32,
    ) -> Result<(u64, ResourceSample)> {
        let app = s.app;
        let readiness = app
            .readiness()
            .ok_or_else(|| OrchestratorError::NoReadinessUrl(app.name.clone()))?;
        let base = self.config.base_url();

        let process = self.supervisor.start(command)?;
        let pid = process.pid();
        s.process = Some(process);
        s.report.step(
            StepRecord::new("START")
                .with_iteration(iteration)
                .with_message(format!("pid {pid}")),
        );

        let time_to_first_ok = self
            .prober
            .wait_for_content(
                &join_url(&base, &readiness.path),
                self.config.start_timeout(),
                &readiness.expected,
                true,
            )
            .await?
            .unwrap_or(1);
        s.report.step(
            StepRecord::new("READY")
                .with_iteration(iteration)
                .with_duration_ms(time_to_first_ok),
        );
        info!(
            app = %s.app.name,
            iteration,
            time_to_first_ok_request_ms = time_to_first_ok,
            "application ready"
        );

        self.prober
            .probe_all(&base, app.additional_urls(), self.config.start_timeout())
            .await?;

        let sample = self.sampler.sample(pid).await;
        s.report.step(
            StepRecord::new("SAMPLE")
                .with_iteration(iteration)
                .with_message(format!("rss_kb={} fds={}", sample.rss_kb, sample.open_fds)),
        );
        Ok((time_to_first_ok, sample))
    }

    /// Graceful stop, then confirm the port was released.
    async fn stop_and_verify(&self, s: &mut Scenario<'_>, iteration: u32) -> Result<()> {
        let started = Instant::now();
        if let Some(process) = s.process.as_mut() {
            self.supervisor.stop(process, false).await?;
        }
        s.process = None;
        s.report.step(
            StepRecord::new("STOP")
                .with_iteration(iteration)
                .with_duration_ms(started.elapsed().as_millis() as u64),
        );

        let timeout = self.config.port_close_timeout();
        if !self
            .prober
            .wait_for_port_closed(&self.config.host, self.config.port, timeout)
            .await
        {
            return Err(OrchestratorError::PortStillOpen {
                host: self.config.host.clone(),
                port: self.config.port,
                timeout_sec: timeout.as_secs(),
            });
        }
        Ok(())
    }

    /// Offending lines, listening host and reported durations of a run log.
    fn validate_run_log(&self, s: &Scenario<'_>, log: &Path) -> Result<startstop_core::StartStop> {
        self.analyzer.ensure_clean(log, &s.whitelist)?;
        if let Some(host) = &self.config.expected_listen_host {
            self.analyzer.check_listening_host(log, host)?;
        }

        let start_stop = self.analyzer.parse_start_stop(log)?;
        if start_stop.started_s.is_none() {
            error!(log = %log.display(), "no 'started in' marker in log");
        }
        if start_stop.stopped_s.is_none() {
            error!(log = %log.display(), "no 'stopped in' marker in log");
        }
        Ok(start_stop)
    }

    /// Append the measurement row; a failed write is reported, not fatal.
    fn record(&self, s: &Scenario<'_>, measurement: &Measurement) {
        let path = self.config.measurements_log(s.mode);
        if let Err(err) = log_measurements(measurement, &path) {
            warn!(path = %path.display(), error = %err, "failed to append measurement");
        }
        info!(
            app = %s.app.name,
            mode = %s.mode,
            row = %measurement.line_csv(),
            "measurement recorded"
        );
    }

    fn check_thresholds(&self, s: &mut Scenario<'_>, observed: Observed) -> Result<()> {
        if s.thresholds.is_empty() {
            warn!(app = %s.app.name, "no thresholds configured; skipping gate");
            return Ok(());
        }
        let result = s.thresholds.check(self.platform.os(), s.mode, &observed);
        s.report.step(StepRecord::new("THRESHOLDS").with_message(match &result {
            Ok(()) => "within budget".to_string(),
            Err(err) => err.to_string(),
        }));
        result.map_err(Into::into)
    }

    /// Flush and drop the page cache before a cold start. Best effort.
    async fn drop_caches(&self) {
        let commands = self.platform.drop_caches_commands();
        if commands.is_empty() {
            warn!("dropping the page cache is not supported on this host");
            return;
        }
        for argv in commands {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            let run = tokio::process::Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .status();
            match tokio::time::timeout(DROP_CACHES_TIMEOUT, run).await {
                Ok(Ok(status)) if status.success() => {}
                Ok(Ok(status)) => {
                    warn!(command = %argv.join(" "), exit_code = ?status.code(), "cache drop failed");
                }
                Ok(Err(err)) => warn!(command = %argv.join(" "), error = %err, "cache drop failed"),
                Err(_) => warn!(command = %argv.join(" "), "cache drop timed out"),
            }
        }
    }

    /// Always runs. Each step logs its own failure and the next one proceeds.
    async fn cleanup(&self, s: &mut Scenario<'_>, failure: Option<&OrchestratorError>) {
        if let Some(mut process) = s.process.take() {
            warn!(pid = process.pid(), "stopping leftover process");
            if let Err(err) = self.supervisor.stop(&mut process, true).await {
                warn!(pid = process.pid(), error = %err, "failed to stop leftover process");
            }
        }

        if let Some(err) = failure {
            error!(app = %s.app.name, mode = %s.mode, error = %err, "scenario failed");
        }
        s.report.finish(failure.map(ToString::to_string));

        let archived = self.archive(s);

        if !self.config.cleanup {
            info!(workspace = %s.root.display(), "workspace kept");
        } else if !archived {
            warn!(workspace = %s.root.display(), "archival incomplete; workspace kept");
        } else if s.root.exists() {
            if let Err(err) = std::fs::remove_dir_all(&s.root) {
                warn!(workspace = %s.root.display(), error = %err, "failed to delete workspace");
            }
        }
    }

    /// Copy logs and the report into a fresh bundle. `true` only when every
    /// log and the report made it.
    fn archive(&self, s: &mut Scenario<'_>) -> bool {
        let created = archive::create_bundle_dir(&self.config.archive_dir, &s.app.name, s.mode);
        let bundle = match created {
            Ok(bundle) => bundle,
            Err(err) => {
                warn!(error = %err, "failed to create archive directory");
                return false;
            }
        };
        s.report.archive = Some(bundle.display().to_string());

        let mut complete = match archive::archive_logs(&s.logs_dir, &bundle) {
            Ok(logs) => {
                if !logs.is_complete() {
                    warn!(
                        bundle = %bundle.display(),
                        failed = ?logs.failed,
                        "some logs were not archived"
                    );
                }
                logs.is_complete()
            }
            Err(err) => {
                warn!(bundle = %bundle.display(), error = %err, "failed to archive logs");
                false
            }
        };
        if let Err(err) = archive::write_report(&bundle, &s.report) {
            warn!(bundle = %bundle.display(), error = %err, "failed to write report");
            complete = false;
        }

        info!(
            bundle = %bundle.display(),
            outcome = s.report.outcome.as_str(),
            complete,
            "scenario archived"
        );
        complete
    }
}

/// Add RSS and descriptor counts when they were available.
fn with_sample(
    mut builder: MeasurementBuilder,
    sample: ResourceSample,
    app: &str,
) -> Result<MeasurementBuilder> {
    if sample.rss_kb > 0 {
        builder = builder.rss_kb(sample.rss_kb)?;
    } else {
        warn!(app, "rss unavailable; omitted from measurement");
    }
    if sample.open_fds > 0 {
        builder = builder.open_fds(sample.open_fds)?;
    } else {
        warn!(app, "open descriptor count unavailable; omitted from measurement");
    }
    Ok(builder)
}

/// Replace `from` with `to` in `file`; `from` must be present.
fn apply_edit(file: &Path, from: &str, to: &str) -> Result<()> {
    let content = std::fs::read_to_string(file)?;
    if !content.contains(from) {
        return Err(OrchestratorError::ReloadEditNotApplied {
            file: file.to_path_buf(),
            from: from.to_string(),
        });
    }
    std::fs::write(file, content.replace(from, to))?;
    Ok(())
}

/// Recursive copy of application sources, skipping build output.
fn copy_sources(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if SKIPPED_SOURCE_DIRS.iter().any(|s| name == *s) {
                continue;
            }
            copy_sources(&entry.path(), &dest.join(&name))?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), dest.join(&name))?;
        }
    }
    Ok(())
}
