//! Supervisor loop for loopcast
//!
//! Pulls work items, runs one encoder session at a time, judges every exit
//! and decides between advancing, backing off and terminating.
//!
//! All mutable run state is owned by the [`Supervisor`] itself. The health
//! tracker lives inside a `watch` channel whose only sender is the
//! supervisor; everything else (the HTTP endpoint, [`SupervisorHandle`])
//! only reads published copies.

use crate::backoff::BackoffPolicy;
use crate::config::{Config, ConfigError};
use crate::diagnose::{diagnose, FailureCause};
use crate::encode::StreamSettings;
use crate::health::{HealthStatus, HealthTracker};
use crate::health_server::run_health_server;
use crate::overlay::{FileOverlay, OverlayChannel};
use crate::playlist::{DirectoryPlaylist, WorkItem, WorkSource};
use crate::process::{ExitOutcome, FinishedSession, ProcessController};
use crate::startup::{run_startup_checks, StartupError};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Minimum completion ratio for a clean exit to count as a full session
pub const COMPLETION_THRESHOLD: f64 = 0.98;

/// How long to wait before asking an empty work source again
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Error type for preparing a supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Backoff,
    Terminated,
}

impl SupervisorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorPhase::Idle => "idle",
            SupervisorPhase::Starting => "starting",
            SupervisorPhase::Running => "running",
            SupervisorPhase::Completed => "completed",
            SupervisorPhase::Failed => "failed",
            SupervisorPhase::Backoff => "backoff",
            SupervisorPhase::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SupervisorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session counts against the retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The encoder could not be started
    Spawn,
    /// Killed by a signal
    SignalTermination,
    /// Nonzero (or unobservable) exit code
    ExitCodeError,
}

/// Outcome of one session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionVerdict {
    Completed,
    /// Clean exit short of [`COMPLETION_THRESHOLD`]; logged, not retried
    PrematureCompletion { completion_ratio: f64 },
    Failed {
        kind: FailureKind,
        cause: Option<FailureCause>,
        report: String,
    },
    /// Stopped on operator request; not counted as a failure
    ShutdownInterrupt,
}

/// Judge a terminated process from its exit and completion ratio.
///
/// `Ok` for clean exits (complete or premature), `Err` with the failure kind
/// otherwise. The threshold is inclusive.
pub fn judge_exit(exit: ExitOutcome, completion_ratio: f64) -> Result<SessionVerdict, FailureKind> {
    if exit.signal.is_some() {
        return Err(FailureKind::SignalTermination);
    }
    if !exit.is_clean() {
        return Err(FailureKind::ExitCodeError);
    }
    if completion_ratio >= COMPLETION_THRESHOLD {
        Ok(SessionVerdict::Completed)
    } else {
        Ok(SessionVerdict::PrematureCompletion { completion_ratio })
    }
}

/// How the supervisor ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Shutdown,
    RetriesExhausted,
}

impl TerminalStatus {
    pub fn exit_code(&self) -> u8 {
        match self {
            TerminalStatus::Shutdown => 0,
            TerminalStatus::RetriesExhausted => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextStep {
    Advance,
    Backoff(Duration),
    Terminate(TerminalStatus),
}

/// Outside view of a running supervisor: shutdown requests and health reads.
#[derive(Clone)]
pub struct SupervisorHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    health_rx: watch::Receiver<HealthTracker>,
}

impl SupervisorHandle {
    /// Request graceful termination. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn health(&self) -> watch::Receiver<HealthTracker> {
        self.health_rx.clone()
    }

    pub fn snapshot(&self) -> HealthStatus {
        self.health_rx.borrow().snapshot()
    }
}

/// Resolves once shutdown has been requested.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    // the supervisor keeps a sender alive, so this only errs if it is gone
    let _ = rx.wait_for(|stop| *stop).await;
}

enum SessionEvent {
    Exited(Option<FinishedSession>),
    HealthTick,
    Shutdown,
}

pub struct Supervisor<S> {
    config: Config,
    source: S,
    controller: ProcessController,
    overlay: Option<Box<dyn OverlayChannel>>,
    backoff: BackoffPolicy,
    phase: SupervisorPhase,
    health_tx: watch::Sender<HealthTracker>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor<DirectoryPlaylist> {
    /// Load the config file and run startup checks, then build a supervisor
    /// streaming the configured playlist directory through ffmpeg.
    pub fn from_config_file<P: AsRef<Path>>(
        config_path: P,
        skip_checks: bool,
    ) -> Result<Self, SupervisorError> {
        let config = Config::load(config_path)?;
        if skip_checks {
            warn!("startup checks skipped");
        } else {
            run_startup_checks(&config)?;
        }
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        let playlist = DirectoryPlaylist::new(config.playlist.dir.clone(), config.playlist.recursive);
        let controller = ProcessController::ffmpeg(StreamSettings::from_config(&config));
        let overlay = config.overlay.enabled.then(|| FileOverlay::new(config.overlay.text_path.clone()));

        let supervisor = Self::new(config, playlist, controller);
        match overlay {
            Some(overlay) => supervisor.with_overlay(Box::new(overlay)),
            None => supervisor,
        }
    }
}

impl<S: WorkSource> Supervisor<S> {
    pub fn new(config: Config, source: S, controller: ProcessController) -> Self {
        let backoff = BackoffPolicy::new(config.retry.base_delay_ms);
        let tracker = HealthTracker::new(config.retry.max_retries, config.retry.base_delay_ms);
        let (health_tx, _) = watch::channel(tracker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            source,
            controller,
            overlay: None,
            backoff,
            phase: SupervisorPhase::Idle,
            health_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn with_overlay(mut self, overlay: Box<dyn OverlayChannel>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            health_rx: self.health_tx.subscribe(),
        }
    }

    /// Spawn the health endpoint on the configured address. It stops when
    /// shutdown is requested.
    pub fn start_health_server(&self) -> tokio::task::JoinHandle<()> {
        let health = self.health_tx.subscribe();
        let addr = self.config.health.bind;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let shutdown = async move { shutdown_requested(&mut shutdown_rx).await };
            if let Err(e) = run_health_server(health, addr, shutdown).await {
                error!(error = %e, "health server stopped");
            }
        })
    }

    fn shutdown_is_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn set_phase(&mut self, phase: SupervisorPhase) {
        debug!(from = %self.phase, to = %phase, "supervisor transition");
        self.phase = phase;
        self.health_tx.send_modify(|h| h.set_state(phase.as_str()));
    }

    /// Sleep for `delay` unless shutdown comes first. Returns true when
    /// interrupted.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown_requested(&mut self.shutdown_rx) => true,
        }
    }

    fn update_overlay(&self, item: &WorkItem) {
        if let Some(overlay) = &self.overlay {
            if let Err(e) = overlay.update(&item.display_name) {
                warn!(error = %e, "failed to update overlay");
            }
        }
    }

    fn log_health(&self) {
        let (health, retry) = {
            let tracker = self.health_tx.borrow();
            (tracker.snapshot(), tracker.retry_state())
        };
        match self.controller.session() {
            Some(session) => info!(
                session = %session.id,
                item = %session.item.display_name,
                progress_secs = session.progress_seconds(),
                duration_secs = session.total_duration_seconds(),
                percent = format_args!("{:.1}", session.completion_ratio() * 100.0),
                uptime_ms = health.uptime_ms,
                retry_count = retry.count,
                max_retries = retry.cap,
                "health"
            ),
            None => info!(
                state = %health.state,
                retry_count = retry.count,
                max_retries = retry.cap,
                "health"
            ),
        }
    }

    /// Run one session for `item` through to its verdict.
    async fn run_session(&mut self, item: &WorkItem) -> SessionVerdict {
        self.set_phase(SupervisorPhase::Starting);
        self.update_overlay(item);

        if let Err(e) = self.controller.start(item).await {
            error!(item = %item.display_name, error = %e, "failed to start encoder");
            return SessionVerdict::Failed {
                kind: FailureKind::Spawn,
                cause: None,
                report: format!("{}: {}", item.path.display(), e),
            };
        }
        self.health_tx.send_modify(|h| h.session_started(item));
        self.set_phase(SupervisorPhase::Running);

        let period = Duration::from_millis(self.config.health.check_interval_ms.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let finished = loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown_rx) => SessionEvent::Shutdown,
                finished = self.controller.wait_for_exit() => SessionEvent::Exited(finished),
                _ = ticker.tick() => SessionEvent::HealthTick,
            };

            match event {
                SessionEvent::Exited(finished) => break finished,
                SessionEvent::HealthTick => self.log_health(),
                SessionEvent::Shutdown => {
                    info!(item = %item.display_name, "shutdown requested; stopping session");
                    if let Some(stopped) = self.controller.stop().await {
                        debug!(exit = %stopped.exit, "session stopped");
                    }
                    self.health_tx.send_modify(|h| h.session_ended());
                    return SessionVerdict::ShutdownInterrupt;
                }
            }
        };
        self.health_tx.send_modify(|h| h.session_ended());

        // the encoder may exit on the same signal that requested shutdown
        if self.shutdown_is_requested() {
            if let Some(finished) = &finished {
                debug!(exit = %finished.exit, "encoder exited during shutdown");
            }
            return SessionVerdict::ShutdownInterrupt;
        }

        let Some(FinishedSession { exit, session }) = finished else {
            return SessionVerdict::Failed {
                kind: FailureKind::ExitCodeError,
                cause: None,
                report: format!("{}: session lost", item.path.display()),
            };
        };

        match judge_exit(exit, session.completion_ratio()) {
            Ok(verdict) => verdict,
            Err(kind) => {
                let report = diagnose(&session, exit);
                error!(session = %session.id, "{}", report.summary());
                debug!(session = %session.id, "{}", report);
                SessionVerdict::Failed {
                    kind,
                    cause: Some(report.primary_cause()),
                    report: report.to_string(),
                }
            }
        }
    }

    /// Update health and retry state for `verdict` and pick the next step.
    fn apply_verdict(&mut self, item: &WorkItem, verdict: SessionVerdict) -> NextStep {
        match verdict {
            SessionVerdict::Completed => {
                self.set_phase(SupervisorPhase::Completed);
                self.health_tx.send_modify(|h| h.reset_retry());
                info!(item = %item.display_name, "session completed");
                NextStep::Advance
            }
            SessionVerdict::PrematureCompletion { completion_ratio } => {
                self.set_phase(SupervisorPhase::Completed);
                warn!(
                    item = %item.display_name,
                    percent = format_args!("{:.2}", completion_ratio * 100.0),
                    "encoder exited cleanly before the end of the input"
                );
                NextStep::Advance
            }
            SessionVerdict::Failed { kind, cause, report } => {
                self.set_phase(SupervisorPhase::Failed);
                let mut retry_count = 0;
                let mut exhausted = false;
                self.health_tx.send_modify(|h| {
                    h.record_error(report);
                    retry_count = h.increment_retry();
                    exhausted = h.retries_exhausted();
                });

                if exhausted {
                    error!(
                        item = %item.display_name,
                        retry_count,
                        max_retries = self.config.retry.max_retries,
                        "retry budget exhausted"
                    );
                    return NextStep::Terminate(TerminalStatus::RetriesExhausted);
                }

                let delay = self.backoff.delay(retry_count);
                warn!(
                    item = %item.display_name,
                    kind = ?kind,
                    cause = ?cause,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "session failed; backing off"
                );
                NextStep::Backoff(delay)
            }
            SessionVerdict::ShutdownInterrupt => NextStep::Terminate(TerminalStatus::Shutdown),
        }
    }

    async fn terminate(&mut self, status: TerminalStatus) -> TerminalStatus {
        if let Some(stopped) = self.controller.stop().await {
            debug!(exit = %stopped.exit, "encoder stopped on termination");
        }
        if let Some(overlay) = &self.overlay {
            if let Err(e) = overlay.clear() {
                warn!(error = %e, "failed to clear overlay");
            }
        }
        self.health_tx.send_modify(|h| h.session_ended());
        self.set_phase(SupervisorPhase::Terminated);
        info!(status = ?status, "supervisor terminated");
        status
    }

    /// Stream work items until shutdown or until the retry budget runs out.
    pub async fn supervise(mut self) -> TerminalStatus {
        info!(
            max_retries = self.config.retry.max_retries,
            base_delay_ms = self.backoff.base_delay_ms(),
            "supervisor started"
        );

        let status = loop {
            if self.shutdown_is_requested() {
                break TerminalStatus::Shutdown;
            }

            let Some(item) = self.source.next() else {
                self.set_phase(SupervisorPhase::Idle);
                warn!(
                    retry_in_secs = IDLE_POLL_INTERVAL.as_secs(),
                    "no playable work items"
                );
                if self.pause(IDLE_POLL_INTERVAL).await {
                    break TerminalStatus::Shutdown;
                }
                continue;
            };

            let verdict = self.run_session(&item).await;
            match self.apply_verdict(&item, verdict) {
                NextStep::Advance => {}
                NextStep::Backoff(delay) => {
                    self.set_phase(SupervisorPhase::Backoff);
                    if self.pause(delay).await {
                        break TerminalStatus::Shutdown;
                    }
                }
                NextStep::Terminate(status) => break status,
            }
        };

        self.terminate(status).await
    }
}
