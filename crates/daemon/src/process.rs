//! Process controller for the external encoder
//!
//! Owns the single live encoder process and the [`ProcessSession`] that
//! describes it. The raw process I/O sits behind [`EncoderProcess`] so the
//! supervisor can be driven by a scripted process in tests; [`FfmpegProcess`]
//! is the real implementation on top of `tokio::process`.

use crate::config::Destination;
use crate::encode::{build_ffmpeg_command, StreamSettings};
use crate::output_parser::{InputMetadata, OutputParser, StreamChannel};
use crate::playlist::WorkItem;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a quit request may take before the process is killed
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// The encoder's interactive quit command, written to its stdin
const QUIT_COMMAND: &[u8] = b"q";

const READ_CHUNK_SIZE: usize = 8192;

/// Signal delivered by an unconditional kill (ours or the OOM killer's)
#[cfg(unix)]
pub const KILL_SIGNAL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
pub const KILL_SIGNAL: i32 = 9;

/// Error type for starting an encoder session
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The work item's file is not there
    #[error("Input file not found: {}", .0.display())]
    InputMissing(PathBuf),

    /// The encoder executable could not be launched
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Local output directory could not be created
    #[error("Failed to prepare output directory {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Only one encoder may run at a time
    #[error("An encoder session is already running")]
    AlreadyRunning,
}

/// How the process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Neither code nor signal could be observed
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Exit code 0 and no signal
    pub fn is_clean(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }

    pub fn was_killed(&self) -> bool {
        self.signal == Some(KILL_SIGNAL)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.signal, self.code) {
            (Some(sig), _) if sig == KILL_SIGNAL => write!(f, "killed by signal {} (SIGKILL)", sig),
            (Some(sig), _) => write!(f, "terminated by signal {}", sig),
            (None, Some(code)) => write!(f, "exit code {}", code),
            (None, None) => write!(f, "unknown termination"),
        }
    }
}

/// Something that happened to the running process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// A chunk of output, in arrival order
    Output(StreamChannel, Vec<u8>),
    /// The process is gone
    Exited(ExitOutcome),
}

/// Raw lifecycle of one encoder process at a time.
#[async_trait]
pub trait EncoderProcess: Send {
    /// Launch the encoder for `item`.
    async fn spawn(&mut self, item: &WorkItem) -> Result<(), SpawnError>;

    /// Next output chunk or the exit of the running process; `None` when
    /// nothing is running. Must be cancel safe.
    async fn next_event(&mut self) -> Option<ProcessEvent>;

    /// Ask the process to quit, kill it after [`STOP_GRACE_PERIOD`], and return
    /// whatever it printed meanwhile followed by `Exited`. Empty when nothing
    /// is running.
    async fn stop(&mut self) -> Vec<ProcessEvent>;
}

/// State of the live encoder session
#[derive(Debug)]
pub struct ProcessSession {
    pub id: Uuid,
    pub item: WorkItem,
    pub started_at: Instant,
    parser: OutputParser,
}

impl ProcessSession {
    pub fn new(item: WorkItem) -> Self {
        Self {
            id: Uuid::new_v4(),
            item,
            started_at: Instant::now(),
            parser: OutputParser::new(),
        }
    }

    pub fn parser(&self) -> &OutputParser {
        &self.parser
    }

    #[cfg(test)]
    pub(crate) fn parser_mut(&mut self) -> &mut OutputParser {
        &mut self.parser
    }

    pub fn progress_seconds(&self) -> f64 {
        self.parser.progress_seconds()
    }

    pub fn total_duration_seconds(&self) -> f64 {
        self.parser.total_duration_seconds()
    }

    pub fn metadata(&self) -> &InputMetadata {
        self.parser.metadata()
    }

    pub fn completion_ratio(&self) -> f64 {
        self.parser.completion_ratio()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// A session whose process has terminated
#[derive(Debug)]
pub struct FinishedSession {
    pub exit: ExitOutcome,
    pub session: ProcessSession,
}

/// Progress of the live session as seen by [`ProcessController::next_update`]
#[derive(Debug)]
pub enum SessionUpdate {
    /// Output was parsed into the session
    Output,
    Exited(FinishedSession),
}

/// Owns the encoder process handle and the session describing it.
pub struct ProcessController {
    process: Box<dyn EncoderProcess>,
    session: Option<ProcessSession>,
}

impl ProcessController {
    pub fn new(process: Box<dyn EncoderProcess>) -> Self {
        Self {
            process,
            session: None,
        }
    }

    /// Controller driving the real encoder binary
    pub fn ffmpeg(settings: StreamSettings) -> Self {
        Self::new(Box::new(FfmpegProcess::new(settings)))
    }

    pub fn session(&self) -> Option<&ProcessSession> {
        self.session.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Start a session for `item`
    ///
    /// # Errors
    /// - `InputMissing` if the item's file does not exist
    /// - `AlreadyRunning` if a session is live
    /// - whatever the process layer reports when launching fails
    pub async fn start(&mut self, item: &WorkItem) -> Result<&ProcessSession, SpawnError> {
        if self.session.is_some() {
            return Err(SpawnError::AlreadyRunning);
        }
        if !item.path.is_file() {
            return Err(SpawnError::InputMissing(item.path.clone()));
        }

        self.process.spawn(item).await?;
        let session = ProcessSession::new(item.clone());
        info!(
            session = %session.id,
            item = %item.display_name,
            path = %item.path.display(),
            "encoder started"
        );
        Ok(self.session.insert(session))
    }

    /// Wait for the next output chunk or the exit of the live process.
    ///
    /// Returns `None` when no session is live. Cancel safe: output is only
    /// applied to the session after it has been fully received.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        self.session.as_ref()?;

        match self.process.next_event().await {
            Some(ProcessEvent::Output(channel, chunk)) => {
                if let Some(session) = self.session.as_mut() {
                    session.parser.feed(channel, &chunk);
                }
                Some(SessionUpdate::Output)
            }
            Some(ProcessEvent::Exited(exit)) => self.finish(exit).map(SessionUpdate::Exited),
            None => {
                warn!("encoder vanished without an exit status");
                self.finish(ExitOutcome::unknown()).map(SessionUpdate::Exited)
            }
        }
    }

    /// Drive the live session until its process exits.
    pub async fn wait_for_exit(&mut self) -> Option<FinishedSession> {
        loop {
            match self.next_update().await? {
                SessionUpdate::Output => continue,
                SessionUpdate::Exited(finished) => return Some(finished),
            }
        }
    }

    /// Gracefully stop the live process, escalating to a kill after
    /// [`STOP_GRACE_PERIOD`]. Safe to call when nothing is running.
    pub async fn stop(&mut self) -> Option<FinishedSession> {
        let session_id = self.session.as_ref()?.id;
        info!(session = %session_id, "stopping encoder");

        let mut exit = ExitOutcome::unknown();
        for event in self.process.stop().await {
            match event {
                ProcessEvent::Output(channel, chunk) => {
                    if let Some(session) = self.session.as_mut() {
                        session.parser.feed(channel, &chunk);
                    }
                }
                ProcessEvent::Exited(outcome) => exit = outcome,
            }
        }
        self.finish(exit)
    }

    fn finish(&mut self, exit: ExitOutcome) -> Option<FinishedSession> {
        let mut session = self.session.take()?;
        session.parser.finish();
        debug!(session = %session.id, %exit, "encoder exited");
        Some(FinishedSession { exit, session })
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match pipe {
        Some(p) => p.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Handles of a spawned encoder
struct RunningEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl RunningEncoder {
    /// Output is preferred over the exit so nothing buffered in the pipes is
    /// lost when the process ends.
    async fn next_event(&mut self) -> ProcessEvent {
        let mut err_buf = [0u8; READ_CHUNK_SIZE];
        let mut out_buf = [0u8; READ_CHUNK_SIZE];
        loop {
            tokio::select! {
                biased;
                read = read_pipe(&mut self.stderr, &mut err_buf) => match read {
                    Ok(0) => self.stderr = None,
                    Ok(n) => {
                        return ProcessEvent::Output(StreamChannel::Diagnostic, err_buf[..n].to_vec())
                    }
                    Err(e) => {
                        debug!(error = %e, "stderr read failed");
                        self.stderr = None;
                    }
                },
                read = read_pipe(&mut self.stdout, &mut out_buf) => match read {
                    Ok(0) => self.stdout = None,
                    Ok(n) => return ProcessEvent::Output(StreamChannel::Data, out_buf[..n].to_vec()),
                    Err(e) => {
                        debug!(error = %e, "stdout read failed");
                        self.stdout = None;
                    }
                },
                status = self.child.wait() => {
                    let exit = match status {
                        Ok(status) => ExitOutcome::from_status(status),
                        Err(e) => {
                            warn!(error = %e, "failed to wait for encoder");
                            ExitOutcome::unknown()
                        }
                    };
                    return ProcessEvent::Exited(exit);
                }
            }
        }
    }

    async fn drain_until_exit(&mut self, events: &mut Vec<ProcessEvent>) -> ExitOutcome {
        loop {
            match self.next_event().await {
                ProcessEvent::Exited(exit) => return exit,
                output => events.push(output),
            }
        }
    }
}

/// [`EncoderProcess`] running the ffmpeg binary from the stream settings
pub struct FfmpegProcess {
    settings: StreamSettings,
    running: Option<RunningEncoder>,
}

impl FfmpegProcess {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings,
            running: None,
        }
    }
}

#[async_trait]
impl EncoderProcess for FfmpegProcess {
    async fn spawn(&mut self, item: &WorkItem) -> Result<(), SpawnError> {
        if self.running.is_some() {
            return Err(SpawnError::AlreadyRunning);
        }

        if let Destination::LocalSegmented { dir, .. } = &self.settings.output {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| SpawnError::OutputDir {
                    path: dir.clone(),
                    source,
                })?;
        }

        let mut cmd = Command::from(build_ffmpeg_command(&item.path, &self.settings));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // keep terminal and service-manager signals away from the encoder;
        // it is stopped through its quit command
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SpawnError::Launch {
            program: self.settings.encoder.ffmpeg_path.display().to_string(),
            source,
        })?;
        debug!(pid = ?child.id(), "encoder process spawned");

        self.running = Some(RunningEncoder {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ProcessEvent> {
        let running = self.running.as_mut()?;
        let event = running.next_event().await;
        if matches!(event, ProcessEvent::Exited(_)) {
            self.running = None;
        }
        Some(event)
    }

    async fn stop(&mut self) -> Vec<ProcessEvent> {
        let Some(mut running) = self.running.take() else {
            return Vec::new();
        };

        if let Some(mut stdin) = running.stdin.take() {
            if let Err(e) = stdin.write_all(QUIT_COMMAND).await {
                debug!(error = %e, "could not send quit command");
            }
            let _ = stdin.flush().await;
            // dropping stdin closes it so the encoder also sees EOF
        }

        let mut events = Vec::new();
        let exit = match tokio::time::timeout(
            STOP_GRACE_PERIOD,
            running.drain_until_exit(&mut events),
        )
        .await
        {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    grace_secs = STOP_GRACE_PERIOD.as_secs(),
                    "encoder ignored quit request; killing"
                );
                if let Err(e) = running.child.kill().await {
                    warn!(error = %e, "failed to kill encoder");
                }
                match running.child.wait().await {
                    Ok(status) => ExitOutcome::from_status(status),
                    Err(_) => ExitOutcome::unknown(),
                }
            }
        };

        events.push(ProcessEvent::Exited(exit));
        events
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted stand-in for the encoder process.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// One scripted run: events emitted in order. A script without an
    /// `Exited` event keeps the process "running" until it is stopped.
    pub type Script = Vec<ProcessEvent>;

    #[derive(Clone, Default)]
    pub struct ScriptLog {
        pub spawned: Arc<Mutex<Vec<PathBuf>>>,
        pub stops: Arc<Mutex<usize>>,
    }

    pub struct ScriptedProcess {
        scripts: VecDeque<Script>,
        current: Option<VecDeque<ProcessEvent>>,
        log: ScriptLog,
    }

    impl ScriptedProcess {
        pub fn new(scripts: Vec<Script>) -> (Self, ScriptLog) {
            let log = ScriptLog::default();
            (
                Self {
                    scripts: scripts.into(),
                    current: None,
                    log: log.clone(),
                },
                log,
            )
        }
    }

    #[async_trait]
    impl EncoderProcess for ScriptedProcess {
        async fn spawn(&mut self, item: &WorkItem) -> Result<(), SpawnError> {
            let script = self.scripts.pop_front().unwrap_or_default();
            self.current = Some(script.into());
            self.log.spawned.lock().unwrap().push(item.path.clone());
            Ok(())
        }

        async fn next_event(&mut self) -> Option<ProcessEvent> {
            let current = self.current.as_mut()?;
            match current.pop_front() {
                Some(event) => {
                    if matches!(event, ProcessEvent::Exited(_)) {
                        self.current = None;
                    }
                    Some(event)
                }
                None => std::future::pending().await,
            }
        }

        async fn stop(&mut self) -> Vec<ProcessEvent> {
            *self.log.stops.lock().unwrap() += 1;
            match self.current.take() {
                Some(_) => vec![
                    ProcessEvent::Output(
                        StreamChannel::Diagnostic,
                        b"Exiting normally, received signal 2.\n".to_vec(),
                    ),
                    ProcessEvent::Exited(ExitOutcome::code(255)),
                ],
                None => Vec::new(),
            }
        }
    }

    pub fn diag(text: &str) -> ProcessEvent {
        ProcessEvent::Output(StreamChannel::Diagnostic, text.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tempfile::TempDir;

    fn item_in(dir: &TempDir, name: &str) -> WorkItem {
        let path = dir.path().join(name);
        std::fs::write(&path, b"media").unwrap();
        WorkItem::from_path(path)
    }

    #[test]
    fn test_exit_outcome_classification() {
        assert!(ExitOutcome::code(0).is_clean());
        assert!(!ExitOutcome::code(1).is_clean());
        assert!(!ExitOutcome::signal(KILL_SIGNAL).is_clean());
        assert!(ExitOutcome::signal(KILL_SIGNAL).was_killed());
        assert!(!ExitOutcome::signal(15).was_killed());
        assert!(!ExitOutcome::unknown().is_clean());
        assert_eq!(ExitOutcome::code(1).to_string(), "exit code 1");
    }

    #[tokio::test]
    async fn test_start_rejects_missing_input() {
        let (process, log) = ScriptedProcess::new(vec![]);
        let mut controller = ProcessController::new(Box::new(process));
        let item = WorkItem::from_path(PathBuf::from("/definitely/not/here.mp4"));

        let err = controller.start(&item).await.unwrap_err();
        assert!(matches!(err, SpawnError::InputMissing(_)));
        assert!(!controller.is_running());
        assert!(log.spawned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_active_session() {
        let temp = TempDir::new().unwrap();
        let (process, _log) = ScriptedProcess::new(vec![vec![]]);
        let mut controller = ProcessController::new(Box::new(process));
        let item = item_in(&temp, "a.mp4");

        controller.start(&item).await.unwrap();
        assert!(matches!(
            controller.start(&item).await,
            Err(SpawnError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn test_session_collects_output_until_exit() {
        let temp = TempDir::new().unwrap();
        let (process, _log) = ScriptedProcess::new(vec![vec![
            diag("  Duration: 00:05:00.00, start: 0.0\n"),
            diag("time=00:02:30.00 bitrate=1\r"),
            ProcessEvent::Exited(ExitOutcome::code(0)),
        ]]);
        let mut controller = ProcessController::new(Box::new(process));
        controller.start(&item_in(&temp, "a.mp4")).await.unwrap();

        let finished = controller.wait_for_exit().await.unwrap();
        assert!(finished.exit.is_clean());
        assert_eq!(finished.session.total_duration_seconds(), 300.0);
        assert_eq!(finished.session.progress_seconds(), 150.0);
        assert!((finished.session.completion_ratio() - 0.5).abs() < 1e-9);
        assert!(!controller.is_running());
        assert!(controller.wait_for_exit().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let (process, log) = ScriptedProcess::new(vec![vec![diag("time=00:00:01.00\n")]]);
        let mut controller = ProcessController::new(Box::new(process));

        assert!(controller.stop().await.is_none());

        controller.start(&item_in(&temp, "a.mp4")).await.unwrap();
        assert!(matches!(
            controller.next_update().await,
            Some(SessionUpdate::Output)
        ));
        let finished = controller.stop().await.unwrap();
        assert_eq!(finished.exit, ExitOutcome::code(255));
        assert!(finished
            .session
            .parser()
            .recent_lines()
            .any(|l| l.contains("Exiting normally")));

        assert!(controller.stop().await.is_none());
        assert_eq!(*log.stops.lock().unwrap(), 1);
    }
}
