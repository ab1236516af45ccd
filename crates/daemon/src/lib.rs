//! loopcast
//!
//! Supervises a long-running encoder process that streams a playlist of media
//! files: one session at a time, failure diagnosis, exponential backoff and a
//! health endpoint.

pub mod backoff;
pub mod diagnose;
pub mod encode;
pub mod health;
pub mod health_server;
pub mod metrics;
pub mod output_parser;
pub mod overlay;
pub mod playlist;
pub mod process;
pub mod startup;
pub mod supervisor;

pub use backoff::BackoffPolicy;
pub use diagnose::{
    classify, diagnose, probable_causes, FailureCause, FailureEvidence, FailureReport,
};
pub use encode::{build_ffmpeg_command, build_video_filter, video_codec, StreamSettings};
pub use health::{ErrorRecord, HealthStatus, HealthTracker, RetryState};
pub use health_server::{create_health_router, run_health_server, ServerError};
pub use loopcast_config as config;
pub use loopcast_config::Config;
pub use metrics::{collect_system_metrics, HealthReport, SystemMetrics};
pub use output_parser::{InputMetadata, OutputParser, StreamChannel};
pub use overlay::{FileOverlay, OverlayChannel};
pub use playlist::{DirectoryPlaylist, WorkItem, WorkSource};
pub use process::{
    EncoderProcess, ExitOutcome, FfmpegProcess, FinishedSession, ProcessController,
    ProcessEvent, ProcessSession, SessionUpdate, SpawnError,
};
pub use startup::{
    check_ffmpeg_available, check_hw_accel_encoders, parse_ffmpeg_version, run_startup_checks,
    FfmpegVersion, StartupError,
};
pub use supervisor::{
    judge_exit, FailureKind, SessionVerdict, Supervisor, SupervisorError, SupervisorHandle,
    SupervisorPhase, TerminalStatus,
};
