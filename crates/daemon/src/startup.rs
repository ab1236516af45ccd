//! Startup checks module for loopcast
//!
//! Provides preflight checks to verify system requirements before streaming:
//! - FFmpeg availability and version
//! - Hardware encoder availability when hardware acceleration is configured

use crate::config::{Config, HwAccel};
use std::fmt;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("Hardware encoder {encoder} not available: {reason}")]
    HardwareEncoderUnavailable {
        encoder: &'static str,
        reason: String,
    },
}

/// Version reported by `ffmpeg -version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FfmpegVersion {
    /// Numbered release, e.g. `6.1.1` or `n7.0-...`
    Release { major: u32 },
    /// Git snapshot build, e.g. `N-113000-g1234abcd`
    Snapshot(String),
}

impl fmt::Display for FfmpegVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfmpegVersion::Release { major } => write!(f, "{}.x", major),
            FfmpegVersion::Snapshot(rev) => write!(f, "git snapshot {}", rev),
        }
    }
}

/// Parse FFmpeg version string
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
/// - Git builds: "ffmpeg version N-113000-g1234abcd ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<FfmpegVersion> {
    // Look for "ffmpeg version" followed by the version string
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    if let Some(rev) = version_part.strip_prefix("n-") {
        if rev.is_empty() {
            return None;
        }
        return Some(FfmpegVersion::Snapshot(rev.to_string()));
    }

    // Handle n-prefixed versions (e.g., "n7.0-...")
    let version_str = version_part.trim_start_matches('n');

    // Extract major version (before first '.' or '-')
    let major_str = version_str.split(['.', '-']).next()?;

    major_str
        .parse()
        .ok()
        .map(|major| FfmpegVersion::Release { major })
}

fn run_ffmpeg(ffmpeg: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new(ffmpeg)
        .args(args)
        .output()
        .map_err(|e| format!("{} {} failed: {}", ffmpeg.display(), args.join(" "), e))?;

    if !output.status.success() {
        return Err(format!(
            "{} {} exited with {}",
            ffmpeg.display(),
            args.join(" "),
            output.status
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that the encoder binary runs and reports a version
pub fn check_ffmpeg_available(ffmpeg: &Path) -> Result<FfmpegVersion, StartupError> {
    let version_output = run_ffmpeg(ffmpeg, &["-version"]).map_err(|e| {
        StartupError::FfmpegUnavailable(format!("{}; is FFmpeg installed and in PATH?", e))
    })?;

    parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegUnavailable(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })
}

/// Encoder that must be compiled into FFmpeg for the given mode
pub fn required_hw_encoder(mode: HwAccel) -> Option<&'static str> {
    match mode {
        HwAccel::None => None,
        HwAccel::Nvenc => Some("h264_nvenc"),
        HwAccel::Vaapi => Some("h264_vaapi"),
    }
}

/// Whether `ffmpeg -encoders` output lists `encoder`
///
/// Encoder lines look like ` V....D h264_nvenc   NVIDIA NVENC H.264 encoder`;
/// the name is the second column.
pub fn encoder_list_contains(encoders_output: &str, encoder: &str) -> bool {
    encoders_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == encoder)
}

/// Check that the hardware encoder for `mode` is available
pub fn check_hw_accel_encoders(ffmpeg: &Path, mode: HwAccel) -> Result<(), StartupError> {
    let Some(encoder) = required_hw_encoder(mode) else {
        return Ok(());
    };

    let encoders = run_ffmpeg(ffmpeg, &["-hide_banner", "-encoders"]).map_err(|reason| {
        StartupError::HardwareEncoderUnavailable { encoder, reason }
    })?;

    if !encoder_list_contains(&encoders, encoder) {
        return Err(StartupError::HardwareEncoderUnavailable {
            encoder,
            reason: "not listed by ffmpeg -encoders; set hw_accel = \"none\"".to_string(),
        });
    }
    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. FFmpeg availability
/// 2. Hardware encoder availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let ffmpeg = &cfg.encoder.ffmpeg_path;
    let version = check_ffmpeg_available(ffmpeg)?;
    info!(ffmpeg = %ffmpeg.display(), %version, "ffmpeg found");

    check_hw_accel_encoders(ffmpeg, cfg.encoder.hw_accel)?;
    Ok(())
}
