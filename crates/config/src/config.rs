//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is not usable
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Output frame size, written as `WIDTHxHEIGHT` in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("resolution '{}' is not in WIDTHxHEIGHT form", s))?;
        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid resolution width in '{}'", s))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid resolution height in '{}'", s))?;
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(r: Resolution) -> Self {
        r.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Hardware acceleration hint passed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    /// Software encoding (libx264)
    #[default]
    None,
    /// NVIDIA NVENC
    Nvenc,
    /// VA-API (Intel/AMD on Linux)
    Vaapi,
}

impl FromStr for HwAccel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "off" | "software" => Ok(HwAccel::None),
            "nvenc" | "nvidia" | "cuda" => Ok(HwAccel::Nvenc),
            "vaapi" => Ok(HwAccel::Vaapi),
            other => Err(format!("unknown hardware acceleration mode '{}'", other)),
        }
    }
}

impl fmt::Display for HwAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwAccel::None => write!(f, "none"),
            HwAccel::Nvenc => write!(f, "nvenc"),
            HwAccel::Vaapi => write!(f, "vaapi"),
        }
    }
}

/// Video/audio encoding settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable, looked up in PATH when not absolute
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Target video bitrate in kbit/s
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
    #[serde(default = "default_resolution")]
    pub resolution: Resolution,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default)]
    pub hw_accel: HwAccel,
    /// Pad to the exact output size instead of only scaling down
    #[serde(default = "default_true")]
    pub letterbox: bool,
    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,
    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: u32,
    #[serde(default = "default_channels")]
    pub channels: u32,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_bitrate_kbps() -> u32 {
    4500
}

fn default_resolution() -> Resolution {
    Resolution::new(1920, 1080)
}

fn default_frame_rate() -> u32 {
    30
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_true() -> bool {
    true
}

fn default_audio_bitrate_kbps() -> u32 {
    128
}

fn default_sample_rate_hz() -> u32 {
    44100
}

fn default_channels() -> u32 {
    2
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            bitrate_kbps: default_bitrate_kbps(),
            resolution: default_resolution(),
            frame_rate: default_frame_rate(),
            preset: default_preset(),
            hw_accel: HwAccel::default(),
            letterbox: default_true(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            sample_rate_hz: default_sample_rate_hz(),
            channels: default_channels(),
        }
    }
}

/// Screen corner the overlay text is anchored to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayPosition {
    TopLeft,
    TopRight,
    #[default]
    BottomLeft,
    BottomRight,
}

/// Text overlay rendered by the encoder from a side-channel file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default)]
    pub position: OverlayPosition,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    /// File the encoder re-reads for the overlay text
    #[serde(default = "default_text_path")]
    pub text_path: PathBuf,
}

fn default_font_size() -> u32 {
    24
}

fn default_color() -> String {
    "white".to_string()
}

fn default_text_path() -> PathBuf {
    PathBuf::from("/tmp/loopcast/overlay.txt")
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            font_size: default_font_size(),
            position: OverlayPosition::default(),
            color: default_color(),
            font_path: None,
            text_path: default_text_path(),
        }
    }
}

/// Retry budget for consecutive failed sessions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

/// Health reporting settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    /// Interval of the periodic health log line while streaming
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Address of the JSON health endpoint
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

fn default_check_interval_ms() -> u64 {
    30_000
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7879))
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            bind: default_bind(),
        }
    }
}

/// Where the encoded stream goes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum Destination {
    /// HLS playlist plus rolling segment files in a local directory
    LocalSegmented {
        dir: PathBuf,
        #[serde(default = "default_segment_seconds")]
        segment_seconds: u32,
        #[serde(default = "default_list_size")]
        list_size: u32,
    },
    /// A network ingest URL (e.g. rtmp://)
    RemoteEndpoint { url: String },
}

fn default_segment_seconds() -> u32 {
    4
}

fn default_list_size() -> u32 {
    6
}

impl Default for Destination {
    fn default() -> Self {
        Destination::LocalSegmented {
            dir: PathBuf::from("/tmp/loopcast/hls"),
            segment_seconds: default_segment_seconds(),
            list_size: default_list_size(),
        }
    }
}

/// Media directory the playlist is built from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistConfig {
    #[serde(default = "default_playlist_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_true")]
    pub recursive: bool,
}

fn default_playlist_dir() -> PathBuf {
    PathBuf::from("media")
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            dir: default_playlist_dir(),
            recursive: true,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub output: Destination,
    #[serde(default)]
    pub playlist: PlaylistConfig,
}

/// Parse an environment variable into `target`, leaving it untouched when
/// the variable is unset or malformed.
fn override_from_env<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = env::var(name) {
        if let Ok(parsed) = val.trim().parse::<T>() {
            *target = parsed;
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - STREAM_FFMPEG_PATH -> encoder.ffmpeg_path
    /// - STREAM_BITRATE_KBPS -> encoder.bitrate_kbps
    /// - STREAM_RESOLUTION -> encoder.resolution
    /// - STREAM_FRAME_RATE -> encoder.frame_rate
    /// - STREAM_PRESET -> encoder.preset
    /// - STREAM_HW_ACCEL -> encoder.hw_accel
    /// - STREAM_OVERLAY_ENABLED -> overlay.enabled
    /// - STREAM_MAX_RETRIES -> retry.max_retries
    /// - STREAM_RETRY_BASE_DELAY_MS -> retry.base_delay_ms
    /// - STREAM_HEALTH_CHECK_INTERVAL_MS -> health.check_interval_ms
    /// - STREAM_PLAYLIST_DIR -> playlist.dir
    /// - STREAM_URL -> output (switches to a remote endpoint)
    pub fn apply_env_overrides(&mut self) {
        override_from_env("STREAM_FFMPEG_PATH", &mut self.encoder.ffmpeg_path);
        override_from_env("STREAM_BITRATE_KBPS", &mut self.encoder.bitrate_kbps);
        override_from_env("STREAM_RESOLUTION", &mut self.encoder.resolution);
        override_from_env("STREAM_FRAME_RATE", &mut self.encoder.frame_rate);
        override_from_env("STREAM_HW_ACCEL", &mut self.encoder.hw_accel);
        override_from_env("STREAM_MAX_RETRIES", &mut self.retry.max_retries);
        override_from_env("STREAM_RETRY_BASE_DELAY_MS", &mut self.retry.base_delay_ms);
        override_from_env(
            "STREAM_HEALTH_CHECK_INTERVAL_MS",
            &mut self.health.check_interval_ms,
        );
        override_from_env("STREAM_PLAYLIST_DIR", &mut self.playlist.dir);

        if let Ok(val) = env::var("STREAM_PRESET") {
            if !val.trim().is_empty() {
                self.encoder.preset = val.trim().to_string();
            }
        }

        // Accept "true", "1", "yes" as true; "false", "0", "no" as false
        if let Ok(val) = env::var("STREAM_OVERLAY_ENABLED") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.overlay.enabled = true,
                "false" | "0" | "no" => self.overlay.enabled = false,
                _ => {}
            }
        }

        if let Ok(val) = env::var("STREAM_URL") {
            if !val.trim().is_empty() {
                self.output = Destination::RemoteEndpoint {
                    url: val.trim().to_string(),
                };
            }
        }
    }

    /// Reject values that would produce an unusable encoder invocation or
    /// a supervisor that can never make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.encoder.bitrate_kbps == 0 {
            return invalid("encoder.bitrate_kbps must be greater than 0");
        }
        if self.encoder.frame_rate == 0 {
            return invalid("encoder.frame_rate must be greater than 0");
        }
        if self.encoder.resolution.width == 0 || self.encoder.resolution.height == 0 {
            return invalid("encoder.resolution must be non-zero in both dimensions");
        }
        if self.retry.max_retries == 0 {
            return invalid("retry.max_retries must be at least 1");
        }
        if self.retry.base_delay_ms == 0 {
            return invalid("retry.base_delay_ms must be greater than 0");
        }
        if let Destination::RemoteEndpoint { url } = &self.output {
            if url.trim().is_empty() {
                return invalid("output.url must not be empty");
            }
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
