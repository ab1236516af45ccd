//! Encoder invocation for loopcast

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_command, build_video_filter, video_codec, StreamSettings};
