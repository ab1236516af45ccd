//! Incremental parser for the encoder's text output.
//!
//! The encoder reports its input banner, stream descriptors and a progress
//! line (rewritten in place with `\r`) on its diagnostic stream. Chunks arrive
//! with no line alignment, so each channel keeps its own partial-line buffer
//! and only complete lines are interpreted.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::trace;

/// Raw lines kept for the failure report.
pub const RECENT_LINE_CAPACITY: usize = 200;

/// Error-looking lines kept separately so they survive a flood of progress lines.
pub const ERROR_LINE_CAPACITY: usize = 50;

/// Substrings (lowercase) that mark a line as worth keeping for forensics.
const ERROR_KEYWORDS: &[&str] = &[
    "error",
    "failed",
    "invalid",
    "cannot",
    "unable",
    "corrupt",
    "refused",
    "denied",
    "not found",
    "broken pipe",
    "timed out",
    "no such",
];

/// Which of the process's output pipes a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamChannel {
    /// stderr: banner, warnings, errors and the progress line
    Diagnostic,
    /// stdout: machine-readable data, when the output format writes any
    Data,
}

/// Properties of the input file announced in the encoder's startup banner.
///
/// Every field is written at most once per session; the first successful
/// parse wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputMetadata {
    pub container: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub resolution: Option<String>,
    pub fps: Option<f64>,
    pub sample_rate_hz: Option<u32>,
}

impl InputMetadata {
    pub fn is_empty(&self) -> bool {
        *self == InputMetadata::default()
    }
}

/// Parse an `H:MM:SS.ss` timestamp into seconds.
///
/// Returns `None` for `N/A`, negative values and anything malformed.
pub fn parse_timestamp(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.starts_with('-') {
        return None;
    }
    let mut parts = s.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((hours * 3600 + minutes * 60) as f64 + seconds)
}

/// Returns true if the line contains an error-ish keyword.
pub fn is_error_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    ERROR_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn push_capped(buf: &mut VecDeque<String>, line: String, cap: usize) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(line);
}

/// Session-scoped state extracted from the encoder's output.
#[derive(Debug, Default)]
pub struct OutputParser {
    metadata: InputMetadata,
    total_duration_seconds: Option<f64>,
    progress_seconds: f64,
    diagnostic_partial: Vec<u8>,
    data_partial: Vec<u8>,
    recent_lines: VecDeque<String>,
    error_lines: VecDeque<String>,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of raw output from one channel.
    ///
    /// Complete lines (terminated by `\n` or `\r`) are parsed immediately;
    /// a trailing partial line is held until the next chunk or [`finish`].
    ///
    /// [`finish`]: OutputParser::finish
    pub fn feed(&mut self, channel: StreamChannel, chunk: &[u8]) {
        let mut pending = match channel {
            StreamChannel::Diagnostic => std::mem::take(&mut self.diagnostic_partial),
            StreamChannel::Data => std::mem::take(&mut self.data_partial),
        };
        pending.extend_from_slice(chunk);

        let mut start = 0;
        for (i, b) in pending.iter().enumerate() {
            if *b == b'\n' || *b == b'\r' {
                if i > start {
                    let line = String::from_utf8_lossy(&pending[start..i]).into_owned();
                    self.handle_line(channel, line);
                }
                start = i + 1;
            }
        }
        pending.drain(..start);

        match channel {
            StreamChannel::Diagnostic => self.diagnostic_partial = pending,
            StreamChannel::Data => self.data_partial = pending,
        }
    }

    /// Flush any buffered partial lines. Called once the process has exited.
    pub fn finish(&mut self) {
        for channel in [StreamChannel::Diagnostic, StreamChannel::Data] {
            let rest = match channel {
                StreamChannel::Diagnostic => std::mem::take(&mut self.diagnostic_partial),
                StreamChannel::Data => std::mem::take(&mut self.data_partial),
            };
            if !rest.is_empty() {
                let line = String::from_utf8_lossy(&rest).into_owned();
                self.handle_line(channel, line);
            }
        }
    }

    fn handle_line(&mut self, channel: StreamChannel, line: String) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        trace!(?channel, line = trimmed, "encoder output");

        self.parse_line(trimmed);

        if channel == StreamChannel::Diagnostic {
            if is_error_line(trimmed) {
                push_capped(&mut self.error_lines, trimmed.to_string(), ERROR_LINE_CAPACITY);
            }
            push_capped(
                &mut self.recent_lines,
                trimmed.to_string(),
                RECENT_LINE_CAPACITY,
            );
        }
    }

    fn parse_line(&mut self, line: &str) {
        if line.starts_with("Input #") {
            self.parse_input_header(line);
        }
        if let Some(rest) = line.strip_prefix("Duration:") {
            self.parse_duration(rest);
        }
        if line.starts_with("Stream #") {
            if let Some(idx) = line.find("Video:") {
                self.parse_video_stream(&line[idx + "Video:".len()..]);
            } else if let Some(idx) = line.find("Audio:") {
                self.parse_audio_stream(&line[idx + "Audio:".len()..]);
            }
        }
        if let Some(idx) = line.rfind("time=") {
            let value = line[idx + "time=".len()..]
                .split_whitespace()
                .next()
                .unwrap_or("");
            if let Some(seconds) = parse_timestamp(value) {
                self.progress_seconds = seconds;
            }
        }
    }

    // Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'a.mp4':
    fn parse_input_header(&mut self, line: &str) {
        if self.metadata.container.is_some() {
            return;
        }
        let Some((_, after_index)) = line.split_once(", ") else {
            return;
        };
        if let Some(end) = after_index.find(", from") {
            let container = after_index[..end].trim();
            if !container.is_empty() {
                self.metadata.container = Some(container.to_string());
            }
        }
    }

    // Duration: 00:05:00.00, start: 0.000000, bitrate: 4211 kb/s
    fn parse_duration(&mut self, rest: &str) {
        if self.total_duration_seconds.is_some() {
            return;
        }
        let value = rest.split(',').next().unwrap_or("");
        if let Some(seconds) = parse_timestamp(value) {
            self.total_duration_seconds = Some(seconds);
        }
    }

    // h264 (High) (avc1 / 0x31637661), yuv420p(tv, bt709), 1920x1080 [SAR 1:1 DAR 16:9], 4000 kb/s, 29.97 fps, ...
    fn parse_video_stream(&mut self, desc: &str) {
        if self.metadata.video_codec.is_none() {
            if let Some(codec) = first_word(desc) {
                self.metadata.video_codec = Some(codec);
            }
        }
        for segment in desc.split(',') {
            let segment = segment.trim();
            if self.metadata.resolution.is_none() {
                if let Some(res) = segment.split_whitespace().find_map(parse_dimensions) {
                    self.metadata.resolution = Some(res);
                }
            }
            if self.metadata.fps.is_none() {
                if let Some(value) = segment.strip_suffix(" fps") {
                    if let Ok(fps) = value.trim().parse::<f64>() {
                        self.metadata.fps = Some(fps);
                    }
                }
            }
        }
    }

    // aac (LC) (mp4a / 0x6134706D), 48000 Hz, stereo, fltp, 128 kb/s
    fn parse_audio_stream(&mut self, desc: &str) {
        if self.metadata.audio_codec.is_none() {
            if let Some(codec) = first_word(desc) {
                self.metadata.audio_codec = Some(codec);
            }
        }
        if self.metadata.sample_rate_hz.is_none() {
            for segment in desc.split(',') {
                if let Some(value) = segment.trim().strip_suffix(" Hz") {
                    if let Ok(rate) = value.trim().parse::<u32>() {
                        self.metadata.sample_rate_hz = Some(rate);
                        break;
                    }
                }
            }
        }
    }

    pub fn metadata(&self) -> &InputMetadata {
        &self.metadata
    }

    /// Declared length of the input, or 0 when the banner never announced one.
    pub fn total_duration_seconds(&self) -> f64 {
        self.total_duration_seconds.unwrap_or(0.0)
    }

    pub fn progress_seconds(&self) -> f64 {
        self.progress_seconds
    }

    /// `progress / duration`, or 1.0 when the duration is unknown.
    pub fn completion_ratio(&self) -> f64 {
        completion_ratio(self.progress_seconds, self.total_duration_seconds())
    }

    pub fn recent_lines(&self) -> impl Iterator<Item = &str> {
        self.recent_lines.iter().map(String::as_str)
    }

    pub fn error_lines(&self) -> impl Iterator<Item = &str> {
        self.error_lines.iter().map(String::as_str)
    }

    /// Everything retained from the diagnostic stream, error lines first.
    pub fn diagnostic_tail(&self) -> String {
        self.error_lines
            .iter()
            .chain(self.recent_lines.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// `progress / total`, treating an unknown (zero) total as fully complete.
pub fn completion_ratio(progress_seconds: f64, total_duration_seconds: f64) -> f64 {
    if total_duration_seconds > 0.0 {
        progress_seconds / total_duration_seconds
    } else {
        1.0
    }
}

fn first_word(desc: &str) -> Option<String> {
    desc.split_whitespace()
        .next()
        .map(|w| w.trim_end_matches(',').to_string())
        .filter(|w| !w.is_empty())
}

fn parse_dimensions(token: &str) -> Option<String> {
    let (w, h) = token.split_once('x')?;
    let width: u32 = w.parse().ok()?;
    let height: u32 = h.parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some(format!("{}x{}", width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BANNER: &str = "\
ffmpeg version 6.1.1 Copyright (c) 2000-2023 the FFmpeg developers
Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'a.mp4':
  Metadata:
    major_brand     : isom
  Duration: 00:05:00.00, start: 0.000000, bitrate: 4211 kb/s
  Stream #0:0[0x1](und): Video: h264 (High) (avc1 / 0x31637661), yuv420p(tv, bt709, progressive), 1920x1080 [SAR 1:1 DAR 16:9], 4000 kb/s, 29.97 fps, 29.97 tbr, 30k tbn (default)
  Stream #0:1[0x2](und): Audio: aac (LC) (mp4a / 0x6134706D), 48000 Hz, stereo, fltp, 128 kb/s (default)
";

    fn feed_str(parser: &mut OutputParser, s: &str) {
        parser.feed(StreamChannel::Diagnostic, s.as_bytes());
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("00:05:00.00"), Some(300.0));
        assert_eq!(parse_timestamp("1:02:03.50"), Some(3723.5));
        assert_eq!(parse_timestamp("N/A"), None);
        assert_eq!(parse_timestamp("-00:00:00.02"), None);
        assert_eq!(parse_timestamp("12:34"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn test_banner_metadata() {
        let mut parser = OutputParser::new();
        feed_str(&mut parser, BANNER);

        assert_eq!(parser.total_duration_seconds(), 300.0);
        let md = parser.metadata();
        assert_eq!(md.container.as_deref(), Some("mov,mp4,m4a,3gp,3g2,mj2"));
        assert_eq!(md.video_codec.as_deref(), Some("h264"));
        assert_eq!(md.resolution.as_deref(), Some("1920x1080"));
        assert_eq!(md.fps, Some(29.97));
        assert_eq!(md.audio_codec.as_deref(), Some("aac"));
        assert_eq!(md.sample_rate_hz, Some(48000));
    }

    #[test]
    fn test_metadata_is_write_once() {
        let mut parser = OutputParser::new();
        feed_str(&mut parser, BANNER);
        // Output section of the banner describes the encoded streams
        feed_str(
            &mut parser,
            "Output #0, flv, to 'rtmp://x':\n  Duration: 00:00:01.00\n  Stream #0:0: Video: h264 (libx264), yuv420p, 1280x720, q=2-31, 4500 kb/s, 30 fps\n  Stream #0:1: Audio: aac, 44100 Hz, stereo\n",
        );

        assert_eq!(parser.total_duration_seconds(), 300.0);
        assert_eq!(parser.metadata().resolution.as_deref(), Some("1920x1080"));
        assert_eq!(parser.metadata().sample_rate_hz, Some(48000));
    }

    #[test]
    fn test_progress_with_carriage_returns() {
        let mut parser = OutputParser::new();
        feed_str(&mut parser, BANNER);
        feed_str(
            &mut parser,
            "frame= 1800 fps= 30 q=28.0 size=   10240kB time=00:01:00.00 bitrate=1398.1kbits/s speed=1x\r",
        );
        assert_eq!(parser.progress_seconds(), 60.0);
        feed_str(
            &mut parser,
            "frame= 8970 fps= 30 q=28.0 size=   51200kB time=00:04:59.00 bitrate=1398.1kbits/s speed=1x\r",
        );
        assert_eq!(parser.progress_seconds(), 299.0);
        assert!((parser.completion_ratio() - 299.0 / 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_progress_na_is_ignored() {
        let mut parser = OutputParser::new();
        feed_str(&mut parser, "size=N/A time=00:00:42.00 bitrate=N/A\n");
        feed_str(&mut parser, "size=N/A time=N/A bitrate=N/A\n");
        assert_eq!(parser.progress_seconds(), 42.0);
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut parser = OutputParser::new();
        feed_str(&mut parser, "  Durat");
        assert_eq!(parser.total_duration_seconds(), 0.0);
        feed_str(&mut parser, "ion: 00:30:00.00, start: 0.0\n");
        assert_eq!(parser.total_duration_seconds(), 1800.0);
    }

    #[test]
    fn test_finish_flushes_partial_line() {
        let mut parser = OutputParser::new();
        feed_str(&mut parser, "time=00:00:10.00");
        assert_eq!(parser.progress_seconds(), 0.0);
        parser.finish();
        assert_eq!(parser.progress_seconds(), 10.0);
    }

    #[test]
    fn test_channels_buffer_independently() {
        let mut parser = OutputParser::new();
        parser.feed(StreamChannel::Diagnostic, b"  Duration: 00:0");
        parser.feed(StreamChannel::Data, b"out_time=00:00:05.000000\n");
        parser.feed(StreamChannel::Diagnostic, b"1:00.00, start: 0\n");
        assert_eq!(parser.total_duration_seconds(), 60.0);
        assert_eq!(parser.progress_seconds(), 5.0);
        // data channel lines are not part of the forensic tail
        assert!(parser.recent_lines().all(|l| !l.starts_with("out_time")));
    }

    #[test]
    fn test_unknown_duration_ratio_is_complete() {
        let mut parser = OutputParser::new();
        feed_str(&mut parser, "time=00:00:03.00\n");
        assert_eq!(parser.completion_ratio(), 1.0);
    }

    #[test]
    fn test_error_lines_are_collected() {
        let mut parser = OutputParser::new();
        feed_str(
            &mut parser,
            "frame=1 time=00:00:01.00\n[h264 @ 0x55] Invalid NAL unit size\nConversion failed!\n",
        );
        let errors: Vec<&str> = parser.error_lines().collect();
        assert_eq!(
            errors,
            vec!["[h264 @ 0x55] Invalid NAL unit size", "Conversion failed!"]
        );
        assert!(parser.diagnostic_tail().contains("Conversion failed!"));
    }

    #[test]
    fn test_tail_is_bounded() {
        let mut parser = OutputParser::new();
        for i in 0..(RECENT_LINE_CAPACITY + 25) {
            feed_str(&mut parser, &format!("line {} error\n", i));
        }
        assert_eq!(parser.recent_lines().count(), RECENT_LINE_CAPACITY);
        assert_eq!(parser.error_lines().count(), ERROR_LINE_CAPACITY);
        assert_eq!(
            parser.recent_lines().last(),
            Some(format!("line {} error", RECENT_LINE_CAPACITY + 24).as_str())
        );
    }

    #[test]
    fn test_missing_fields_are_not_errors() {
        let mut parser = OutputParser::new();
        feed_str(&mut parser, "  Stream #0:0: Video: rawvideo\n  Stream #0:1: Audio: pcm_s16le\n");
        let md = parser.metadata();
        assert_eq!(md.video_codec.as_deref(), Some("rawvideo"));
        assert_eq!(md.resolution, None);
        assert_eq!(md.fps, None);
        assert_eq!(md.audio_codec.as_deref(), Some("pcm_s16le"));
        assert_eq!(md.sample_rate_hz, None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Splitting the same byte stream at any point yields the same state
        #[test]
        fn prop_chunk_boundaries_do_not_matter(split in 0usize..BANNER.len()) {
            let mut whole = OutputParser::new();
            feed_str(&mut whole, BANNER);

            let mut split_parser = OutputParser::new();
            split_parser.feed(StreamChannel::Diagnostic, &BANNER.as_bytes()[..split]);
            split_parser.feed(StreamChannel::Diagnostic, &BANNER.as_bytes()[split..]);

            prop_assert_eq!(whole.metadata(), split_parser.metadata());
            prop_assert_eq!(whole.total_duration_seconds(), split_parser.total_duration_seconds());
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut parser = OutputParser::new();
            parser.feed(StreamChannel::Diagnostic, &bytes);
            parser.finish();
            prop_assert!(parser.progress_seconds() >= 0.0);
        }
    }
}
