//! Failure classifier for terminated encoder sessions.
//!
//! Heuristics over the exit outcome, the captured diagnostic text and the
//! completion ratio. Rules are evaluated in order and the first match is the
//! primary cause; every matching rule is kept, in order, as a probable cause.

use crate::output_parser::InputMetadata;
use crate::process::{ExitOutcome, ProcessSession, KILL_SIGNAL};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Number of error lines and raw lines quoted in a report.
pub const REPORT_LINES: usize = 12;

/// Below this ratio an unexplained failure counts as early termination.
pub const EARLY_TERMINATION_RATIO: f64 = 0.5;

const CORRUPT_MARKERS: &[&str] = &["invalid data found", "corrupt"];
const HW_ENCODER_MARKERS: &[&str] = &["nvenc", "vaapi", "cuda"];
const NETWORK_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "network is unreachable",
    "failed to connect",
    "broken pipe",
];
const CONVERSION_MARKERS: &[&str] = &["conversion failed"];

/// Probable cause of a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    OutOfMemory,
    CorruptInput,
    HardwareEncoder,
    NetworkUnreachable,
    UnsupportedFormat,
    EarlyTermination,
    Unknown,
}

impl FailureCause {
    pub fn description(&self) -> &'static str {
        match self {
            FailureCause::OutOfMemory => "out of memory / killed by the OS",
            FailureCause::CorruptInput => "corrupted input or incompatible codec",
            FailureCause::HardwareEncoder => "hardware encoder fault",
            FailureCause::NetworkUnreachable => "transport or endpoint unreachable",
            FailureCause::UnsupportedFormat => "unsupported input format",
            FailureCause::EarlyTermination => {
                "early termination, likely a filter chain or resolution/frame rate mismatch"
            }
            FailureCause::Unknown => "unknown cause",
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            FailureCause::OutOfMemory => "lower the bitrate or disable hardware acceleration",
            FailureCause::CorruptInput => "re-encode or replace the input file",
            FailureCause::HardwareEncoder => "disable hardware acceleration (hw_accel = \"none\")",
            FailureCause::NetworkUnreachable => "check the stream URL and network connectivity",
            FailureCause::UnsupportedFormat => "convert the input to a common container and codec",
            FailureCause::EarlyTermination => {
                "check the overlay filter, resolution and frame rate settings"
            }
            FailureCause::Unknown => "rerun with verbose encoder logging (RUST_LOG=trace)",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Inputs the rules look at.
#[derive(Debug, Clone, Copy)]
pub struct FailureEvidence<'a> {
    pub exit: ExitOutcome,
    pub tail: &'a str,
    pub completion_ratio: f64,
}

type Predicate = fn(&FailureEvidence<'_>, &str) -> bool;

fn contains_any(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| text.contains(m))
}

fn killed(ev: &FailureEvidence<'_>, _: &str) -> bool {
    ev.exit.signal == Some(KILL_SIGNAL)
}

fn corrupt_input(_: &FailureEvidence<'_>, text: &str) -> bool {
    contains_any(text, CORRUPT_MARKERS)
}

fn hardware_encoder(_: &FailureEvidence<'_>, text: &str) -> bool {
    contains_any(text, HW_ENCODER_MARKERS)
}

fn network(_: &FailureEvidence<'_>, text: &str) -> bool {
    contains_any(text, NETWORK_MARKERS)
}

fn conversion_failed(_: &FailureEvidence<'_>, text: &str) -> bool {
    contains_any(text, CONVERSION_MARKERS)
}

/// Ordered `(predicate, cause)` rules. The predicate gets the evidence and the
/// lowercased tail.
const RULES: &[(Predicate, FailureCause)] = &[
    (killed, FailureCause::OutOfMemory),
    (corrupt_input, FailureCause::CorruptInput),
    (hardware_encoder, FailureCause::HardwareEncoder),
    (network, FailureCause::NetworkUnreachable),
    (conversion_failed, FailureCause::UnsupportedFormat),
];

/// All matching causes in rule order. Never empty: when no text rule matches
/// the result is early termination or unknown, depending on the ratio.
pub fn probable_causes(evidence: &FailureEvidence<'_>) -> Vec<FailureCause> {
    let lowered = evidence.tail.to_lowercase();
    let mut causes: Vec<FailureCause> = RULES
        .iter()
        .filter(|(predicate, _)| predicate(evidence, &lowered))
        .map(|(_, cause)| *cause)
        .collect();

    if causes.is_empty() {
        if evidence.completion_ratio < EARLY_TERMINATION_RATIO {
            causes.push(FailureCause::EarlyTermination);
        } else {
            causes.push(FailureCause::Unknown);
        }
    }
    causes
}

/// First matching cause.
pub fn classify(evidence: &FailureEvidence<'_>) -> FailureCause {
    probable_causes(evidence)[0]
}

/// Rendered diagnosis of one failed session.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub session_id: Uuid,
    pub path: PathBuf,
    pub exit: ExitOutcome,
    pub causes: Vec<FailureCause>,
    pub progress_seconds: f64,
    pub total_duration_seconds: f64,
    pub completion_percent: f64,
    pub elapsed: Duration,
    pub metadata: Option<InputMetadata>,
    pub error_lines: Vec<String>,
    pub raw_lines: Vec<String>,
}

impl FailureReport {
    pub fn primary_cause(&self) -> FailureCause {
        self.causes.first().copied().unwrap_or(FailureCause::Unknown)
    }

    /// One-line form for the failure log line; the error history keeps the
    /// full rendering.
    pub fn summary(&self) -> String {
        format!(
            "{} failed ({}) at {:.1}%: {}",
            self.path.display(),
            self.exit,
            self.completion_percent,
            self.primary_cause()
        )
    }
}

fn last_lines<'a>(lines: impl Iterator<Item = &'a str>, n: usize) -> Vec<String> {
    let all: Vec<&str> = lines.collect();
    let skip = all.len().saturating_sub(n);
    all[skip..].iter().map(|s| s.to_string()).collect()
}

/// Build the report for a session that ended with `exit`.
pub fn diagnose(session: &ProcessSession, exit: ExitOutcome) -> FailureReport {
    let parser = session.parser();
    let tail = parser.diagnostic_tail();
    let completion_ratio = session.completion_ratio();
    let causes = probable_causes(&FailureEvidence {
        exit,
        tail: &tail,
        completion_ratio,
    });

    let metadata = session.metadata();
    FailureReport {
        session_id: session.id,
        path: session.item.path.clone(),
        exit,
        causes,
        progress_seconds: session.progress_seconds(),
        total_duration_seconds: session.total_duration_seconds(),
        completion_percent: completion_ratio * 100.0,
        elapsed: session.elapsed(),
        metadata: (!metadata.is_empty()).then(|| metadata.clone()),
        error_lines: last_lines(parser.error_lines(), REPORT_LINES),
        raw_lines: last_lines(parser.recent_lines(), REPORT_LINES),
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Encoder session {} failed", self.session_id)?;
        writeln!(f, "  video:    {}", self.path.display())?;
        writeln!(f, "  exit:     {}", self.exit)?;
        writeln!(
            f,
            "  progress: {:.2}s / {:.2}s ({:.2}%)",
            self.progress_seconds, self.total_duration_seconds, self.completion_percent
        )?;
        writeln!(f, "  elapsed:  {:.1}s", self.elapsed.as_secs_f64())?;

        if let Some(meta) = &self.metadata {
            let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "?".to_string());
            writeln!(
                f,
                "  input:    container={} video={} audio={} resolution={} fps={} sample_rate={}",
                field(&meta.container),
                field(&meta.video_codec),
                field(&meta.audio_codec),
                field(&meta.resolution),
                meta.fps.map(|v| v.to_string()).unwrap_or_else(|| "?".to_string()),
                meta.sample_rate_hz
                    .map(|v| format!("{} Hz", v))
                    .unwrap_or_else(|| "?".to_string()),
            )?;
        }

        writeln!(f, "  probable causes:")?;
        for (i, cause) in self.causes.iter().enumerate() {
            writeln!(f, "    {}. {} (try: {})", i + 1, cause, cause.suggestion())?;
        }

        if !self.error_lines.is_empty() {
            writeln!(f, "  last error lines:")?;
            for line in &self.error_lines {
                writeln!(f, "    | {}", line)?;
            }
        }
        if !self.raw_lines.is_empty() {
            writeln!(f, "  last output lines:")?;
            for line in &self.raw_lines {
                writeln!(f, "    | {}", line)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output_parser::StreamChannel;
    use crate::playlist::WorkItem;
    use proptest::prelude::*;

    fn evidence(exit: ExitOutcome, tail: &str, ratio: f64) -> FailureEvidence<'_> {
        FailureEvidence {
            exit,
            tail,
            completion_ratio: ratio,
        }
    }

    #[test]
    fn test_rule_order() {
        let code1 = ExitOutcome::code(1);
        assert_eq!(
            classify(&evidence(code1, "pipe:0: Invalid data found when processing input", 0.9)),
            FailureCause::CorruptInput
        );
        assert_eq!(
            classify(&evidence(code1, "[h264_nvenc @ 0x1] OpenEncodeSessionEx failed", 0.9)),
            FailureCause::HardwareEncoder
        );
        assert_eq!(
            classify(&evidence(code1, "rtmp://x: Connection refused", 0.9)),
            FailureCause::NetworkUnreachable
        );
        assert_eq!(
            classify(&evidence(code1, "Conversion failed!", 0.9)),
            FailureCause::UnsupportedFormat
        );
        assert_eq!(
            classify(&evidence(code1, "", 0.49)),
            FailureCause::EarlyTermination
        );
        assert_eq!(classify(&evidence(code1, "", 0.5)), FailureCause::Unknown);
    }

    #[test]
    fn test_earlier_rule_wins_but_all_are_listed() {
        let tail = "corrupt packet\n[h264_vaapi] failed\nConversion failed!";
        let causes = probable_causes(&evidence(ExitOutcome::code(1), tail, 0.1));
        assert_eq!(
            causes,
            vec![
                FailureCause::CorruptInput,
                FailureCause::HardwareEncoder,
                FailureCause::UnsupportedFormat,
            ]
        );
    }

    #[test]
    fn test_other_signal_is_not_oom() {
        assert_ne!(
            classify(&evidence(ExitOutcome::signal(15), "", 0.9)),
            FailureCause::OutOfMemory
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // OOM whenever the kill signal is present, whatever else is true.
        #[test]
        fn prop_kill_signal_always_oom(
            code in prop::option::of(-255i32..256),
            tail in ".{0,200}",
            ratio in 0.0f64..2.0,
        ) {
            let exit = ExitOutcome { code, signal: Some(KILL_SIGNAL) };
            prop_assert_eq!(classify(&evidence(exit, &tail, ratio)), FailureCause::OutOfMemory);
        }

        // And only then.
        #[test]
        fn prop_no_kill_signal_never_oom(
            code in prop::option::of(-255i32..256),
            signal in prop::option::of(1i32..64).prop_filter("not SIGKILL", |s| *s != Some(KILL_SIGNAL)),
            tail in ".{0,200}",
            ratio in 0.0f64..2.0,
        ) {
            let exit = ExitOutcome { code, signal };
            let causes = probable_causes(&evidence(exit, &tail, ratio));
            prop_assert!(!causes.is_empty());
            prop_assert!(!causes.contains(&FailureCause::OutOfMemory));
        }
    }

    #[test]
    fn test_report_from_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("movie.mp4");
        std::fs::write(&path, b"x").unwrap();

        let mut session = ProcessSession::new(WorkItem::from_path(path.clone()));
        let banner = "Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'movie.mp4':\n\
                      \x20 Duration: 00:30:00.00, start: 0.000000, bitrate: 2000 kb/s\n\
                      \x20   Stream #0:0(und): Video: h264 (High), yuv420p, 1280x720, 1500 kb/s, 25 fps\n\
                      frame=1000 fps=25 time=00:00:42.00 bitrate=1\r";
        session_feed(&mut session, banner);

        let report = diagnose(&session, ExitOutcome::signal(KILL_SIGNAL));
        assert_eq!(report.primary_cause(), FailureCause::OutOfMemory);
        assert_eq!(report.path, path);
        assert_eq!(report.progress_seconds, 42.0);
        assert_eq!(report.total_duration_seconds, 1800.0);
        assert!((report.completion_percent - 2.333).abs() < 0.01);
        assert!(report.metadata.is_some());
        assert!(report.raw_lines.len() <= REPORT_LINES);

        let rendered = report.to_string();
        assert!(rendered.contains("out of memory"));
        assert!(rendered.contains("lower the bitrate"));
        assert!(rendered.contains("movie.mp4"));
        assert!(report.summary().contains("SIGKILL"));
    }

    fn session_feed(session: &mut ProcessSession, text: &str) {
        session.parser_mut().feed(StreamChannel::Diagnostic, text.as_bytes());
    }
}
