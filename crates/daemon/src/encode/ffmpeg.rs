//! FFmpeg invocation for one streaming session
//!
//! Turns the declarative stream settings into the encoder's argument vector.
//! No decisions are made here beyond string assembly.

use crate::config::{
    Config, Destination, EncoderConfig, HwAccel, OverlayConfig, OverlayPosition,
};
use std::path::Path;
use std::process::Command;

/// Overlay text file is re-read before every N frames
pub const OVERLAY_RELOAD_INTERVAL: u32 = 1;

/// Margin in pixels between the overlay text and the frame edge
const OVERLAY_MARGIN: u32 = 20;

/// Render node used for VA-API uploads
const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// Playlist and segment names used for local segmented output
pub const HLS_PLAYLIST_NAME: &str = "stream.m3u8";
pub const HLS_SEGMENT_PATTERN: &str = "segment_%05d.ts";

/// Settings that shape the encoder invocation
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub encoder: EncoderConfig,
    pub overlay: OverlayConfig,
    pub output: Destination,
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            encoder: config.encoder.clone(),
            overlay: config.overlay.clone(),
            output: config.output.clone(),
        }
    }
}

/// Video encoder name for the acceleration mode
pub fn video_codec(hw: HwAccel) -> &'static str {
    match hw {
        HwAccel::None => "libx264",
        HwAccel::Nvenc => "h264_nvenc",
        HwAccel::Vaapi => "h264_vaapi",
    }
}

/// NVENC only understands its own p1..p7 scale; x264 names are mapped onto it.
fn nvenc_preset(preset: &str) -> String {
    let p = preset.trim().to_lowercase();
    if p.len() == 2 && p.starts_with('p') && p[1..].chars().all(|c| c.is_ascii_digit()) {
        return p;
    }
    match p.as_str() {
        "ultrafast" => "p1",
        "superfast" => "p2",
        "veryfast" => "p3",
        "faster" | "fast" => "p4",
        "medium" => "p5",
        "slow" => "p6",
        "slower" | "veryslow" => "p7",
        _ => "p4",
    }
    .to_string()
}

/// Escape a value for use inside a filtergraph option.
pub fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ':' | '\'' | ',' | ';' | '[' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn overlay_coordinates(position: OverlayPosition) -> (String, String) {
    let m = OVERLAY_MARGIN;
    match position {
        OverlayPosition::TopLeft => (format!("{m}"), format!("{m}")),
        OverlayPosition::TopRight => (format!("w-tw-{m}"), format!("{m}")),
        OverlayPosition::BottomLeft => (format!("{m}"), format!("h-th-{m}")),
        OverlayPosition::BottomRight => (format!("w-tw-{m}"), format!("h-th-{m}")),
    }
}

fn drawtext_filter(overlay: &OverlayConfig) -> String {
    let (x, y) = overlay_coordinates(overlay.position);
    let mut filter = format!(
        "drawtext=textfile={}:reload={}:expansion=none:fontsize={}:fontcolor={}:x={}:y={}:box=1:boxcolor=black@0.5:boxborderw=8",
        escape_filter_value(&overlay.text_path.to_string_lossy()),
        OVERLAY_RELOAD_INTERVAL,
        overlay.font_size,
        escape_filter_value(&overlay.color),
        x,
        y,
    );
    if let Some(font) = &overlay.font_path {
        filter.push_str(":fontfile=");
        filter.push_str(&escape_filter_value(&font.to_string_lossy()));
    }
    filter
}

/// Build the `-vf` chain: scale, optional letterbox pad, optional overlay,
/// and the hardware upload for VA-API.
pub fn build_video_filter(settings: &StreamSettings) -> String {
    let w = settings.encoder.resolution.width;
    let h = settings.encoder.resolution.height;
    let mut chain = Vec::new();

    if settings.encoder.letterbox {
        chain.push(format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease"
        ));
        chain.push(format!("pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color=black"));
    } else {
        chain.push(format!("scale={w}:{h}"));
    }

    if settings.overlay.enabled {
        chain.push(drawtext_filter(&settings.overlay));
    }

    if settings.encoder.hw_accel == HwAccel::Vaapi {
        chain.push("format=nv12".to_string());
        chain.push("hwupload".to_string());
    }

    chain.join(",")
}

/// Build the encoder command for one input file
///
/// Argument order:
/// - realtime input pacing (`-re`) and the hardware hint
/// - input path
/// - video codec, preset, bitrate/maxrate/bufsize (2x bitrate)
/// - frame rate and keyframe interval (2x frame rate), pixel format
/// - filter chain
/// - audio codec, bitrate, sample rate, channels
/// - output format flags and destination
pub fn build_ffmpeg_command(input: &Path, settings: &StreamSettings) -> Command {
    let enc = &settings.encoder;
    let mut cmd = Command::new(&enc.ffmpeg_path);

    cmd.arg("-re");
    match enc.hw_accel {
        HwAccel::None => {}
        HwAccel::Nvenc => {
            cmd.arg("-hwaccel").arg("cuda");
        }
        HwAccel::Vaapi => {
            cmd.arg("-vaapi_device").arg(VAAPI_DEVICE);
        }
    }

    cmd.arg("-i").arg(input);

    cmd.arg("-c:v").arg(video_codec(enc.hw_accel));
    match enc.hw_accel {
        HwAccel::None => {
            cmd.arg("-preset").arg(&enc.preset);
        }
        HwAccel::Nvenc => {
            cmd.arg("-preset").arg(nvenc_preset(&enc.preset));
        }
        // h264_vaapi has no preset option
        HwAccel::Vaapi => {}
    }

    cmd.arg("-b:v").arg(format!("{}k", enc.bitrate_kbps));
    cmd.arg("-maxrate").arg(format!("{}k", enc.bitrate_kbps));
    cmd.arg("-bufsize")
        .arg(format!("{}k", enc.bitrate_kbps.saturating_mul(2)));

    cmd.arg("-r").arg(enc.frame_rate.to_string());
    cmd.arg("-g").arg(enc.frame_rate.saturating_mul(2).to_string());

    // VA-API frames are already nv12 surfaces after hwupload
    if enc.hw_accel != HwAccel::Vaapi {
        cmd.arg("-pix_fmt").arg("yuv420p");
    }

    cmd.arg("-vf").arg(build_video_filter(settings));

    cmd.arg("-c:a").arg("aac");
    cmd.arg("-b:a").arg(format!("{}k", enc.audio_bitrate_kbps));
    cmd.arg("-ar").arg(enc.sample_rate_hz.to_string());
    cmd.arg("-ac").arg(enc.channels.to_string());

    match &settings.output {
        Destination::RemoteEndpoint { url } => {
            cmd.arg("-f").arg("flv");
            cmd.arg("-flvflags").arg("no_duration_filesize");
            cmd.arg(url);
        }
        Destination::LocalSegmented {
            dir,
            segment_seconds,
            list_size,
        } => {
            cmd.arg("-f").arg("hls");
            cmd.arg("-hls_time").arg(segment_seconds.to_string());
            cmd.arg("-hls_list_size").arg(list_size.to_string());
            // Segments from consecutive sessions continue the same playlist
            cmd.arg("-hls_flags")
                .arg("delete_segments+append_list+omit_endlist");
            cmd.arg("-hls_segment_filename")
                .arg(dir.join(HLS_SEGMENT_PATTERN));
            cmd.arg("-y");
            cmd.arg(dir.join(HLS_PLAYLIST_NAME));
        }
    }

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Resolution;
    use proptest::prelude::*;
    use std::ffi::OsStr;
    use std::path::PathBuf;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn position_of(args: &[String], flag: &str) -> usize {
        args.iter()
            .position(|a| a == flag)
            .unwrap_or_else(|| panic!("missing {flag} in {args:?}"))
    }

    fn remote_settings() -> StreamSettings {
        StreamSettings {
            encoder: EncoderConfig::default(),
            overlay: OverlayConfig::default(),
            output: Destination::RemoteEndpoint {
                url: "rtmp://live.example.com/app/key".to_string(),
            },
        }
    }

    fn hw_strategy() -> impl Strategy<Value = HwAccel> {
        prop_oneof![
            Just(HwAccel::None),
            Just(HwAccel::Nvenc),
            Just(HwAccel::Vaapi),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_command_completeness(
            input in "/[a-zA-Z0-9_/.]{1,40}",
            bitrate in 1u32..20_000,
            width in 16u32..4096,
            height in 16u32..4096,
            fps in 1u32..120,
            hw in hw_strategy(),
            letterbox in proptest::bool::ANY,
        ) {
            let mut settings = remote_settings();
            settings.encoder.bitrate_kbps = bitrate;
            settings.encoder.resolution = Resolution::new(width, height);
            settings.encoder.frame_rate = fps;
            settings.encoder.hw_accel = hw;
            settings.encoder.letterbox = letterbox;

            let cmd = build_ffmpeg_command(Path::new(&input), &settings);
            let args = get_command_args(&cmd);

            prop_assert_eq!(cmd.get_program(), OsStr::new("ffmpeg"));
            prop_assert_eq!(args[0].as_str(), "-re");
            prop_assert!(has_flag_with_value(&args, "-i", &input));
            prop_assert!(has_flag_with_value(&args, "-c:v", video_codec(hw)));
            let rate = format!("{}k", bitrate);
            let buffer = format!("{}k", bitrate * 2);
            prop_assert!(has_flag_with_value(&args, "-b:v", &rate));
            prop_assert!(has_flag_with_value(&args, "-maxrate", &rate));
            prop_assert!(has_flag_with_value(&args, "-bufsize", &buffer));
            prop_assert!(has_flag_with_value(&args, "-r", &fps.to_string()));
            prop_assert!(has_flag_with_value(&args, "-g", &(fps * 2).to_string()));
            prop_assert!(has_flag_with_value(&args, "-c:a", "aac"));
            prop_assert!(has_flag_with_value(&args, "-ar", "44100"));
            prop_assert!(has_flag_with_value(&args, "-ac", "2"));

            let vf = &args[position_of(&args, "-vf") + 1];
            let scale_prefix = format!("scale={}:{}", width, height);
            prop_assert!(vf.starts_with(&scale_prefix));
            prop_assert_eq!(vf.contains("pad="), letterbox);

            // input comes before every output option
            prop_assert!(position_of(&args, "-i") < position_of(&args, "-c:v"));
            prop_assert_eq!(args.last().map(String::as_str), Some("rtmp://live.example.com/app/key"));
        }
    }

    #[test]
    fn test_software_defaults() {
        let cmd = build_ffmpeg_command(Path::new("/media/a.mp4"), &remote_settings());
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-preset", "veryfast"));
        assert!(has_flag_with_value(&args, "-pix_fmt", "yuv420p"));
        assert!(has_flag_with_value(&args, "-f", "flv"));
        assert!(!args.iter().any(|a| a == "-hwaccel"));
        assert_eq!(
            args[position_of(&args, "-vf") + 1],
            "scale=1920:1080:force_original_aspect_ratio=decrease,pad=1920:1080:(ow-iw)/2:(oh-ih)/2:color=black"
        );
    }

    #[test]
    fn test_nvenc_hint_and_preset_mapping() {
        let mut settings = remote_settings();
        settings.encoder.hw_accel = HwAccel::Nvenc;
        let args = get_command_args(&build_ffmpeg_command(Path::new("a.mp4"), &settings));

        assert!(has_flag_with_value(&args, "-hwaccel", "cuda"));
        assert!(position_of(&args, "-hwaccel") < position_of(&args, "-i"));
        assert!(has_flag_with_value(&args, "-preset", "p3"));

        settings.encoder.preset = "p6".to_string();
        let args = get_command_args(&build_ffmpeg_command(Path::new("a.mp4"), &settings));
        assert!(has_flag_with_value(&args, "-preset", "p6"));
    }

    #[test]
    fn test_vaapi_uploads_and_skips_pix_fmt() {
        let mut settings = remote_settings();
        settings.encoder.hw_accel = HwAccel::Vaapi;
        let args = get_command_args(&build_ffmpeg_command(Path::new("a.mp4"), &settings));

        assert!(has_flag_with_value(&args, "-vaapi_device", VAAPI_DEVICE));
        assert!(!args.iter().any(|a| a == "-pix_fmt"));
        assert!(!args.iter().any(|a| a == "-preset"));
        assert!(args[position_of(&args, "-vf") + 1].ends_with(",format=nv12,hwupload"));
    }

    #[test]
    fn test_overlay_filter() {
        let mut settings = remote_settings();
        settings.overlay.enabled = true;
        settings.overlay.text_path = PathBuf::from("/run/loopcast/now playing.txt");
        settings.overlay.position = OverlayPosition::TopRight;
        settings.overlay.font_path = Some(PathBuf::from("/fonts/Inter.ttf"));
        let vf = build_video_filter(&settings);

        assert!(vf.contains(
            "drawtext=textfile=/run/loopcast/now playing.txt:reload=1:expansion=none"
        ));
        assert!(vf.contains(":x=w-tw-20:y=20"));
        assert!(vf.contains(":fontfile=/fonts/Inter.ttf"));
    }

    #[test]
    fn test_escape_filter_value() {
        assert_eq!(escape_filter_value("C:\\fonts\\a.ttf"), "C\\:\\\\fonts\\\\a.ttf");
        assert_eq!(escape_filter_value("it's"), "it\\'s");
        assert_eq!(escape_filter_value("white@0.5"), "white@0.5");
    }

    #[test]
    fn test_local_segmented_output() {
        let mut settings = remote_settings();
        settings.output = Destination::LocalSegmented {
            dir: PathBuf::from("/srv/hls"),
            segment_seconds: 6,
            list_size: 10,
        };
        let args = get_command_args(&build_ffmpeg_command(Path::new("a.mp4"), &settings));

        assert!(has_flag_with_value(&args, "-f", "hls"));
        assert!(has_flag_with_value(&args, "-hls_time", "6"));
        assert!(has_flag_with_value(&args, "-hls_list_size", "10"));
        assert!(has_flag_with_value(
            &args,
            "-hls_segment_filename",
            "/srv/hls/segment_%05d.ts"
        ));
        assert_eq!(args.last().map(String::as_str), Some("/srv/hls/stream.m3u8"));
    }
}
