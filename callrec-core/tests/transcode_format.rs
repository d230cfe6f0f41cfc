use std::path::Path;
use std::process::Command;

use callrec_core::transcode::ensure_target;
use callrec_core::{parse_config, FfmpegTranscoder, Transcoder};
use tempfile::TempDir;

fn tool_available(name: &str) -> bool {
    Command::new(name)
        .arg("-version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn stereo_source(path: &Path) -> bool {
    Command::new("ffmpeg")
        .args(["-y", "-hide_banner", "-loglevel", "error", "-f", "lavfi", "-i"])
        .arg("sine=frequency=440:sample_rate=44100:duration=1")
        .args(["-ac", "2", "-c:a", "pcm_s16le"])
        .arg(path)
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn output_is_mono_8khz_alaw() {
    if !tool_available("ffmpeg") || !tool_available("ffprobe") {
        eprintln!("ffmpeg/ffprobe not available, skipping");
        return;
    }
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source.wav");
    if !stereo_source(&source) {
        eprintln!("ffmpeg lacks lavfi, skipping");
        return;
    }
    let config =
        parse_config("[store]\nbucket = \"b\"\n[convert]\nffmpeg = \"ffmpeg\"\nffprobe = \"ffprobe\"\n")
            .unwrap();
    let transcoder = FfmpegTranscoder::new(&config.convert);

    let first = dir.path().join("first.wav");
    let second = dir.path().join("second.wav");
    transcoder
        .transcode(&source.to_string_lossy(), &first)
        .await
        .unwrap();
    transcoder
        .transcode(&first.to_string_lossy(), &second)
        .await
        .unwrap();

    let format = ensure_target(transcoder.probe(&second).await.unwrap()).unwrap();
    assert_eq!(format.channels, 1);
    assert_eq!(format.sample_rate, 8000);
    assert_eq!(format.codec, "pcm_alaw");
}
