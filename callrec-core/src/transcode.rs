use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ConvertSection;

pub const TARGET_CODEC: &str = "pcm_alaw";
pub const TARGET_CHANNELS: u32 = 1;
pub const TARGET_SAMPLE_RATE: u32 = 8000;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: PathBuf,
        status: String,
        stderr: String,
    },
    #[error("{program} timed out after {limit:?}")]
    Timeout { program: PathBuf, limit: Duration },
    #[error("invalid ffprobe payload: {0}")]
    Probe(String),
    #[error("output has no audio stream")]
    MissingAudioStream,
    #[error("output format {actual} does not match {expected}")]
    FormatMismatch {
        expected: StreamFormat,
        actual: StreamFormat,
    },
    #[error("transcoder produced no output at {0}")]
    MissingOutput(PathBuf),
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn output(&self, program: &Path, args: &[String]) -> std::io::Result<Output>;
}

pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn output(&self, program: &Path, args: &[String]) -> std::io::Result<Output> {
        // Dropping the future on timeout must take the child down with it.
        Command::new(program)
            .kill_on_drop(true)
            .args(args)
            .output()
            .await
    }
}

/// Audio parameters of the first audio stream of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamFormat {
    pub codec: String,
    pub channels: u32,
    pub sample_rate: u32,
}

impl StreamFormat {
    pub fn target() -> Self {
        Self {
            codec: TARGET_CODEC.to_string(),
            channels: TARGET_CHANNELS,
            sample_rate: TARGET_SAMPLE_RATE,
        }
    }

    pub fn is_target(&self) -> bool {
        *self == Self::target()
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}ch/{}Hz", self.codec, self.channels, self.sample_rate)
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Converts `input` (a path or URL) into a mono 8 kHz A-law file at `output`.
    async fn transcode(&self, input: &str, output: &Path) -> TranscodeResult<()>;

    async fn probe(&self, path: &Path) -> TranscodeResult<StreamFormat>;
}

pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    limit: Duration,
    executor: Arc<dyn CommandExecutor>,
}

impl FfmpegTranscoder {
    pub fn new(section: &ConvertSection) -> Self {
        Self {
            ffmpeg: section.ffmpeg.clone(),
            ffprobe: section.ffprobe.clone(),
            limit: section.transcode_timeout(),
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    async fn execute(&self, program: &Path, args: Vec<String>) -> TranscodeResult<Output> {
        let output = match timeout(self.limit, self.executor.output(program, &args)).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(TranscodeError::Spawn {
                    program: program.to_path_buf(),
                    source,
                })
            }
            Err(_) => {
                return Err(TranscodeError::Timeout {
                    program: program.to_path_buf(),
                    limit: self.limit,
                })
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscodeError::Failed {
                program: program.to_path_buf(),
                status: output.status.to_string(),
                stderr: last_line(&stderr).to_string(),
            });
        }
        Ok(output)
    }
}

pub fn transcode_args(input: &str, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        input.to_string(),
        "-ac".into(),
        TARGET_CHANNELS.to_string(),
        "-ar".into(),
        TARGET_SAMPLE_RATE.to_string(),
        "-c:a".into(),
        TARGET_CODEC.into(),
        output.display().to_string(),
    ]
}

pub fn probe_args(path: &Path) -> Vec<String> {
    vec![
        "-v".into(),
        "quiet".into(),
        "-print_format".into(),
        "json".into(),
        "-show_streams".into(),
        path.display().to_string(),
    ]
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, input: &str, output: &Path) -> TranscodeResult<()> {
        self.execute(&self.ffmpeg, transcode_args(input, output))
            .await?;
        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(TranscodeError::MissingOutput(output.to_path_buf()));
        }
        debug!(output = %output.display(), "transcoded");
        Ok(())
    }

    async fn probe(&self, path: &Path) -> TranscodeResult<StreamFormat> {
        let output = self.execute(&self.ffprobe, probe_args(path)).await?;
        parse_probe(&output.stdout)
    }
}

/// Checks a probed format against mono 8 kHz A-law.
pub fn ensure_target(format: StreamFormat) -> TranscodeResult<StreamFormat> {
    if format.is_target() {
        Ok(format)
    } else {
        Err(TranscodeError::FormatMismatch {
            expected: StreamFormat::target(),
            actual: format,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    channels: Option<u32>,
    // ffprobe reports the rate as a string.
    #[serde(default)]
    sample_rate: Option<String>,
}

fn parse_probe(stdout: &[u8]) -> TranscodeResult<StreamFormat> {
    let parsed: FfprobeOutput =
        serde_json::from_slice(stdout).map_err(|err| TranscodeError::Probe(err.to_string()))?;
    let stream = parsed
        .streams
        .into_iter()
        .find(|stream| stream.codec_type.as_deref() == Some("audio"))
        .ok_or(TranscodeError::MissingAudioStream)?;
    Ok(StreamFormat {
        codec: stream.codec_name.unwrap_or_default(),
        channels: stream.channels.unwrap_or_default(),
        sample_rate: stream
            .sample_rate
            .as_deref()
            .and_then(|rate| rate.parse().ok())
            .unwrap_or_default(),
    })
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
        .trim()
}
