use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::{CompilerConfig, FfmpegMode};
use crate::error::{
    diagnostic_tail, EncodingError, MuxError, ResourceError, DIAGNOSTIC_TAIL_CHARS,
};
use crate::schema::MediaKind;
use crate::temp::{ScratchDir, TempMedia};

/// Process boundary to the media toolchain.
#[async_trait]
pub trait MediaEncoder: Send + Sync {
    /// Audio duration in seconds.
    async fn probe_duration(&self, audio: &Path) -> Result<f64, MuxError>;

    /// Stream-copies `clips` (same codec parameters) into `output`.
    async fn concat_audio(&self, clips: &[PathBuf], output: &Path) -> Result<(), EncodingError>;

    /// Holds `image` for exactly `duration_secs` under `audio`.
    async fn mux_still(
        &self,
        image: &Path,
        audio: &Path,
        duration_secs: f64,
        output: &Path,
    ) -> Result<(), MuxError>;
}

#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub fps: u32,
    pub audio_bitrate: String,
    pub video_codec: String,
    pub pixel_format: String,
    pub encoder_timeout: Duration,
    pub probe_timeout: Duration,
}

impl EncodeSettings {
    pub fn from_config(config: &CompilerConfig) -> Self {
        Self {
            fps: config.fps,
            audio_bitrate: config.audio_bitrate.clone(),
            video_codec: config.video_codec.clone(),
            pixel_format: config.pixel_format.clone(),
            encoder_timeout: config.encoder_timeout(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    mode_label: &'static str,
    settings: EncodeSettings,
}

impl FfmpegEncoder {
    pub fn from_config(config: &CompilerConfig) -> Result<Self, ResourceError> {
        Self::with_mode(config.ffmpeg, EncodeSettings::from_config(config))
    }

    pub fn with_mode(mode: FfmpegMode, settings: EncodeSettings) -> Result<Self, ResourceError> {
        match mode {
            FfmpegMode::Auto | FfmpegMode::System => Ok(Self {
                ffmpeg: PathBuf::from("ffmpeg"),
                ffprobe: PathBuf::from("ffprobe"),
                mode_label: "system",
                settings,
            }),
            FfmpegMode::Sidecar => sidecar_encoder(settings),
        }
    }

    pub fn settings(&self) -> &EncodeSettings {
        &self.settings
    }
}

#[cfg(feature = "sidecar_ffmpeg")]
fn sidecar_encoder(settings: EncodeSettings) -> Result<FfmpegEncoder, ResourceError> {
    let ffmpeg = ffmpeg_sidecar::paths::ffmpeg_path();
    if !ffmpeg.exists() {
        ffmpeg_sidecar::download::auto_download().map_err(|error| {
            ResourceError::MissingExecutable {
                program: format!("{} (sidecar download failed: {error})", ffmpeg.display()),
            }
        })?;
    }
    Ok(FfmpegEncoder {
        ffprobe: ffmpeg_sidecar::ffprobe::ffprobe_path(),
        ffmpeg,
        mode_label: "sidecar",
        settings,
    })
}

#[cfg(not(feature = "sidecar_ffmpeg"))]
fn sidecar_encoder(_settings: EncodeSettings) -> Result<FfmpegEncoder, ResourceError> {
    Err(ResourceError::MissingExecutable {
        program: "ffmpeg sidecar (rebuild with `--features sidecar_ffmpeg`)".to_owned(),
    })
}

#[async_trait]
impl MediaEncoder for FfmpegEncoder {
    async fn probe_duration(&self, audio: &Path) -> Result<f64, MuxError> {
        let args = ffprobe_duration_args(audio);
        let output = run_media_process(&self.ffprobe, &args, self.settings.probe_timeout)
            .await
            .map_err(|failure| match failure {
                ProcessFailure::Resource(error) => MuxError::Resource(error),
                ProcessFailure::TimedOut(limit) => MuxError::Timeout(limit),
                ProcessFailure::Exited { diagnostic, .. } => MuxError::Probe {
                    path: audio.to_path_buf(),
                    diagnostic,
                },
            })?;
        parse_duration(&String::from_utf8_lossy(&output))
    }

    async fn concat_audio(&self, clips: &[PathBuf], output: &Path) -> Result<(), EncodingError> {
        let list_dir = output.parent().unwrap_or_else(|| Path::new("."));
        let mut list = tempfile::Builder::new()
            .prefix("concat-")
            .suffix(".txt")
            .tempfile_in(list_dir)
            .map_err(|source| ResourceError::TempFile {
                dir: list_dir.to_path_buf(),
                source,
            })?;
        list.write_all(concat_list(clips).as_bytes())
            .and_then(|()| list.flush())
            .map_err(|source| ResourceError::Write {
                path: list.path().to_path_buf(),
                source,
            })?;

        let args = ffmpeg_concat_args(list.path(), output);
        debug!(mode = self.mode_label, clips = clips.len(), "concatenating audio");
        run_media_process(&self.ffmpeg, &args, self.settings.encoder_timeout)
            .await
            .map_err(|failure| match failure {
                ProcessFailure::Resource(error) => EncodingError::Resource(error),
                ProcessFailure::TimedOut(limit) => EncodingError::Timeout(limit),
                ProcessFailure::Exited { status, diagnostic } => {
                    EncodingError::Rejected { status, diagnostic }
                }
            })?;
        Ok(())
    }

    async fn mux_still(
        &self,
        image: &Path,
        audio: &Path,
        duration_secs: f64,
        output: &Path,
    ) -> Result<(), MuxError> {
        let args = ffmpeg_mux_args(&self.settings, image, audio, duration_secs, output);
        debug!(mode = self.mode_label, duration_secs, "muxing still image");
        run_media_process(&self.ffmpeg, &args, self.settings.encoder_timeout)
            .await
            .map_err(|failure| match failure {
                ProcessFailure::Resource(error) => MuxError::Resource(error),
                ProcessFailure::TimedOut(limit) => MuxError::Timeout(limit),
                ProcessFailure::Exited { status, diagnostic } => {
                    MuxError::Encode { status, diagnostic }
                }
            })?;
        Ok(())
    }
}

/// Joins a segment's clips into one track. A single clip is the track
/// itself. The input clips are consumed and deleted whatever the outcome.
pub async fn concatenate_clips(
    encoder: &dyn MediaEncoder,
    scratch: &ScratchDir,
    mut clips: Vec<TempMedia>,
) -> Result<TempMedia, EncodingError> {
    let first_kind = match clips.first() {
        Some(clip) => clip.kind(),
        None => return Err(EncodingError::NoClips),
    };
    if let Some(other) = clips
        .iter()
        .map(TempMedia::kind)
        .find(|kind| *kind != first_kind || matches!(kind, MediaKind::Image(_)))
    {
        return Err(EncodingError::IncompatibleClips {
            first: first_kind,
            other,
        });
    }

    if clips.len() == 1 {
        return clips.pop().ok_or(EncodingError::NoClips);
    }

    let track = scratch.reserve("track-", first_kind)?;
    let paths = clips.iter().map(TempMedia::to_path_buf).collect::<Vec<_>>();
    let result = encoder.concat_audio(&paths, track.path()).await;
    drop(clips);
    result.map(|()| track)
}

/// Probes the track, then encodes the still + audio into `output` with an
/// explicit duration. A partially written output is removed on failure.
pub async fn mux_segment(
    encoder: &dyn MediaEncoder,
    image: &Path,
    audio: &Path,
    output: &Path,
) -> Result<f64, MuxError> {
    check_output_path(output)?;
    let duration = encoder.probe_duration(audio).await?;
    if let Err(error) = encoder.mux_still(image, audio, duration, output).await {
        if output.exists() {
            let _ = tokio::fs::remove_file(output).await;
        }
        return Err(error);
    }
    Ok(duration)
}

fn check_output_path(output: &Path) -> Result<(), ResourceError> {
    let path_str = output.to_string_lossy();
    let problem = if path_str.len() > 1024 {
        Some("output path is suspiciously long")
    } else if path_str.chars().any(char::is_control) {
        Some("output path contains control characters")
    } else {
        None
    };
    match problem {
        Some(message) => Err(ResourceError::Write {
            path: output.to_path_buf(),
            source: io::Error::new(ErrorKind::InvalidInput, message),
        }),
        None => Ok(()),
    }
}

pub fn parse_duration(raw: &str) -> Result<f64, MuxError> {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(seconds) if seconds.is_finite() && seconds > 0.0 => Ok(seconds),
        _ => Err(MuxError::InvalidDuration(trimmed.to_owned())),
    }
}

/// Formats a duration for `-t`, rounded up to the millisecond so the
/// video never ends before its audio.
pub fn format_duration(seconds: f64) -> String {
    format!("{:.3}", (seconds * 1000.0).ceil() / 1000.0)
}

/// Concat demuxer list; single quotes in paths are escaped.
pub fn concat_list(clips: &[PathBuf]) -> String {
    clips
        .iter()
        .map(|clip| {
            let escaped = clip.to_string_lossy().replace('\'', "'\\''");
            format!("file '{escaped}'\n")
        })
        .collect()
}

pub fn ffprobe_duration_args(audio: &Path) -> Vec<String> {
    vec![
        "-v".to_owned(),
        "error".to_owned(),
        "-show_entries".to_owned(),
        "format=duration".to_owned(),
        "-of".to_owned(),
        "default=noprint_wrappers=1:nokey=1".to_owned(),
        audio.to_string_lossy().into_owned(),
    ]
}

pub fn ffmpeg_concat_args(list: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-f".to_owned(),
        "concat".to_owned(),
        "-safe".to_owned(),
        "0".to_owned(),
        "-i".to_owned(),
        list.to_string_lossy().into_owned(),
        "-c".to_owned(),
        "copy".to_owned(),
        output.to_string_lossy().into_owned(),
    ]
}

pub fn ffmpeg_mux_args(
    settings: &EncodeSettings,
    image: &Path,
    audio: &Path,
    duration_secs: f64,
    output: &Path,
) -> Vec<String> {
    let fps = settings.fps.to_string();
    let mut args = vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-loop".to_owned(),
        "1".to_owned(),
        "-framerate".to_owned(),
        fps.clone(),
        "-i".to_owned(),
        image.to_string_lossy().into_owned(),
        "-i".to_owned(),
        audio.to_string_lossy().into_owned(),
        "-map".to_owned(),
        "0:v:0".to_owned(),
        "-map".to_owned(),
        "1:a:0".to_owned(),
        "-c:v".to_owned(),
        settings.video_codec.clone(),
    ];
    if settings.video_codec == "libx264" {
        args.push("-tune".to_owned());
        args.push("stillimage".to_owned());
    }
    args.extend([
        // Arbitrary input sizes; 4:2:0 needs even dimensions.
        "-vf".to_owned(),
        "scale=trunc(iw/2)*2:trunc(ih/2)*2".to_owned(),
        "-pix_fmt".to_owned(),
        settings.pixel_format.clone(),
        "-r".to_owned(),
        fps,
        "-c:a".to_owned(),
        "aac".to_owned(),
        "-b:a".to_owned(),
        settings.audio_bitrate.clone(),
        "-t".to_owned(),
        format_duration(duration_secs),
        "-movflags".to_owned(),
        "+faststart".to_owned(),
        output.to_string_lossy().into_owned(),
    ]);
    args
}

enum ProcessFailure {
    Resource(ResourceError),
    TimedOut(Duration),
    Exited { status: String, diagnostic: String },
}

/// Starts the child in its own process group so a terminal Ctrl-C reaches
/// only lessonreel, which then stops between blocks instead of mid-encode.
pub(crate) fn isolate_process_group(command: &mut Command) {
    #[cfg(unix)]
    command.process_group(0);
    #[cfg(not(unix))]
    let _ = command;
}

/// Runs one encoder invocation to completion or until `limit` elapses, in
/// which case the process is killed. Returns stdout.
async fn run_media_process(
    program: &Path,
    args: &[String],
    limit: Duration,
) -> Result<Vec<u8>, ProcessFailure> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    isolate_process_group(&mut command);
    let child = command.spawn().map_err(|error| {
        let program = program.display().to_string();
        ProcessFailure::Resource(if error.kind() == ErrorKind::NotFound {
            ResourceError::MissingExecutable { program }
        } else {
            ResourceError::Spawn {
                program,
                source: error,
            }
        })
    })?;

    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| {
            ProcessFailure::Resource(ResourceError::Spawn {
                program: program.display().to_string(),
                source,
            })
        })?,
        Err(_) => return Err(ProcessFailure::TimedOut(limit)),
    };

    if !output.status.success() {
        return Err(ProcessFailure::Exited {
            status: output.status.to_string(),
            diagnostic: diagnostic_tail(
                &String::from_utf8_lossy(&output.stderr),
                DIAGNOSTIC_TAIL_CHARS,
            ),
        });
    }
    Ok(output.stdout)
}
