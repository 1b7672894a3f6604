use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_VOICE: &str = "A calm, clear narrator voice.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisFailurePolicy {
    /// Stop the whole run on the first failed line.
    #[default]
    Abort,
    /// Drop the line's audio and keep going.
    SkipLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FfmpegMode {
    #[default]
    Auto,
    System,
    Sidecar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    pub placeholder: Resolution,
    pub fps: u32,
    pub audio_bitrate: String,
    pub video_codec: String,
    pub pixel_format: String,
    pub encoder_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub synthesis_timeout_secs: u64,
    pub on_synthesis_error: SynthesisFailurePolicy,
    pub default_voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
    pub ffmpeg: FfmpegMode,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            placeholder: Resolution::default(),
            fps: 30,
            audio_bitrate: "192k".to_owned(),
            video_codec: "libx264".to_owned(),
            pixel_format: "yuv420p".to_owned(),
            encoder_timeout_secs: 300,
            probe_timeout_secs: 30,
            synthesis_timeout_secs: 120,
            on_synthesis_error: SynthesisFailurePolicy::Abort,
            default_voice: DEFAULT_VOICE.to_owned(),
            scratch_dir: None,
            ffmpeg: FfmpegMode::Auto,
        }
    }
}

impl CompilerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&contents).map_err(|error| {
            let location = error
                .location()
                .map(|location| format!("line {}, column {}", location.line(), location.column()))
                .unwrap_or_else(|| "unknown location".to_owned());
            anyhow!(
                "failed to parse config {} at {}: {}",
                path.display(),
                location,
                error
            )
        })?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.placeholder.width == 0 || self.placeholder.height == 0 {
            bail!(
                "placeholder resolution must be positive, got {}x{}",
                self.placeholder.width,
                self.placeholder.height
            );
        }
        if self.fps == 0 {
            bail!("fps must be > 0");
        }
        if self.encoder_timeout_secs == 0
            || self.probe_timeout_secs == 0
            || self.synthesis_timeout_secs == 0
        {
            bail!("timeouts must be > 0 seconds");
        }
        for (name, value) in [
            ("audio_bitrate", &self.audio_bitrate),
            ("video_codec", &self.video_codec),
            ("pixel_format", &self.pixel_format),
            ("default_voice", &self.default_voice),
        ] {
            if value.trim().is_empty() {
                bail!("{name} cannot be empty");
            }
        }
        Ok(())
    }

    pub fn encoder_timeout(&self) -> Duration {
        Duration::from_secs(self.encoder_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }
}
