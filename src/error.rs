use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::segment::BranchIdentity;

/// Longest encoder diagnostic kept in an error, in characters.
pub const DIAGNOSTIC_TAIL_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("speech service failed for voice '{voice}': {message}")]
    Service { voice: String, message: String },
    #[error("speech service returned no audio")]
    EmptyAudio,
    #[error("speech service timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("failed to launch speech program '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("cannot concatenate an empty clip list")]
    NoClips,
    #[error("clips have incompatible media kinds ({first} vs {other})")]
    IncompatibleClips {
        first: crate::schema::MediaKind,
        other: crate::schema::MediaKind,
    },
    #[error("encoder rejected concat list (status {status}): {diagnostic}")]
    Rejected { status: String, diagnostic: String },
    #[error("audio concatenation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("failed to probe audio duration of {}: {diagnostic}", path.display())]
    Probe { path: PathBuf, diagnostic: String },
    #[error("audio duration probe returned unusable value '{0}'")]
    InvalidDuration(String),
    #[error("video encoder failed (status {status}): {diagnostic}")]
    Encode { status: String, diagnostic: String },
    #[error("video encoder timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to create temporary file in {}: {source}", dir.display())]
    TempFile {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("media executable '{program}' not found; install ffmpeg or build with `--features sidecar_ffmpeg`")]
    MissingExecutable { program: String },
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ImageSourceError {
    #[error("image has no url, prompt or inline data")]
    Empty,
    #[error("image format is not declared; add `format` or a data:image/<kind> prefix")]
    UndeclaredFormat,
    #[error("unsupported image format '{0}'")]
    UnsupportedFormat(String),
    #[error("invalid inline image data: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("invalid image url '{url}': {message}")]
    InvalidUrl { url: String, message: String },
    #[error("{0} images are resolved by an external image service")]
    External(&'static str),
    #[error("failed to read image {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to render placeholder image: {0}")]
    Render(#[from] image::ImageError),
}

/// Failure of a single segment. The run continues past these.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Failure of a whole compile run.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to create output directory {}: {source}", path.display())]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),
    #[error("synthesis failed for {identity} line {line}: {source}")]
    Synthesis {
        identity: BranchIdentity,
        line: usize,
        #[source]
        source: SynthesisError,
    },
    #[error("failed to prepare placeholder frame: {0}")]
    Placeholder(#[source] ImageSourceError),
    #[error("compile cancelled after {produced} segment(s)")]
    Cancelled { produced: usize },
    #[error("compile produced no segments ({failures} segment failure(s))")]
    NoSegments { failures: usize },
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl SynthesisError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Service { .. } => "E_SYNTHESIS_SERVICE",
            Self::EmptyAudio => "E_SYNTHESIS_EMPTY",
            Self::Timeout(_) => "E_SYNTHESIS_TIMEOUT",
            Self::Spawn { .. } => "E_SYNTHESIS_SPAWN",
        }
    }
}

impl ResourceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TempFile { .. } => "E_RESOURCE_TEMP",
            Self::Write { .. } => "E_RESOURCE_WRITE",
            Self::MissingExecutable { .. } => "E_RESOURCE_MISSING_EXECUTABLE",
            Self::Spawn { .. } => "E_RESOURCE_SPAWN",
        }
    }
}

impl SegmentError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Encoding(EncodingError::Resource(error))
            | Self::Mux(MuxError::Resource(error))
            | Self::Resource(error) => error.code(),
            Self::Encoding(EncodingError::Timeout(_)) => "E_ENCODING_TIMEOUT",
            Self::Encoding(_) => "E_ENCODING",
            Self::Mux(MuxError::Timeout(_)) => "E_MUX_TIMEOUT",
            Self::Mux(MuxError::Probe { .. } | MuxError::InvalidDuration(_)) => "E_MUX_PROBE",
            Self::Mux(_) => "E_MUX",
        }
    }
}

impl CompileError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutputDirectory { .. } => "E_OUTPUT_DIRECTORY",
            Self::InvalidScenario(_) => "E_INVALID_SCENARIO",
            Self::Synthesis { source, .. } => source.code(),
            Self::Placeholder(_) => "E_PLACEHOLDER",
            Self::Cancelled { .. } => "E_CANCELLED",
            Self::NoSegments { .. } => "E_NO_SEGMENTS",
            Self::Resource(error) => error.code(),
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let details = match self {
            Self::OutputDirectory { path, .. } => {
                Some(serde_json::json!({ "path": path.display().to_string() }))
            }
            Self::Synthesis { identity, line, .. } => Some(serde_json::json!({
                "branch": identity.label(),
                "line": line,
            })),
            Self::Cancelled { produced } => Some(serde_json::json!({ "produced": produced })),
            Self::NoSegments { failures } => Some(serde_json::json!({ "failures": failures })),
            Self::InvalidScenario(_) | Self::Placeholder(_) | Self::Resource(_) => None,
        };
        ErrorEnvelope::new(self.code(), self.to_string(), details)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorEnvelope {
    pub fn new(code: &str, message: impl Into<String>, details: Option<Value>) -> Self {
        Self {
            ok: false,
            error: ErrorEnvelopeBody {
                code: code.to_owned(),
                message: message.into(),
                details,
            },
        }
    }
}

/// Keeps the last `max_chars` characters of encoder output, trimmed.
pub fn diagnostic_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    let tail = if total > max_chars {
        text.chars().skip(total - max_chars).collect::<String>()
    } else {
        text.to_owned()
    };
    tail.trim().to_owned()
}
