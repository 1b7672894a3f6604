use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::segment::BranchIdentity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub title: String,
    pub script: Vec<ScriptBlock>,
    /// Role name -> natural-language voice description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characters: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialogue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint: Option<BreakpointQuestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_options: Option<Vec<BranchOption>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BranchOption {
    #[serde(rename = "type")]
    pub branch_type: String,
    pub dialogue: Vec<DialogueLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DialogueLine {
    pub role: String,
    pub dialogue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakpointQuestion {
    pub question: String,
    pub options: Vec<BreakpointOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakpointOption {
    pub text: String,
    #[serde(alias = "isCorrect")]
    pub is_correct: bool,
    #[serde(
        default,
        alias = "branchTarget",
        skip_serializing_if = "Option::is_none"
    )]
    pub branch_target: Option<String>,
}

/// Encoded audio container produced by a synthesis service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioKind {
    Mp3,
    Wav,
    Aac,
}

impl AudioKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Aac => "aac",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp3" | "mpeg" | "audio/mpeg" => Some(Self::Mp3),
            "wav" | "wave" | "audio/wav" | "audio/x-wav" => Some(Self::Wav),
            "aac" | "audio/aac" => Some(Self::Aac),
            _ => None,
        }
    }
}

impl fmt::Display for AudioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Encoded still-image format, declared by the image source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Png,
    #[serde(alias = "jpg")]
    Jpeg,
    Webp,
}

impl ImageKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
        }
    }

    /// Maps a MIME type such as `image/jpeg` (or a bare subtype) to a kind.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let subtype = mime
            .trim()
            .to_ascii_lowercase()
            .trim_start_matches("image/")
            .to_owned();
        match subtype.as_str() {
            "png" => Some(Self::Png),
            "jpeg" | "jpg" | "pjpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }
}

/// Either kind of encoded media handled by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "media", content = "kind", rename_all = "snake_case")]
pub enum MediaKind {
    Audio(AudioKind),
    Image(ImageKind),
}

impl MediaKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Audio(kind) => kind.extension(),
            Self::Image(kind) => kind.extension(),
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio(kind) => write!(f, "audio/{kind}"),
            Self::Image(kind) => write!(f, "image/{}", kind.extension()),
        }
    }
}

impl ScriptBlock {
    /// Returns the block's dialogue when it contains speakable text.
    pub fn spoken_text(&self) -> Option<&str> {
        self.dialogue
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    pub fn branches(&self) -> &[BranchOption] {
        self.branch_options.as_deref().unwrap_or_default()
    }
}

impl DialogueLine {
    pub fn spoken_text(&self) -> Option<&str> {
        Some(self.dialogue.trim()).filter(|text| !text.is_empty())
    }
}

impl ImageData {
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.prompt.is_none() && self.base64.is_none()
    }
}

impl Scenario {
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            bail!("scenario title cannot be empty");
        }

        if self.script.is_empty() {
            bail!("scenario script must contain at least one block");
        }

        let mut file_components: HashMap<String, &str> = HashMap::new();
        for (index, block) in self.script.iter().enumerate() {
            block
                .validate()
                .with_context(|| format!("invalid script block {index}"))?;

            for branch in block.branches() {
                let identity = BranchIdentity::branch(branch.branch_type.as_str());
                let component = identity.file_component();
                match file_components.get(component.as_str()) {
                    Some(existing) if *existing != branch.branch_type => bail!(
                        "branch types '{}' and '{}' would share segment files named '{}'",
                        existing,
                        branch.branch_type,
                        component
                    ),
                    Some(_) => {}
                    None => {
                        file_components.insert(component, &branch.branch_type);
                    }
                }
            }
        }

        Ok(())
    }

    pub fn voice_for(&self, role: Option<&str>) -> Option<&str> {
        let role = role?;
        self.characters
            .as_ref()
            .and_then(|characters| characters.get(role))
            .map(String::as_str)
    }

    pub fn branch_count(&self) -> usize {
        self.script.iter().map(|block| block.branches().len()).sum()
    }
}

impl ScriptBlock {
    fn validate(&self) -> Result<()> {
        if let Some(breakpoint) = &self.breakpoint {
            if breakpoint.question.trim().is_empty() {
                bail!("breakpoint question cannot be empty");
            }
            if breakpoint.options.is_empty() {
                bail!("breakpoint must define at least one option");
            }
        }

        for branch in self.branches() {
            validate_branch_type(&branch.branch_type)?;
        }

        Ok(())
    }
}

/// Branch types become part of segment file names, so they must stay a
/// single path component.
pub fn validate_branch_type(branch_type: &str) -> Result<()> {
    if branch_type.trim().is_empty() {
        bail!("branch type cannot be empty");
    }
    if branch_type == "main" {
        bail!("branch type 'main' is reserved for the main track");
    }
    if branch_type.contains(['/', '\\']) || branch_type.contains("..") {
        bail!(
            "branch type '{}' must not contain path separators or '..'",
            branch_type
        );
    }
    if branch_type.trim() != branch_type {
        bail!(
            "branch type '{}' must not start or end with whitespace",
            branch_type
        );
    }
    if branch_type.chars().any(char::is_control) {
        bail!("branch type '{}' contains control characters", branch_type);
    }
    Ok(())
}
