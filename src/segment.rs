//! Segment addressing: identities, per-identity numbering, and the on-disk
//! file name layout shared with the playback side.
//!
//! Layout inside a namespace directory:
//!
//! ```text
//! segment_main_001.mp4          main track, 1-indexed
//! segment_<branch_type>_001.mp4 one counter per branch type
//! ```
//!
//! Spaces in a branch type become `_`. Numbers are zero-padded to three
//! digits.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::schema::validate_branch_type;

pub const SEGMENT_EXTENSION: &str = "mp4";
const MAIN_MARKER: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BranchIdentity {
    Main,
    Branch(String),
}

impl BranchIdentity {
    pub fn branch(branch_type: impl Into<String>) -> Self {
        Self::Branch(branch_type.into())
    }

    /// `main` for the main track, otherwise the branch type as written.
    pub fn label(&self) -> &str {
        match self {
            Self::Main => MAIN_MARKER,
            Self::Branch(branch_type) => branch_type,
        }
    }

    pub fn is_main(&self) -> bool {
        matches!(self, Self::Main)
    }

    /// Name used inside segment file names. Distinct identities may share
    /// one, so counters are keyed on it.
    pub fn file_component(&self) -> String {
        match self {
            Self::Main => MAIN_MARKER.to_owned(),
            Self::Branch(branch_type) => branch_type.replace(' ', "_"),
        }
    }
}

impl fmt::Display for BranchIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => f.write_str("main track"),
            Self::Branch(branch_type) => write!(f, "branch '{branch_type}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub path: PathBuf,
    pub branch_identity: BranchIdentity,
    pub sequence_number: u32,
}

/// Hands out 1-indexed sequence numbers, one independent counter per
/// segment file name component. Reusing a branch type at a later decision
/// point continues its counter.
#[derive(Debug, Default)]
pub struct BranchIndexer {
    next: HashMap<String, u32>,
}

impl BranchIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_and_increment(&mut self, identity: &BranchIdentity) -> u32 {
        let slot = self.next.entry(identity.file_component()).or_insert(1);
        let current = *slot;
        *slot += 1;
        current
    }

    /// Value the next call for `identity` would return.
    pub fn peek(&self, identity: &BranchIdentity) -> u32 {
        self.next
            .get(identity.file_component().as_str())
            .copied()
            .unwrap_or(1)
    }
}

pub fn segment_file_name(identity: &BranchIdentity, sequence_number: u32) -> String {
    format!(
        "segment_{}_{:03}.{}",
        identity.file_component(),
        sequence_number,
        SEGMENT_EXTENSION
    )
}

pub fn segment_path(
    namespace_dir: &Path,
    identity: &BranchIdentity,
    sequence_number: u32,
) -> PathBuf {
    namespace_dir.join(segment_file_name(identity, sequence_number))
}

/// Maps a playback request `(segment_number, segment_type)` to an existing
/// segment file. `None` or `"main"` addresses the main track.
pub fn resolve_segment(
    namespace_dir: &Path,
    segment_number: u32,
    segment_type: Option<&str>,
) -> Result<PathBuf> {
    if segment_number == 0 {
        bail!("segment numbers start at 1");
    }

    let identity = match segment_type {
        None | Some("") | Some(MAIN_MARKER) => BranchIdentity::Main,
        Some(branch_type) => {
            validate_branch_type(branch_type)?;
            BranchIdentity::branch(branch_type)
        }
    };

    let path = segment_path(namespace_dir, &identity, segment_number);
    if !path.is_file() {
        bail!(
            "segment {} of {} not found at {}",
            segment_number,
            identity,
            path.display()
        );
    }
    Ok(path)
}

fn segment_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^segment_(.+)_(\d{3,})\.mp4$").expect("segment name pattern is valid")
    })
}

/// Parses a file name produced by [`segment_file_name`]. Branch types come
/// back in their file-name form (spaces already replaced).
pub fn parse_segment_file_name(file_name: &str) -> Option<(BranchIdentity, u32)> {
    let captures = segment_name_pattern().captures(file_name)?;
    let component = captures.get(1)?.as_str();
    let number = captures.get(2)?.as_str().parse::<u32>().ok()?;
    if number == 0 {
        return None;
    }
    let identity = if component == MAIN_MARKER {
        BranchIdentity::Main
    } else {
        BranchIdentity::branch(component)
    };
    Some((identity, number))
}

/// Lists the segments present in a namespace directory, main track first,
/// then branches by name, each by number.
pub fn list_segments(namespace_dir: &Path) -> Result<Vec<SegmentDescriptor>> {
    let entries = fs::read_dir(namespace_dir)
        .with_context(|| format!("failed to read namespace {}", namespace_dir.display()))?;

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read entry in {}", namespace_dir.display()))?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some((branch_identity, sequence_number)) = parse_segment_file_name(file_name) {
            segments.push(SegmentDescriptor {
                path: entry.path(),
                branch_identity,
                sequence_number,
            });
        }
    }

    segments.sort_by(|left, right| {
        left.branch_identity
            .cmp(&right.branch_identity)
            .then(left.sequence_number.cmp(&right.sequence_number))
    });
    Ok(segments)
}
