use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::{Builder, TempDir, TempPath};

use crate::error::ResourceError;
use crate::schema::MediaKind;

/// Per-run scratch directory; removed with everything in it on drop.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

/// A media file owned by exactly one holder and deleted when dropped,
/// including on early error returns.
#[derive(Debug)]
pub struct TempMedia {
    path: TempPath,
    kind: MediaKind,
}

impl ScratchDir {
    pub fn create(parent: Option<&Path>) -> Result<Self, ResourceError> {
        // Concat lists name clips by path, so the scratch dir must be absolute.
        let parent = match parent {
            Some(dir) => std::path::absolute(dir).map_err(|source| ResourceError::TempFile {
                dir: dir.to_path_buf(),
                source,
            })?,
            None => std::env::temp_dir(),
        };
        let dir = Builder::new()
            .prefix("lessonreel-")
            .tempdir_in(&parent)
            .map_err(|source| ResourceError::TempFile {
                dir: parent.clone(),
                source,
            })?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `bytes` to a fresh file named after `label` with the
    /// extension of `kind`.
    pub fn write_media(
        &self,
        label: &str,
        kind: MediaKind,
        bytes: &[u8],
    ) -> Result<TempMedia, ResourceError> {
        let suffix = format!(".{}", kind.extension());
        let mut file = Builder::new()
            .prefix(label)
            .suffix(&suffix)
            .tempfile_in(self.path())
            .map_err(|source| ResourceError::TempFile {
                dir: self.path().to_path_buf(),
                source,
            })?;
        file.write_all(bytes)
            .and_then(|()| file.flush())
            .map_err(|source| ResourceError::Write {
                path: file.path().to_path_buf(),
                source,
            })?;
        Ok(TempMedia {
            path: file.into_temp_path(),
            kind,
        })
    }

    /// Reserves an empty file an external encoder will overwrite.
    pub fn reserve(&self, label: &str, kind: MediaKind) -> Result<TempMedia, ResourceError> {
        self.write_media(label, kind, &[])
    }
}

impl TempMedia {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn to_path_buf(&self) -> PathBuf {
        self.path.to_path_buf()
    }
}
