use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, ImageFormat, RgbImage};
use url::Url;

use crate::config::Resolution;
use crate::error::ImageSourceError;
use crate::schema::{ImageData, ImageKind};

/// Encoded still frame with its declared format. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StillImage {
    bytes: Arc<[u8]>,
    kind: ImageKind,
}

impl StillImage {
    pub fn new(bytes: impl Into<Arc<[u8]>>, kind: ImageKind) -> Self {
        Self {
            bytes: bytes.into(),
            kind,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }
}

/// Turns a scenario image reference into encoded bytes.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn resolve(&self, image: &ImageData) -> Result<StillImage, ImageSourceError>;
}

/// Resolves inline base64 data and `file://` URLs. Remote URLs and
/// generation prompts belong to an external image service.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineImageSource;

#[async_trait]
impl ImageSource for InlineImageSource {
    async fn resolve(&self, image: &ImageData) -> Result<StillImage, ImageSourceError> {
        if let Some(data) = &image.base64 {
            let (declared, bytes) = decode_inline_image(data)?;
            let kind = image
                .format
                .or(declared)
                .ok_or(ImageSourceError::UndeclaredFormat)?;
            return Ok(StillImage::new(bytes, kind));
        }

        if let Some(raw_url) = &image.url {
            let url = Url::parse(raw_url).map_err(|error| ImageSourceError::InvalidUrl {
                url: raw_url.clone(),
                message: error.to_string(),
            })?;
            if url.scheme() != "file" {
                return Err(ImageSourceError::External("remote"));
            }
            let path = url
                .to_file_path()
                .map_err(|()| ImageSourceError::InvalidUrl {
                    url: raw_url.clone(),
                    message: "not a local file path".to_owned(),
                })?;
            let kind = match image.format {
                Some(kind) => kind,
                None => kind_from_extension(&path)?,
            };
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|source| ImageSourceError::Read { path, source })?;
            return Ok(StillImage::new(bytes, kind));
        }

        if image.prompt.is_some() {
            return Err(ImageSourceError::External("prompt-generated"));
        }

        Err(ImageSourceError::Empty)
    }
}

fn kind_from_extension(path: &Path) -> Result<ImageKind, ImageSourceError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or(ImageSourceError::UndeclaredFormat)?;
    ImageKind::from_mime(extension)
        .ok_or_else(|| ImageSourceError::UnsupportedFormat(extension.to_owned()))
}

/// Decodes base64 image data, tolerating a `data:` URI prefix, embedded
/// whitespace and missing padding. Returns the kind declared by the prefix.
pub fn decode_inline_image(
    data: &str,
) -> Result<(Option<ImageKind>, Vec<u8>), ImageSourceError> {
    let (declared, payload) = match data.trim().strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest.split_once(',').unwrap_or(("", rest));
            let mime = header.split(';').next().unwrap_or_default();
            let kind = if mime.is_empty() {
                None
            } else {
                Some(
                    ImageKind::from_mime(mime)
                        .ok_or_else(|| ImageSourceError::UnsupportedFormat(mime.to_owned()))?,
                )
            };
            (kind, payload)
        }
        None => (None, data),
    };

    let mut cleaned = payload
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>();
    let remainder = cleaned.len() % 4;
    if remainder != 0 {
        cleaned.extend(std::iter::repeat('=').take(4 - remainder));
    }

    Ok((declared, STANDARD.decode(cleaned)?))
}

/// Solid black PNG used when a segment has no image.
pub fn placeholder_image(resolution: Resolution) -> Result<StillImage, ImageSourceError> {
    let frame = RgbImage::new(resolution.width, resolution.height);
    let mut encoded = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(frame).write_to(&mut encoded, ImageFormat::Png)?;
    Ok(StillImage::new(encoded.into_inner(), ImageKind::Png))
}
