use image::{imageops::FilterType, DynamicImage, ImageError, ImageFormat, ImageReader};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::DEFAULT_THUMBNAIL_SIZE;
use crate::error::ThumbnailError;
use crate::state::data::MediaKind;

/// Disk cache of JPEG thumbnails for photos.
///
/// The cache file for a source is named after a hash of the source path, so
/// deriving the same photo twice overwrites one file instead of adding a
/// second.
#[derive(Debug, Clone)]
pub struct ThumbnailCache {
    dir: PathBuf,
    size: u32,
}

impl ThumbnailCache {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            size: DEFAULT_THUMBNAIL_SIZE,
        }
    }

    /// Override the thumbnail edge length
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the thumbnail for `source` lives (doesn't generate, just
    /// returns the expected path)
    pub fn path_for(&self, source: &Path) -> PathBuf {
        let digest = Sha256::digest(source.to_string_lossy().as_bytes());
        self.dir.join(format!("{}.jpg", hex::encode(digest)))
    }

    /// Decode `source`, shrink it to fit the thumbnail size and write it to
    /// the cache
    pub fn derive(&self, source: &Path) -> Result<PathBuf, ThumbnailError> {
        if MediaKind::from_path(source) != Some(MediaKind::Image) {
            return Err(ThumbnailError::NotAnImage(source.to_path_buf()));
        }

        let img = decode(source)?;
        let thumbnail = img.resize(self.size, self.size, FilterType::Lanczos3);
        // JPEG has no alpha channel
        let thumbnail = DynamicImage::ImageRgb8(thumbnail.to_rgb8());

        fs::create_dir_all(&self.dir).map_err(|source| ThumbnailError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let target = self.path_for(source);
        thumbnail
            .save_with_format(&target, ImageFormat::Jpeg)
            .map_err(|e| match e {
                ImageError::IoError(io) => ThumbnailError::Io {
                    path: target.clone(),
                    source: io,
                },
                other => ThumbnailError::Io {
                    path: target.clone(),
                    source: std::io::Error::other(other.to_string()),
                },
            })?;

        debug!(source = %source.display(), thumbnail = %target.display(), "generated thumbnail");
        Ok(target)
    }

    /// `derive` on the blocking pool
    pub async fn derive_async(&self, source: PathBuf) -> Result<PathBuf, ThumbnailError> {
        let cache = self.clone();
        let fallback = source.clone();
        tokio::task::spawn_blocking(move || cache.derive(&source))
            .await
            .unwrap_or_else(|e| {
                Err(ThumbnailError::Io {
                    path: fallback,
                    source: std::io::Error::other(format!("thumbnail task failed: {}", e)),
                })
            })
    }
}

fn decode(source: &Path) -> Result<DynamicImage, ThumbnailError> {
    let io_err = |e: std::io::Error| ThumbnailError::Io {
        path: source.to_path_buf(),
        source: e,
    };
    let unsupported = |reason: String| ThumbnailError::UnsupportedFormat {
        path: source.to_path_buf(),
        reason,
    };

    let reader = ImageReader::open(source)
        .map_err(io_err)?
        .with_guessed_format()
        .map_err(io_err)?;

    reader.decode().map_err(|e| match e {
        ImageError::IoError(io) => io_err(io),
        other => unsupported(other.to_string()),
    })
}
