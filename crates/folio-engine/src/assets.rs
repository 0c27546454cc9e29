//! On-disk layout of a project's image artifacts.
//!
//! ```text
//! <root>/<category dir>/<stem>.<ext>              full resolution, bytes as received
//! <root>/.thumbnails/<category dir>/<stem>.png    long edge <= 256 px
//! <root>/.receipts/<category dir>/<stem>.json     generation receipt, if any
//! ```

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use folio_contracts::catalog::{BackingStore, Category};
use folio_contracts::receipts::{read_receipt, remove_receipt, write_receipt};
use folio_contracts::write_atomic;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const THUMBNAILS_DIR: &str = ".thumbnails";
pub const THUMBNAIL_MAX_EDGE: u32 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedAsset {
    pub relative_path: String,
    pub full_res_path: PathBuf,
    pub thumbnail_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AssetWriter {
    root: PathBuf,
}

impl AssetWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn full_res_path(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path)
    }

    pub fn thumbnail_path(&self, relative_path: &str) -> PathBuf {
        let mut path = self.root.join(THUMBNAILS_DIR).join(relative_path);
        path.set_extension("png");
        path
    }

    /// Writes `bytes` unchanged under the category directory and derives its
    /// thumbnail. If the thumbnail cannot be produced the full-resolution file
    /// is removed again.
    pub fn persist(
        &self,
        bytes: &[u8],
        category: Category,
        filename_hint: &str,
    ) -> Result<PersistedAsset> {
        let thumbnail = render_thumbnail(bytes)?;
        let (stem, ext) = split_hint(filename_hint, bytes);

        let dir = self.root.join(category.dir_name());
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let mut staged = NamedTempFile::new_in(&dir)
            .with_context(|| format!("failed to stage file in {}", dir.display()))?;
        staged
            .write_all(bytes)
            .and_then(|()| staged.as_file().sync_all())
            .context("failed to write image bytes")?;

        let mut suffix = 1u32;
        let relative_path = loop {
            let file_name = if suffix == 1 {
                format!("{stem}.{ext}")
            } else {
                format!("{stem}_{suffix}.{ext}")
            };
            let relative_path = format!("{}/{}", category.dir_name(), file_name);
            if self.thumbnail_path(&relative_path).exists() {
                suffix += 1;
                continue;
            }
            match staged.persist_noclobber(self.full_res_path(&relative_path)) {
                Ok(_) => break relative_path,
                Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
                    staged = err.file;
                    suffix += 1;
                }
                Err(err) => {
                    return Err(err.error).with_context(|| {
                        format!("failed to write {}", self.full_res_path(&relative_path).display())
                    })
                }
            }
        };

        let full_res_path = self.full_res_path(&relative_path);
        let thumbnail_path = self.thumbnail_path(&relative_path);
        if let Err(err) = write_atomic(&thumbnail_path, |file| file.write_all(&thumbnail)) {
            if let Err(cleanup) = fs::remove_file(&full_res_path) {
                warn!(path = %full_res_path.display(), error = %cleanup, "failed to remove image after thumbnail failure");
            }
            return Err(err).context("failed to write thumbnail");
        }

        debug!(path = %relative_path, bytes = bytes.len(), "image persisted");
        Ok(PersistedAsset {
            relative_path,
            full_res_path,
            thumbnail_path,
        })
    }

    /// Copies an image from outside the project into `category`.
    pub fn import(&self, source: &Path, category: Category) -> Result<PersistedAsset> {
        let bytes = fs::read(source).with_context(|| format!("failed reading {}", source.display()))?;
        let hint = source
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("imported");
        self.persist(&bytes, category, hint)
    }

    /// Re-derives the thumbnail if it is missing. Returns its path.
    pub fn ensure_thumbnail(&self, relative_path: &str) -> Result<PathBuf> {
        let thumbnail_path = self.thumbnail_path(relative_path);
        if thumbnail_path.is_file() {
            return Ok(thumbnail_path);
        }
        let full_res_path = self.full_res_path(relative_path);
        let bytes = fs::read(&full_res_path)
            .with_context(|| format!("failed reading {}", full_res_path.display()))?;
        let thumbnail = render_thumbnail(&bytes)?;
        write_atomic(&thumbnail_path, |file| file.write_all(&thumbnail))
            .context("failed to write thumbnail")?;
        debug!(path = %relative_path, "thumbnail regenerated");
        Ok(thumbnail_path)
    }

    /// Deletes the full-resolution file, its thumbnail and its receipt.
    /// Files that are already gone are skipped.
    pub fn remove(&self, relative_path: &str) -> Result<()> {
        for path in [self.full_res_path(relative_path), self.thumbnail_path(relative_path)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to remove {}", path.display()))
                }
            }
        }
        remove_receipt(&self.root, relative_path)?;
        Ok(())
    }

    fn copy_into(&self, relative_path: &str, category: Category) -> Result<String> {
        let source = self.full_res_path(relative_path);
        let bytes = fs::read(&source).with_context(|| format!("failed reading {}", source.display()))?;
        let file_name = Path::new(relative_path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("image");
        let copied = self.persist(&bytes, category, file_name)?;

        match read_receipt(&self.root, relative_path) {
            Ok(Some(receipt)) => {
                if let Err(err) = write_receipt(&self.root, &copied.relative_path, &receipt) {
                    warn!(path = %copied.relative_path, error = %err, "receipt not carried over");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(path = %relative_path, error = %err, "receipt not carried over"),
        }
        Ok(copied.relative_path)
    }
}

impl BackingStore for AssetWriter {
    fn copy_to_category(&self, relative_path: &str, category: Category) -> std::io::Result<String> {
        self.copy_into(relative_path, category)
            .map_err(|err| std::io::Error::other(format!("{err:#}")))
    }

    fn remove(&self, relative_path: &str) -> std::io::Result<()> {
        AssetWriter::remove(self, relative_path)
            .map_err(|err| std::io::Error::other(format!("{err:#}")))
    }
}

/// PNG thumbnail whose long edge is at most [`THUMBNAIL_MAX_EDGE`].
pub fn render_thumbnail(bytes: &[u8]) -> Result<Vec<u8>> {
    let image = image::load_from_memory(bytes).context("image bytes could not be decoded")?;
    let (width, height) = thumbnail_dims(image.dimensions());
    let thumbnail = if (width, height) == image.dimensions() {
        image
    } else {
        image.resize_exact(width, height, FilterType::Lanczos3)
    };
    let mut encoded = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(thumbnail.to_rgba8())
        .write_to(&mut encoded, ImageFormat::Png)
        .context("failed to encode thumbnail")?;
    Ok(encoded.into_inner())
}

fn thumbnail_dims((width, height): (u32, u32)) -> (u32, u32) {
    let long = width.max(height);
    if long <= THUMBNAIL_MAX_EDGE {
        return (width, height);
    }
    let long = u64::from(long);
    let scale = |edge: u32| {
        let scaled = (u64::from(edge) * u64::from(THUMBNAIL_MAX_EDGE) + long / 2) / long;
        scaled.max(1) as u32
    };
    (scale(width), scale(height))
}

fn split_hint(filename_hint: &str, bytes: &[u8]) -> (String, String) {
    let name = Path::new(filename_hint.trim())
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(sanitize_stem)
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "image".to_string());
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .filter(|ext| matches!(ext.as_str(), "png" | "jpg" | "jpeg" | "webp" | "gif"))
        .unwrap_or_else(|| sniff_extension(bytes).to_string());
    (stem, ext)
}

fn sniff_extension(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "jpg",
        Ok(ImageFormat::WebP) => "webp",
        Ok(ImageFormat::Gif) => "gif",
        _ => "png",
    }
}

fn sanitize_stem(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}
