//! Frame sequence access
//!
//! The registration engine reads frames, writes registered frames back in
//! place and asks for a backup before touching anything, all through
//! [`FrameSequence`]. [`DirectorySequence`] implements it over a directory of
//! image files ordered by name.

use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageBuffer, Luma, Rgb, Rgba};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RegistrationError, Result};
use crate::raster::{PixelData, Raster};

/// Which channels of a frame to load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChannelSet {
    #[default]
    All,
    Subset(Vec<usize>),
}

/// Host container of a finite, index-addressable image sequence
pub trait FrameSequence {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn image(&self, frame: usize, channels: &ChannelSet) -> Result<Raster>;

    /// Where frame `frame` is stored; registered output overwrites it
    fn file_name_for_frame(&self, frame: usize) -> Result<PathBuf>;

    fn save_image(&mut self, raster: &Raster, path: &Path, overwrite: bool) -> Result<()>;

    /// Snapshot the original frames; must be idempotent
    fn backup_originals(&mut self) -> Result<()>;
}

/// Sequence settings, loaded from the `[sequence]` config section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Directory holding the frames
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Accepted file extensions (lowercase, without the dot)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Name of the backup subdirectory
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_extensions() -> Vec<String> {
    ["tif", "tiff", "png", "jpg", "jpeg"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_backup_dir() -> String {
    "original".to_string()
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            extensions: default_extensions(),
            backup_dir: default_backup_dir(),
        }
    }
}

/// A directory of image files, one frame per file, ordered by file name
#[derive(Debug)]
pub struct DirectorySequence {
    directory: PathBuf,
    backup_dir: PathBuf,
    files: Vec<PathBuf>,
}

impl DirectorySequence {
    pub fn open(config: &SequenceConfig) -> Result<Self> {
        if config.backup_dir.is_empty() || Path::new(&config.backup_dir).components().count() != 1 {
            return Err(RegistrationError::Config(format!(
                "backup_dir must be a single directory name, got {:?}",
                config.backup_dir
            )));
        }

        let directory = config.directory.clone();
        let entries = fs::read_dir(&directory).map_err(|e| RegistrationError::io(&directory, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| RegistrationError::io(&directory, e))?.path();
            if !path.is_file() {
                continue;
            }
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| config.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
                .unwrap_or(false);
            if matches {
                files.push(path);
            }
        }
        files.sort();

        info!("Opened {} frames from {:?}", files.len(), directory);

        Ok(Self {
            backup_dir: directory.join(&config.backup_dir),
            directory,
            files,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn path(&self, frame: usize) -> Result<&PathBuf> {
        self.files.get(frame).ok_or(RegistrationError::FrameOutOfRange {
            frame,
            len: self.files.len(),
        })
    }

    fn backup_path(&self, file: &Path) -> Option<PathBuf> {
        file.file_name().map(|name| self.backup_dir.join(name))
    }

    /// Copy the backed-up originals back over the frames
    pub fn restore_originals(&self) -> Result<usize> {
        let mut restored = 0;
        for file in &self.files {
            let Some(backup) = self.backup_path(file) else {
                continue;
            };
            if backup.is_file() {
                fs::copy(&backup, file).map_err(|e| RegistrationError::io(file, e))?;
                restored += 1;
            }
        }
        info!("Restored {} frames from {:?}", restored, self.backup_dir);
        Ok(restored)
    }
}

impl FrameSequence for DirectorySequence {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn image(&self, frame: usize, channels: &ChannelSet) -> Result<Raster> {
        let path = self.path(frame)?;
        let decoded = image::open(path).map_err(|e| RegistrationError::image(path, e))?;
        let raster = dynamic_to_raster(decoded)?;
        match channels {
            ChannelSet::All => Ok(raster),
            ChannelSet::Subset(selection) => raster.select_channels(selection),
        }
    }

    fn file_name_for_frame(&self, frame: usize) -> Result<PathBuf> {
        self.path(frame).cloned()
    }

    fn save_image(&mut self, raster: &Raster, path: &Path, overwrite: bool) -> Result<()> {
        if path.exists() && !overwrite {
            return Err(RegistrationError::SaveFailed {
                path: path.to_path_buf(),
                reason: "file exists and overwrite is disabled".to_string(),
            });
        }
        let image = raster_to_dynamic(raster)?;
        image.save(path).map_err(|e| RegistrationError::image(path, e))?;
        debug!("Saved {:?}", path);
        Ok(())
    }

    fn backup_originals(&mut self) -> Result<()> {
        fs::create_dir_all(&self.backup_dir).map_err(|e| RegistrationError::BackupFailed(format!("{:?}: {}", self.backup_dir, e)))?;

        let mut copied = 0;
        for file in &self.files {
            let backup = self
                .backup_path(file)
                .ok_or_else(|| RegistrationError::BackupFailed(format!("{:?} has no file name", file)))?;
            // Never overwrite a pristine original with registered output
            if backup.exists() {
                continue;
            }
            fs::copy(file, &backup).map_err(|e| RegistrationError::BackupFailed(format!("{:?}: {}", file, e)))?;
            copied += 1;
        }

        info!("Backup in {:?}: {} new, {} already present", self.backup_dir, copied, self.files.len() - copied);
        Ok(())
    }
}

fn dynamic_to_raster(image: DynamicImage) -> Result<Raster> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    match image {
        DynamicImage::ImageLuma8(buf) => Raster::from_interleaved(w, h, 1, buf.as_raw(), PixelData::U8),
        DynamicImage::ImageRgb8(buf) => Raster::from_interleaved(w, h, 3, buf.as_raw(), PixelData::U8),
        DynamicImage::ImageRgba8(buf) => Raster::from_interleaved(w, h, 4, buf.as_raw(), PixelData::U8),
        DynamicImage::ImageLumaA8(_) => {
            let buf = image.to_rgba8();
            Raster::from_interleaved(w, h, 4, buf.as_raw(), PixelData::U8)
        }
        DynamicImage::ImageLuma16(buf) => Raster::from_interleaved(w, h, 1, buf.as_raw(), PixelData::U16),
        DynamicImage::ImageRgb16(buf) => Raster::from_interleaved(w, h, 3, buf.as_raw(), PixelData::U16),
        DynamicImage::ImageRgba16(buf) => Raster::from_interleaved(w, h, 4, buf.as_raw(), PixelData::U16),
        DynamicImage::ImageLumaA16(_) => {
            let buf = image.to_rgba16();
            Raster::from_interleaved(w, h, 4, buf.as_raw(), PixelData::U16)
        }
        DynamicImage::ImageRgb32F(buf) => Raster::from_interleaved(w, h, 3, buf.as_raw(), PixelData::F32),
        DynamicImage::ImageRgba32F(buf) => Raster::from_interleaved(w, h, 4, buf.as_raw(), PixelData::F32),
        other => {
            let buf = other.to_rgba32f();
            Raster::from_interleaved(w, h, 4, buf.as_raw(), PixelData::F32)
        }
    }
}

fn raster_to_dynamic(raster: &Raster) -> Result<DynamicImage> {
    let (w, h) = (raster.width() as u32, raster.height() as u32);
    let channels = raster.channels();
    let unsupported = || {
        RegistrationError::UnsupportedFormat(format!(
            "cannot encode {} channel(s) of {:?}",
            channels,
            raster.sample_type()
        ))
    };

    let image = match (raster.data(), channels) {
        (PixelData::U8(v), 1) => ImageBuffer::<Luma<u8>, _>::from_raw(w, h, Raster::interleaved(v, 1)).map(DynamicImage::ImageLuma8),
        (PixelData::U8(v), 3) => ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, Raster::interleaved(v, 3)).map(DynamicImage::ImageRgb8),
        (PixelData::U8(v), 4) => ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, Raster::interleaved(v, 4)).map(DynamicImage::ImageRgba8),
        (PixelData::U16(v), 1) => ImageBuffer::<Luma<u16>, _>::from_raw(w, h, Raster::interleaved(v, 1)).map(DynamicImage::ImageLuma16),
        (PixelData::U16(v), 3) => ImageBuffer::<Rgb<u16>, _>::from_raw(w, h, Raster::interleaved(v, 3)).map(DynamicImage::ImageRgb16),
        (PixelData::U16(v), 4) => ImageBuffer::<Rgba<u16>, _>::from_raw(w, h, Raster::interleaved(v, 4)).map(DynamicImage::ImageRgba16),
        (PixelData::F32(v), 3) => ImageBuffer::<Rgb<f32>, _>::from_raw(w, h, Raster::interleaved(v, 3)).map(DynamicImage::ImageRgb32F),
        (PixelData::F32(v), 4) => ImageBuffer::<Rgba<f32>, _>::from_raw(w, h, Raster::interleaved(v, 4)).map(DynamicImage::ImageRgba32F),
        _ => return Err(unsupported()),
    };

    image.ok_or_else(unsupported)
}
