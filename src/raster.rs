//! Planar multi-channel frame rasters
//!
//! Frames keep their native element type; the warper works on one `f32`
//! channel at a time and converts back with the same precision rules.

use serde::Serialize;

use crate::error::{RegistrationError, Result};

/// Element type of a raster, carrying signedness and precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    U8,
    U16,
    I16,
    F32,
}

impl SampleType {
    pub fn is_signed(&self) -> bool {
        matches!(self, SampleType::I16 | SampleType::F32)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, SampleType::F32)
    }

    pub fn bits(&self) -> u32 {
        match self {
            SampleType::U8 => 8,
            SampleType::U16 | SampleType::I16 => 16,
            SampleType::F32 => 32,
        }
    }
}

/// Channel-planar pixel storage: channel `c` occupies
/// `[c * width * height, (c + 1) * width * height)`.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    F32(Vec<f32>),
}

impl PixelData {
    fn len(&self) -> usize {
        match self {
            PixelData::U8(v) => v.len(),
            PixelData::U16(v) => v.len(),
            PixelData::I16(v) => v.len(),
            PixelData::F32(v) => v.len(),
        }
    }

    fn sample_type(&self) -> SampleType {
        match self {
            PixelData::U8(_) => SampleType::U8,
            PixelData::U16(_) => SampleType::U16,
            PixelData::I16(_) => SampleType::I16,
            PixelData::F32(_) => SampleType::F32,
        }
    }
}

/// A multi-channel 2D frame
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    width: usize,
    height: usize,
    channels: usize,
    data: PixelData,
}

impl Raster {
    pub fn new(width: usize, height: usize, channels: usize, data: PixelData) -> Result<Self> {
        let expected = width * height * channels;
        if data.len() != expected {
            return Err(RegistrationError::UnsupportedFormat(format!(
                "{}x{}x{} raster needs {} samples, got {}",
                width,
                height,
                channels,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// A zero-filled raster of the given type
    pub fn zeros(width: usize, height: usize, channels: usize, sample_type: SampleType) -> Self {
        let n = width * height * channels;
        let data = match sample_type {
            SampleType::U8 => PixelData::U8(vec![0; n]),
            SampleType::U16 => PixelData::U16(vec![0; n]),
            SampleType::I16 => PixelData::I16(vec![0; n]),
            SampleType::F32 => PixelData::F32(vec![0.0; n]),
        };
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_type(&self) -> SampleType {
        self.data.sample_type()
    }

    pub fn data(&self) -> &PixelData {
        &self.data
    }

    fn plane_len(&self) -> usize {
        self.width * self.height
    }

    /// Copy one channel into an `f32` working buffer
    pub fn channel_f32(&self, channel: usize) -> Vec<f32> {
        let n = self.plane_len();
        let range = channel * n..(channel + 1) * n;
        match &self.data {
            PixelData::U8(v) => v[range].iter().map(|&s| s as f32).collect(),
            PixelData::U16(v) => v[range].iter().map(|&s| s as f32).collect(),
            PixelData::I16(v) => v[range].iter().map(|&s| s as f32).collect(),
            PixelData::F32(v) => v[range].to_vec(),
        }
    }

    /// Write an `f32` working buffer back into one channel, rounding and
    /// clamping to the native integer range.
    pub fn set_channel_f32(&mut self, channel: usize, values: &[f32]) {
        let n = self.plane_len();
        debug_assert_eq!(values.len(), n);
        let range = channel * n..(channel + 1) * n;
        match &mut self.data {
            PixelData::U8(v) => {
                for (dst, &src) in v[range].iter_mut().zip(values) {
                    *dst = src.round().clamp(0.0, u8::MAX as f32) as u8;
                }
            }
            PixelData::U16(v) => {
                for (dst, &src) in v[range].iter_mut().zip(values) {
                    *dst = src.round().clamp(0.0, u16::MAX as f32) as u16;
                }
            }
            PixelData::I16(v) => {
                for (dst, &src) in v[range].iter_mut().zip(values) {
                    *dst = src.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                }
            }
            PixelData::F32(v) => v[range].copy_from_slice(values),
        }
    }

    /// Copy of the selected channels, in the given order
    pub fn select_channels(&self, channels: &[usize]) -> Result<Raster> {
        if let Some(&bad) = channels.iter().find(|&&c| c >= self.channels) {
            return Err(RegistrationError::UnsupportedFormat(format!(
                "channel {} requested from a {}-channel frame",
                bad, self.channels
            )));
        }
        let mut out = Raster::zeros(self.width, self.height, channels.len(), self.sample_type());
        for (dst, &src) in channels.iter().enumerate() {
            out.set_channel_f32(dst, &self.channel_f32(src));
        }
        Ok(out)
    }

    /// Build from interleaved samples (`[r, g, b, r, g, b, ...]`)
    pub fn from_interleaved<T: Copy>(
        width: usize,
        height: usize,
        channels: usize,
        samples: &[T],
        wrap: impl FnOnce(Vec<T>) -> PixelData,
    ) -> Result<Self> {
        let n = width * height;
        if samples.len() != n * channels {
            return Err(RegistrationError::UnsupportedFormat(format!(
                "expected {} interleaved samples, got {}",
                n * channels,
                samples.len()
            )));
        }
        let mut planar = Vec::with_capacity(samples.len());
        for c in 0..channels {
            planar.extend(samples.iter().skip(c).step_by(channels).copied());
        }
        Raster::new(width, height, channels, wrap(planar))
    }

    /// Interleave planar samples for encoders
    pub fn interleaved<T: Copy>(planar: &[T], channels: usize) -> Vec<T> {
        let n = planar.len() / channels.max(1);
        let mut out = Vec::with_capacity(planar.len());
        for i in 0..n {
            for c in 0..channels {
                out.push(planar[c * n + i]);
            }
        }
        out
    }
}
