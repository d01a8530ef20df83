//! Image decoding into RGB pixel grids.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image data is empty")]
    Empty,
    #[error("unrecognized image format")]
    UnsupportedFormat,
    #[error("malformed image: {0}")]
    Malformed(String),
    #[error("image has zero width or height")]
    ZeroSized,
    #[error("pixel buffer length {actual} does not match {width}x{height}x3")]
    BufferLength { width: u32, height: u32, actual: usize },
}

/// An immutable RGB8 image: `height` rows of `width` pixels, 3 bytes each.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelGrid {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelGrid {
    /// Wrap a packed RGB8 buffer.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, DecodeError> {
        if width == 0 || height == 0 {
            return Err(DecodeError::ZeroSized);
        }
        if data.len() != width as usize * height as usize * 3 {
            return Err(DecodeError::BufferLength {
                width,
                height,
                actual: data.len(),
            });
        }
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    /// RGB triple at (x, y). Caller guarantees bounds.
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width as usize + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// BT.601 luma, one byte per pixel.
    pub fn to_grayscale(&self) -> Vec<u8> {
        self.data
            .chunks_exact(3)
            .map(|p| luma(p[0], p[1], p[2]))
            .collect()
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    let y = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
    y.round().clamp(0.0, 255.0) as u8
}

/// Decode JPEG/PNG/BMP (or any other format the `image` crate recognizes by
/// content) into an RGB grid.
pub fn decode(bytes: &[u8]) -> Result<PixelGrid, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let format = image::guess_format(bytes).map_err(|_| DecodeError::UnsupportedFormat)?;
    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    tracing::trace!(?format, width, height, "decoded image");

    PixelGrid::from_rgb(width, height, rgb.into_raw())
}
