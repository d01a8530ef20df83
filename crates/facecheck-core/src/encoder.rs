//! Encoding generation.
//!
//! Two strategies, chosen by configuration at startup:
//!
//! - [`EncoderStrategy::DetectorBacked`]: a [`FaceLocator`] proposes regions,
//!   each is screened by [`validate_face_region`], and a
//!   [`DescriptorExtractor`] encodes the first region that passes.
//! - [`EncoderStrategy::FeatureFallback`]: a deterministic grid-statistics
//!   descriptor over the whole image. It never locates faces.

use crate::codec::{self, PixelGrid};
use crate::detector::{DetectorError, ScrfdLocator};
use crate::recognizer::{DescriptorModel, RecognizerError};
use crate::types::{Encoding, Region, ENCODING_DIM};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Source images pooled into one enrollment encoding.
pub const MAX_ENROLL_IMAGES: usize = 3;

const FALLBACK_GRID: usize = 4;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("No face detected")]
    NoFaceDetected,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Proposes candidate face regions, highest confidence first.
pub trait FaceLocator: Send {
    fn locate(&mut self, grid: &PixelGrid) -> Result<Vec<Region>, DetectorError>;
}

/// Produces an encoding for one face region.
pub trait DescriptorExtractor: Send {
    fn describe(&mut self, grid: &PixelGrid, region: &Region) -> Result<Encoding, RecognizerError>;
}

/// How encodings are produced.
pub enum EncoderStrategy {
    DetectorBacked {
        locator: Box<dyn FaceLocator>,
        extractor: Box<dyn DescriptorExtractor>,
    },
    FeatureFallback,
}

impl EncoderStrategy {
    /// Load the SCRFD locator and descriptor model from disk.
    pub fn detector_from_models(
        locator_path: &str,
        descriptor_path: &str,
    ) -> Result<Self, EncoderError> {
        Ok(Self::DetectorBacked {
            locator: Box::new(ScrfdLocator::load(locator_path)?),
            extractor: Box::new(DescriptorModel::load(descriptor_path)?),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::DetectorBacked { .. } => "detector",
            Self::FeatureFallback => "fallback",
        }
    }
}

/// Heuristic thresholds for accepting a detected region as a face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionThresholds {
    /// Minimum width and height in pixels.
    pub min_face_size: f32,
    /// Minimum intensity variance inside the region.
    pub min_intensity_variance: f32,
    /// Minimum red-channel share of total intensity.
    pub min_red_ratio: f32,
}

impl Default for RegionThresholds {
    fn default() -> Self {
        Self {
            min_face_size: 20.0,
            min_intensity_variance: 100.0,
            min_red_ratio: 0.25,
        }
    }
}

/// Why a candidate region was rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegionRejection {
    TooSmall { width: f32, height: f32 },
    LowVariance(f32),
    LowRedRatio(f32),
}

impl fmt::Display for RegionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall { width, height } => write!(f, "too small ({width:.0}x{height:.0})"),
            Self::LowVariance(v) => write!(f, "flat region (variance {v:.1})"),
            Self::LowRedRatio(r) => write!(f, "implausible colour (red ratio {r:.3})"),
        }
    }
}

/// Screen a detected region: minimum size, texture, and a crude skin-tone check.
pub fn validate_face_region(
    grid: &PixelGrid,
    region: &Region,
    thresholds: &RegionThresholds,
) -> Result<(), RegionRejection> {
    let too_small = |width: f32, height: f32| {
        if width < thresholds.min_face_size || height < thresholds.min_face_size {
            Err(RegionRejection::TooSmall { width, height })
        } else {
            Ok(())
        }
    };
    too_small(region.width, region.height)?;

    let x0 = region.x.max(0.0).floor() as usize;
    let y0 = region.y.max(0.0).floor() as usize;
    let x1 = ((region.x + region.width).ceil().max(0.0) as usize).min(grid.width() as usize);
    let y1 = ((region.y + region.height).ceil().max(0.0) as usize).min(grid.height() as usize);
    too_small(
        x1.saturating_sub(x0) as f32,
        y1.saturating_sub(y0) as f32,
    )?;

    let mut channel_sums = [0f64; 3];
    let mut sum = 0f64;
    let mut sum_sq = 0f64;
    for y in y0..y1 {
        for x in x0..x1 {
            for (c, &v) in grid.pixel(x, y).iter().enumerate() {
                let v = v as f64;
                channel_sums[c] += v;
                sum += v;
                sum_sq += v * v;
            }
        }
    }

    let n = ((x1 - x0) * (y1 - y0) * 3) as f64;
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0) as f32;
    if variance < thresholds.min_intensity_variance {
        return Err(RegionRejection::LowVariance(variance));
    }

    let red_ratio = if sum > 0.0 {
        (channel_sums[0] / sum) as f32
    } else {
        0.0
    };
    if red_ratio < thresholds.min_red_ratio {
        return Err(RegionRejection::LowRedRatio(red_ratio));
    }

    Ok(())
}

pub fn is_valid_face_region(grid: &PixelGrid, region: &Region, thresholds: &RegionThresholds) -> bool {
    validate_face_region(grid, region, thresholds).is_ok()
}

fn mean_std(values: impl Iterator<Item = f32> + Clone) -> (f32, f32) {
    let n = values.clone().count();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.clone().sum::<f32>() / n as f32;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f32>() / n as f32;
    (mean, var.sqrt())
}

/// The 38 raw fallback features of a grayscale image scaled to [0, 1]:
/// 4×4 cell mean/std (32), gradient magnitude mean/std (2), and global
/// mean/std/min/max (4).
pub fn fallback_features(gray: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut features = Vec::with_capacity(38);

    for gy in 0..FALLBACK_GRID {
        let (ry0, ry1) = (gy * height / FALLBACK_GRID, (gy + 1) * height / FALLBACK_GRID);
        for gx in 0..FALLBACK_GRID {
            let (rx0, rx1) = (gx * width / FALLBACK_GRID, (gx + 1) * width / FALLBACK_GRID);
            let cell = (ry0..ry1).flat_map(move |y| (rx0..rx1).map(move |x| gray[y * width + x]));
            let (m, s) = mean_std(cell);
            features.push(m);
            features.push(s);
        }
    }

    let rows = height.saturating_sub(1);
    let cols = width.saturating_sub(1);
    let magnitudes = (0..rows).flat_map(move |y| {
        (0..cols).map(move |x| {
            let p = gray[y * width + x];
            let gx = gray[y * width + x + 1] - p;
            let gy = gray[(y + 1) * width + x] - p;
            (gx * gx + gy * gy).sqrt()
        })
    });
    let (edge_mean, edge_std) = mean_std(magnitudes);
    features.push(edge_mean);
    features.push(edge_std);

    let (mean, std) = mean_std(gray.iter().copied());
    let min = gray.iter().copied().fold(f32::INFINITY, f32::min);
    let max = gray.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    features.extend([mean, std, min, max]);

    features
}

/// Deterministic whole-image encoding: fallback features zero-padded to
/// [`ENCODING_DIM`] and L2-normalized.
pub fn fallback_encoding(grid: &PixelGrid) -> Encoding {
    let gray: Vec<f32> = grid
        .to_grayscale()
        .into_iter()
        .map(|v| v as f32 / 255.0)
        .collect();
    Encoding::padded_normalized(fallback_features(
        &gray,
        grid.width() as usize,
        grid.height() as usize,
    ))
}

/// Per-candidate outcome reported by [`EncodingGenerator::inspect`].
#[derive(Debug, Clone)]
pub struct RegionVerdict {
    pub region: Region,
    pub rejection: Option<RegionRejection>,
}

/// Produces encodings from pixel grids with a configured strategy.
///
/// Not shared between threads: each pool worker owns one.
pub struct EncodingGenerator {
    strategy: EncoderStrategy,
    thresholds: RegionThresholds,
}

impl EncodingGenerator {
    pub fn new(strategy: EncoderStrategy, thresholds: RegionThresholds) -> Self {
        Self { strategy, thresholds }
    }

    pub fn fallback() -> Self {
        Self::new(EncoderStrategy::FeatureFallback, RegionThresholds::default())
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Encode one grid. Returns the accepted regions (empty for the fallback).
    pub fn generate(&mut self, grid: &PixelGrid) -> Result<(Encoding, Vec<Region>), EncoderError> {
        let (locator, extractor) = match &mut self.strategy {
            EncoderStrategy::FeatureFallback => return Ok((fallback_encoding(grid), Vec::new())),
            EncoderStrategy::DetectorBacked { locator, extractor } => (locator, extractor),
        };

        let mut accepted = Vec::new();
        for region in locator.locate(grid)? {
            match validate_face_region(grid, &region, &self.thresholds) {
                Ok(()) => accepted.push(region),
                Err(reason) => tracing::debug!(%reason, confidence = region.confidence, "rejected face region"),
            }
        }

        let first = accepted.first().ok_or(EncoderError::NoFaceDetected)?;
        let encoding = extractor.describe(grid, first)?;
        Ok((encoding, accepted))
    }

    /// Run the locator and report each candidate's validation outcome.
    /// The fallback strategy has no locator and reports nothing.
    pub fn inspect(&mut self, grid: &PixelGrid) -> Result<Vec<RegionVerdict>, EncoderError> {
        let EncoderStrategy::DetectorBacked { locator, .. } = &mut self.strategy else {
            return Ok(Vec::new());
        };
        Ok(locator
            .locate(grid)?
            .into_iter()
            .map(|region| RegionVerdict {
                rejection: validate_face_region(grid, &region, &self.thresholds).err(),
                region,
            })
            .collect())
    }

    /// Pool the encodings of up to [`MAX_ENROLL_IMAGES`] source images by
    /// element-wise mean. Images that fail to decode or encode are skipped.
    pub fn enroll(&mut self, images: &[Vec<u8>]) -> Result<Encoding, EncoderError> {
        if images.len() > MAX_ENROLL_IMAGES {
            tracing::warn!(
                supplied = images.len(),
                used = MAX_ENROLL_IMAGES,
                "extra enrollment images ignored"
            );
        }

        let mut encodings = Vec::with_capacity(MAX_ENROLL_IMAGES);
        for (slot, bytes) in images.iter().take(MAX_ENROLL_IMAGES).enumerate() {
            let grid = match codec::decode(bytes) {
                Ok(grid) => grid,
                Err(error) => {
                    tracing::warn!(slot, %error, "skipping undecodable enrollment image");
                    continue;
                }
            };
            match self.generate(&grid) {
                Ok((encoding, _)) => encodings.push(encoding),
                Err(error) => tracing::warn!(slot, %error, "skipping enrollment image"),
            }
        }

        tracing::debug!(pooled = encodings.len(), "enrollment encodings pooled");
        Encoding::mean(&encodings).ok_or(EncoderError::NoFaceDetected)
    }
}
