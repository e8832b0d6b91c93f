//! Image comparison for uploaded files

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::{GenericImageView, Pixel, RgbaImage};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{RestamentError, RunResult};

/// Decides whether two image files show the same picture
#[async_trait]
pub trait ImageComparator: Send + Sync {
    /// Returns `true` when the images are the same. When `diff_out` is given and
    /// the images differ, a diff image is written there.
    async fn compare(
        &self,
        actual: &Path,
        expected: &Path,
        diff_out: Option<&Path>,
    ) -> RunResult<bool>;
}

/// Result of a pixel comparison
#[derive(Debug, Clone)]
pub struct VisualDiff {
    /// Whether the images match (within threshold)
    pub matches: bool,

    /// Percentage of pixels that differ
    pub diff_percent: f64,

    /// Number of different pixels
    pub diff_pixels: u64,

    /// Total pixels compared
    pub total_pixels: u64,

    /// Path to the diff image (if generated)
    pub diff_image_path: Option<PathBuf>,
}

/// Pixel-by-pixel comparator with a per-channel tolerance
#[derive(Debug, Clone)]
pub struct PixelComparator {
    /// Allowed differing pixels (0.0 - 100.0 percent)
    threshold: f64,

    /// Allowed difference per RGBA channel
    tolerance: u8,
}

impl Default for PixelComparator {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            tolerance: 5,
        }
    }
}

impl PixelComparator {
    pub fn new(threshold: f64, tolerance: u8) -> Self {
        Self { threshold, tolerance }
    }

    /// Compare two images on the current thread
    pub fn diff(
        &self,
        actual: &Path,
        expected: &Path,
        diff_out: Option<&Path>,
    ) -> RunResult<VisualDiff> {
        // Identical files need no decoding
        if hash_file(actual)? == hash_file(expected)? {
            debug!("{} matches {} exactly (same hash)", actual.display(), expected.display());
            return Ok(VisualDiff {
                matches: true,
                diff_percent: 0.0,
                diff_pixels: 0,
                total_pixels: 0,
                diff_image_path: None,
            });
        }

        let actual_img = image::open(actual)?;
        let expected_img = image::open(expected)?;

        if actual_img.dimensions() != expected_img.dimensions() {
            warn!(
                "Image dimensions differ: actual {:?} vs expected {:?}",
                actual_img.dimensions(),
                expected_img.dimensions()
            );
            let (w, h) = actual_img.dimensions();
            return Ok(VisualDiff {
                matches: false,
                diff_percent: 100.0,
                diff_pixels: u64::from(w) * u64::from(h),
                total_pixels: u64::from(w) * u64::from(h),
                diff_image_path: None,
            });
        }

        let (width, height) = actual_img.dimensions();
        let actual_rgba = actual_img.to_rgba8();
        let expected_rgba = expected_img.to_rgba8();

        let mut diff_img = RgbaImage::new(width, height);
        let mut diff_pixels = 0u64;
        let total_pixels = u64::from(width) * u64::from(height);

        for y in 0..height {
            for x in 0..width {
                let actual_pixel = actual_rgba.get_pixel(x, y);
                let expected_pixel = expected_rgba.get_pixel(x, y);

                if self.pixels_differ(actual_pixel, expected_pixel) {
                    diff_pixels += 1;
                    // Mark diff pixels in red
                    diff_img.put_pixel(x, y, image::Rgba([255, 0, 0, 255]));
                } else {
                    // Keep original but dim it
                    let channels = actual_pixel.channels();
                    diff_img.put_pixel(
                        x,
                        y,
                        image::Rgba([channels[0] / 2, channels[1] / 2, channels[2] / 2, 128]),
                    );
                }
            }
        }

        let diff_percent = if total_pixels == 0 {
            0.0
        } else {
            (diff_pixels as f64 / total_pixels as f64) * 100.0
        };
        let matches = diff_pixels == 0 || diff_percent <= self.threshold;

        let diff_image_path = match diff_out {
            Some(path) if diff_pixels > 0 => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                diff_img.save(path)?;
                Some(path.to_path_buf())
            }
            _ => None,
        };

        if !matches {
            warn!(
                "{}: {:.2}% pixels differ from {} (threshold: {:.2}%)",
                actual.display(),
                diff_percent,
                expected.display(),
                self.threshold
            );
        }

        Ok(VisualDiff {
            matches,
            diff_percent,
            diff_pixels,
            total_pixels,
            diff_image_path,
        })
    }

    fn pixels_differ(&self, a: &image::Rgba<u8>, b: &image::Rgba<u8>) -> bool {
        a.channels()
            .iter()
            .zip(b.channels())
            .any(|(x, y)| x.abs_diff(*y) > self.tolerance)
    }
}

#[async_trait]
impl ImageComparator for PixelComparator {
    async fn compare(
        &self,
        actual: &Path,
        expected: &Path,
        diff_out: Option<&Path>,
    ) -> RunResult<bool> {
        let comparator = self.clone();
        let actual = actual.to_path_buf();
        let expected = expected.to_path_buf();
        let diff_out = diff_out.map(Path::to_path_buf);

        let diff = tokio::task::spawn_blocking(move || {
            comparator.diff(&actual, &expected, diff_out.as_deref())
        })
        .await
        .map_err(|e| RestamentError::Internal(format!("image comparison task failed: {}", e)))??;

        Ok(diff.matches)
    }
}

/// Hash a file using SHA256
fn hash_file(path: &Path) -> RunResult<String> {
    let data = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}
