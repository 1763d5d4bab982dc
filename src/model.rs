use std::path::{Path, PathBuf};

use image::{imageops, io::Reader as ImageReader, DynamicImage, GrayImage, Rgb, RgbImage};
use thiserror::Error;

const BLUR_SIGMA: f32 = 3.0;
// Residuals must clear mean + N standard deviations and this absolute floor.
const RESIDUAL_SIGMAS: f32 = 3.0;
const RESIDUAL_FLOOR: f32 = 12.0;
const OUTLINE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const FILL_ALPHA: f32 = 0.5;

pub const LABEL_ANOMALY: &str = "anomaly";
pub const LABEL_NORMAL: &str = "normal";

/// Output of one detector run: a label, a score and the two rendered artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub score: f64,
    pub outline_image: PathBuf,
    pub filled_image: PathBuf,
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to process image: {0}")]
    Image(#[from] image::ImageError),
    #[error("image {} has no pixels", .0.display())]
    Empty(PathBuf),
    #[error("model failure: {0}")]
    Model(String),
}

/// Anomaly detection capability used by the prediction handler.
///
/// Implementations write their artifact images themselves and return the
/// paths; callers only ever use the file name component.
pub trait Detector: Send + Sync {
    fn detect(&self, image_path: &Path) -> Result<Detection, DetectionError>;
}

/// Per-pixel deviation values for a `width x height` image, row major.
pub struct AnomalyMap {
    width: u32,
    height: u32,
    residual: Vec<f32>,
}

impl AnomalyMap {
    pub fn new(width: u32, height: u32, residual: Vec<f32>) -> Self {
        debug_assert_eq!(residual.len(), (width as usize) * (height as usize));
        Self {
            width,
            height,
            residual,
        }
    }

    #[cfg_attr(not(feature = "tensorflow"), allow(dead_code))]
    pub fn from_gray(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        let residual = image.pixels().map(|pixel| pixel.0[0] as f32).collect();
        Self::new(width, height, residual)
    }

    pub fn mask(&self) -> Vec<bool> {
        if self.residual.is_empty() {
            return Vec::new();
        }
        let count = self.residual.len() as f32;
        let mean = self.residual.iter().sum::<f32>() / count;
        let variance = self
            .residual
            .iter()
            .map(|value| (value - mean).powi(2))
            .sum::<f32>()
            / count;
        let cutoff = (mean + RESIDUAL_SIGMAS * variance.sqrt()).max(RESIDUAL_FLOOR);

        self.residual.iter().map(|&value| value > cutoff).collect()
    }
}

/// Fraction of flagged pixels, rounded to four decimals.
pub fn mask_score(mask: &[bool]) -> f64 {
    if mask.is_empty() {
        return 0.0;
    }
    let flagged = mask.iter().filter(|&&hit| hit).count() as f64;
    ((flagged / mask.len() as f64) * 10_000.0).round() / 10_000.0
}

pub fn label_for(score: f64, threshold: f64) -> &'static str {
    if score >= threshold {
        LABEL_ANOMALY
    } else {
        LABEL_NORMAL
    }
}

pub fn load_image(path: &Path) -> Result<DynamicImage, DetectionError> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    if image.width() == 0 || image.height() == 0 {
        return Err(DetectionError::Empty(path.to_path_buf()));
    }
    Ok(image)
}

fn is_boundary(mask: &[bool], width: u32, height: u32, x: u32, y: u32) -> bool {
    let at = |x: u32, y: u32| mask[(y * width + x) as usize];
    x == 0
        || y == 0
        || x + 1 == width
        || y + 1 == height
        || !at(x - 1, y)
        || !at(x + 1, y)
        || !at(x, y - 1)
        || !at(x, y + 1)
}

fn blend(pixel: &mut Rgb<u8>, color: Rgb<u8>) {
    for (channel, target) in pixel.0.iter_mut().zip(color.0) {
        let mixed = *channel as f32 * (1.0 - FILL_ALPHA) + target as f32 * FILL_ALPHA;
        *channel = mixed.round().clamp(0.0, 255.0) as u8;
    }
}

/// Writes `outline_<stem>.png` and `filled_<stem>.png` into `results_dir`.
pub fn render_artifacts(
    original: &DynamicImage,
    mask: &[bool],
    results_dir: &Path,
    stem: &str,
) -> Result<(PathBuf, PathBuf), DetectionError> {
    let base: RgbImage = original.to_rgb8();
    let (width, height) = base.dimensions();
    let mut outline = base.clone();
    let mut filled = base;

    if mask.len() == (width as usize) * (height as usize) {
        for y in 0..height {
            for x in 0..width {
                if !mask[(y * width + x) as usize] {
                    continue;
                }
                blend(filled.get_pixel_mut(x, y), OUTLINE_COLOR);
                if is_boundary(mask, width, height, x, y) {
                    outline.put_pixel(x, y, OUTLINE_COLOR);
                }
            }
        }
    }

    std::fs::create_dir_all(results_dir)?;
    let outline_path = results_dir.join(format!("outline_{stem}.png"));
    let filled_path = results_dir.join(format!("filled_{stem}.png"));
    outline.save(&outline_path)?;
    filled.save(&filled_path)?;
    Ok((outline_path, filled_path))
}

pub fn file_stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "image".to_string())
}

/// Maps an anomaly map onto a finished [`Detection`], rendering the artifacts.
pub fn finish_detection(
    original: &DynamicImage,
    map: &AnomalyMap,
    results_dir: &Path,
    image_path: &Path,
    threshold: f64,
) -> Result<Detection, DetectionError> {
    let mask = map.mask();
    let score = mask_score(&mask);
    let (outline_image, filled_image) =
        render_artifacts(original, &mask, results_dir, &file_stem_of(image_path))?;

    Ok(Detection {
        label: label_for(score, threshold).to_string(),
        score,
        outline_image,
        filled_image,
    })
}

/// Flags pixels that deviate strongly from their blurred neighbourhood.
pub struct ResidualDetector {
    results_dir: PathBuf,
    threshold: f64,
}

impl ResidualDetector {
    pub fn new(results_dir: impl Into<PathBuf>, threshold: f64) -> Self {
        Self {
            results_dir: results_dir.into(),
            threshold,
        }
    }

    fn residual_map(&self, image: &DynamicImage) -> AnomalyMap {
        let gray = image.to_luma8();
        let (width, height) = gray.dimensions();
        let smooth = imageops::blur(&gray, BLUR_SIGMA);

        let residual = gray
            .pixels()
            .zip(smooth.pixels())
            .map(|(original, blurred)| (original.0[0] as f32 - blurred.0[0] as f32).abs())
            .collect();

        AnomalyMap::new(width, height, residual)
    }
}

impl Detector for ResidualDetector {
    fn detect(&self, image_path: &Path) -> Result<Detection, DetectionError> {
        let image = load_image(image_path)?;
        let map = self.residual_map(&image);
        finish_detection(&image, &map, &self.results_dir, image_path, self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Luma};

    use super::*;

    fn write_square_image(dir: &Path, name: &str) -> PathBuf {
        let image: RgbImage = ImageBuffer::from_fn(64, 64, |x, y| {
            if (26..38).contains(&x) && (26..38).contains(&y) {
                Rgb([250, 250, 250])
            } else {
                Rgb([40, 40, 40])
            }
        });
        let path = dir.join(name);
        image.save(&path).unwrap();
        path
    }

    fn count_color(path: &Path, color: Rgb<u8>) -> usize {
        image::open(path)
            .unwrap()
            .to_rgb8()
            .pixels()
            .filter(|pixel| **pixel == color)
            .count()
    }

    #[test]
    fn mask_ignores_flat_residuals() {
        let map = AnomalyMap::new(4, 1, vec![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(map.mask(), vec![false; 4]);
    }

    #[test]
    fn mask_flags_outliers() {
        let mut residual = vec![0.0; 100];
        residual[42] = 200.0;
        let map = AnomalyMap::new(10, 10, residual);
        let mask = map.mask();
        assert!(mask[42]);
        assert_eq!(mask.iter().filter(|&&hit| hit).count(), 1);
        assert_eq!(mask_score(&mask), 0.01);
    }

    #[test]
    fn from_gray_reads_pixel_values() {
        let gray: GrayImage = ImageBuffer::from_fn(2, 2, |x, _| Luma([if x == 0 { 0 } else { 90 }]));
        let map = AnomalyMap::from_gray(&gray);
        assert_eq!((map.width, map.height), (2, 2));
        assert_eq!(map.residual, vec![0.0, 90.0, 0.0, 90.0]);
    }

    #[test]
    fn label_uses_inclusive_threshold() {
        assert_eq!(label_for(0.5, 0.5), LABEL_ANOMALY);
        assert_eq!(label_for(0.49, 0.5), LABEL_NORMAL);
        assert_eq!(mask_score(&[]), 0.0);
    }

    #[test]
    fn residual_detector_finds_bright_square() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("results");
        let input = write_square_image(dir.path(), "square.png");

        let detector = ResidualDetector::new(&results, 0.001);
        let detection = detector.detect(&input).unwrap();

        assert_eq!(detection.label, LABEL_ANOMALY);
        assert!(detection.score > 0.0);
        assert_eq!(detection.outline_image, results.join("outline_square.png"));
        assert_eq!(detection.filled_image, results.join("filled_square.png"));
        assert!(count_color(&detection.outline_image, OUTLINE_COLOR) > 0);
    }

    #[test]
    fn residual_detector_reports_uniform_image_as_normal() {
        let dir = tempfile::tempdir().unwrap();
        let image: RgbImage = ImageBuffer::from_pixel(32, 32, Rgb([120, 120, 120]));
        let input = dir.path().join("flat.png");
        image.save(&input).unwrap();

        let detection = ResidualDetector::new(dir.path(), 0.01)
            .detect(&input)
            .unwrap();

        assert_eq!(detection.label, LABEL_NORMAL);
        assert_eq!(detection.score, 0.0);
        assert!(detection.filled_image.exists());
        assert_eq!(count_color(&detection.outline_image, OUTLINE_COLOR), 0);
    }

    #[test]
    fn undecodable_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("broken.png");
        std::fs::write(&input, b"definitely not an image").unwrap();

        let err = ResidualDetector::new(dir.path(), 0.01)
            .detect(&input)
            .unwrap_err();
        assert!(matches!(err, DetectionError::Image(_)));
    }
}
