use std::path::{Path, PathBuf};

use image::{imageops::FilterType, DynamicImage, GrayImage, ImageBuffer, Luma};
use tensorflow::{Graph, ImportGraphDefOptions, Session, SessionOptions, SessionRunArgs, Tensor};

use crate::model::{finish_detection, load_image, AnomalyMap, Detection, DetectionError, Detector};

const IMAGE_DIMENSIONS: (u64, u64, u64) = (256, 256, 3);

fn model_error(err: impl std::fmt::Display) -> DetectionError {
    DetectionError::Model(err.to_string())
}

/// Detector backed by a frozen convolutional autoencoder graph.
///
/// The graph takes `x` of shape `[1, 256, 256, 3]` scaled to `0..1` and
/// produces the reconstruction on `Identity`. Reconstruction error is the
/// anomaly map.
pub struct AutoencoderDetector {
    session: Session,
    graph: Graph,
    results_dir: PathBuf,
    threshold: f64,
}

impl AutoencoderDetector {
    pub fn new(
        model_path: &Path,
        results_dir: impl Into<PathBuf>,
        threshold: f64,
    ) -> Result<Self, DetectionError> {
        let mut graph = Graph::new();
        let model_bytes = std::fs::read(model_path)?;

        graph
            .import_graph_def(&model_bytes, &ImportGraphDefOptions::new())
            .map_err(model_error)?;

        let session = Session::new(&SessionOptions::new(), &graph).map_err(model_error)?;

        Ok(AutoencoderDetector {
            session,
            graph,
            results_dir: results_dir.into(),
            threshold,
        })
    }

    fn preprocess_image(&self, image: &DynamicImage) -> Result<Tensor<f32>, DetectionError> {
        let resized = image
            .resize_exact(
                IMAGE_DIMENSIONS.0 as u32,
                IMAGE_DIMENSIONS.1 as u32,
                FilterType::Triangle,
            )
            .to_rgb8();

        let flat_img: Vec<f32> = resized
            .pixels()
            .flat_map(|pixel| pixel.0)
            .map(|channel| channel as f32 / 255.0)
            .collect();

        let mut tensor = Tensor::new(&[1, IMAGE_DIMENSIONS.0, IMAGE_DIMENSIONS.1, IMAGE_DIMENSIONS.2]);
        tensor.copy_from_slice(&flat_img);

        Ok(tensor)
    }

    fn reconstruct(&self, input_tensor: &Tensor<f32>) -> Result<Vec<f32>, DetectionError> {
        let mut args = SessionRunArgs::new();

        let input_operation = self
            .graph
            .operation_by_name("x")
            .map_err(model_error)?
            .ok_or_else(|| model_error("Input operation 'x:0' not found in graph"))?;

        let output_operation = self
            .graph
            .operation_by_name("Identity")
            .map_err(model_error)?
            .ok_or_else(|| model_error("Output operation 'Identity:0' not found in graph"))?;

        args.add_feed(&input_operation, 0, input_tensor);
        let output_token = args.request_fetch(&output_operation, 0);
        self.session.run(&mut args).map_err(model_error)?;
        let output_tensor: Tensor<f32> = args.fetch(output_token).map_err(model_error)?;

        Ok(output_tensor.to_vec())
    }
}

impl Detector for AutoencoderDetector {
    fn detect(&self, image_path: &Path) -> Result<Detection, DetectionError> {
        let image = load_image(image_path)?;
        let input_tensor = self.preprocess_image(&image)?;
        let reconstruction = self.reconstruct(&input_tensor)?;

        if reconstruction.len() != input_tensor.len() {
            return Err(model_error(format!(
                "reconstruction has {} values, expected {}",
                reconstruction.len(),
                input_tensor.len()
            )));
        }

        // Mean absolute error per pixel, scaled back to 0..255 and stretched to the original size.
        let errors: Vec<u8> = input_tensor
            .chunks(3)
            .zip(reconstruction.chunks(3))
            .map(|(input, output)| {
                let diff: f32 = input
                    .iter()
                    .zip(output)
                    .map(|(a, b)| (a - b).abs())
                    .sum::<f32>()
                    / 3.0;
                (diff * 255.0).round().clamp(0.0, 255.0) as u8
            })
            .collect();

        let small: GrayImage = ImageBuffer::<Luma<u8>, _>::from_raw(
            IMAGE_DIMENSIONS.0 as u32,
            IMAGE_DIMENSIONS.1 as u32,
            errors,
        )
        .ok_or_else(|| model_error("reconstruction error map has the wrong size"))?;
        let full = image::imageops::resize(
            &small,
            image.width(),
            image.height(),
            FilterType::Triangle,
        );

        finish_detection(
            &image,
            &AnomalyMap::from_gray(&full),
            &self.results_dir,
            image_path,
            self.threshold,
        )
    }
}
