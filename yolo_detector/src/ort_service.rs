use crate::{
    config::ModelConfig,
    detection::{non_max_suppression, Detection},
    error::{InferenceError, ModelError},
    labels::{load_labels_file, parse_names_metadata, ClassLabels},
    model_service::{Detector, ModelHandle, ModelLoader},
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, ArrayD, Axis, Ix2, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::{path::Path, sync::Mutex};

const OUTPUT_NAME: &str = "output0";
const NAMES_METADATA_KEY: &str = "names";

fn transform_image(image: &RgbImage, input_size: u32) -> Array<f32, Ix4> {
    let size = input_size as usize;
    let img = image::imageops::resize(image, input_size, input_size, FilterType::CatmullRom);

    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Decodes a `[1, 4 + classes, anchors]` YOLO head into boxes in source
/// image coordinates. Anchors whose best class scores below `threshold` are
/// dropped before suppression.
fn decode_output(
    output: &ArrayD<f32>,
    threshold: f32,
    iou_threshold: f32,
    input_size: u32,
    img_width: u32,
    img_height: u32,
) -> Result<Vec<Detection>, InferenceError> {
    if output.ndim() != 3 || output.shape()[0] != 1 || output.shape()[1] <= 4 {
        return Err(InferenceError::Runtime(format!(
            "unexpected output shape {:?}",
            output.shape()
        )));
    }

    let scale_x = img_width as f32 / input_size as f32;
    let scale_y = img_height as f32 / input_size as f32;
    let max_x = img_width as f32;
    let max_y = img_height as f32;

    let head = output
        .index_axis(Axis(0), 0)
        .into_dimensionality::<Ix2>()
        .map_err(|e| InferenceError::Runtime(format!("invalid output head: {}", e)))?;
    let mut boxes = Vec::new();

    for anchor in head.axis_iter(Axis(1)) {
        let best = anchor
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|accum, row| if row.1 > accum.1 { row } else { accum });
        let Some((class_id, prob)) = best else {
            continue;
        };

        if prob.is_nan() || prob < threshold {
            continue;
        }

        let xc = anchor[0] * scale_x;
        let yc = anchor[1] * scale_y;
        let w = anchor[2] * scale_x;
        let h = anchor[3] * scale_y;

        let detection = Detection {
            x1: (xc - w / 2.).clamp(0.0, max_x),
            y1: (yc - h / 2.).clamp(0.0, max_y),
            x2: (xc + w / 2.).clamp(0.0, max_x),
            y2: (yc + h / 2.).clamp(0.0, max_y),
            confidence: prob.min(1.0),
            class_id,
        };
        if detection.is_valid() {
            boxes.push(detection);
        }
    }

    Ok(non_max_suppression(boxes, iou_threshold))
}

/// YOLO detector backed by an ONNX Runtime session.
pub struct OrtDetector {
    session: Mutex<Session>,
    input_size: u32,
    iou_threshold: f32,
}

impl OrtDetector {
    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, InferenceError> {
        let mut session = self
            .session
            .lock()
            .map_err(|e| InferenceError::Runtime(format!("session mutex poisoned: {}", e)))?;

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| InferenceError::Preprocess(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| InferenceError::Runtime(format!("inference failed: {}", e)))?;

        let (shape, data) = outputs[OUTPUT_NAME]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Runtime(format!("failed to extract tensor: {}", e)))?;

        let ix = shape.to_ixdyn();
        ArrayD::from_shape_vec(ix, data.to_vec())
            .map_err(|e| InferenceError::Runtime(format!("invalid tensor shape: {}", e)))
    }
}

impl Detector for OrtDetector {
    fn infer(&self, image: &RgbImage, threshold: f32) -> Result<Vec<Detection>, InferenceError> {
        let input = transform_image(image, self.input_size);
        let output = self.run_inference(&input)?;
        decode_output(
            &output,
            threshold,
            self.iou_threshold,
            self.input_size,
            image.width(),
            image.height(),
        )
    }
}

/// Loads `.onnx` YOLO exports with ONNX Runtime.
#[derive(Debug, Clone)]
pub struct OrtLoader {
    config: ModelConfig,
}

impl OrtLoader {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn read_labels(&self, session: &Session) -> Result<ClassLabels, ModelError> {
        if let Some(labels_file) = &self.config.labels_file {
            return load_labels_file(labels_file).map_err(|e| {
                ModelError::Load(format!("failed to read labels {:?}: {}", labels_file, e))
            });
        }

        let metadata = session
            .metadata()
            .map_err(|e| ModelError::Load(format!("failed to read model metadata: {}", e)))?;
        let names = metadata
            .custom(NAMES_METADATA_KEY)
            .map_err(|e| ModelError::Load(format!("failed to read model metadata: {}", e)))?
            .ok_or_else(|| {
                ModelError::Load("model has no `names` metadata and no labels file".to_string())
            })?;

        parse_names_metadata(&names).map_err(ModelError::Load)
    }
}

impl ModelLoader for OrtLoader {
    fn load(&self, model_path: &Path) -> Result<ModelHandle, ModelError> {
        let session = Session::builder()
            .map_err(|e| ModelError::Load(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| ModelError::Load(e.to_string()))?
            .with_intra_threads(self.config.intra_threads)
            .map_err(|e| ModelError::Load(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| ModelError::Load(e.to_string()))?;

        let labels = self.read_labels(&session)?;
        tracing::info!(
            "Loaded ONNX model {:?} with {} class labels",
            model_path,
            labels.len()
        );

        let detector = OrtDetector {
            session: Mutex::new(session),
            input_size: self.config.input_size,
            iou_threshold: self.config.iou_threshold,
        };

        Ok(ModelHandle::new(detector, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::io::Write;

    #[test]
    fn test_transform_image() {
        let img = RgbImage::from_pixel(100, 50, Rgb([255, 0, 0]));

        let input = transform_image(&img, 640);

        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert!((input[[0, 0, 320, 320]] - 1.0).abs() < 1e-3);
        assert!(input[[0, 1, 320, 320]].abs() < 1e-3);
        assert!(input[[0, 2, 320, 320]].abs() < 1e-3);
    }

    fn head(anchors: &[[f32; 6]]) -> ArrayD<f32> {
        // Two classes, laid out as [1, 6, anchors].
        let mut output = Array::zeros((1, 6, anchors.len()));
        for (i, anchor) in anchors.iter().enumerate() {
            for (row, value) in anchor.iter().enumerate() {
                output[[0, row, i]] = *value;
            }
        }
        output.into_dyn()
    }

    #[test]
    fn test_decode_output_rescales_and_filters() {
        let output = head(&[
            [320.0, 320.0, 64.0, 32.0, 0.1, 0.9],
            [100.0, 100.0, 20.0, 20.0, 0.3, 0.2],
        ]);

        let detections = decode_output(&output, 0.5, 0.7, 640, 1280, 320).unwrap();

        assert_eq!(detections.len(), 1);
        let d = detections[0];
        assert_eq!(d.class_id, 1);
        assert!((d.confidence - 0.9).abs() < 1e-6);
        assert!((d.x1 - 576.0).abs() < 1e-3);
        assert!((d.x2 - 704.0).abs() < 1e-3);
        assert!((d.y1 - 152.0).abs() < 1e-3);
        assert!((d.y2 - 168.0).abs() < 1e-3);

        assert_eq!(decode_output(&output, 0.25, 0.7, 640, 1280, 320).unwrap().len(), 2);
    }

    #[test]
    fn test_decode_output_clamps_to_frame() {
        let output = head(&[[5.0, 5.0, 40.0, 40.0, 0.8, 0.0]]);
        let detections = decode_output(&output, 0.5, 0.7, 640, 640, 640).unwrap();
        assert_eq!(detections[0].x1, 0.0);
        assert_eq!(detections[0].y1, 0.0);
    }

    #[test]
    fn test_decode_output_skips_nan_scores() {
        let output = head(&[
            [320.0, 320.0, 64.0, 32.0, f32::NAN, f32::NAN],
            [100.0, 100.0, 20.0, 20.0, f32::NAN, 0.2],
        ]);

        let detections = decode_output(&output, 0.1, 0.7, 640, 640, 640).unwrap();

        assert!(detections.is_empty());
    }

    #[test]
    fn test_decode_output_rejects_bad_shape() {
        let output = Array::<f32, _>::zeros((2, 3)).into_dyn();
        assert!(decode_output(&output, 0.5, 0.7, 640, 640, 640).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_model_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"<html>not a model</html>").unwrap();

        let loader = OrtLoader::new(&ModelConfig::new("http://localhost/model.onnx"));
        assert!(matches!(loader.load(file.path()), Err(ModelError::Load(_))));
    }
}
