use crate::{
    detection::Detection,
    error::{InferenceError, ModelError},
    labels::{ClassLabels, ColorLabel},
};
use image::RgbImage;
use std::{borrow::Cow, path::Path};

/// Runs a loaded model on a single RGB frame.
///
/// Implementations return detections with `confidence >= threshold`.
pub trait Detector: Send + Sync + 'static {
    fn infer(&self, image: &RgbImage, threshold: f32) -> Result<Vec<Detection>, InferenceError>;
}

/// Turns a model artifact on disk into a ready to query handle.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, model_path: &Path) -> Result<ModelHandle, ModelError>;
}

/// A loaded detection model and its class labels. Never mutated after load.
pub struct ModelHandle {
    detector: Box<dyn Detector>,
    labels: ClassLabels,
}

impl ModelHandle {
    pub fn new(detector: impl Detector, labels: ClassLabels) -> Self {
        Self {
            detector: Box::new(detector),
            labels,
        }
    }

    pub fn labels(&self) -> &ClassLabels {
        &self.labels
    }

    pub fn label(&self, class_id: usize) -> Cow<'_, ColorLabel> {
        match self.labels.get(class_id) {
            Some(label) => Cow::Borrowed(label),
            None => Cow::Owned(ColorLabel::new(format!("Unknown class {}", class_id))),
        }
    }

    /// Detects objects in `image`, keeping only those at or above `threshold`.
    pub fn detect(
        &self,
        image: &RgbImage,
        threshold: f32,
    ) -> Result<Vec<Detection>, InferenceError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(InferenceError::InvalidThreshold(threshold));
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(InferenceError::EmptyFrame);
        }

        let mut detections = self.detector.infer(image, threshold)?;
        detections.retain(|d| d.confidence >= threshold && d.is_valid());

        tracing::debug!("Detected {} objects", detections.len());
        for (i, detection) in detections.iter().enumerate() {
            tracing::trace!(
                "Detection {}: class_id={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.class_id,
                detection.confidence,
                detection.x1,
                detection.y1,
                detection.x2,
                detection.y2
            );
        }

        Ok(detections)
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("labels", &self.labels.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockDetector {}

    impl Detector for MockDetector {
        fn infer(&self, _image: &RgbImage, _threshold: f32) -> Result<Vec<Detection>, InferenceError> {
            // Deliberately ignores the threshold so the handle has to filter.
            Ok(vec![
                Detection {
                    x1: 10.0,
                    y1: 20.0,
                    x2: 100.0,
                    y2: 150.0,
                    confidence: 0.95,
                    class_id: 2,
                },
                Detection {
                    x1: 200.0,
                    y1: 50.0,
                    x2: 300.0,
                    y2: 200.0,
                    confidence: 0.40,
                    class_id: 7,
                },
            ])
        }
    }

    fn handle() -> ModelHandle {
        ModelHandle::new(MockDetector {}, ClassLabels::from_names(["person", "bicycle", "car"]))
    }

    #[test]
    fn test_detect_filters_by_threshold() {
        let image = RgbImage::new(320, 240);
        let handle = handle();

        assert_eq!(handle.detect(&image, 0.3).unwrap().len(), 2);

        let detections = handle.detect(&image, 0.5).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_id, 2);

        assert!(handle.detect(&image, 0.99).unwrap().is_empty());
    }

    #[test]
    fn test_detect_rejects_invalid_input() {
        let handle = handle();
        assert!(matches!(
            handle.detect(&RgbImage::new(32, 32), 1.5),
            Err(InferenceError::InvalidThreshold(_))
        ));
        assert!(matches!(
            handle.detect(&RgbImage::new(0, 0), 0.5),
            Err(InferenceError::EmptyFrame)
        ));
    }

    #[test]
    fn test_label_lookup() {
        let handle = handle();
        assert_eq!(handle.label(2).label, "car");
        assert_eq!(handle.label(7).label, "Unknown class 7");
    }
}
