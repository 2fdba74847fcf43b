mod detection;
mod error;
mod labels;
mod model_service;
mod ort_service;
mod provider;

pub mod config;

pub use detection::{iou, non_max_suppression, Detection};
pub use error::{InferenceError, ModelError};
pub use labels::{load_labels_file, parse_names_metadata, ClassLabels, ColorLabel};
pub use model_service::{Detector, ModelHandle, ModelLoader};
pub use ort_service::{OrtDetector, OrtLoader};
pub use provider::ModelProvider;
