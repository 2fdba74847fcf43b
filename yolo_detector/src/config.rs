use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub url: String,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    /// Optional `label,red,green,blue` file used instead of the model's own
    /// `names` metadata.
    #[serde(default)]
    pub labels_file: Option<PathBuf>,
}

fn default_input_size() -> u32 {
    640
}

fn default_iou_threshold() -> f32 {
    0.7
}

fn default_intra_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl ModelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            input_size: default_input_size(),
            iou_threshold: default_iou_threshold(),
            intra_threads: default_intra_threads(),
            labels_file: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("Model url must not be empty".to_string());
        }
        if self.input_size == 0 || self.input_size % 32 != 0 {
            return Err(format!(
                "Model input size must be a positive multiple of 32, got {}",
                self.input_size
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(format!(
                "IoU threshold must be within [0, 1], got {}",
                self.iou_threshold
            ));
        }
        if let Some(labels_file) = &self.labels_file {
            if !labels_file.exists() {
                return Err(format!("Labels file not found: {:?}", labels_file));
            }
        }
        Ok(())
    }
}
