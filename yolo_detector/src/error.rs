use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to fetch model from {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Model storage error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Confidence threshold {0} is outside [0, 1]")]
    InvalidThreshold(f32),
    #[error("Frame is empty")]
    EmptyFrame,
    #[error("Failed to build input tensor: {0}")]
    Preprocess(String),
    #[error("Inference failed: {0}")]
    Runtime(String),
}
