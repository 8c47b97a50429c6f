use std::path::PathBuf;

/// Errors raised while building, training or evaluating a re-id model.
#[derive(Debug, thiserror::Error)]
pub enum ReidError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("light_model was enabled, expected teacher model at {0} but file does not exist")]
    MissingTeacher(PathBuf),

    #[error("Checkpoint {path} could not be loaded: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("No cache found for backpropagation in {0}")]
    MissingCache(&'static str),

    #[error("Unsupported feature shape: {0}")]
    UnsupportedFeatureShape(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, ReidError>;
