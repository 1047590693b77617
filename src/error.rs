use thiserror::Error;

/// Unified decoding errors.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("ndarray shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Ensemble mismatch: {0}")]
    Ensemble(String),

    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Scorer: {0}")]
    Scorer(String),

    #[error("Language model: {0}")]
    LanguageModel(String),
}

impl DecodeError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        DecodeError::Config(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Self {
        DecodeError::Input(msg.into())
    }
}
