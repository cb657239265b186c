use thiserror::Error;

/// Errors surfaced by the generation and parity paths.
///
/// Checkpoint parameter-name mismatches are deliberately absent: a partial
/// load is reported through `checkpoint::LoadReport` and logged, never raised.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {reason}")]
    Config { reason: String },

    #[error("prompt of {len} tokens exceeds the maximum sequence length {max}")]
    SequenceTooLong { len: usize, max: usize },

    #[error("invalid sampling parameter: {reason}")]
    InvalidParameter { reason: String },

    #[error("sampling distribution is degenerate after filtering")]
    SamplingDegenerate,

    #[error("cache tensors live on {found} but the model expects {expected}")]
    DeviceMismatch { expected: String, found: String },

    #[error("checkpoint error: {reason}")]
    Checkpoint { reason: String },

    #[error("tokenizer error: {reason}")]
    Tokenizer { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
