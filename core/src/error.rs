use thiserror::Error;

/// Domain failures raised by the store.
///
/// Store functions return `anyhow::Result`; these variants travel inside the
/// `anyhow::Error` so callers at a boundary (HTTP, CLI) can downcast and pick
/// a status. Anything that is not a `LarderError` is a persistence failure.
#[derive(Debug, Error)]
pub enum LarderError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
}

impl LarderError {
    pub fn validation(msg: impl Into<String>) -> anyhow::Error {
        Self::Validation(msg.into()).into()
    }

    pub fn not_found(msg: impl Into<String>) -> anyhow::Error {
        Self::NotFound(msg.into()).into()
    }

    pub fn conflict(msg: impl Into<String>) -> anyhow::Error {
        Self::Conflict(msg.into()).into()
    }
}

/// Returns the domain error carried by `err`, if any.
pub fn classify(err: &anyhow::Error) -> Option<&LarderError> {
    err.downcast_ref::<LarderError>()
}
