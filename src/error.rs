use thiserror::Error;

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("store failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl SafetyError {
    pub fn not_found(what: impl Into<String>) -> Self {
        SafetyError::NotFound(what.into())
    }

    pub fn validation(why: impl Into<String>) -> Self {
        SafetyError::Validation(why.into())
    }
}
