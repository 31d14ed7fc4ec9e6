//! Domain error taxonomy.
//!
//! Each variant maps to one recovery policy:
//!
//! | Variant | Policy |
//! |---------|--------|
//! | [`CopilotError::Validation`] | ETL row skipped, counted, reason reported |
//! | [`CopilotError::InsufficientData`] | recommendation skipped, not an error to the caller |
//! | [`CopilotError::Retrieval`] | Q&A answers 503; KPIs stay up |
//! | [`CopilotError::Generation`] | Q&A answers 502 with the retrieved sources |
//! | [`CopilotError::SecurityRejection`] | Q&A answers 400 with a non-leaking message |

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CopilotError>;

#[derive(Error, Debug)]
pub enum CopilotError {
    #[error("row {row}: {reason}")]
    Validation { row: usize, reason: String },

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("retrieval index unavailable: {0}")]
    Retrieval(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("request rejected: {0}")]
    SecurityRejection(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CopilotError {
    pub fn validation(row: usize, reason: impl Into<String>) -> Self {
        CopilotError::Validation {
            row,
            reason: reason.into(),
        }
    }
}
