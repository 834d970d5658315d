//! Error taxonomy for the memory core.
//!
//! Six stable kinds, surfaced unchanged at every public boundary:
//!
//! - **Validation**: bad input (dimension, path, batch size). Never retried.
//! - **NotFound**: unknown id/certificate/backend on an imperative operation.
//!   Pure lookups return `Option` instead.
//! - **Corrupt**: invalid index file, bad JSON, witness-chain stride
//!   violation, hash mismatch. Fatal for the affected file only.
//! - **Capacity**: index full, intent count exceeded, trajectory buffer full.
//! - **Cancelled**: cooperative cancellation token tripped.
//! - **Backend**: underlying backend unavailable or failed; carries an
//!   installation hint.

/// Core error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngramError {
    /// Invalid input; surfaced to the caller verbatim
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown id on an imperative operation
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid on-disk state; disables only the affected file
    #[error("corrupt {file}: {reason}")]
    Corrupt {
        /// File or logical subsystem that failed
        file: String,
        /// What was wrong with it
        reason: String,
    },

    /// A bounded resource is full
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Cooperative cancellation token tripped
    #[error("cancelled during {0}")]
    Cancelled(String),

    /// Underlying backend unavailable or failed
    #[error("backend error: {reason} (hint: {hint})")]
    Backend {
        /// What went wrong
        reason: String,
        /// How to make the backend available
        hint: String,
    },
}

impl EngramError {
    /// Validation error from anything displayable
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Corrupt-file error
    pub fn corrupt(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            file: file.into(),
            reason: reason.into(),
        }
    }

    /// Backend error with an installation hint
    pub fn backend(reason: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
            hint: hint.into(),
        }
    }

    /// True for the kinds that leave all state intact
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::Capacity(_) | Self::Cancelled(_)
        )
    }
}

impl From<serde_json::Error> for EngramError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt {
            file: "json".to_string(),
            reason: e.to_string(),
        }
    }
}

impl From<rusqlite::Error> for EngramError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend {
            reason: format!("sqlite: {e}"),
            hint: "check that the store database is writable".to_string(),
        }
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, EngramError>;
