//! Persistence path validation.
//!
//! Every path handed to `save`/`load` passes through [`validate_path`]
//! before any file is touched: no `..` segments, no null bytes, no system
//! prefixes, length capped at 4096.

use std::path::{Component, Path};

use crate::error::{EngramError, Result};

/// Maximum accepted path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Prefixes that are never valid persistence targets
const FORBIDDEN_PREFIXES: &[&str] = &["/etc", "/proc", "/sys", "/dev"];

/// Validate a persistence path, rejecting traversal and system locations
pub fn validate_path(path: &Path) -> Result<()> {
    let raw = path.to_string_lossy();

    if raw.is_empty() {
        return Err(EngramError::validation("empty path"));
    }
    if raw.len() > MAX_PATH_LEN {
        return Err(EngramError::validation(format!(
            "path exceeds {MAX_PATH_LEN} bytes"
        )));
    }
    if raw.contains('\0') {
        return Err(EngramError::validation("path contains null byte"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(EngramError::validation(format!(
            "path contains parent traversal: {raw}"
        )));
    }
    for prefix in FORBIDDEN_PREFIXES {
        if raw == *prefix || raw.starts_with(&format!("{prefix}/")) {
            return Err(EngramError::validation(format!(
                "refusing system path: {raw}"
            )));
        }
    }
    Ok(())
}
