//! Path Safety for case and evidence identifiers
//!
//! Case ids become directory names under `Investigations/` and evidence ids become
//! blob file names, so both must be a single, inert path component:
//! 1. Not empty and not longer than `MAX_COMPONENT_LEN`
//! 2. No separators, NUL bytes, "." or ".."
//! 3. Nothing that looks like an absolute or drive-prefixed path

use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MAX_COMPONENT_LEN: usize = 128;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathValidationError {
    #[error("Empty path component")]
    Empty,

    #[error("Path component too long ({len} > {max})")]
    TooLong { len: usize, max: usize },

    #[error("Path traversal detected in: {component}")]
    Traversal { component: String },

    #[error("Absolute path not allowed: {component}")]
    Absolute { component: String },

    #[error("Invalid character in path component: {component}")]
    InvalidCharacter { component: String },
}

/// Validate that a user-supplied identifier is safe to use as one path component
pub fn validate_path_component(component: &str) -> Result<(), PathValidationError> {
    if component.is_empty() {
        return Err(PathValidationError::Empty);
    }

    if component.len() > MAX_COMPONENT_LEN {
        return Err(PathValidationError::TooLong {
            len: component.len(),
            max: MAX_COMPONENT_LEN,
        });
    }

    if component.contains('\0') || component.chars().any(|c| c.is_control()) {
        return Err(PathValidationError::InvalidCharacter {
            component: component.escape_debug().to_string(),
        });
    }

    if component.contains('/') || component.contains('\\') {
        return Err(PathValidationError::Traversal {
            component: component.to_string(),
        });
    }

    if component == "." || component == ".." {
        return Err(PathValidationError::Traversal {
            component: component.to_string(),
        });
    }

    // Windows drive prefix ("C:")
    if component.len() >= 2 && component.chars().nth(1) == Some(':') {
        return Err(PathValidationError::Absolute {
            component: component.to_string(),
        });
    }

    Ok(())
}

/// Join a validated component onto a base directory
pub fn safe_join(base: &Path, component: &str) -> Result<PathBuf, PathValidationError> {
    validate_path_component(component)?;
    Ok(base.join(component))
}
