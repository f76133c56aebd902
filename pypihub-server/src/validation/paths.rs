//! # Input Validation: Artifact Filenames
//!
//! An artifact filename is a single path component. Anything that could
//! address a different directory, or collide with the hidden bookkeeping
//! files kept inside a bucket (`.record.json`, `.*.part`), is rejected.

use crate::validation::error::ValidationError;
use crate::validation::limits::MAX_FILENAME_LENGTH;
use crate::validation::result::ValidationResult;

/// Distribution formats accepted for upload.
pub const ALLOWED_EXTENSIONS: &[&str] = &[".whl", ".tar.gz", ".zip"];

/// Validate that `filename` names a file directly inside a package bucket.
///
/// # Examples
///
/// ```rust
/// use pypihub_server::validation::validate_artifact_filename;
///
/// assert!(validate_artifact_filename("requests-2.31.0-py3-none-any.whl").is_ok());
/// assert!(validate_artifact_filename("../../etc/passwd").is_err());
/// assert!(validate_artifact_filename(".record.json").is_err());
/// ```
pub fn validate_artifact_filename(filename: &str) -> ValidationResult<()> {
    if filename.is_empty() {
        return Err(ValidationError::TooShort { actual: 0, min: 1 });
    }

    if filename.len() > MAX_FILENAME_LENGTH {
        return Err(ValidationError::TooLong {
            actual: filename.len(),
            max: MAX_FILENAME_LENGTH,
        });
    }

    if filename.contains('\0') {
        return Err(ValidationError::NullBytes);
    }

    if filename.chars().any(|c| c.is_control()) {
        return Err(ValidationError::ControlCharacters);
    }

    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(ValidationError::PathTraversal {
            path: filename.to_string(),
        });
    }

    // Also rules out "." and hidden bookkeeping files.
    if filename.starts_with('.') {
        return Err(ValidationError::InvalidCharacters {
            input: filename.to_string(),
        });
    }

    if filename.contains(':') {
        return Err(ValidationError::InvalidCharacters {
            input: filename.to_string(),
        });
    }

    Ok(())
}

/// Validate that an uploaded filename has a supported distribution extension.
pub fn validate_upload_extension(filename: &str) -> ValidationResult<()> {
    if ALLOWED_EXTENSIONS.iter().any(|ext| filename.ends_with(ext)) {
        Ok(())
    } else {
        Err(ValidationError::InvalidFormat {
            reason: format!(
                "unsupported distribution type for {filename}, expected one of {}",
                ALLOWED_EXTENSIONS.join(", ")
            ),
        })
    }
}
