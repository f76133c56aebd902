//! # Input Validation: Size Limits
//!
//! Limits applied to names, filenames and uploaded artifacts.

use crate::validation::error::ValidationError;
use crate::validation::result::ValidationResult;

/// Default maximum artifact upload size (100 MB)
pub const MAX_UPLOAD_SIZE: u64 = 100 * 1024 * 1024;

/// Maximum allowed package name length
pub const MAX_PACKAGE_NAME_LENGTH: usize = 214;

/// Maximum allowed filename length
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Validate file size against limits.
///
/// `max_size` defaults to [`MAX_UPLOAD_SIZE`].
pub fn validate_file_size(size: u64, max_size: Option<u64>) -> ValidationResult<()> {
    let limit = max_size.unwrap_or(MAX_UPLOAD_SIZE);

    if size > limit {
        return Err(ValidationError::FileTooLarge {
            actual: size,
            max: limit,
        });
    }

    Ok(())
}
