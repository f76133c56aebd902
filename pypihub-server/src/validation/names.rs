//! # Input Validation: Package Names
//!
//! PEP 508 project names: ASCII letters and digits at both ends, with `.`,
//! `-` and `_` allowed in between.

use crate::validation::error::ValidationError;
use crate::validation::limits::MAX_PACKAGE_NAME_LENGTH;
use crate::validation::result::ValidationResult;

/// Validate a raw (not yet normalized) package name.
pub fn validate_package_name(name: &str) -> ValidationResult<()> {
    if name.is_empty() {
        return Err(ValidationError::TooShort { actual: 0, min: 1 });
    }

    if name.len() > MAX_PACKAGE_NAME_LENGTH {
        return Err(ValidationError::TooLong {
            actual: name.len(),
            max: MAX_PACKAGE_NAME_LENGTH,
        });
    }

    if name.contains('\0') {
        return Err(ValidationError::NullBytes);
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(ValidationError::ControlCharacters);
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(ValidationError::InvalidCharacters {
            input: name.to_string(),
        });
    }

    let edges_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if !edges_ok {
        return Err(ValidationError::InvalidFormat {
            reason: format!("package name must start and end with a letter or digit: {name}"),
        });
    }

    Ok(())
}
