//! # Input Validation Utilities
//!
//! Checks that run before any name or filename reaches the filesystem.
//! Storage calls these itself, so a path built from a validated filename can
//! never leave its package bucket.

pub mod error;
pub mod limits;
pub mod names;
pub mod paths;
pub mod result;

pub use self::{
    error::ValidationError,
    limits::{validate_file_size, MAX_FILENAME_LENGTH, MAX_PACKAGE_NAME_LENGTH, MAX_UPLOAD_SIZE},
    names::validate_package_name,
    paths::{validate_artifact_filename, validate_upload_extension, ALLOWED_EXTENSIONS},
    result::ValidationResult,
};
