//! Upload validation and publishing.

use bytes::Bytes;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::pypi_utils::{normalize_package_name, project_name_from_filename};
use crate::storage::Storage;
use crate::types::{Artifact, Origin, PackageName};
use crate::validation::{
    validate_artifact_filename, validate_file_size, validate_upload_extension, ValidationError,
};

/// An artifact offered for upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub package: PackageName,
    pub filename: String,
    pub content: Bytes,
    /// Only [`Origin::Local`] is accepted.
    pub origin: Origin,
}

impl UploadRequest {
    pub fn local(package: PackageName, filename: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            package,
            filename: filename.into(),
            content: content.into(),
            origin: Origin::Local,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadHandler {
    storage: Storage,
    max_size: u64,
}

impl UploadHandler {
    pub fn new(storage: Storage, max_size: u64) -> Self {
        Self { storage, max_size }
    }

    /// Validate and store an upload. Returns the stored artifact, or
    /// `Conflict` when the filename already exists for the package.
    pub async fn upload(&self, request: UploadRequest) -> AppResult<Artifact> {
        if let Err(e) = self.validate(&request) {
            warn!(package = %request.package, filename = %request.filename, error = %e, "Rejected upload");
            return Err(e);
        }

        let artifact = self
            .storage
            .write_local_artifact(&request.package, &request.filename, &request.content)
            .await?;
        info!(
            package = %artifact.package,
            filename = %artifact.filename,
            size = artifact.size_bytes,
            "Package uploaded successfully"
        );
        Ok(artifact)
    }

    fn validate(&self, request: &UploadRequest) -> AppResult<()> {
        if request.origin != Origin::Local {
            return Err(AppError::InvalidInput(format!(
                "Uploads are stored as local packages, not {}",
                request.origin
            )));
        }

        let filename = request.filename.as_str();
        validate_artifact_filename(filename)?;
        validate_upload_extension(filename)?;

        if request.content.is_empty() {
            return Err(ValidationError::TooShort { actual: 0, min: 1 }.into());
        }
        validate_file_size(request.content.len() as u64, Some(self.max_size))?;

        let project = project_name_from_filename(filename).ok_or_else(|| {
            AppError::InvalidInput(format!("Cannot determine the project name of {filename}"))
        })?;
        if normalize_package_name(&project) != request.package.as_str() {
            return Err(AppError::InvalidInput(format!(
                "{filename} belongs to project {project}, not {}",
                request.package
            )));
        }
        Ok(())
    }
}
