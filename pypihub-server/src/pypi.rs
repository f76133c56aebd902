//! HTTP handlers for the simple index, downloads, uploads and cache control.
//!
//! Handlers only translate between HTTP and the core components; every
//! decision about sources and precedence is made by the resolver, the cache
//! manager and the upload handler.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Multipart, Path as AxumPath, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::html::{render_package_page, render_root_index};
use crate::pypi_utils::project_name_from_filename;
use crate::state::{AppState, ClearCacheResponse, UploadResponse};
use crate::types::PackageName;
use crate::upload::UploadRequest;

fn moved_permanently(location: String) -> Response {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
}

/// `GET /simple/`: every project with local or cached files.
pub async fn simple_index(State(state): State<Arc<AppState>>) -> AppResult<Html<String>> {
    let packages = state.storage.list_packages().await?;
    debug!(count = packages.len(), "Rendering simple root index");
    Ok(Html(render_root_index(&packages)))
}

/// `GET /simple/{package}`: redirect to the canonical, slash-terminated URL.
pub async fn package_redirect(AxumPath(raw): AxumPath<String>) -> AppResult<Response> {
    let package = PackageName::parse(&raw)?;
    Ok(moved_permanently(format!("/simple/{package}/")))
}

/// `GET /simple/{package}/`: merged local and upstream links.
///
/// Non-normalized spellings are redirected. A package with no files that
/// nobody has ever heard of is a 404; one with a known, empty listing renders
/// an empty page.
pub async fn package_index(
    AxumPath(raw): AxumPath<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Response> {
    let package = PackageName::parse(&raw)?;
    if package.as_str() != raw {
        return Ok(moved_permanently(format!("/simple/{package}/")));
    }

    let entries = state.resolver.build_simple_index_page(&package).await?;
    if entries.is_empty() && !state.resolver.is_known(&package).await {
        return Err(AppError::NotFound(format!("Package not found: {package}")));
    }

    Ok(Html(render_package_page(&package, &entries)).into_response())
}

/// `GET /packages/{package}/{filename}`: stream an artifact, fetching it
/// from the upstream on a miss.
pub async fn download_file(
    AxumPath((raw, filename)): AxumPath<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Response> {
    let package = PackageName::parse(&raw)?;
    let opened = state.open_artifact(&package, &filename).await?;
    info!(
        package = %package,
        filename = %filename,
        origin = %opened.artifact.origin,
        size = opened.artifact.size_bytes,
        "Serving package file"
    );

    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
        (header::CONTENT_LENGTH, HeaderValue::from(opened.artifact.size_bytes)),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(opened.file))).into_response())
}

/// `POST /`: twine-compatible upload.
///
/// Reads the `name` field and the `content` file field. When `name` is
/// missing, the project name is taken from the filename.
pub async fn upload_package(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<UploadResponse>)> {
    info!("Processing package upload");
    let mut name = None;
    let mut file = None;

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            ":action" => {
                let action = field.text().await?;
                if action != "file_upload" {
                    return Err(AppError::InvalidInput(format!("Unsupported action: {action}")));
                }
            }
            "name" => name = Some(field.text().await?),
            "content" => {
                let filename = field
                    .file_name()
                    .ok_or_else(|| AppError::InvalidInput("Missing filename in upload".to_string()))?
                    .to_string();
                let data = field.bytes().await?;
                debug!(filename = %filename, size = data.len(), "Read package data");
                file = Some((filename, data));
            }
            _ => {
                // Metadata fields twine sends along are not needed.
                field.bytes().await?;
            }
        }
    }

    let (filename, data) =
        file.ok_or_else(|| AppError::InvalidInput("No package file in upload".to_string()))?;
    let name = match name {
        Some(name) => name,
        None => project_name_from_filename(&filename).ok_or_else(|| {
            AppError::InvalidInput(format!("Cannot determine the project name of {filename}"))
        })?,
    };
    let package = PackageName::parse(&name)?;

    let artifact = state
        .uploads
        .upload(UploadRequest::local(package, filename, data))
        .await?;
    Ok((StatusCode::CREATED, Json(artifact.into())))
}

/// `DELETE /cache/{package}/`: drop the mirrored files and cache record.
pub async fn clear_cache(
    AxumPath(raw): AxumPath<String>,
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ClearCacheResponse>> {
    let package = PackageName::parse(&raw)?;
    let cleared = state.cache.clear(&package).await?;
    Ok(Json(ClearCacheResponse {
        package: package.to_string(),
        cleared,
    }))
}
