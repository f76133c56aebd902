//! PyPI-specific utility functions

use regex::Regex;
use std::sync::OnceLock;

/// Normalize a PyPI package name according to PEP 503.
///
/// Lowercases the name and replaces runs of `[-_.]+` with a single `-`, so
/// `Django-REST-framework`, `django_rest_framework` and
/// `django.rest.framework` all resolve to the same name.
///
/// # Examples
///
/// ```
/// # use pypihub_server::pypi_utils::normalize_package_name;
/// assert_eq!(normalize_package_name("Django-REST-framework"), "django-rest-framework");
/// assert_eq!(normalize_package_name("some__package"), "some-package");
/// ```
pub fn normalize_package_name(name: &str) -> String {
    static PYPI_NAME_REGEX: OnceLock<Regex> = OnceLock::new();
    let re = PYPI_NAME_REGEX.get_or_init(|| {
        Regex::new(r"[-_.]+").unwrap_or_else(|e| {
            panic!("Failed to compile PyPI name normalization regex: {}", e)
        })
    });
    re.replace_all(&name.to_lowercase(), "-").to_string()
}

/// Extract the (unnormalized) project name from a distribution filename.
///
/// Wheels carry the name up to the first `-`. Source distributions
/// (`.tar.gz`, `.zip`) carry it up to the last `-` that is followed by a
/// version-looking segment.
pub fn project_name_from_filename(filename: &str) -> Option<String> {
    if filename.ends_with(".whl") {
        return filename
            .find('-')
            .filter(|&pos| pos > 0)
            .map(|pos| filename[..pos].to_string());
    }

    let stem = filename
        .strip_suffix(".tar.gz")
        .or_else(|| filename.strip_suffix(".zip"))?;

    let dash_pos = stem.rfind('-')?;
    let after_dash = &stem[dash_pos + 1..];
    if dash_pos > 0
        && after_dash
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit() || c == 'v')
    {
        return Some(stem[..dash_pos].to_string());
    }

    None
}
