//! PEP 503 simple-index pages.
//!
//! Every file link points back at this server (`/packages/{package}/{file}`),
//! whatever source the entry came from, so downloads go through the cache.

use std::fmt::Write;

use crate::types::{artifact_href, IndexEntry, PackageName};

const REPOSITORY_VERSION: &str = "1.0";

/// Escape text for use in HTML content and double-quoted attributes.
pub fn escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn head(title: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n  <head>\n    \
         <meta name=\"pypi:repository-version\" content=\"{REPOSITORY_VERSION}\">\n    \
         <title>{}</title>\n  </head>\n  <body>\n",
        escape(title)
    )
}

const FOOT: &str = "  </body>\n</html>\n";

/// The `/simple/` page listing every known project.
pub fn render_root_index(packages: &[PackageName]) -> String {
    let mut page = head("Simple index");
    for package in packages {
        // writing to a String cannot fail
        let _ = writeln!(
            page,
            "    <a href=\"{0}/\">{0}</a><br/>",
            escape(package.as_str())
        );
    }
    page.push_str(FOOT);
    page
}

/// The `/simple/{package}/` page.
pub fn render_package_page(package: &PackageName, entries: &[IndexEntry]) -> String {
    let mut page = head(&format!("Links for {package}"));
    let _ = writeln!(page, "    <h1>Links for {}</h1>", escape(package.as_str()));

    for entry in entries {
        let mut href = artifact_href(package, &entry.filename);
        if let Some(hash) = &entry.hash {
            href.push('#');
            href.push_str(hash);
        }

        let mut attrs = format!("href=\"{}\"", escape(&href));
        if let Some(requires_python) = &entry.requires_python {
            let _ = write!(attrs, " data-requires-python=\"{}\"", escape(requires_python));
        }
        if let Some(yanked) = &entry.yanked {
            let _ = write!(attrs, " data-yanked=\"{}\"", escape(yanked));
        }
        let _ = writeln!(page, "    <a {attrs}>{}</a><br/>", escape(&entry.filename));
    }

    page.push_str(FOOT);
    page
}
