//! Simple-index page parsing.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{AppError, AppResult};
use crate::types::{IndexEntry, Origin};

static ANCHOR_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("a[href]").unwrap_or_else(|e| panic!("Invalid anchor selector: {e}"))
});

/// Parse an upstream simple-index page into entries, in page order.
///
/// `base_url` is the URL the page was fetched from; relative hrefs are
/// resolved against it. Any anchor that does not resolve to a file URL makes
/// the whole page unusable.
pub fn parse_index_page(body: &[u8], base_url: &Url) -> AppResult<Vec<IndexEntry>> {
    let text = std::str::from_utf8(body)
        .map_err(|e| AppError::Upstream(format!("Index page at {base_url} is not UTF-8: {e}")))?;
    let document = Html::parse_document(text);

    document
        .select(&ANCHOR_SELECTOR)
        .map(|anchor| parse_anchor(anchor, base_url))
        .collect()
}

fn parse_anchor(anchor: ElementRef<'_>, base_url: &Url) -> AppResult<IndexEntry> {
    let element = anchor.value();
    let raw_href = element.attr("href").unwrap_or_default().trim();
    let mut url = base_url
        .join(raw_href)
        .map_err(|e| AppError::Upstream(format!("Unresolvable link {raw_href:?} in {base_url}: {e}")))?;

    let hash = url.fragment().filter(|f| !f.is_empty()).map(str::to_string);
    url.set_fragment(None);

    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| AppError::Upstream(format!("Link {raw_href:?} in {base_url} names no file")))?
        .to_string();

    let filename = if segment.contains('%') {
        let text = anchor.text().collect::<String>();
        let text = text.trim();
        if text.is_empty() { segment } else { text.to_string() }
    } else {
        segment
    };

    Ok(IndexEntry {
        filename,
        href: url.to_string(),
        hash,
        requires_python: element.attr("data-requires-python").map(str::to_string),
        yanked: element.attr("data-yanked").map(str::to_string),
        origin: Origin::Cache,
    })
}
