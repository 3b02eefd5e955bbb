//! Download link discovery in rendered page HTML.

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use url::Url;

use super::patterns::UrlPattern;

static DOWNLOAD_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse("#download-link").expect("valid selector"));
static ANCHORS: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("valid selector"));

/// `#download-link`'s target if present, else the first anchor whose
/// absolute href matches one of `patterns`. Relative hrefs resolve against
/// `page_url`.
pub fn find_download_link(html: &str, page_url: &Url, patterns: &[UrlPattern]) -> Option<Url> {
    let document = Html::parse_document(html);

    if let Some(element) = document.select(&DOWNLOAD_LINK).next()
        && let Some(href) = element.value().attr("href")
        && let Some(url) = resolve(page_url, href)
    {
        return Some(url);
    }

    document
        .select(&ANCHORS)
        .filter_map(|element| element.value().attr("href"))
        .filter_map(|href| resolve(page_url, href))
        .find(|url| patterns.iter().any(|pattern| pattern.matches(url.as_str())))
}

fn resolve(base: &Url, href: &str) -> Option<Url> {
    let href = html_escape::decode_html_entities(href.trim());
    if href.is_empty() || href.starts_with("javascript:") || href.starts_with('#') {
        return None;
    }
    base.join(&href).ok()
}
