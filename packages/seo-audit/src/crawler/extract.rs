//! HTML extraction with `scraper`.

use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::models::{Headings, ImageRecord, LinkRecord, PageData};

lazy_static! {
    static ref TITLE: Selector = Selector::parse("title").unwrap();
    static ref META_DESCRIPTION: Selector =
        Selector::parse(r#"meta[name="description"]"#).unwrap();
    static ref H1: Selector = Selector::parse("h1").unwrap();
    static ref H2: Selector = Selector::parse("h2").unwrap();
    static ref H3: Selector = Selector::parse("h3").unwrap();
    static ref IMG: Selector = Selector::parse("img").unwrap();
    static ref ANCHOR: Selector = Selector::parse("a[href]").unwrap();
}

/// Extract title, meta description, headings, images and links.
///
/// Relative URLs are resolved against `base`. Links are kept in document
/// order with duplicates removed.
pub fn extract_page(html: &str, base: &Url) -> PageData {
    let document = Html::parse_document(html);

    let title = document
        .select(&TITLE)
        .next()
        .map(text_of)
        .filter(|t| !t.is_empty());

    let meta_description = document
        .select(&META_DESCRIPTION)
        .next()
        .and_then(|m| m.value().attr("content"))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    let headings = Headings {
        h1: document.select(&H1).map(text_of).collect(),
        h2: document.select(&H2).map(text_of).collect(),
        h3: document.select(&H3).map(text_of).collect(),
    };

    let images = document
        .select(&IMG)
        .filter_map(|img| {
            let src = img.value().attr("src")?.trim();
            if src.is_empty() {
                return None;
            }
            Some(ImageRecord {
                src: base
                    .join(src)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| src.to_string()),
                alt: img.value().attr("alt").map(|a| a.trim().to_string()),
            })
        })
        .collect();

    let mut links: Vec<LinkRecord> = Vec::new();
    for anchor in document.select(&ANCHOR) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(url) = resolve_link(base, href) else {
            continue;
        };
        let url_str = url.to_string();
        if links.iter().any(|l| l.url == url_str) {
            continue;
        }
        links.push(LinkRecord {
            external: url.host_str() != base.host_str(),
            url: url_str,
            text: text_of(anchor),
        });
    }

    PageData {
        title,
        meta_description,
        headings,
        images,
        links,
        error: None,
    }
}

/// Resolve an href to an absolute http(s) URL without its fragment.
pub fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
    {
        return None;
    }

    let mut url = base.join(href).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(|t| t.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}
