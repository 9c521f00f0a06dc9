//! Lightweight HTML-to-text extraction.
//!
//! Not a full parser: strips tags, drops script/style bodies, turns block
//! elements into line breaks, and decodes the common entities. Good enough
//! for article text and search result pages.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

const BLOCK_TAGS: &[&str] = &[
    "p", "/p", "br", "div", "/div", "h1", "h2", "h3", "h4", "h5", "h6", "/h1", "/h2", "/h3",
    "/h4", "/h5", "/h6", "li", "tr", "section", "/section", "article", "/article", "blockquote",
    "/blockquote",
];

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "svg", "nav", "footer"];

static TITLE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok());

static TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").ok());

static PUBLISHED_META: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)<meta[^>]+(?:property|name|itemprop)="(?:article:published_time|datePublished|date|pubdate|publish-date|dc\.date)"[^>]+content="([^"]+)""#,
    )
    .ok()
});

/// Readable text of an HTML document.
pub fn extract_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    let mut building_tag = false;
    let mut tag_name = String::new();
    let mut skipping: Option<String> = None;

    for ch in html.chars() {
        if ch == '<' {
            in_tag = true;
            building_tag = true;
            tag_name.clear();
            continue;
        }
        if ch == '>' && in_tag {
            in_tag = false;
            building_tag = false;
            let tag = tag_name.to_lowercase();

            match &skipping {
                Some(open) => {
                    if tag.strip_prefix('/') == Some(open.as_str()) {
                        skipping = None;
                    }
                }
                None => {
                    if SKIPPED_TAGS.contains(&tag.as_str()) {
                        skipping = Some(tag.clone());
                    } else if BLOCK_TAGS.contains(&tag.as_str()) {
                        text.push('\n');
                    }
                }
            }
            continue;
        }
        if in_tag {
            if building_tag && (ch.is_alphanumeric() || ch == '/') {
                tag_name.push(ch);
            } else {
                building_tag = false;
            }
            continue;
        }
        if skipping.is_none() {
            text.push(ch);
        }
    }

    let text = decode_entities(&text);
    let mut lines: Vec<String> = text
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();
    lines.retain(|l| !l.is_empty());
    lines.join("\n")
}

/// Contents of the `<title>` element, if any.
pub fn extract_title(html: &str) -> Option<String> {
    let re = TITLE.as_ref()?;
    let raw = re.captures(html)?.get(1)?.as_str();
    let title = strip_tags(raw);
    (!title.is_empty()).then_some(title)
}

/// Publish date from common article meta tags.
pub fn extract_published_at(html: &str) -> Option<DateTime<Utc>> {
    let re = PUBLISHED_META.as_ref()?;
    let value = re.captures(html)?.get(1)?.as_str().trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    let date_part = value.get(..10)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}

/// Inline markup removed, entities decoded, whitespace collapsed.
pub fn strip_tags(fragment: &str) -> String {
    let without = match TAG.as_ref() {
        Some(re) => re.replace_all(fragment, " ").into_owned(),
        None => fragment.to_string(),
    };
    decode_entities(&without)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        .replace("&rsquo;", "'")
        .replace("&lsquo;", "'")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&mdash;", "-")
        .replace("&ndash;", "-")
        .replace("&amp;", "&")
}
