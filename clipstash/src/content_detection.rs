//! Content classification for clipboard offers
//!
//! Decides the semantic kind of an offer, which representation of a selection
//! gets persisted, how it is previewed, and which MIME type to advertise when a
//! stored selection is placed back on the clipboard.

use std::io::Cursor;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use crate::interface::{Kind, Offer};

/// Maximum preview length in characters for text content
pub const TEXT_PREVIEW_CHARS: usize = 50;

/// `application/*` subtypes that are really text
const APPLICATION_TEXT_SUBTYPES: &[&str] = &["json", "xml", "javascript", "sql"];

static HTML_COMMENT_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static HTML_SCRIPT_STYLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<\s*(?:script|style|head)\b[^>]*>.*?<\s*/\s*(?:script|style|head)\s*>").unwrap()
});

static HTML_BLOCK_BREAK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<\s*(?:br\b[^>]*|/\s*(?:p|div|li|tr|h[1-6]|blockquote|pre|table|ul|ol|dt|dd))\s*>").unwrap()
});

static HTML_TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

static HTML_ENTITY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[xX][0-9a-fA-F]{1,6}|#[0-9]{1,7}|[a-zA-Z]{2,8});").unwrap());

static WHITESPACE_RUN_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static BLANK_LINES_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Lowercased MIME essence, without parameters (`text/plain;charset=utf-8` → `text/plain`)
pub(crate) fn essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or(mime_type)
        .trim()
        .to_ascii_lowercase()
}

/// Parse offer bytes as an absolute URL
///
/// Surrounding whitespace is tolerated (terminals append newlines), interior
/// whitespace is not.
fn parse_link(data: &[u8]) -> Option<Url> {
    let text = std::str::from_utf8(data).ok()?.trim();
    if text.is_empty() || text.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return None;
    }
    let url = Url::parse(text).ok()?;
    if url.scheme().is_empty() {
        return None;
    }
    Some(url)
}

/// Determine the semantic kind of an offer
pub fn classify_kind(mime_type: &str, data: &[u8]) -> Kind {
    let mime = essence(mime_type);

    if mime.starts_with("image/") {
        return Kind::Image;
    }

    if mime.starts_with("text/") {
        if mime == "text/html" {
            return Kind::Text;
        }
        return if parse_link(data).is_some() {
            Kind::Link
        } else {
            Kind::Text
        };
    }

    if let Some(subtype) = mime.strip_prefix("application/") {
        if APPLICATION_TEXT_SUBTYPES.contains(&subtype) {
            return Kind::Text;
        }
    }

    Kind::Unknown
}

/// Host of a link, only for http(s) URLs
pub fn url_host(data: &[u8]) -> Option<String> {
    let url = parse_link(data)?;
    if !url.scheme().starts_with("http") {
        return None;
    }
    url.host_str().map(str::to_string)
}

/// Pick the single representation persisted for a selection.
///
/// Strict priority: `text/plain`, then the first `image/*`, then `text/html`
/// converted to plain text. Returns `None` when none is present.
pub fn select_preferred_offer(offers: &[Offer]) -> Option<Offer> {
    if let Some(plain) = offers.iter().find(|o| essence(&o.mime_type) == "text/plain") {
        return Some(Offer::new("text/plain", plain.data.clone()));
    }

    if let Some(image) = offers.iter().find(|o| essence(&o.mime_type).starts_with("image/")) {
        return Some(image.clone());
    }

    if let Some(html) = offers.iter().find(|o| essence(&o.mime_type) == "text/html") {
        let text = html_to_text(&String::from_utf8_lossy(&html.data));
        return Some(Offer::new("text/plain", text.into_bytes()));
    }

    None
}

/// Placement priority of a single MIME type (higher wins)
fn placement_priority(mime_type: &str) -> u8 {
    const OTHER: u8 = 1;
    const HTML_TEXT: u8 = 2;
    const TEXT: u8 = 3;
    const GENERIC_IMAGE: u8 = 4;
    const IMAGE_JPEG: u8 = 5;
    const IMAGE_PNG: u8 = 6;
    const IMAGE_SVG: u8 = 7;

    let mime = essence(mime_type);
    match mime.as_str() {
        "text/html" => HTML_TEXT,
        "text/svg" | "image/svg+xml" => IMAGE_SVG,
        "image/jpeg" => IMAGE_JPEG,
        "image/png" => IMAGE_PNG,
        m if m.starts_with("text/") => TEXT,
        m if m.starts_with("image/") => GENERIC_IMAGE,
        _ => OTHER,
    }
}

/// MIME type to advertise when a stored multi-offer selection is placed on
/// the clipboard. Not interchangeable with [`select_preferred_offer`].
pub fn preferred_mime_type(offers: &[Offer]) -> Option<&str> {
    let mut best: Option<(u8, &str)> = None;
    for offer in offers {
        if offer.mime_type.starts_with("text/_moz_html") {
            continue;
        }
        let priority = placement_priority(&offer.mime_type);
        if best.map_or(true, |(p, _)| priority > p) {
            best = Some((priority, offer.mime_type.as_str()));
        }
    }
    best.map(|(_, mime)| mime)
}

/// Short display text for an offer
pub fn text_preview(mime_type: &str, data: &[u8]) -> String {
    match classify_kind(mime_type, data) {
        Kind::Text | Kind::Link => {
            let text = String::from_utf8_lossy(data);
            let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
            collapsed.chars().take(TEXT_PREVIEW_CHARS).collect()
        }
        Kind::Image => match image_dimensions(data) {
            Some((width, height)) => format!("Image {}x{}", width, height),
            None => "Image".to_string(),
        },
        Kind::Unknown => "Unnamed".to_string(),
    }
}

fn image_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

fn decode_entity(caps: &Captures) -> String {
    let entity = &caps[1];
    let decoded = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
        u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
    } else if let Some(dec) = entity.strip_prefix('#') {
        dec.parse::<u32>().ok().and_then(char::from_u32)
    } else {
        match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            "copy" => Some('©'),
            "reg" => Some('®'),
            "hellip" => Some('…'),
            "mdash" => Some('—'),
            "ndash" => Some('–'),
            _ => None,
        }
    };
    match decoded {
        Some(c) => c.to_string(),
        None => caps[0].to_string(),
    }
}

/// Convert HTML markup to plain text: drop tags, decode entities, keep block
/// boundaries as line breaks.
pub fn html_to_text(html: &str) -> String {
    let text = HTML_COMMENT_REGEX.replace_all(html, "");
    let text = HTML_SCRIPT_STYLE_REGEX.replace_all(&text, "");
    let text = WHITESPACE_RUN_REGEX.replace_all(&text, " ");
    let text = HTML_BLOCK_BREAK_REGEX.replace_all(&text, "\n");
    let text = HTML_TAG_REGEX.replace_all(&text, "");
    let text = HTML_ENTITY_REGEX.replace_all(&text, decode_entity);

    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let joined = lines.join("\n");
    BLANK_LINES_REGEX
        .replace_all(joined.trim(), "\n\n")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::new(width, height);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_classify_kind() {
        assert_eq!(classify_kind("image/png", &png_bytes(2, 2)), Kind::Image);
        assert_eq!(classify_kind("text/plain", b"hello"), Kind::Text);
        assert_eq!(classify_kind("text/plain", b"https://example.com"), Kind::Link);
        assert_eq!(classify_kind("application/json", b"{}"), Kind::Text);
        assert_eq!(classify_kind("application/octet-stream", &[0, 1, 2]), Kind::Unknown);
    }

    #[test]
    fn test_classify_html_is_always_text() {
        assert_eq!(classify_kind("text/html", b"https://example.com"), Kind::Text);
    }

    #[test]
    fn test_classify_mime_parameters_ignored() {
        assert_eq!(classify_kind("text/plain;charset=utf-8", b"https://a.io"), Kind::Link);
        assert_eq!(classify_kind("Application/XML", b"<a/>"), Kind::Text);
    }

    #[test]
    fn test_link_requires_absolute_url_without_spaces() {
        assert_eq!(classify_kind("text/plain", b"example.com"), Kind::Text);
        assert_eq!(classify_kind("text/plain", b"Note: buy milk"), Kind::Text);
        assert_eq!(classify_kind("text/plain", b"https://example.com\n"), Kind::Link);
        assert_eq!(classify_kind("text/plain", b"mailto:user@example.com"), Kind::Link);
        assert_eq!(classify_kind("text/plain", &[0xff, 0xfe]), Kind::Text);
    }

    #[test]
    fn test_url_host_only_for_http() {
        assert_eq!(url_host(b"https://docs.rs/tokio"), Some("docs.rs".to_string()));
        assert_eq!(url_host(b"http://localhost:8080/x"), Some("localhost".to_string()));
        assert_eq!(url_host(b"ftp://files.example.com"), None);
        assert_eq!(url_host(b"not a link"), None);
    }

    #[test]
    fn test_select_prefers_plain_text() {
        let offers = vec![
            Offer::new("text/html", b"<b>bold</b>".to_vec()),
            Offer::new("text/plain", b"bold".to_vec()),
        ];
        let chosen = select_preferred_offer(&offers).unwrap();
        assert_eq!(chosen.mime_type, "text/plain");
        assert_eq!(chosen.data, b"bold");
    }

    #[test]
    fn test_select_image_over_html() {
        let png = png_bytes(3, 3);
        let offers = vec![
            Offer::new("text/html", b"<img src=x>".to_vec()),
            Offer::new("image/png", png.clone()),
            Offer::new("image/jpeg", vec![1, 2, 3]),
        ];
        let chosen = select_preferred_offer(&offers).unwrap();
        assert_eq!(chosen.mime_type, "image/png");
        assert_eq!(chosen.data, png);
    }

    #[test]
    fn test_select_html_converted_to_text() {
        let offers = vec![Offer::new("text/html", b"<p>Hello <b>world</b></p>".to_vec())];
        let chosen = select_preferred_offer(&offers).unwrap();
        assert_eq!(chosen.mime_type, "text/plain");
        assert_eq!(chosen.data, b"Hello world");
    }

    #[test]
    fn test_select_unsupported() {
        let offers = vec![Offer::new("application/octet-stream", vec![1, 2, 3])];
        assert!(select_preferred_offer(&offers).is_none());
    }

    #[test]
    fn test_placement_priority_ranking() {
        let offers = vec![
            Offer::new("text/plain", b"a".to_vec()),
            Offer::new("text/html", b"<a>".to_vec()),
        ];
        assert_eq!(preferred_mime_type(&offers), Some("text/plain"));

        let offers = vec![
            Offer::new("image/jpeg", vec![1]),
            Offer::new("image/png", vec![1]),
            Offer::new("text/plain", b"a".to_vec()),
        ];
        assert_eq!(preferred_mime_type(&offers), Some("image/png"));

        let offers = vec![
            Offer::new("image/png", vec![1]),
            Offer::new("image/svg+xml", b"<svg/>".to_vec()),
        ];
        assert_eq!(preferred_mime_type(&offers), Some("image/svg+xml"));

        let offers = vec![
            Offer::new("text/plain", b"a".to_vec()),
            Offer::new("image/bmp", vec![1]),
        ];
        assert_eq!(preferred_mime_type(&offers), Some("image/bmp"));

        let offers = vec![
            Offer::new("application/x-custom", vec![1]),
            Offer::new("text/html", b"<a>".to_vec()),
        ];
        assert_eq!(preferred_mime_type(&offers), Some("text/html"));
    }

    #[test]
    fn test_placement_skips_moz_html_and_keeps_first_on_tie() {
        let offers = vec![
            Offer::new("text/_moz_htmlcontext", b"x".to_vec()),
            Offer::new("text/plain", b"a".to_vec()),
            Offer::new("text/x-moz-url", b"b".to_vec()),
        ];
        assert_eq!(preferred_mime_type(&offers), Some("text/plain"));
        assert_eq!(preferred_mime_type(&[]), None);
    }

    #[test]
    fn test_text_preview_collapses_and_truncates() {
        let preview = text_preview("text/plain", b"  hello \n\n\t world  ");
        assert_eq!(preview, "hello world");

        let long = "x".repeat(200);
        assert_eq!(text_preview("text/plain", long.as_bytes()).chars().count(), 50);

        let multibyte = "é".repeat(80);
        assert_eq!(text_preview("text/plain", multibyte.as_bytes()), "é".repeat(50));
    }

    #[test]
    fn test_image_preview() {
        assert_eq!(text_preview("image/png", &png_bytes(640, 480)), "Image 640x480");
        assert_eq!(text_preview("image/png", b"garbage"), "Image");
    }

    #[test]
    fn test_unknown_preview() {
        assert_eq!(text_preview("application/pdf", b"%PDF"), "Unnamed");
    }

    #[test]
    fn test_html_to_text() {
        let html = r#"<html><head><title>t</title><style>p { color: red }</style></head>
            <body><!-- note --><p>Hello&nbsp;<b>world</b></p><p>Tom &amp; Jerry &#39;s &#x41;</p>
            <script>alert(1)</script><ul><li>one</li><li>two</li></ul></body></html>"#;
        assert_eq!(html_to_text(html), "Hello world\nTom & Jerry 's A\none\ntwo");
    }

    #[test]
    fn test_html_to_text_unknown_entity_kept() {
        assert_eq!(html_to_text("a &bogus; b<br>c"), "a &bogus; b\nc");
    }
}
