//! Neutralises preview markup so it can be rendered in an isolated frame:
//! nothing executes and nothing is interactive.

use std::sync::LazyLock;

use regex::{Captures, Regex};

pub const CSP_META: &str =
    r#"<meta http-equiv="Content-Security-Policy" content="script-src 'none'; object-src 'none'">"#;

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid regex"));
static SCRIPT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?script\b[^>]*>").expect("valid regex"));
static EMBED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:iframe|object|embed|applet|frameset)\b[^>]*>.*?</(?:iframe|object|embed|applet|frameset)\s*>")
        .expect("valid regex")
});
static EMBED_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(?:iframe|object|embed|applet|frameset|frame|base)\b[^>]*>").expect("valid regex")
});
static META_REFRESH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta\b[^>]*?http-equiv\s*=\s*["']?\s*refresh[^>]*>"#).expect("valid regex")
});
/// An opening tag; attribute values may be quoted and contain `>`.
static ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<([a-zA-Z][a-zA-Z0-9:-]*)((?:"[^"]*"|'[^']*'|[^'">])*)>"#).expect("valid regex")
});
static EMBEDDED_HANDLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/on[a-z]+\s*=").expect("valid regex"));
static CHAR_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)&(?:#x([0-9a-f]+)|#([0-9]+)|(colon|tab|newline));?").expect("valid regex")
});
static INTERACTIVE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(button|input|select|textarea)\b([^>]*?)(\s*/?)>").expect("valid regex")
});
static DISABLED_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:^|\s)disabled(?:\s|=|$)").expect("valid regex"));
static HEAD_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<head\b[^>]*>").expect("valid regex"));
static HTML_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<html\b[^>]*>").expect("valid regex"));

const SCRIPT_SCHEMES: [&str; 3] = ["javascript:", "vbscript:", "data:text/html"];

/// Strip executable content and disable interactive elements.
pub fn sanitize(markup: &str) -> String {
    let out = SCRIPT_BLOCK.replace_all(markup, "");
    let out = SCRIPT_TAG.replace_all(&out, "");
    let out = EMBED_BLOCK.replace_all(&out, "");
    let out = EMBED_TAG.replace_all(&out, "");
    let out = META_REFRESH.replace_all(&out, "");
    let out = ELEMENT.replace_all(&out, |caps: &Captures| {
        let tag = caps[1].to_ascii_lowercase();
        format!("<{}{}>", &caps[1], rewrite_attributes(&tag, &caps[2]))
    });
    let out = INTERACTIVE_TAG.replace_all(&out, |caps: &Captures| {
        let attrs = &caps[2];
        if DISABLED_ATTR.is_match(attrs) {
            caps[0].to_string()
        } else {
            format!("<{}{} disabled{}>", &caps[1], attrs, &caps[3])
        }
    });
    out.into_owned()
}

struct Attribute<'a> {
    name: &'a str,
    value: Option<&'a str>,
    quoted: bool,
    len: usize,
}

impl<'a> Attribute<'a> {
    fn parse(body: &'a str) -> Self {
        let name_len = match body.find(|c: char| c.is_whitespace() || matches!(c, '/' | '=')) {
            Some(0) => body.chars().next().map_or(1, char::len_utf8),
            Some(n) => n,
            None => body.len(),
        };
        let name = &body[..name_len];
        let Some(after_eq) = body[name_len..].trim_start().strip_prefix('=') else {
            return Self { name, value: None, quoted: false, len: name_len };
        };
        let raw = after_eq.trim_start();
        let value_start = body.len() - raw.len();
        let (value, quoted, value_len) = match raw.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let inner = &raw[1..];
                match inner.find(quote) {
                    Some(end) => (&inner[..end], true, end + 2),
                    None => (inner, true, raw.len()),
                }
            }
            _ => {
                let end = raw.find(char::is_whitespace).unwrap_or(raw.len());
                (&raw[..end], false, end)
            }
        };
        Self {
            name,
            value: Some(value),
            quoted,
            len: value_start + value_len,
        }
    }
}

enum AttributeEdit {
    Keep,
    Drop,
    Rename(&'static str),
}

fn edit_for(tag: &str, attr: &Attribute<'_>) -> AttributeEdit {
    let name = attr.name.to_ascii_lowercase();
    if name.len() > 2 && name.starts_with("on") {
        return AttributeEdit::Drop;
    }
    if let Some(value) = attr.value {
        if is_script_url(value) || (!attr.quoted && EMBEDDED_HANDLER.is_match(value)) {
            return AttributeEdit::Drop;
        }
    }
    match (tag, name.as_str()) {
        ("form", "action") | (_, "formaction") | (_, "srcdoc") => AttributeEdit::Drop,
        ("a" | "area", "href") => AttributeEdit::Rename("data-href"),
        _ => AttributeEdit::Keep,
    }
}

/// Rewrite the attribute list of one opening tag. `/` counts as a separator
/// between attributes, as it does in browsers.
fn rewrite_attributes(tag: &str, attrs: &str) -> String {
    let mut out = String::with_capacity(attrs.len());
    let mut rest = attrs;
    loop {
        let body = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '/');
        let separator = &rest[..rest.len() - body.len()];
        if body.is_empty() {
            out.push_str(separator);
            return out;
        }
        let attr = Attribute::parse(body);
        match edit_for(tag, &attr) {
            AttributeEdit::Keep => {
                out.push_str(separator);
                out.push_str(&body[..attr.len]);
            }
            AttributeEdit::Drop => {}
            AttributeEdit::Rename(name) => {
                out.push_str(separator);
                out.push_str(name);
                out.push_str(&body[attr.name.len()..attr.len]);
            }
        }
        rest = &body[attr.len..];
    }
}

fn is_script_url(value: &str) -> bool {
    let decoded = CHAR_REF.replace_all(value, |caps: &Captures| {
        let code = if let Some(hex) = caps.get(1) {
            u32::from_str_radix(hex.as_str(), 16).ok()
        } else if let Some(dec) = caps.get(2) {
            dec.as_str().parse().ok()
        } else {
            match caps.get(3).map(|m| m.as_str().to_ascii_lowercase()).as_deref() {
                Some("colon") => Some(0x3a),
                Some("tab") => Some(0x09),
                _ => Some(0x0a),
            }
        };
        code.and_then(char::from_u32).map(String::from).unwrap_or_default()
    });
    let compact: String = decoded
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase();
    SCRIPT_SCHEMES.iter().any(|scheme| compact.starts_with(scheme))
}

/// Insert the script-blocking CSP meta tag unless it is already present.
pub fn inject_csp(document: &str) -> String {
    if document.contains(CSP_META) {
        return document.to_string();
    }
    if let Some(head) = HEAD_OPEN.find(document) {
        return splice(document, head.end(), CSP_META);
    }
    if let Some(html) = HTML_OPEN.find(document) {
        return splice(document, html.end(), &format!("<head>{CSP_META}</head>"));
    }
    format!("{CSP_META}{document}")
}

/// Full sandbox pass for a rendered document.
pub fn sandbox_document(document: &str) -> String {
    inject_csp(&sanitize(document))
}

fn splice(document: &str, at: usize, insert: &str) -> String {
    let mut out = String::with_capacity(document.len() + insert.len());
    out.push_str(&document[..at]);
    out.push_str(insert);
    out.push_str(&document[at..]);
    out
}
