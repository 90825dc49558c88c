//! Just enough XML for the flat documents storage services exchange:
//! escaping for request bodies and tag extraction for responses.
//!
//! Responses are scanned, not validated. Elements are matched by local name
//! and must not nest inside an element of the same name.

/// Escape text for inclusion in an element or attribute.
pub fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Undo [`escape`] plus numeric character references.
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(end) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Raw inner content of every `<tag>` element in `doc`, in document order.
pub fn elements<'a>(doc: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut found = Vec::new();
    let mut rest = doc;

    while let Some(start) = rest.find(&open) {
        let after_name = &rest[start + open.len()..];
        // `<Key` must not match `<KeyCount>`.
        match after_name.chars().next() {
            Some('>') | Some(' ') | Some('/') | Some('\t') | Some('\n') | Some('\r') => {}
            _ => {
                rest = after_name;
                continue;
            }
        }
        let Some(gt) = after_name.find('>') else {
            break;
        };
        if after_name[..gt].ends_with('/') {
            found.push("");
            rest = &after_name[gt + 1..];
            continue;
        }
        let body = &after_name[gt + 1..];
        let Some(end) = body.find(&close) else {
            break;
        };
        found.push(&body[..end]);
        rest = &body[end + close.len()..];
    }
    found
}

/// Unescaped text of the first `<tag>` element.
pub fn child_text(doc: &str, tag: &str) -> Option<String> {
    elements(doc, tag).first().map(|inner| unescape(inner.trim()))
}

/// Name and unescaped text of each top-level element in `fragment`, for
/// free-form maps such as `<Metadata><k>v</k></Metadata>`.
pub fn child_elements(fragment: &str) -> Vec<(String, String)> {
    let mut found = Vec::new();
    let mut rest = fragment;

    while let Some(lt) = rest.find('<') {
        let after = &rest[lt + 1..];
        if after.starts_with('/') || after.starts_with('?') || after.starts_with('!') {
            rest = after;
            continue;
        }
        let Some(gt) = after.find('>') else {
            break;
        };
        let head = &after[..gt];
        let name = head
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default();
        if head.ends_with('/') {
            found.push((name.to_string(), String::new()));
            rest = &after[gt + 1..];
            continue;
        }
        let body = &after[gt + 1..];
        let close = format!("</{}>", name);
        let Some(end) = body.find(&close) else {
            break;
        };
        found.push((name.to_string(), unescape(body[..end].trim())));
        rest = &body[end + close.len()..];
    }
    found
}
