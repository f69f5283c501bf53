//! Variable masking for template patterns shown to consumers.
//!
//! Masking runs after clustering, on the rendered pattern text only;
//! the clustering tokens themselves stay raw.

use std::sync::OnceLock;

use regex::Regex;

macro_rules! masker {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("mask pattern is valid"))
        }
    };
}

masker!(re_email, r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}");
masker!(re_url, r"https?://[^\s]+");
masker!(re_uuid, r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}");
masker!(re_ip, r"\b(?:\d{1,3}\.){3}\d{1,3}(?::\d+)?\b");
masker!(
    re_timestamp,
    r"(?i)\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:z|[+-]\d{2}:?\d{2})?"
);
masker!(re_hex, r"\b(?:0x[0-9a-fA-F]+|[0-9a-f]{12,})\b");
masker!(re_path, r"(?:^|\s)(/[\w./-]{2,})");
masker!(re_number, r"\b\d+(?:\.\d+)?\b");
masker!(re_status_context, r"(?:status|code)\s*[=: ]\s*[1-5]\d{2}\b");

/// Masks variable fragments, preserving HTTP status codes that appear
/// in a `status`/`code` context.
pub fn mask_variables(text: &str) -> String {
    let mut out = text.to_string();
    out = re_email().replace_all(&out, "<email>").into_owned();
    out = re_url().replace_all(&out, "<url>").into_owned();
    out = re_uuid().replace_all(&out, "<uuid>").into_owned();
    out = re_ip().replace_all(&out, "<ip>").into_owned();
    out = re_timestamp().replace_all(&out, "<timestamp>").into_owned();
    out = re_hex().replace_all(&out, "<hex>").into_owned();
    out = re_path()
        .replace_all(&out, |caps: &regex::Captures<'_>| {
            caps[0].replace(&caps[1], "<path>")
        })
        .into_owned();
    out = mask_numbers_outside_status(&out);
    out
}

fn mask_numbers_outside_status(text: &str) -> String {
    let protected: Vec<(usize, usize)> = re_status_context()
        .find_iter(text)
        .map(|m| (m.start(), m.end()))
        .collect();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for m in re_number().find_iter(text) {
        let shielded = protected
            .iter()
            .any(|(start, end)| m.start() >= *start && m.end() <= *end);
        out.push_str(&text[cursor..m.start()]);
        if shielded {
            out.push_str(m.as_str());
        } else {
            out.push_str("<num>");
        }
        cursor = m.end();
    }
    out.push_str(&text[cursor..]);
    out
}
