//! Markup helpers for notification bodies.

/// Escape text for embedding in HTML element content or a quoted attribute.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escape multi-line user text and turn its line breaks into `<br>`.
pub fn escape_multiline(text: &str) -> String {
    escape(text).replace('\r', "").replace('\n', "<br>")
}
