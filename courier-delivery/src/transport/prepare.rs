//! Normalisation applied to every message before it reaches a carrier.

use courier_common::Message;
use serde::Deserialize;

/// Header carrying the per-message trace id
pub const TRACE_HEADER: &str = "X-Courier-Trace-Id";

/// A message ready for a carrier: sender filled in, plain-text alternative
/// present whenever HTML is, trace header attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMessage {
    pub message: Message,
    pub from: String,
    pub trace_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageDefaults {
    /// Sender used when a message does not name one
    #[serde(default = "default_from")]
    pub default_from: String,

    /// Right-hand side of generated `Message-ID`s; taken from the sender when
    /// unset
    #[serde(default)]
    pub message_id_domain: Option<String>,
}

impl Default for MessageDefaults {
    fn default() -> Self {
        Self {
            default_from: default_from(),
            message_id_domain: None,
        }
    }
}

fn default_from() -> String {
    "Courier <no-reply@localhost>".to_string()
}

impl MessageDefaults {
    pub fn prepare(&self, message: &Message) -> PreparedMessage {
        let mut message = message.clone();

        let from = message
            .from
            .get_or_insert_with(|| self.default_from.clone())
            .clone();

        if message.text.as_deref().is_none_or(str::is_empty)
            && let Some(html) = message.html.as_deref()
        {
            message.text = Some(html_to_text(html));
        }

        // A replayed message keeps the trace id it was first sent with
        let trace_id = message
            .headers
            .entry(TRACE_HEADER.to_string())
            .or_insert_with(|| ulid::Ulid::new().to_string())
            .clone();

        let domain = self
            .message_id_domain
            .clone()
            .unwrap_or_else(|| sender_domain(&from));
        let message_id = format!("<{trace_id}@{domain}>");

        PreparedMessage {
            message,
            from,
            trace_id,
            message_id,
        }
    }
}

fn sender_domain(from: &str) -> String {
    from.rsplit_once('@')
        .map(|(_, domain)| domain.trim_end_matches('>').trim())
        .filter(|domain| !domain.is_empty())
        .unwrap_or("localhost")
        .to_string()
}

const BLOCK_TAGS: [&str; 12] = [
    "br", "p", "div", "li", "tr", "h1", "h2", "h3", "h4", "h5", "h6", "table",
];

/// Plain-text rendition of an HTML body
///
/// Tags are dropped, block-level tags become line breaks, `<script>` and
/// `<style>` contents are skipped, the common entities are decoded and each
/// line has its whitespace collapsed.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    let mut skip_until: Option<&str> = None;

    while let Some(start) = rest.find('<') {
        if skip_until.is_none() {
            out.push_str(&decode_entities(&rest[..start]));
        }

        // `<` not followed by a tag name, `/`, `!` or `?` is plain text
        let opens_tag = rest[start + 1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?'));
        if !opens_tag {
            if skip_until.is_none() {
                out.push('<');
            }
            rest = &rest[start + 1..];
            continue;
        }

        let Some(end) = rest[start..].find('>') else {
            rest = "";
            break;
        };

        let tag = rest[start + 1..start + end].trim();
        let closing = tag.starts_with('/');
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        match skip_until {
            Some(until) if closing && name == until => skip_until = None,
            Some(_) => {}
            None if !closing && (name == "script" || name == "style") => {
                skip_until = Some(if name == "script" { "script" } else { "style" });
            }
            None if BLOCK_TAGS.contains(&name.as_str()) => out.push('\n'),
            None => {}
        }

        rest = &rest[start + end + 1..];
    }

    if skip_until.is_none() {
        out.push_str(&decode_entities(rest));
    }

    out.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_default_sender_substituted() {
        let defaults = MessageDefaults::default();
        let message = Message::new().to("a@x.com").subject("Hi").text("hi");

        let prepared = defaults.prepare(&message);
        assert_eq!(prepared.from, "Courier <no-reply@localhost>");
        assert_eq!(
            prepared.message.from.as_deref(),
            Some("Courier <no-reply@localhost>")
        );
    }

    #[test]
    fn test_explicit_sender_kept() {
        let defaults = MessageDefaults::default();
        let message = Message::new()
            .to("a@x.com")
            .from("billing@shop.example")
            .subject("Hi")
            .text("hi");

        let prepared = defaults.prepare(&message);
        assert_eq!(prepared.from, "billing@shop.example");
        assert!(prepared.message_id.ends_with("@shop.example>"));
    }

    #[test]
    fn test_text_derived_from_html() {
        let defaults = MessageDefaults::default();
        let message = Message::new()
            .to("a@x.com")
            .subject("Hi")
            .html("<p>hi</p>");

        let prepared = defaults.prepare(&message);
        assert_eq!(prepared.message.text.as_deref(), Some("hi"));
        assert_eq!(prepared.message.html.as_deref(), Some("<p>hi</p>"));
    }

    #[test]
    fn test_trace_header_attached_once() {
        let defaults = MessageDefaults {
            message_id_domain: Some("mail.example".to_string()),
            ..MessageDefaults::default()
        };
        let message = Message::new().to("a@x.com").subject("Hi").text("hi");

        let first = defaults.prepare(&message);
        assert_eq!(
            first.message.headers.get(TRACE_HEADER),
            Some(&first.trace_id)
        );
        assert_eq!(first.message_id, format!("<{}@mail.example>", first.trace_id));

        let again = defaults.prepare(&first.message);
        assert_eq!(again.trace_id, first.trace_id);
    }

    #[test]
    fn test_html_to_text() {
        let html = r"<html><head><style>p { color: red; }</style></head>
            <body><h1>Welcome,&nbsp;Ada</h1><p>Your order   &amp; receipt</p>
            <script>track()</script><ul><li>One</li><li>Two</li></ul>Thanks<br/>-- Team</body></html>";

        assert_eq!(
            html_to_text(html),
            "Welcome, Ada\nYour order & receipt\nOne\nTwo\nThanks\n-- Team"
        );
    }

    #[test]
    fn test_html_to_text_unterminated_tag() {
        assert_eq!(html_to_text("hello <b"), "hello");
    }

    #[test]
    fn test_html_to_text_keeps_bare_angle_brackets() {
        assert_eq!(html_to_text("<p>1 < 2 and 3 > 2</p>"), "1 < 2 and 3 > 2");
        assert_eq!(html_to_text("x <b>bold</b> <3 y"), "x bold <3 y");
        assert_eq!(html_to_text("ends with <"), "ends with <");
    }
}
