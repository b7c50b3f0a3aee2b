use std::sync::LazyLock;

use regex::{Captures, Regex};
use scraper::Html;

use crate::model::DocumentKind;

const VOID_ELEMENTS: &str = "area|base|br|col|embed|hr|img|input|link|meta|param|source|track|wbr";

static VOID_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)<({VOID_ELEMENTS})\b((?:[^>/]|/[^>])*)/?>"))
        .expect("void tag pattern")
});

static AMPERSAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]+;|#[xX][0-9a-fA-F]+;|[A-Za-z][A-Za-z0-9]*;)?")
        .expect("ampersand pattern")
});

/// Decode HTML character references (`&amp;`, `&#39;`, `&eacute;` ...) in plain text.
pub fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    // Keep literal angle brackets as text while the parser resolves references.
    let fragment = Html::parse_fragment(&value.replace('<', "&lt;"));
    fragment.root_element().text().collect()
}

/// Canonical destination title for a source document.
pub fn normalize_title(raw: &str, kind: DocumentKind) -> String {
    let decoded = decode_entities(raw);
    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        kind.untitled().to_string()
    } else {
        collapsed
    }
}

pub fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn escape_attr(value: &str) -> String {
    escape_text(value)
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Normalize an HTML fragment into storage-format XHTML: void elements are
/// self-closed and stray ampersands escaped.
pub fn to_storage_xhtml(html: &str) -> String {
    let closed = VOID_TAG.replace_all(html, |caps: &Captures<'_>| {
        let attributes = caps.get(2).map_or("", |m| m.as_str()).trim_end();
        format!("<{}{attributes} />", caps[1].to_ascii_lowercase())
    });
    AMPERSAND
        .replace_all(&closed, |caps: &Captures<'_>| match caps.get(1) {
            Some(reference) => format!("&{}", reference.as_str()),
            None => "&amp;".to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::{decode_entities, escape_attr, normalize_title, to_storage_xhtml};
    use crate::model::DocumentKind;

    #[test]
    fn normalize_title_decodes_and_trims() {
        assert_eq!(
            normalize_title("  How do I use &quot;git rebase&quot; &amp; keep history?  ", DocumentKind::Question),
            "How do I use \"git rebase\" & keep history?"
        );
        assert_eq!(normalize_title("Can&#39;t  connect", DocumentKind::Article), "Can't connect");
        assert_eq!(normalize_title("a < b", DocumentKind::Question), "a < b");
        assert_eq!(normalize_title(" \n ", DocumentKind::Question), "Untitled Question");
        assert_eq!(normalize_title("", DocumentKind::Article), "Untitled Article");
    }

    #[test]
    fn decode_entities_leaves_plain_text_alone() {
        assert_eq!(decode_entities("plain title"), "plain title");
        assert_eq!(decode_entities("x &lt;T&gt; y"), "x <T> y");
    }

    #[test]
    fn escape_attr_round_trips_through_decode() {
        let url = "https://example.com/a?b=1&c=\"2\"";
        assert_eq!(decode_entities(&escape_attr(url)), url);
    }

    #[test]
    fn storage_xhtml_self_closes_void_elements() {
        let html = r#"<p>one<br>two<BR/>three</p><img src="a.png" alt="x"><hr />"#;
        assert_eq!(
            to_storage_xhtml(html),
            r#"<p>one<br />two<br />three</p><img src="a.png" alt="x" /><hr />"#
        );
    }

    #[test]
    fn storage_xhtml_escapes_bare_ampersands_only() {
        assert_eq!(
            to_storage_xhtml("<p>R&D &amp; ops &#169; &nbsp;</p>"),
            "<p>R&amp;D &amp; ops &#169; &nbsp;</p>"
        );
    }
}
