use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::Url;
use sha2::{Digest, Sha256};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::{MigrateConfig, require};
use crate::destination::AssetUpload;
use crate::markup::{decode_entities, escape_attr};
use crate::model::Document;

pub const ASSET_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg"];

static HTML_URL_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<(img|a|ri:url)\b[^>]*?\s(src|href|ri:value)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#,
    )
    .expect("html attribute pattern")
});

static MARKDOWN_INLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"!?\[[^\]]*\]\(\s*<?([^\s()<>]+)>?(?:\s+"[^"]*")?\s*\)"#)
        .expect("markdown inline pattern")
});

static MARKDOWN_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]{0,3}\[[^\]]+\]:[ \t]*<?([^\s<>]+)>?").expect("markdown reference pattern")
});

/// Recognizes URLs hosted on the source platform's asset domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPattern {
    domain: String,
    path_prefix: String,
}

impl AssetPattern {
    pub fn new(domain: &str, path_prefix: &str) -> Self {
        let domain = domain
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_ascii_lowercase();
        Self {
            domain,
            path_prefix: path_prefix.trim().to_string(),
        }
    }

    pub fn from_config(config: &MigrateConfig) -> Result<Self> {
        let domain = require(config.asset_domain(), "assets.external_domain")?;
        Ok(Self::new(&domain, &config.assets.path_prefix))
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn matches(&self, url: &str) -> bool {
        let Some(parsed) = parse_absolute(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let host_matches = host == self.domain || host.ends_with(&format!(".{}", self.domain));
        host_matches && parsed.path().starts_with(&self.path_prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    HtmlImage,
    HtmlLink,
    /// `<ri:url ri:value>` inside a Confluence storage-format `<ac:image>`.
    StorageUrl,
    MarkdownInline,
    MarkdownReference,
}

impl NodeKind {
    fn is_html(self) -> bool {
        matches!(self, Self::HtmlImage | Self::HtmlLink | Self::StorageUrl)
    }
}

/// A link or image node in a body, with the byte span of its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlNode {
    pub kind: NodeKind,
    pub span: Range<usize>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetReference {
    pub url: String,
    pub filename: String,
}

/// Locate image and link nodes in an HTML or Markdown body. Spans never overlap
/// and are returned in document order.
pub fn scan_nodes(text: &str) -> Vec<UrlNode> {
    let mut nodes = Vec::new();

    for caps in HTML_URL_ATTR.captures_iter(text) {
        let tag = caps[1].to_ascii_lowercase();
        let attr = caps[2].to_ascii_lowercase();
        let kind = match (tag.as_str(), attr.as_str()) {
            ("img", "src") => NodeKind::HtmlImage,
            ("a", "href") => NodeKind::HtmlLink,
            ("ri:url", "ri:value") => NodeKind::StorageUrl,
            _ => continue,
        };
        let Some(value) = caps.get(3).or_else(|| caps.get(4)).or_else(|| caps.get(5)) else {
            continue;
        };
        nodes.push(UrlNode {
            kind,
            span: value.range(),
            url: decode_entities(value.as_str()),
        });
    }

    for (pattern, kind) in [
        (&*MARKDOWN_INLINE, NodeKind::MarkdownInline),
        (&*MARKDOWN_REFERENCE, NodeKind::MarkdownReference),
    ] {
        for caps in pattern.captures_iter(text) {
            if let Some(value) = caps.get(1) {
                nodes.push(UrlNode {
                    kind,
                    span: value.range(),
                    url: value.as_str().to_string(),
                });
            }
        }
    }

    nodes.sort_by_key(|node| node.span.start);
    let mut result: Vec<UrlNode> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if result
            .last()
            .is_some_and(|previous| node.span.start < previous.span.end)
        {
            continue;
        }
        result.push(node);
    }
    result
}

/// Asset references in one body, deduplicated by URL in first-seen order.
pub fn extract_asset_references(text: &str, pattern: &AssetPattern) -> Vec<AssetReference> {
    let mut out: Vec<AssetReference> = Vec::new();
    for node in scan_nodes(text) {
        if !pattern.matches(&node.url) || out.iter().any(|known| known.url == node.url) {
            continue;
        }
        if let Some(filename) = filename_for(&node.url) {
            out.push(AssetReference {
                url: node.url,
                filename,
            });
        }
    }
    out
}

/// Rewrite the URL of every node whose URL is a key of `replacements`.
/// Returns the new text and the number of nodes rewritten.
pub fn rewrite_asset_urls(text: &str, replacements: &BTreeMap<String, String>) -> (String, usize) {
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0usize;
    let mut rewritten = 0usize;
    for node in scan_nodes(text) {
        let Some(target) = replacements.get(&node.url) else {
            continue;
        };
        output.push_str(&text[cursor..node.span.start]);
        if node.kind.is_html() {
            output.push_str(&escape_attr(target));
        } else {
            output.push_str(target);
        }
        cursor = node.span.end;
        rewritten += 1;
    }
    output.push_str(&text[cursor..]);
    (output, rewritten)
}

/// Final path segment of a URL, ignoring query and fragment.
pub fn filename_for(url: &str) -> Option<String> {
    let parsed = parse_absolute(url)?;
    let segment = parsed.path_segments()?.next_back()?;
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

/// Every body of a document that can carry asset references.
pub fn document_bodies(document: &Document) -> Vec<&str> {
    let mut bodies = Vec::new();
    bodies.extend(document.body.as_deref());
    bodies.extend(document.body_markdown.as_deref());
    for answer in document.answers() {
        bodies.extend(answer.body.as_deref());
        bodies.extend(answer.body_markdown.as_deref());
    }
    bodies
}

pub fn document_references(document: &Document, pattern: &AssetPattern) -> Vec<AssetReference> {
    let mut out: Vec<AssetReference> = Vec::new();
    for body in document_bodies(document) {
        for reference in extract_asset_references(body, pattern) {
            if !out.iter().any(|known| known.url == reference.url) {
                out.push(reference);
            }
        }
    }
    out
}

/// Apply `replacements` to the document body and every answer body, in both
/// representations. Returns the number of nodes rewritten.
pub fn rewrite_document(document: &mut Document, replacements: &BTreeMap<String, String>) -> usize {
    let mut total = rewrite_field(&mut document.body, replacements);
    total += rewrite_field(&mut document.body_markdown, replacements);
    if let Some(answers) = document.answers.as_mut() {
        for answer in answers {
            total += rewrite_field(&mut answer.body, replacements);
            total += rewrite_field(&mut answer.body_markdown, replacements);
        }
    }
    total
}

fn rewrite_field(field: &mut Option<String>, replacements: &BTreeMap<String, String>) -> usize {
    let Some(text) = field.as_deref() else {
        return 0;
    };
    let (rewritten, count) = rewrite_asset_urls(text, replacements);
    if count > 0 {
        *field = Some(rewritten);
    }
    count
}

/// Every distinct asset URL referenced by the corpus, in first-seen order.
pub fn list_asset_urls(documents: &[Document], pattern: &AssetPattern) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for document in documents {
        for reference in document_references(document, pattern) {
            if !urls.contains(&reference.url) {
                urls.push(reference.url);
            }
        }
    }
    urls
}

/// Sibling of the snapshot that receives the asset URL list.
pub fn asset_list_path(snapshot_path: &Path) -> PathBuf {
    let mut name = snapshot_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".asset-urls.txt");
    snapshot_path.with_file_name(name)
}

pub fn write_asset_url_list(path: &Path, urls: &[String]) -> Result<()> {
    let mut content = urls.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

/// Image files available for upload, keyed by filename.
#[derive(Debug, Clone, Default)]
pub struct LocalAssetLibrary {
    files: BTreeMap<String, PathBuf>,
}

impl LocalAssetLibrary {
    /// Index image files directly inside `dir`. A missing directory yields an empty library.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        if !dir.exists() {
            warn!("asset directory {} does not exist", dir.display());
            return Ok(Self { files });
        }
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
            let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let is_asset = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ASSET_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if !is_asset {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                files.insert(name.to_string(), path.to_path_buf());
            }
        }
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.files.contains_key(filename)
    }

    pub fn load(&self, filename: &str) -> Result<Option<AssetUpload>> {
        let Some(path) = self.files.get(filename) else {
            return Ok(None);
        };
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(AssetUpload {
            filename: filename.to_string(),
            content_type: content_type_for(filename),
            content_hash: content_hash(&bytes),
            bytes,
        }))
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub fn content_type_for(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "image/png",
    }
}

fn parse_absolute(url: &str) -> Option<Url> {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("//") {
        return Url::parse(&format!("https://{rest}")).ok();
    }
    Url::parse(url).ok()
}
