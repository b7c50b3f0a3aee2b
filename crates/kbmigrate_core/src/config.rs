use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::model::DocumentKind;

pub const DEFAULT_USER_AGENT: &str = "kbmigrate/0.1";
pub const DEFAULT_CONFIG_FILENAME: &str = "kbmigrate.toml";
/// Response-shaping filter that includes `body` and `body_markdown` on posts and comments.
pub const DEFAULT_SOURCE_FILTER: &str = "!-NjR7YBAGtXRbJN1ECErSn*8.E3y04xrL";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrateConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub destination: DestinationSection,
    #[serde(default)]
    pub assets: AssetSection,
    #[serde(default)]
    pub snapshot: SnapshotSection,
    #[serde(default)]
    pub pacing: PacingSection,
    #[serde(default)]
    pub retry: RetrySection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SourceSection {
    pub api_url: Option<String>,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    pub access_token_file: Option<PathBuf>,
    #[serde(default = "default_filter")]
    pub filter: String,
    pub site: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            api_url: None,
            key_file: default_key_file(),
            access_token_file: None,
            filter: default_filter(),
            site: None,
            user_agent: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DestinationSection {
    pub base_url: Option<String>,
    pub space_key: Option<String>,
    pub parent_page_id: Option<String>,
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_write_interval_ms")]
    pub write_interval_ms: u64,
}

impl Default for DestinationSection {
    fn default() -> Self {
        Self {
            base_url: None,
            space_key: None,
            parent_page_id: None,
            token_file: default_token_file(),
            timeout_ms: default_timeout_ms(),
            write_interval_ms: default_write_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AssetSection {
    pub external_domain: Option<String>,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default = "default_question_assets")]
    pub questions_dir: PathBuf,
    #[serde(default = "default_article_assets")]
    pub articles_dir: PathBuf,
}

impl Default for AssetSection {
    fn default() -> Self {
        Self {
            external_domain: None,
            path_prefix: default_path_prefix(),
            questions_dir: default_question_assets(),
            articles_dir: default_article_assets(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SnapshotSection {
    #[serde(default = "default_questions_snapshot")]
    pub questions: PathBuf,
    #[serde(default = "default_articles_snapshot")]
    pub articles: PathBuf,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            questions: default_questions_snapshot(),
            articles: default_articles_snapshot(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct PacingSection {
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_document_delay_ms")]
    pub document_delay_ms: u64,
    #[serde(default = "default_comment_delay_ms")]
    pub comment_delay_ms: u64,
    #[serde(default = "default_comment_delay_ms")]
    pub answer_delay_ms: u64,
}

impl Default for PacingSection {
    fn default() -> Self {
        Self {
            page_delay_ms: default_page_delay_ms(),
            document_delay_ms: default_document_delay_ms(),
            comment_delay_ms: default_comment_delay_ms(),
            answer_delay_ms: default_comment_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_backoff_secs")]
    pub default_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            default_backoff_secs: default_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl MigrateConfig {
    /// Resolve the source API URL: env KBMIGRATE_SOURCE_API_URL > config.
    pub fn source_api_url(&self) -> Option<String> {
        env_override("KBMIGRATE_SOURCE_API_URL").or_else(|| self.source.api_url.clone())
    }

    /// Resolve the Confluence base URL: env KBMIGRATE_CONFLUENCE_URL > config.
    pub fn confluence_url(&self) -> Option<String> {
        env_override("KBMIGRATE_CONFLUENCE_URL")
            .or_else(|| self.destination.base_url.clone())
            .map(|url| url.trim_end_matches('/').to_string())
    }

    pub fn space_key(&self) -> Option<String> {
        env_override("KBMIGRATE_SPACE_KEY").or_else(|| self.destination.space_key.clone())
    }

    pub fn parent_page_id(&self) -> Option<String> {
        env_override("KBMIGRATE_PARENT_PAGE_ID")
            .or_else(|| self.destination.parent_page_id.clone())
    }

    pub fn asset_domain(&self) -> Option<String> {
        env_override("KBMIGRATE_ASSET_DOMAIN").or_else(|| self.assets.external_domain.clone())
    }

    /// Resolve user agent: env KBMIGRATE_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("KBMIGRATE_USER_AGENT")
            .or_else(|| self.source.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn snapshot_path(&self, kind: DocumentKind) -> &Path {
        match kind {
            DocumentKind::Question => &self.snapshot.questions,
            DocumentKind::Article => &self.snapshot.articles,
        }
    }

    pub fn asset_dir(&self, kind: DocumentKind) -> &Path {
        match kind {
            DocumentKind::Question => &self.assets.questions_dir,
            DocumentKind::Article => &self.assets.articles_dir,
        }
    }
}

/// Load and parse a MigrateConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrateConfig> {
    if !config_path.exists() {
        return Ok(MigrateConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrateConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Read an opaque credential from a file. Surrounding whitespace is dropped.
pub fn read_secret_file(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read credential file {}", path.display()))?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        bail!("credential file is empty: {}", path.display());
    }
    Ok(trimmed.to_string())
}

pub fn require(value: Option<String>, what: &str) -> Result<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => bail!("{what} is not configured"),
    }
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn default_key_file() -> PathBuf {
    PathBuf::from("client_key.txt")
}

fn default_token_file() -> PathBuf {
    PathBuf::from("pat.txt")
}

fn default_filter() -> String {
    DEFAULT_SOURCE_FILTER.to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_write_interval_ms() -> u64 {
    250
}

fn default_path_prefix() -> String {
    "/images/".to_string()
}

fn default_question_assets() -> PathBuf {
    PathBuf::from("question-images")
}

fn default_article_assets() -> PathBuf {
    PathBuf::from("article-images")
}

fn default_questions_snapshot() -> PathBuf {
    PathBuf::from("stackoverflow_questions.json")
}

fn default_articles_snapshot() -> PathBuf {
    PathBuf::from("stackoverflow_articles.json")
}

fn default_page_delay_ms() -> u64 {
    1_000
}

fn default_document_delay_ms() -> u64 {
    500
}

fn default_comment_delay_ms() -> u64 {
    200
}

fn default_max_retries() -> usize {
    8
}

fn default_backoff_secs() -> u64 {
    30
}

fn default_max_backoff_secs() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_no_urls() {
        let config = MigrateConfig::default();
        assert!(config.source.api_url.is_none());
        assert!(config.destination.base_url.is_none());
        assert_eq!(config.source.filter, DEFAULT_SOURCE_FILTER);
        assert_eq!(config.retry.default_backoff_secs, 30);
        assert_eq!(config.pacing.page_delay_ms, 1_000);
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/kbmigrate.toml")).expect("load config");
        assert_eq!(config, MigrateConfig::default());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("kbmigrate.toml");
        fs::write(
            &config_path,
            r#"
[source]
api_url = "https://teams.example.co/api/2.3"
key_file = "secrets/key.txt"
site = "stackoverflowteams"

[destination]
base_url = "https://confluence.example.org/"
space_key = "DE"
parent_page_id = "322175520"

[assets]
external_domain = "teams.example.co"
questions_dir = "imgs/q"

[snapshot]
questions = "out/questions.json"

[pacing]
page_delay_ms = 0
comment_delay_ms = 10

[retry]
max_retries = 3
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.source.api_url.as_deref(),
            Some("https://teams.example.co/api/2.3")
        );
        assert_eq!(config.source.key_file, PathBuf::from("secrets/key.txt"));
        assert_eq!(config.source.filter, DEFAULT_SOURCE_FILTER);
        assert_eq!(config.destination.space_key.as_deref(), Some("DE"));
        assert_eq!(config.destination.token_file, PathBuf::from("pat.txt"));
        assert_eq!(
            config.asset_dir(DocumentKind::Question),
            Path::new("imgs/q")
        );
        assert_eq!(
            config.snapshot_path(DocumentKind::Article),
            Path::new("stackoverflow_articles.json")
        );
        assert_eq!(config.pacing.page_delay_ms, 0);
        assert_eq!(config.pacing.document_delay_ms, 500);
        assert_eq!(config.pacing.answer_delay_ms, 200);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.max_backoff_secs, 600);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("kbmigrate.toml");
        fs::write(&config_path, "[source\napi_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn read_secret_file_trims_and_rejects_empty() {
        let temp = tempdir().expect("tempdir");
        let key = temp.path().join("client_key.txt");
        fs::write(&key, "  abc123\n").expect("write key");
        assert_eq!(read_secret_file(&key).expect("read"), "abc123");

        let empty = temp.path().join("empty.txt");
        fs::write(&empty, "\n").expect("write empty");
        let error = read_secret_file(&empty).expect_err("must fail");
        assert!(error.to_string().contains("credential file is empty"));
    }

    #[test]
    fn require_reports_missing_setting() {
        assert_eq!(require(Some(" DE ".to_string()), "space key").expect("ok"), "DE");
        let error = require(None, "destination.space_key").expect_err("must fail");
        assert_eq!(error.to_string(), "destination.space_key is not configured");
    }
}
