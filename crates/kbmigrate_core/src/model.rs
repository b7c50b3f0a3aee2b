use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const UNKNOWN_AUTHOR: &str = "Unknown User";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Question,
    Article,
}

impl DocumentKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "question" | "questions" => Ok(Self::Question),
            "article" | "articles" => Ok(Self::Article),
            other => bail!("unsupported document kind: {other} (expected questions|articles)"),
        }
    }

    /// Path segment of the source list and detail endpoints.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Question => "questions",
            Self::Article => "articles",
        }
    }

    pub fn id_field(self) -> &'static str {
        match self {
            Self::Question => "question_id",
            Self::Article => "article_id",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Article => "article",
        }
    }

    pub fn untitled(self) -> &'static str {
        match self {
            Self::Question => "Untitled Question",
            Self::Article => "Untitled Article",
        }
    }
}

/// Display name of a post author. The remaining owner fields returned by the
/// source are kept verbatim so snapshots round-trip.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AuthorRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<AuthorRef>,
    #[serde(default)]
    pub creation_date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_markdown: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<AuthorRef>,
    #[serde(default)]
    pub creation_date: i64,
    #[serde(default)]
    pub is_accepted: bool,
    #[serde(default)]
    pub score: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_markdown: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub omitted_comments: u32,
}

/// One question or article, the root of a hydration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_id: Option<u64>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<AuthorRef>,
    #[serde(default)]
    pub creation_date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edit_date: Option<i64>,
    #[serde(default)]
    pub view_count: u64,
    #[serde(default)]
    pub score: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_answered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_markdown: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answers: Option<Vec<Answer>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub omitted_comments: u32,
}

impl Document {
    pub fn kind(&self) -> DocumentKind {
        if self.article_id.is_some() && self.question_id.is_none() {
            DocumentKind::Article
        } else {
            DocumentKind::Question
        }
    }

    pub fn id(&self) -> Option<u64> {
        self.question_id.or(self.article_id)
    }

    pub fn author(&self) -> &str {
        author_name(self.owner.as_ref())
    }

    pub fn answers(&self) -> &[Answer] {
        self.answers.as_deref().unwrap_or(&[])
    }
}

impl Answer {
    pub fn author(&self) -> &str {
        author_name(self.owner.as_ref())
    }

    pub fn backfill_bodies(&mut self) {
        backfill(&mut self.body, &mut self.body_markdown);
    }
}

impl Comment {
    pub fn author(&self) -> &str {
        author_name(self.owner.as_ref())
    }

    pub fn backfill_bodies(&mut self) {
        backfill(&mut self.body, &mut self.body_markdown);
    }
}

pub fn author_name(owner: Option<&AuthorRef>) -> &str {
    owner
        .and_then(|owner| owner.display_name.as_deref())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(UNKNOWN_AUTHOR)
}

/// Copies whichever body representation is present into the missing one.
fn backfill(body: &mut Option<String>, body_markdown: &mut Option<String>) {
    match (body.as_ref(), body_markdown.as_ref()) {
        (Some(html), None) => *body_markdown = Some(html.clone()),
        (None, Some(markdown)) => *body = Some(markdown.clone()),
        _ => {}
    }
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Answer, Comment, Document, DocumentKind, UNKNOWN_AUTHOR};

    #[test]
    fn comment_backfill_copies_missing_representation() {
        let mut comment: Comment = serde_json::from_value(json!({
            "comment_id": 5,
            "creation_date": 10,
            "body_markdown": "only markdown"
        }))
        .expect("comment");
        comment.backfill_bodies();
        assert_eq!(comment.body.as_deref(), Some("only markdown"));

        let mut answer: Answer = serde_json::from_value(json!({
            "answer_id": 6,
            "body": "<p>html</p>"
        }))
        .expect("answer");
        answer.backfill_bodies();
        assert_eq!(answer.body_markdown.as_deref(), Some("<p>html</p>"));
    }

    #[test]
    fn document_kind_follows_identifier_field() {
        let article: Document =
            serde_json::from_value(json!({"article_id": 3, "title": "A"})).expect("article");
        assert_eq!(article.kind(), DocumentKind::Article);
        assert_eq!(article.id(), Some(3));
        assert!(article.answers().is_empty());

        let question: Document =
            serde_json::from_value(json!({"question_id": 4, "title": "Q", "answers": []}))
                .expect("question");
        assert_eq!(question.kind(), DocumentKind::Question);
        assert_eq!(question.author(), UNKNOWN_AUTHOR);
    }

    #[test]
    fn unknown_source_fields_survive_serialization() {
        let value = json!({
            "question_id": 1,
            "title": "Q",
            "tags": ["rust"],
            "owner": {"display_name": "Ada", "user_id": 7, "reputation": 11},
            "creation_date": 1700000000,
            "body": "<p>x</p>",
            "content_license": "CC BY-SA 4.0",
            "comments": [],
            "answers": []
        });
        let document: Document = serde_json::from_value(value).expect("document");
        assert_eq!(document.extra.get("content_license"), Some(&json!("CC BY-SA 4.0")));
        let owner = document.owner.as_ref().expect("owner");
        assert_eq!(owner.extra.get("user_id"), Some(&json!(7)));

        let written = serde_json::to_value(&document).expect("serialize");
        assert_eq!(written["content_license"], json!("CC BY-SA 4.0"));
        assert_eq!(written["owner"]["reputation"], json!(11));
        assert!(written.get("omitted_comments").is_none());
    }

    #[test]
    fn kind_parse_accepts_plural_and_singular() {
        assert_eq!(DocumentKind::parse("Questions").expect("parse"), DocumentKind::Question);
        assert_eq!(DocumentKind::parse("article").expect("parse"), DocumentKind::Article);
        assert!(DocumentKind::parse("users").is_err());
    }
}
