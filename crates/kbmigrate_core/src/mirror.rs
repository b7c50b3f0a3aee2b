use std::fmt::Write as _;

use chrono::DateTime;
use serde::Serialize;
use tracing::{info, warn};

use crate::destination::{DestinationApi, DestinationPage, find_page_by_title};
use crate::markup::{escape_attr, escape_text, normalize_title, to_storage_xhtml};
use crate::model::{Answer, Comment, Document, DocumentKind};

const ACCEPTED_MARKER: &str = "(Accepted Answer)";
const METADATA_STYLE: &str = "background-color: #f5f5f5; padding: 10px; border-radius: 5px;";
const COMMENTS_STYLE: &str = "background-color: #f9f9f9; padding: 10px; border-left: 3px solid #ccc;";
const ANSWER_COMMENTS_STYLE: &str =
    "background-color: #f9f9f9; padding: 10px; border-left: 3px solid #ccc; margin-left: 20px;";
const ANSWER_STYLE: &str = "margin-bottom: 20px; border-bottom: 1px solid #eee; padding-bottom: 10px;";

#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorSettings {
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    Created(DestinationPage),
    /// A page with the normalized title already exists.
    Skipped(DestinationPage),
    WouldCreate,
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorPageResult {
    pub title: String,
    pub action: String,
    pub page_id: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorReport {
    pub dry_run: bool,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pages: Vec<MirrorPageResult>,
    pub request_count: usize,
}

/// Create the destination page for one document unless its title is taken.
pub fn mirror_document<A: DestinationApi>(
    api: &mut A,
    document: &Document,
    settings: MirrorSettings,
) -> anyhow::Result<MirrorOutcome> {
    let title = normalize_title(&document.title, document.kind());
    if let Some(existing) = find_page_by_title(api, &title)? {
        return Ok(MirrorOutcome::Skipped(existing));
    }
    if settings.dry_run {
        return Ok(MirrorOutcome::WouldCreate);
    }
    let body = to_storage_xhtml(&compose_page_body(document));
    let page = api.create_page(&title, &body)?;
    Ok(MirrorOutcome::Created(page))
}

/// Mirror every document in order. A failure is recorded against its document
/// and the run moves on.
pub fn mirror_documents<A: DestinationApi>(
    api: &mut A,
    documents: &[Document],
    settings: MirrorSettings,
) -> MirrorReport {
    let mut report = MirrorReport {
        dry_run: settings.dry_run,
        created: 0,
        skipped: 0,
        failed: 0,
        pages: Vec::with_capacity(documents.len()),
        request_count: 0,
    };

    for (index, document) in documents.iter().enumerate() {
        let title = normalize_title(&document.title, document.kind());
        info!(
            "mirroring {} {}/{}: {title}",
            document.kind().label(),
            index + 1,
            documents.len()
        );
        let result = match mirror_document(api, document, settings) {
            Ok(MirrorOutcome::Created(page)) => {
                report.created += 1;
                info!("created page {} for {title}", page.id);
                MirrorPageResult {
                    title,
                    action: "created".to_string(),
                    page_id: Some(page.id),
                    detail: None,
                }
            }
            Ok(MirrorOutcome::Skipped(page)) => {
                report.skipped += 1;
                info!("page {title} already exists; skipping");
                MirrorPageResult {
                    title,
                    action: "skipped".to_string(),
                    page_id: Some(page.id),
                    detail: Some("page with this title already exists".to_string()),
                }
            }
            Ok(MirrorOutcome::WouldCreate) => MirrorPageResult {
                title,
                action: "would_create".to_string(),
                page_id: None,
                detail: None,
            },
            Err(error) => {
                report.failed += 1;
                warn!("failed to mirror {title}: {error:#}");
                MirrorPageResult {
                    title,
                    action: "failed".to_string(),
                    page_id: None,
                    detail: Some(format!("{error:#}")),
                }
            }
        };
        report.pages.push(result);
    }

    report.request_count = api.request_count();
    report
}

/// Render the storage body of a document page: metadata header, the document
/// body, then comments and (for questions) answers.
pub fn compose_page_body(document: &Document) -> String {
    let kind = document.kind();
    let mut html = String::new();
    let link = document.link.as_deref().unwrap_or_default();

    let _ = write!(html, "<div style=\"{METADATA_STYLE}\">");
    let _ = write!(
        html,
        "<p><strong>Original {}:</strong> <a href=\"{}\">{}</a></p>",
        match kind {
            DocumentKind::Question => "Question",
            DocumentKind::Article => "Article",
        },
        escape_attr(link),
        escape_text(link)
    );
    let _ = write!(
        html,
        "<p><strong>{}:</strong> {}</p>",
        match kind {
            DocumentKind::Question => "Asked by",
            DocumentKind::Article => "Written by",
        },
        escape_text(document.author())
    );
    let _ = write!(
        html,
        "<p><strong>Created:</strong> {}</p>",
        format_date(document.creation_date, "%Y-%m-%d")
    );
    let tags = document
        .tags
        .iter()
        .map(|tag| format!("<code>{}</code>", escape_text(tag)))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = write!(html, "<p><strong>Tags:</strong> {tags}</p>");
    if kind == DocumentKind::Question {
        let answered = if document.is_answered.unwrap_or(false) {
            "Yes"
        } else {
            "No"
        };
        let _ = write!(
            html,
            "<p><strong>Views:</strong> {} | <strong>Score:</strong> {} | <strong>Answered:</strong> {answered}</p>",
            document.view_count, document.score
        );
    }
    html.push_str("</div><hr/>");

    if kind == DocumentKind::Question {
        html.push_str("<h1>Question:</h1>");
    }
    html.push_str(document.body.as_deref().unwrap_or_default());
    html.push_str(&format_comments(
        &document.comments,
        document.omitted_comments,
    ));
    if kind == DocumentKind::Question {
        html.push_str(&format_answers(document.answers()));
    }
    html
}

fn format_comments(comments: &[Comment], omitted: u32) -> String {
    if comments.is_empty() && omitted == 0 {
        return String::new();
    }
    let mut html = format!("<h3>Comments:</h3><div style=\"{COMMENTS_STYLE}\">");
    for comment in comments {
        html.push_str(&format_comment(comment));
        html.push_str("<hr/>");
    }
    html.push_str(&omitted_note(omitted));
    html.push_str("</div>");
    html
}

fn format_answers(answers: &[Answer]) -> String {
    if answers.is_empty() {
        return String::new();
    }
    let mut html = String::from("<h2>Answers:</h2>");
    for answer in answers {
        let accepted = if answer.is_accepted {
            format!(" <span style=\"color: green;\">{ACCEPTED_MARKER}</span>")
        } else {
            String::new()
        };
        let _ = write!(
            html,
            "<div style=\"{ANSWER_STYLE}\"><p><strong>{}</strong> <em>({})</em>{accepted} - Score: {}</p><div>{}</div></div>",
            escape_text(answer.author()),
            format_date(answer.creation_date, "%Y-%m-%d %H:%M"),
            answer.score,
            answer.body.as_deref().unwrap_or_default()
        );

        if !answer.comments.is_empty() || answer.omitted_comments > 0 {
            let _ = write!(
                html,
                "<div style=\"{ANSWER_COMMENTS_STYLE}\"><h4>Comments on this answer:</h4>"
            );
            for comment in &answer.comments {
                html.push_str(&format_comment(comment));
            }
            html.push_str(&omitted_note(answer.omitted_comments));
            html.push_str("</div>");
        }
        html.push_str("<hr/>");
    }
    html
}

fn format_comment(comment: &Comment) -> String {
    format!(
        "<div><p><strong>{}</strong> <em>({})</em>:</p><div>{}</div></div>",
        escape_text(comment.author()),
        format_date(comment.creation_date, "%Y-%m-%d %H:%M"),
        comment.body.as_deref().unwrap_or_default()
    )
}

fn omitted_note(omitted: u32) -> String {
    match omitted {
        0 => String::new(),
        1 => "<p><em>1 comment could not be retrieved.</em></p>".to_string(),
        count => format!("<p><em>{count} comments could not be retrieved.</em></p>"),
    }
}

fn format_date(timestamp: i64, pattern: &str) -> String {
    if timestamp <= 0 {
        return "Unknown date".to_string();
    }
    DateTime::from_timestamp(timestamp, 0)
        .map(|date| date.format(pattern).to_string())
        .unwrap_or_else(|| "Unknown date".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{MirrorOutcome, MirrorSettings, compose_page_body, mirror_document, mirror_documents};
    use crate::destination::tests::MockDestination;
    use crate::model::Document;

    fn question(title: &str) -> Document {
        serde_json::from_value(json!({
            "question_id": 1,
            "title": title,
            "link": "https://teams.example.co/questions/1",
            "tags": ["rust", "http"],
            "owner": {"display_name": "Ada <admin>"},
            "creation_date": 1700000000,
            "view_count": 12,
            "score": 3,
            "is_answered": true,
            "body": "<p>How do I retry?<br>Thanks</p>",
            "comments": [],
            "answers": [{
                "answer_id": 10,
                "is_accepted": true,
                "score": 5,
                "creation_date": 1700000500,
                "owner": {"display_name": "Grace"},
                "body": "<p>Use backoff.</p>",
                "comments": [{
                    "comment_id": 100,
                    "creation_date": 1700000600,
                    "body": "worked for me"
                }]
            }]
        }))
        .expect("question")
    }

    #[test]
    fn mirroring_creates_one_page_with_accepted_answer_and_nested_comment() {
        let mut api = MockDestination::default();
        let outcome =
            mirror_document(&mut api, &question("Q"), MirrorSettings::default()).expect("mirror");
        let MirrorOutcome::Created(page) = outcome else {
            panic!("expected a created page, got {outcome:?}");
        };
        assert_eq!(api.created, vec!["Q".to_string()]);
        assert!(page.body.contains("(Accepted Answer)"));
        assert!(page.body.contains("worked for me"));
        assert!(page.body.contains("<br />"));
        assert!(page.body.contains("Ada &lt;admin&gt;"));
        assert!(page.body.contains("<code>rust</code>, <code>http</code>"));
        assert!(page.body.contains("<strong>Answered:</strong> Yes"));
    }

    #[test]
    fn mirroring_twice_creates_once_and_skips_once() {
        let mut api = MockDestination::default();
        let documents = vec![question("Q"), question("Q")];
        let report = mirror_documents(&mut api, &documents, MirrorSettings::default());
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(api.created.len(), 1);
        assert_eq!(report.pages[1].action, "skipped");
        assert_eq!(report.pages[1].page_id, report.pages[0].page_id);
    }

    #[test]
    fn entity_encoded_title_matches_existing_decoded_page() {
        let mut api = MockDestination::default().with_page("Fetch & retry", "<p>old</p>");
        let outcome = mirror_document(
            &mut api,
            &question(" Fetch &amp; retry "),
            MirrorSettings::default(),
        )
        .expect("mirror");
        assert!(matches!(outcome, MirrorOutcome::Skipped(_)));
        assert!(api.created.is_empty());
    }

    #[test]
    fn failed_create_is_reported_and_run_continues() {
        let mut api = MockDestination::default();
        api.fail_create.insert("Broken".to_string());
        let documents = vec![question("Broken"), question("Fine")];
        let report = mirror_documents(&mut api, &documents, MirrorSettings::default());
        assert_eq!(report.failed, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.pages[0].action, "failed");
        assert!(
            report.pages[0]
                .detail
                .as_deref()
                .is_some_and(|detail| detail.contains("400"))
        );
        assert_eq!(api.created, vec!["Fine".to_string()]);
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let mut api = MockDestination::default();
        let report = mirror_documents(
            &mut api,
            &[question("Q")],
            MirrorSettings { dry_run: true },
        );
        assert!(report.dry_run);
        assert_eq!(report.pages[0].action, "would_create");
        assert!(api.created.is_empty());
        assert_eq!(report.request_count, 1);
    }

    #[test]
    fn omitted_comments_are_noted_on_the_page() {
        let mut document = question("Q");
        document.omitted_comments = 2;
        if let Some(answers) = document.answers.as_mut() {
            answers[0].omitted_comments = 1;
        }
        let body = compose_page_body(&document);
        assert!(body.contains("<h3>Comments:</h3>"));
        assert!(body.contains("2 comments could not be retrieved."));
        assert!(body.contains("1 comment could not be retrieved."));
    }

    #[test]
    fn article_page_has_article_header_and_no_answers() {
        let article: Document = serde_json::from_value(json!({
            "article_id": 7,
            "title": "Runbook",
            "link": "https://teams.example.co/articles/7",
            "tags": ["ops"],
            "creation_date": 0,
            "body": "<p>steps</p>",
            "comments": [{"comment_id": 1, "creation_date": 1700000000, "body": "nice"}]
        }))
        .expect("article");
        let body = compose_page_body(&article);
        assert!(body.contains("<strong>Original Article:</strong>"));
        assert!(body.contains("<strong>Written by:</strong> Unknown User"));
        assert!(body.contains("<strong>Created:</strong> Unknown date"));
        assert!(body.contains("nice"));
        assert!(!body.contains("Answers:"));
        assert!(!body.contains("Views:"));
    }
}
