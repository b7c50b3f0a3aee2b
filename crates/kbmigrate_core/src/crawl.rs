use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::PacingSection;
use crate::error::ApiError;
use crate::model::{Answer, Comment, Document, DocumentKind};
use crate::source::{Pacer, SourceApi};

pub const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlSettings {
    pub page_delay: Duration,
    pub document_delay: Duration,
    pub comment_delay: Duration,
    pub answer_delay: Duration,
}

impl CrawlSettings {
    pub fn from_pacing(pacing: &PacingSection) -> Self {
        Self {
            page_delay: Duration::from_millis(pacing.page_delay_ms),
            document_delay: Duration::from_millis(pacing.document_delay_ms),
            comment_delay: Duration::from_millis(pacing.comment_delay_ms),
            answer_delay: Duration::from_millis(pacing.answer_delay_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub kind: DocumentKind,
    pub listed: usize,
    pub hydrated: usize,
    pub dropped: usize,
    pub omitted_comments: usize,
    pub diagnostics: Vec<String>,
    pub request_count: usize,
    pub documents: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    has_more: bool,
}

/// Drives the source API: paginated collection and per-document hydration.
pub struct Crawler<'a, A: SourceApi, P: Pacer> {
    api: &'a mut A,
    pacer: &'a mut P,
    settings: CrawlSettings,
    diagnostics: Vec<String>,
}

impl<'a, A: SourceApi, P: Pacer> Crawler<'a, A, P> {
    pub fn new(api: &'a mut A, pacer: &'a mut P, settings: CrawlSettings) -> Self {
        Self {
            api,
            pacer,
            settings,
            diagnostics: Vec::new(),
        }
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    /// Fetch every page of a list endpoint, oldest first.
    pub fn collect(&mut self, endpoint: &str) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut page = 1usize;

        loop {
            if page > 1 {
                self.pacer.pause(self.settings.page_delay);
            }
            let params = [
                ("page", page.to_string()),
                ("pagesize", PAGE_SIZE.to_string()),
                ("sort", "creation".to_string()),
                ("order", "asc".to_string()),
            ];
            let response = self.api.request(endpoint, &params)?;
            let parsed: ListPage = serde_json::from_value(response)
                .with_context(|| format!("failed to decode {endpoint} page {page}"))?;
            let fetched = parsed.items.len();
            items.extend(parsed.items);
            info!(
                "fetched {endpoint} page {page}: {fetched} items (total {})",
                items.len()
            );

            if !parsed.has_more {
                break;
            }
            if fetched == 0 {
                warn!("{endpoint} page {page} reported more results but returned none; stopping");
                break;
            }
            page += 1;
        }

        Ok(items)
    }

    /// Fetch one document in full. `None` means the detail fetch came back empty.
    pub fn hydrate(&mut self, kind: DocumentKind, id: u64) -> Result<Option<Document>> {
        let endpoint = format!("{}/{id}", kind.collection());
        let response = self.api.request(&endpoint, &[])?;
        let Some(item) = first_item(response) else {
            self.record(ApiError::MissingDetail {
                kind: kind.label(),
                id,
            });
            return Ok(None);
        };
        let mut document: Document = serde_json::from_value(item)
            .with_context(|| format!("failed to decode {} {id}", kind.label()))?;

        info!("fetching comments for {} {id}", kind.label());
        let (comments, omitted) = self.hydrate_comments(kind.collection(), id)?;
        document.comments = comments;
        document.omitted_comments = omitted;

        if kind == DocumentKind::Question {
            info!("fetching answers for question {id}");
            let mut answers = self
                .collect(&format!("questions/{id}/answers"))?
                .into_iter()
                .map(|item| {
                    serde_json::from_value::<Answer>(item)
                        .with_context(|| format!("failed to decode answer on question {id}"))
                })
                .collect::<Result<Vec<_>>>()?;

            for answer in &mut answers {
                self.pacer.pause(self.settings.answer_delay);
                let (comments, omitted) = self.hydrate_comments("answers", answer.answer_id)?;
                answer.comments = comments;
                answer.omitted_comments = omitted;
                answer.backfill_bodies();
            }
            answers.sort_by_key(|answer| answer.creation_date);
            document.answers = Some(answers);
        }

        Ok(Some(document))
    }

    /// List comments on a post, then fetch each one individually because the
    /// list response omits body fields.
    fn hydrate_comments(&mut self, collection: &str, post_id: u64) -> Result<(Vec<Comment>, u32)> {
        let summaries = self.collect(&format!("{collection}/{post_id}/comments"))?;
        if !summaries.is_empty() {
            info!(
                "found {} comments on {collection}/{post_id}; fetching details",
                summaries.len()
            );
        }

        let mut comments = Vec::with_capacity(summaries.len());
        let mut omitted = 0u32;
        for summary in summaries {
            let Some(comment_id) = summary.get("comment_id").and_then(Value::as_u64) else {
                self.note(format!(
                    "comment summary without comment_id on {collection}/{post_id}"
                ));
                omitted += 1;
                continue;
            };
            self.pacer.pause(self.settings.comment_delay);
            let response = self.api.request(&format!("comments/{comment_id}"), &[])?;
            match first_item(response) {
                Some(item) => {
                    let mut comment: Comment = serde_json::from_value(item)
                        .with_context(|| format!("failed to decode comment {comment_id}"))?;
                    comment.backfill_bodies();
                    comments.push(comment);
                }
                None => {
                    self.record(ApiError::MissingDetail {
                        kind: "comment",
                        id: comment_id,
                    });
                    omitted += 1;
                }
            }
        }
        comments.sort_by_key(|comment| comment.creation_date);
        Ok((comments, omitted))
    }

    fn record(&mut self, error: ApiError) {
        self.note(error.to_string());
    }

    fn note(&mut self, message: String) {
        warn!("{message}");
        self.diagnostics.push(message);
    }

    pub fn into_diagnostics(self) -> Vec<String> {
        self.diagnostics
    }
}

/// List every document of `kind` and hydrate each one in turn.
pub fn crawl_documents<A: SourceApi, P: Pacer>(
    api: &mut A,
    pacer: &mut P,
    settings: CrawlSettings,
    kind: DocumentKind,
) -> Result<CrawlReport> {
    let mut crawler = Crawler::new(api, pacer, settings);
    info!("fetching {}...", kind.collection());
    let summaries = crawler.collect(kind.collection())?;
    let listed = summaries.len();
    info!("fetched a total of {listed} {}", kind.collection());

    let mut documents = Vec::with_capacity(listed);
    let mut dropped = 0usize;
    for (index, summary) in summaries.iter().enumerate() {
        let Some(id) = summary.get(kind.id_field()).and_then(Value::as_u64) else {
            crawler.note(format!(
                "{} summary #{} has no {}",
                kind.label(),
                index + 1,
                kind.id_field()
            ));
            dropped += 1;
            continue;
        };
        if index > 0 {
            crawler.pacer.pause(crawler.settings.document_delay);
        }
        info!("processing {} {}/{listed} (ID: {id})", kind.label(), index + 1);
        match crawler.hydrate(kind, id)? {
            Some(document) => documents.push(document),
            None => dropped += 1,
        }
    }

    let omitted_comments = documents
        .iter()
        .map(|document| {
            let nested = document
                .answers()
                .iter()
                .map(|answer| answer.omitted_comments as usize)
                .sum::<usize>();
            document.omitted_comments as usize + nested
        })
        .sum();
    let request_count = crawler.api.request_count();

    Ok(CrawlReport {
        kind,
        listed,
        hydrated: documents.len(),
        dropped,
        omitted_comments,
        diagnostics: crawler.into_diagnostics(),
        request_count,
        documents,
    })
}

fn first_item(response: Value) -> Option<Value> {
    match response {
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => items.into_iter().next(),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::{CrawlSettings, Crawler, PAGE_SIZE, crawl_documents};
    use crate::model::DocumentKind;
    use crate::source::SourceApi;
    use crate::source::tests::RecordingPacer;

    #[derive(Default)]
    struct MockSource {
        responses: BTreeMap<String, Value>,
        pages: BTreeMap<String, Vec<Value>>,
        calls: Vec<String>,
    }

    impl MockSource {
        fn detail(&mut self, endpoint: &str, item: Option<Value>) {
            let items = item.into_iter().collect::<Vec<_>>();
            self.responses
                .insert(endpoint.to_string(), json!({ "items": items }));
        }

        fn list(&mut self, endpoint: &str, pages: Vec<Value>) {
            self.pages.insert(endpoint.to_string(), pages);
        }
    }

    impl SourceApi for MockSource {
        fn request(
            &mut self,
            endpoint: &str,
            params: &[(&str, String)],
        ) -> anyhow::Result<Value> {
            self.calls.push(endpoint.to_string());
            if let Some(pages) = self.pages.get(endpoint) {
                let page = params
                    .iter()
                    .find(|(key, _)| *key == "page")
                    .and_then(|(_, value)| value.parse::<usize>().ok())
                    .unwrap_or(1);
                return Ok(pages
                    .get(page - 1)
                    .cloned()
                    .unwrap_or_else(|| json!({"items": [], "has_more": false})));
            }
            Ok(self
                .responses
                .get(endpoint)
                .cloned()
                .unwrap_or_else(|| json!({"items": [], "has_more": false})))
        }

        fn request_count(&self) -> usize {
            self.calls.len()
        }
    }

    fn settings() -> CrawlSettings {
        CrawlSettings {
            page_delay: Duration::from_millis(1000),
            document_delay: Duration::from_millis(500),
            comment_delay: Duration::from_millis(200),
            answer_delay: Duration::from_millis(200),
        }
    }

    fn summaries(start: u64, count: usize) -> Vec<Value> {
        (0..count as u64)
            .map(|offset| json!({"question_id": start + offset}))
            .collect()
    }

    #[test]
    fn collect_drains_every_page_in_order() {
        let mut api = MockSource::default();
        api.list(
            "questions",
            vec![
                json!({"items": summaries(1, PAGE_SIZE), "has_more": true}),
                json!({"items": summaries(101, PAGE_SIZE), "has_more": true}),
                json!({"items": summaries(201, 37), "has_more": false}),
            ],
        );
        let mut pacer = RecordingPacer::default();
        let mut crawler = Crawler::new(&mut api, &mut pacer, settings());

        let items = crawler.collect("questions").expect("collect");
        assert_eq!(items.len(), 2 * PAGE_SIZE + 37);
        let ids = items
            .iter()
            .map(|item| item["question_id"].as_u64().expect("id"))
            .collect::<Vec<_>>();
        assert_eq!(ids, (1..=237).collect::<Vec<_>>());
        assert_eq!(pacer.pauses, vec![Duration::from_millis(1000); 2]);
        assert_eq!(api.calls.len(), 3);
    }

    #[test]
    fn collect_stops_on_empty_page_claiming_more() {
        let mut api = MockSource::default();
        api.list("articles", vec![json!({"items": [], "has_more": true})]);
        let mut pacer = RecordingPacer::default();
        let mut crawler = Crawler::new(&mut api, &mut pacer, settings());
        assert!(crawler.collect("articles").expect("collect").is_empty());
        assert_eq!(api.calls.len(), 1);
    }

    #[test]
    fn missing_comment_detail_is_omitted_with_diagnostic() {
        let mut api = MockSource::default();
        api.detail(
            "questions/1",
            Some(json!({"question_id": 1, "title": "Q", "body": "<p>q</p>"})),
        );
        api.list(
            "questions/1/comments",
            vec![json!({
                "items": [{"comment_id": 11}, {"comment_id": 12}, {"comment_id": 13}],
                "has_more": false
            })],
        );
        api.detail(
            "comments/11",
            Some(json!({"comment_id": 11, "creation_date": 5, "body": "first"})),
        );
        api.detail("comments/12", None);
        api.detail(
            "comments/13",
            Some(json!({"comment_id": 13, "creation_date": 9, "body_markdown": "third"})),
        );

        let mut pacer = RecordingPacer::default();
        let mut crawler = Crawler::new(&mut api, &mut pacer, settings());
        let document = crawler
            .hydrate(DocumentKind::Question, 1)
            .expect("hydrate")
            .expect("document");

        assert_eq!(document.comments.len(), 2);
        assert_eq!(document.omitted_comments, 1);
        assert_eq!(document.comments[1].body.as_deref(), Some("third"));
        assert_eq!(crawler.diagnostics().len(), 1);
        assert!(crawler.diagnostics()[0].contains("comment 12"));
        assert_eq!(document.answers.as_deref().map(<[_]>::len), Some(0));
    }

    #[test]
    fn question_hydrates_answers_and_their_comments() {
        let mut api = MockSource::default();
        api.list(
            "questions",
            vec![json!({"items": [{"question_id": 1}], "has_more": false})],
        );
        api.detail(
            "questions/1",
            Some(json!({"question_id": 1, "title": "Q", "comments": [], "answers": []})),
        );
        api.list(
            "questions/1/answers",
            vec![json!({
                "items": [{"answer_id": 10, "is_accepted": true, "body": "<p>yes</p>", "creation_date": 20}],
                "has_more": false
            })],
        );
        api.list(
            "answers/10/comments",
            vec![json!({"items": [{"comment_id": 100}], "has_more": false})],
        );
        api.detail(
            "comments/100",
            Some(json!({"comment_id": 100, "creation_date": 30, "body": "thanks"})),
        );

        let mut pacer = RecordingPacer::default();
        let report =
            crawl_documents(&mut api, &mut pacer, settings(), DocumentKind::Question)
                .expect("crawl");

        assert_eq!(report.listed, 1);
        assert_eq!(report.hydrated, 1);
        assert_eq!(report.dropped, 0);
        let document = &report.documents[0];
        let answers = document.answers();
        assert_eq!(answers.len(), 1);
        assert!(answers[0].is_accepted);
        assert_eq!(answers[0].body_markdown.as_deref(), Some("<p>yes</p>"));
        assert_eq!(answers[0].comments.len(), 1);
        assert_eq!(answers[0].comments[0].body_markdown.as_deref(), Some("thanks"));
        assert!(pacer.pauses.contains(&Duration::from_millis(200)));
        assert_eq!(report.request_count, api.calls.len());
    }

    #[test]
    fn empty_document_detail_drops_document() {
        let mut api = MockSource::default();
        api.list(
            "articles",
            vec![json!({"items": [{"article_id": 1}, {"article_id": 2}], "has_more": false})],
        );
        api.detail("articles/1", None);
        api.detail(
            "articles/2",
            Some(json!({"article_id": 2, "title": "Second", "body": "<p>a</p>"})),
        );

        let mut pacer = RecordingPacer::default();
        let report = crawl_documents(&mut api, &mut pacer, settings(), DocumentKind::Article)
            .expect("crawl");
        assert_eq!(report.hydrated, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.documents[0].article_id, Some(2));
        assert!(report.documents[0].answers.is_none());
        assert!(report.diagnostics[0].contains("article 1"));
        assert!(!api.calls.iter().any(|call| call.contains("answers")));
        assert_eq!(
            pacer
                .pauses
                .iter()
                .filter(|pause| **pause == Duration::from_millis(500))
                .count(),
            1
        );
    }

    #[test]
    fn comments_and_answers_are_sorted_oldest_first_keeping_ties() {
        let mut api = MockSource::default();
        api.detail("questions/1", Some(json!({"question_id": 1, "title": "Q"})));
        api.list(
            "questions/1/comments",
            vec![json!({
                "items": [{"comment_id": 23}, {"comment_id": 22}, {"comment_id": 21}, {"comment_id": 24}],
                "has_more": false
            })],
        );
        for (id, created) in [(23, 30), (22, 20), (21, 20), (24, 10)] {
            api.detail(
                &format!("comments/{id}"),
                Some(json!({"comment_id": id, "creation_date": created, "body": "c"})),
            );
        }
        api.list(
            "questions/1/answers",
            vec![json!({
                "items": [
                    {"answer_id": 33, "creation_date": 300},
                    {"answer_id": 32, "creation_date": 200},
                    {"answer_id": 31, "creation_date": 200},
                    {"answer_id": 34, "creation_date": 100}
                ],
                "has_more": false
            })],
        );

        let mut pacer = RecordingPacer::default();
        let mut crawler = Crawler::new(&mut api, &mut pacer, settings());
        let document = crawler
            .hydrate(DocumentKind::Question, 1)
            .expect("hydrate")
            .expect("document");

        let comment_ids = document
            .comments
            .iter()
            .map(|comment| comment.comment_id)
            .collect::<Vec<_>>();
        assert_eq!(comment_ids, vec![24, 22, 21, 23]);
        let answer_ids = document
            .answers()
            .iter()
            .map(|answer| answer.answer_id)
            .collect::<Vec<_>>();
        assert_eq!(answer_ids, vec![34, 32, 31, 33]);
    }

    #[test]
    fn comment_summary_without_id_is_counted_and_noted() {
        let mut api = MockSource::default();
        api.detail("articles/5", Some(json!({"article_id": 5, "title": "A"})));
        api.list(
            "articles/5/comments",
            vec![json!({"items": [{"score": 1}], "has_more": false})],
        );

        let mut pacer = RecordingPacer::default();
        let mut crawler = Crawler::new(&mut api, &mut pacer, settings());
        let document = crawler
            .hydrate(DocumentKind::Article, 5)
            .expect("hydrate")
            .expect("document");
        assert!(document.comments.is_empty());
        assert_eq!(document.omitted_comments, 1);
        assert_eq!(
            crawler.diagnostics(),
            ["comment summary without comment_id on articles/5".to_string()]
        );
    }
}
