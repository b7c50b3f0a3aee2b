use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::assets::{
    AssetPattern, LocalAssetLibrary, document_references, rewrite_asset_urls, rewrite_document,
    scan_nodes,
};
use crate::destination::{AssetUpload, DestinationApi, find_page_by_title};
use crate::markup::normalize_title;
use crate::model::{Document, DocumentKind};
use crate::snapshot::{read_snapshot, write_snapshot};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetCollision {
    pub filename: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcilePageResult {
    pub title: String,
    pub page_id: Option<String>,
    pub action: String,
    pub rewritten: usize,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub dry_run: bool,
    pub scanned: usize,
    pub pages_updated: usize,
    pub uploaded: usize,
    pub reused: usize,
    pub unmatched: Vec<String>,
    pub collisions: Vec<AssetCollision>,
    pub missing_pages: Vec<String>,
    pub errors: Vec<String>,
    pub pages: Vec<ReconcilePageResult>,
    pub changed: bool,
    pub request_count: usize,
}

/// What happened to the live page body.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PageCommit {
    Rewritten(usize),
    /// Nothing to rewrite and every attachment URL is already on the page.
    Current,
    /// Nothing to rewrite, yet these old URLs have no attachment URL on the page.
    Stale(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadAction {
    Created,
    Updated,
    Reused,
}

/// Upload embedded assets for every mirrored document and point its page and
/// snapshot copy at the destination-hosted attachments.
pub fn reconcile_documents<A: DestinationApi>(
    api: &mut A,
    documents: &mut [Document],
    library: &LocalAssetLibrary,
    pattern: &AssetPattern,
    options: ReconcileOptions,
) -> ReconcileReport {
    let mut report = ReconcileReport {
        dry_run: options.dry_run,
        ..ReconcileReport::default()
    };

    let collisions = find_collisions(documents, pattern);
    let colliding = collisions
        .iter()
        .map(|collision| collision.filename.clone())
        .collect::<BTreeSet<_>>();
    for collision in &collisions {
        warn!(
            "asset filename {} is shared by {} different URLs; leaving them unrewritten",
            collision.filename,
            collision.urls.len()
        );
    }
    report.collisions = collisions;

    for document in documents.iter_mut() {
        report.scanned += 1;
        let references = document_references(document, pattern);
        if references.is_empty() {
            continue;
        }

        let mut candidates: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for reference in references {
            if colliding.contains(&reference.filename) {
                continue;
            }
            if library.contains(&reference.filename) {
                candidates
                    .entry(reference.filename)
                    .or_default()
                    .push(reference.url);
            } else {
                report.unmatched.push(reference.url);
            }
        }
        if candidates.is_empty() {
            continue;
        }

        let title = normalize_title(&document.title, document.kind());
        let page = match find_page_by_title(api, &title) {
            Ok(Some(page)) => page,
            Ok(None) => {
                warn!("no destination page titled {title}; run import first");
                report.missing_pages.push(title);
                continue;
            }
            Err(error) => {
                report.errors.push(format!("{title}: {error:#}"));
                continue;
            }
        };

        if options.dry_run {
            report.pages.push(ReconcilePageResult {
                title,
                page_id: Some(page.id),
                action: "would_update".to_string(),
                rewritten: 0,
                detail: Some(format!(
                    "{} asset(s) to upload",
                    candidates.len()
                )),
            });
            continue;
        }

        let mut replacements = BTreeMap::new();
        for (filename, urls) in &candidates {
            match upload_from_library(api, &page.id, library, filename) {
                Ok(action) => {
                    match action {
                        UploadAction::Reused => report.reused += 1,
                        UploadAction::Created | UploadAction::Updated => report.uploaded += 1,
                    }
                    let target = api.attachment_url(&page.id, filename);
                    for url in urls {
                        replacements.insert(url.clone(), target.clone());
                    }
                }
                Err(error) => {
                    warn!("failed to upload {filename} to page {}: {error:#}", page.id);
                    report.errors.push(format!("{title}: {filename}: {error:#}"));
                }
            }
        }
        if replacements.is_empty() {
            continue;
        }

        let mut updated = document.clone();
        rewrite_document(&mut updated, &replacements);

        let result = match commit_page(api, &page.id, &replacements) {
            Ok(PageCommit::Current) => ReconcilePageResult {
                title,
                page_id: Some(page.id),
                action: "unchanged".to_string(),
                rewritten: 0,
                detail: None,
            },
            Ok(PageCommit::Rewritten(rewritten)) => {
                report.pages_updated += 1;
                info!("rewrote {rewritten} asset reference(s) on {title}");
                ReconcilePageResult {
                    title,
                    page_id: Some(page.id),
                    action: "updated".to_string(),
                    rewritten,
                    detail: None,
                }
            }
            Ok(PageCommit::Stale(missing)) => {
                warn!(
                    "page {title} has no rewritable reference to {} asset(s); snapshot left as is",
                    missing.len()
                );
                report
                    .errors
                    .push(format!("{title}: page does not reference {}", missing.join(", ")));
                report.unmatched.extend(missing.iter().cloned());
                report.pages.push(ReconcilePageResult {
                    title,
                    page_id: Some(page.id),
                    action: "stale".to_string(),
                    rewritten: 0,
                    detail: Some(format!("{} reference(s) not found on page", missing.len())),
                });
                continue;
            }
            Err(error) => {
                report.errors.push(format!("{title}: {error:#}"));
                report.pages.push(ReconcilePageResult {
                    title,
                    page_id: Some(page.id),
                    action: "failed".to_string(),
                    rewritten: 0,
                    detail: Some(format!("{error:#}")),
                });
                continue;
            }
        };
        report.pages.push(result);

        if updated != *document {
            *document = updated;
            report.changed = true;
        }
    }

    report.request_count = api.request_count();
    report
}

/// Load, reconcile, and persist one snapshot. The file is rewritten only when
/// a document changed.
pub fn reconcile_snapshot<A: DestinationApi>(
    api: &mut A,
    snapshot_path: &Path,
    kind: DocumentKind,
    library: &LocalAssetLibrary,
    pattern: &AssetPattern,
    options: ReconcileOptions,
) -> Result<ReconcileReport> {
    let mut documents = read_snapshot(snapshot_path, kind)?;
    info!(
        "reconciling {} {} against {} local assets",
        documents.len(),
        kind.collection(),
        library.len()
    );
    let report = reconcile_documents(api, &mut documents, library, pattern, options);
    if report.changed && !options.dry_run {
        write_snapshot(snapshot_path, &documents)?;
    }
    Ok(report)
}

/// Filenames that more than one distinct asset URL maps to, anywhere in the corpus.
pub fn find_collisions(documents: &[Document], pattern: &AssetPattern) -> Vec<AssetCollision> {
    let mut by_filename: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for document in documents {
        for reference in document_references(document, pattern) {
            let urls = by_filename.entry(reference.filename).or_default();
            if !urls.contains(&reference.url) {
                urls.push(reference.url);
            }
        }
    }
    by_filename
        .into_iter()
        .filter(|(_, urls)| urls.len() > 1)
        .map(|(filename, urls)| AssetCollision { filename, urls })
        .collect()
}

fn upload_from_library<A: DestinationApi>(
    api: &mut A,
    page_id: &str,
    library: &LocalAssetLibrary,
    filename: &str,
) -> Result<UploadAction> {
    let Some(upload) = library.load(filename)? else {
        anyhow::bail!("{filename} is not in the local asset directory");
    };
    upload_asset(api, page_id, &upload)
}

/// Attach `upload` to a page: reuse an attachment carrying the same content
/// hash, replace the data of one that differs, or create a new one.
fn upload_asset<A: DestinationApi>(
    api: &mut A,
    page_id: &str,
    upload: &AssetUpload,
) -> Result<UploadAction> {
    match api.find_attachment(page_id, &upload.filename)? {
        Some(existing) if existing.content_hash() == Some(upload.content_hash.as_str()) => {
            Ok(UploadAction::Reused)
        }
        Some(existing) => {
            api.update_attachment_data(page_id, &existing.id, upload)?;
            Ok(UploadAction::Updated)
        }
        None => {
            api.create_attachment(page_id, upload)?;
            Ok(UploadAction::Created)
        }
    }
}

/// Rewrite the live page body and submit it as the next version.
fn commit_page<A: DestinationApi>(
    api: &mut A,
    page_id: &str,
    replacements: &BTreeMap<String, String>,
) -> Result<PageCommit> {
    let current = api.get_page(page_id)?;
    let (body, rewritten) = rewrite_asset_urls(&current.body, replacements);
    if rewritten == 0 {
        let present = scan_nodes(&current.body)
            .into_iter()
            .map(|node| node.url)
            .collect::<BTreeSet<_>>();
        let missing = replacements
            .iter()
            .filter(|(_, target)| !present.contains(*target))
            .map(|(old, _)| old.clone())
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(PageCommit::Current);
        }
        return Ok(PageCommit::Stale(missing));
    }
    api.update_page(&current.id, &current.title, current.version + 1, &body)?;
    Ok(PageCommit::Rewritten(rewritten))
}
