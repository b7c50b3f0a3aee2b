use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use tracing::info;

use crate::model::{Document, DocumentKind};

/// Serialize documents as a top-level JSON array with four-space indentation.
pub fn render_snapshot(documents: &[Document]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    documents
        .serialize(&mut serializer)
        .context("failed to serialize snapshot")?;
    buffer.push(b'\n');
    Ok(buffer)
}

/// Replace the snapshot at `path` in one step: write a sibling temp file, then rename.
pub fn write_snapshot(path: &Path, documents: &[Document]) -> Result<()> {
    let payload = render_snapshot(documents)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let temp_path = temp_path_for(path);
    {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("failed to create {}", temp_path.display()))?;
        file.write_all(&payload)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to flush {}", temp_path.display()))?;
    }
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            temp_path.display(),
            path.display()
        )
    })?;
    info!("wrote {} documents to {}", documents.len(), path.display());
    Ok(())
}

pub fn read_snapshot(path: &Path, kind: DocumentKind) -> Result<Vec<Document>> {
    if !path.exists() {
        bail!(
            "snapshot not found: {} (run `kbmigrate export {}` first)",
            path.display(),
            kind.collection()
        );
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut documents: Vec<Document> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse snapshot {}", path.display()))?;
    for document in &mut documents {
        for comment in &mut document.comments {
            comment.backfill_bodies();
        }
        if let Some(answers) = document.answers.as_mut() {
            for answer in answers {
                answer.backfill_bodies();
                for comment in &mut answer.comments {
                    comment.backfill_bodies();
                }
            }
        }
    }
    Ok(documents)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
