//! Reply text for chat commands.

use apkforge_core::{Batch, BuildReport, Status, WorkflowError};

use crate::commands::{confirm_callback, download_callback};
use crate::telegram::{InlineKeyboardButton, InlineKeyboardMarkup};

pub const HELP: &str = "APK build bot.\n\n\
/list → recent batches\n\
/confirm <batchId> [project] → allocate the next build number, pick a config template and build\n\
/download <batchId> → send a finished build";

/// One line per batch, plus Confirm/Download buttons where they apply.
pub fn batch_list(batches: &[Batch]) -> (String, InlineKeyboardMarkup) {
    if batches.is_empty() {
        return ("No batches found.".to_string(), InlineKeyboardMarkup::default());
    }
    let mut lines = Vec::with_capacity(batches.len());
    let mut keyboard = InlineKeyboardMarkup::default();
    for b in batches {
        lines.push(format!("• {} | {} | status: {}", b.id, b.artifact_name, b.status));
        let button = match b.status {
            Status::Available | Status::WaitingConfirm => Some(InlineKeyboardButton {
                text: format!("Confirm: {}", b.artifact_name),
                callback_data: confirm_callback(&b.id),
            }),
            Status::Built => Some(InlineKeyboardButton {
                text: format!("Download: {}", b.artifact_name),
                callback_data: download_callback(&b.id),
            }),
            Status::Confirmed | Status::Building | Status::Error => None,
        };
        if let Some(button) = button {
            keyboard.inline_keyboard.push(vec![button]);
        }
    }
    (lines.join("\n"), keyboard)
}

pub fn build_started(report: &BuildReport) -> String {
    format!(
        "Build started → project={}, seq={}, template={}",
        report.project, report.seq, report.template_index
    )
}

pub fn build_caption(report: &BuildReport) -> String {
    format!(
        "✅ Build complete\nproject={} • seq={} • template={}",
        report.project, report.seq, report.template_index
    )
}

/// Caption for a re-sent artifact.
pub fn download_caption(batch: &Batch) -> String {
    let seq = batch.apk_seq.map_or("?".to_string(), |n| n.to_string());
    let index = batch.template_index_used.map_or("?".to_string(), |n| n.to_string());
    format!(
        "{}\nproject={} • seq={seq} • template={index}",
        batch.artifact_name,
        batch.resolved_project()
    )
}

pub fn undelivered(report: &BuildReport, reason: &str) -> String {
    format!(
        "Build done but download failed: {reason}\nRetry with /download {}",
        report.batch_id
    )
}

/// Message for a failed confirm or download.
pub fn workflow_error(err: &WorkflowError) -> String {
    match err {
        WorkflowError::NotFound(_) => "Batch not found.".to_string(),
        WorkflowError::Conflict(status) => format!("Already {status}."),
        WorkflowError::NotReady(_) => "APK is not ready yet.".to_string(),
        WorkflowError::TemplateNotFound(project) => format!("{project}: no config template found."),
        WorkflowError::EmptyTemplate { project, index } => {
            format!("{project}: template #{index} is empty.")
        }
        WorkflowError::BuildSubmit(reason) => format!("Build could not start: {reason}"),
        WorkflowError::BuildExecution(reason) => format!("Build failed: {reason}"),
        WorkflowError::ArtifactFetch(reason) => format!("Download error: {reason}"),
        other => format!("Error: {other}"),
    }
}
