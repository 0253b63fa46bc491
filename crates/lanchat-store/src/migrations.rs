//! Startup upgrade of chat logs written by older servers.
//!
//! Older logs may contain messages without a `read` flag (those predate
//! read tracking and count as read) or without an `id`. Each log is
//! rewritten once with both fields filled in; logs already up to date are
//! left untouched.

use std::path::Path;

use lanchat_shared::constants::MESSAGES_FILE;
use serde_json::Value;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::json_file;

/// Summary of a [`backfill_messages`] run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub logs_scanned: usize,
    pub logs_rewritten: usize,
    pub messages_updated: usize,
    pub logs_skipped: usize,
}

/// Walk every pair directory under `root` and backfill missing fields.
///
/// A log that cannot be parsed is logged and skipped rather than failing
/// startup.
pub async fn backfill_messages(root: &Path) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();
    fs::create_dir_all(root).await?;

    let mut entries = fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let path = entry.path().join(MESSAGES_FILE);
        if !fs::try_exists(&path).await? {
            continue;
        }
        report.logs_scanned += 1;

        let mut messages: Vec<Value> = match json_file::read_or_default(&path).await {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable chat log");
                report.logs_skipped += 1;
                continue;
            }
        };

        let updated = messages
            .iter_mut()
            .map(backfill_one)
            .filter(|changed| *changed)
            .count();
        if updated > 0 {
            json_file::write_atomic(&path, &messages).await?;
            report.logs_rewritten += 1;
            report.messages_updated += updated;
        }
    }

    info!(
        scanned = report.logs_scanned,
        rewritten = report.logs_rewritten,
        updated = report.messages_updated,
        skipped = report.logs_skipped,
        "Chat log migration complete"
    );
    Ok(report)
}

fn backfill_one(message: &mut Value) -> bool {
    let Some(obj) = message.as_object_mut() else {
        return false;
    };
    let mut changed = false;
    if !obj.contains_key("read") {
        obj.insert("read".into(), Value::Bool(true));
        changed = true;
    }
    if !obj.contains_key("id") {
        obj.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        changed = true;
    }
    changed
}
