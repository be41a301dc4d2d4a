//! Resumable ingestion of reader actions from a JSONL file or an HTTP feed.
//!
//! Progress is kept in a small state file (`cursor`, `mode`, `last_ok`,
//! `last_error`) so a later run continues where the previous one stopped.

use anyhow::{Context as _, Result};
use leselern_core::Context;
use leselern_feedback::{Action, ActionType, RecommendationEngine};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{error, info, warn};

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    Http,
    File,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct IngestState {
    pub cursor: u64,
    pub mode: IngestMode,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_ok: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

impl IngestState {
    pub fn load(path: &Path, expected_mode: IngestMode) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let state: IngestState = serde_json::from_reader(file)?;

        if state.mode != expected_mode {
            anyhow::bail!(
                "State file mode mismatch: expected {:?}, found {:?}",
                expected_mode,
                state.mode
            );
        }

        Ok(Some(state))
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

/// One action as it arrives from a file line or feed entry.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ActionEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub identity: String,
    pub book_id: String,
    #[serde(alias = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default)]
    pub context: Option<Context>,
}

impl ActionEvent {
    /// Events without id get `fallback_id`, events without timestamp get `now`.
    fn into_action(self, fallback_id: String, now: OffsetDateTime) -> Action {
        Action {
            id: self.id.unwrap_or(fallback_id),
            identity: self.identity,
            book_id: self.book_id,
            action_type: self.action_type,
            value: self.value,
            timestamp: self.timestamp.unwrap_or(now),
            context: self.context,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct FeedResponse {
    pub events: Vec<ActionEvent>,
    pub next_cursor: Option<u64>,
    pub has_more: bool,
}

pub struct FetchResult {
    pub events: Vec<Action>,
    pub next_cursor: Option<u64>,
    pub has_more: bool,
}

/// Totals over all batches of one run.
#[derive(Serialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub batches: u32,
    pub events: usize,
    pub applied: usize,
    pub failed: usize,
    pub rejected: usize,
    pub cursor: u64,
}

fn record_state_error(
    state_file: &Path,
    mode: IngestMode,
    cursor: u64,
    err_msg: &str,
) -> Result<()> {
    let old_last_ok = if let Ok(Some(s)) = IngestState::load(state_file, mode) {
        s.last_ok
    } else {
        None
    };

    let state = IngestState {
        cursor,
        mode,
        last_ok: old_last_ok,
        last_error: Some(err_msg.to_string()),
    };

    if let Err(e) = state.save(state_file) {
        error!(
            state_file = %state_file.display(),
            original = err_msg,
            error = %e,
            "failed to save error state"
        );
        return Err(e);
    }

    Ok(())
}

/// Normalizes a feed base URL to `<base>/v1/actions`.
pub fn build_feed_url(base: &str) -> Result<url::Url> {
    let mut target_url = url::Url::parse(base).context("Invalid base URL")?;

    let mut segments: Vec<String> = target_url
        .path_segments()
        .map(|iter| iter.map(String::from).collect())
        .unwrap_or_default();

    if segments.last().is_some_and(String::is_empty) {
        segments.pop();
    }

    if segments.ends_with(&["v1".to_string(), "actions".to_string()]) {
        segments.pop();
        segments.pop();
    } else if segments.ends_with(&["v1".to_string()]) {
        segments.pop();
    }

    target_url
        .path_segments_mut()
        .map_err(|()| anyhow::anyhow!("URL cannot be used as a base"))?
        .clear()
        .extend(segments)
        .push("v1")
        .push("actions");

    Ok(target_url)
}

pub fn fetch_http(
    base: &str,
    cursor: Option<u64>,
    limit: u32,
    token: Option<&str>,
    now: OffsetDateTime,
) -> Result<FetchResult> {
    let target_url = build_feed_url(base).context("Failed to build feed URL")?;
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let mut query = vec![("limit", limit.to_string())];
    if let Some(c) = cursor {
        query.push(("cursor", c.to_string()));
    }
    let mut req = client.get(target_url.as_str()).query(&query);
    if let Some(t) = token {
        req = req.bearer_auth(t);
    }

    let body: FeedResponse = req
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .with_context(|| format!("Failed to fetch from {target_url}"))?
        .json()
        .context("Malformed feed response")?;

    let start = cursor.unwrap_or(0);
    let events = body
        .events
        .into_iter()
        .enumerate()
        .map(|(i, ev)| ev.into_action(format!("feed-{start}-{i}"), now))
        .collect();

    Ok(FetchResult {
        events,
        next_cursor: body.next_cursor,
        has_more: body.has_more,
    })
}

pub fn fetch_file(path: &Path, offset: u64, now: OffsetDateTime) -> Result<FetchResult> {
    let f = File::open(path).context("Failed to open input file")?;
    let reader = BufReader::new(f);
    let mut events = Vec::new();
    let mut lines_read: u64 = 0;

    for (idx, line) in reader.lines().enumerate() {
        let idx = idx as u64;
        if idx < offset {
            continue;
        }
        let line = line?;
        lines_read += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: ActionEvent = serde_json::from_str(&line)
            .with_context(|| format!("Invalid action on line {}", idx + 1))?;
        events.push(event.into_action(format!("{}#{idx}", path.display()), now));
    }

    let next_offset = offset.checked_add(lines_read).context("Cursor overflow")?;

    Ok(FetchResult {
        events,
        next_cursor: Some(next_offset),
        has_more: false,
    })
}

/// Feeds one fetched batch through the engine and advances the cursor.
///
/// Returns whether the source reported more data.
pub fn process_ingest(
    engine: &RecommendationEngine,
    source_result: Result<FetchResult>,
    state_file: &Path,
    current_cursor: &mut u64,
    mode: IngestMode,
    summary: &mut IngestSummary,
) -> Result<bool> {
    let fetch_result = match source_result {
        Ok(r) => r,
        Err(e) => {
            let err_msg = e.to_string();
            warn!(error = %err_msg, "ingest failed");
            if let Err(e) = record_state_error(state_file, mode, *current_cursor, &err_msg) {
                error!(error = %e, "failed to record error state");
            }
            return Err(e.context("Ingestion cycle failed"));
        }
    };

    for action in fetch_result.events {
        summary.events += 1;
        match engine.ingest_action(action) {
            Ok(report) => {
                summary.applied += report.applied();
                summary.failed += report.failed();
            }
            Err(e) => {
                warn!(error = %e, "action rejected");
                summary.rejected += 1;
            }
        }
    }
    summary.batches += 1;

    if fetch_result.next_cursor.is_none() && fetch_result.has_more {
        let err_msg = "Protocol Error: has_more=true but next_cursor is missing.";
        if let Err(e) = record_state_error(state_file, mode, *current_cursor, err_msg) {
            error!(error = %e, "failed to record error state");
        }
        return Err(anyhow::anyhow!(err_msg));
    }

    if let Some(nc) = fetch_result.next_cursor {
        if nc == *current_cursor && fetch_result.has_more {
            let err_msg = format!(
                "Protocol Error: Stalled cursor {} with has_more=true",
                *current_cursor
            );
            if let Err(e) = record_state_error(state_file, mode, *current_cursor, &err_msg) {
                error!(error = %e, "failed to record error state");
            }
            return Err(anyhow::anyhow!(err_msg));
        }
        *current_cursor = nc;
    }

    IngestState {
        cursor: *current_cursor,
        mode,
        last_ok: Some(OffsetDateTime::now_utc()),
        last_error: None,
    }
    .save(state_file)
    .context("Failed to save state")?;
    summary.cursor = *current_cursor;
    info!(cursor = *current_cursor, "ingest state updated");

    Ok(fetch_result.has_more)
}
