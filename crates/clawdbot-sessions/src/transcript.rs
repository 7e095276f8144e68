//! Transcript files: one JSONL file per session id under `sessions/`.
//!
//! Lifecycle mirrors the session registry: compact keeps a `.bak.<ts>`
//! copy, delete renames to `.deleted.<ts>` (soft-delete, recoverable),
//! reset unlinks the old id's file outright.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// One transcript line — an assistant/user event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptLine {
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

/// Deterministic transcript path for a session id.
pub fn transcript_path(sessions_dir: &Path, session_id: &str) -> PathBuf {
    sessions_dir.join(format!("sess-{session_id}.jsonl"))
}

/// Append one event line. Creates the file on first write.
pub fn append(sessions_dir: &Path, session_id: &str, line: &TranscriptLine) -> Result<()> {
    clawdbot_core::fsio::ensure_private_dir(sessions_dir)?;
    let path = transcript_path(sessions_dir, session_id);
    let mut json = serde_json::to_string(line)?;
    json.push('\n');
    use std::io::Write;
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

/// Read the last `max_lines` events (all of them when `max_lines` is 0).
pub fn tail(sessions_dir: &Path, session_id: &str, max_lines: usize) -> Result<Vec<TranscriptLine>> {
    let path = transcript_path(sessions_dir, session_id);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)?;
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = if max_lines > 0 && lines.len() > max_lines {
        lines.len() - max_lines
    } else {
        0
    };
    Ok(lines[start..]
        .iter()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// Truncate the transcript to its last `max_lines` lines, keeping a
/// `.bak.<ts>` copy of the original. Returns false when there was nothing
/// to trim.
pub fn compact(sessions_dir: &Path, session_id: &str, max_lines: usize) -> Result<bool> {
    let path = transcript_path(sessions_dir, session_id);
    if !path.exists() {
        return Ok(false);
    }
    let text = fs::read_to_string(&path)?;
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return Ok(false);
    }

    let ts = chrono::Utc::now().timestamp();
    let bak = sessions_dir.join(format!("sess-{session_id}.jsonl.bak.{ts}"));
    fs::copy(&path, &bak)?;

    let kept = lines[lines.len() - max_lines..].join("\n") + "\n";
    clawdbot_core::fsio::write_atomic(&path, kept.as_bytes(), 0o600)?;
    debug!(session_id, kept = max_lines, dropped = lines.len() - max_lines, "transcript compacted");
    Ok(true)
}

/// Soft-delete: rename to `sess-<id>.jsonl.deleted.<ts>` for recovery.
pub fn soft_delete(sessions_dir: &Path, session_id: &str) -> Result<Option<PathBuf>> {
    let path = transcript_path(sessions_dir, session_id);
    if !path.exists() {
        return Ok(None);
    }
    let ts = chrono::Utc::now().timestamp();
    let target = sessions_dir.join(format!("sess-{session_id}.jsonl.deleted.{ts}"));
    fs::rename(&path, &target)?;
    Ok(Some(target))
}

/// Hard-delete the transcript of a superseded session id (reset path).
pub fn remove(sessions_dir: &Path, session_id: &str) -> Result<()> {
    let path = transcript_path(sessions_dir, session_id);
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}
