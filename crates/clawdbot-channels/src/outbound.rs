//! Outbound delivery: code-fence-aware chunking plus the dock-driven
//! delivery loop.
//!
//! When a split falls inside a fenced code block, the fence is closed
//! before the chunk boundary and re-opened at the start of the next chunk
//! so every chunk renders standalone.

use std::time::Duration;

use tracing::warn;

use crate::dock::ChannelDock;
use crate::error::ChannelError;
use crate::types::{ChannelTransport, OutboundPayload};

/// Delay between consecutive chunks to stay under channel rate limits.
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(100);

/// Bytes reserved at the chunk edge for a `\n`-prefixed closing fence.
const FENCE_CLOSE_RESERVE: usize = 4;

/// Longest fence language tag worth reopening in the next chunk.
const MAX_REOPEN_TAG: usize = 24;

/// Below this, fence bookkeeping has no headroom and chunking degrades to
/// plain char-boundary slices.
const MIN_SMART_LIMIT: usize = 64;

/// Split `text` into chunks of at most `limit` bytes.
///
/// Splits land on line boundaries where possible. A chunk boundary inside
/// a fenced code block closes the fence and the next chunk reopens it with
/// the same language tag. A single line longer than the limit wraps on
/// char boundaries, never mid-character, breaking at a space when one sits
/// near the edge.
pub fn split_chunks(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }
    if limit < MIN_SMART_LIMIT {
        return char_slices(text, limit.max(1));
    }

    let mut out: Vec<String> = Vec::new();
    let mut chunk = String::new();
    let mut fence: Option<&str> = None;

    for line in text.split('\n') {
        // an open fence needs room for its closing marker at the edge
        let budget = if fence.is_some() {
            limit - FENCE_CLOSE_RESERVE
        } else {
            limit
        };
        let sep = usize::from(!chunk.is_empty());

        if !chunk.is_empty() && chunk.len() + sep + line.len() > budget {
            finish_chunk(&mut out, &mut chunk, fence);
        }
        if !chunk.is_empty() {
            chunk.push('\n');
        }

        if chunk.len() + line.len() <= budget {
            chunk.push_str(line);
        } else {
            // the line alone outgrows the budget: wrap it piecewise. The
            // chunk here is at most a reopened fence seed, so there is
            // always room for at least one character.
            let mut rest = line;
            while !rest.is_empty() {
                let room = budget - chunk.len();
                if rest.len() <= room {
                    chunk.push_str(rest);
                    break;
                }
                let cut = wrap_point(rest, room);
                chunk.push_str(&rest[..cut]);
                rest = rest[cut..].trim_start();
                finish_chunk(&mut out, &mut chunk, fence);
                // a reopened fence seed takes its own line before the
                // wrapped remainder continues
                if !chunk.is_empty() && !rest.is_empty() {
                    chunk.push('\n');
                }
            }
        }

        // fence state flips after the line lands in the chunk
        if let Some(tag) = line.trim_start().strip_prefix("```") {
            fence = match fence {
                Some(_) => None,
                None => Some(tag.trim()),
            };
        }
    }

    // a fence left open at text end stays open; nothing to reopen
    finish_chunk(&mut out, &mut chunk, None);
    out
}

/// Seal the open chunk: close an open fence, push it, and seed the next
/// chunk with the reopened fence. The seed carries no trailing newline —
/// the caller's separator logic supplies it. Oversized language tags are
/// not reopened, which keeps the seed smaller than any smart-mode budget.
fn finish_chunk(out: &mut Vec<String>, chunk: &mut String, fence: Option<&str>) {
    if chunk.is_empty() {
        return;
    }
    let mut sealed = std::mem::take(chunk);
    if fence.is_some() {
        sealed.push_str("\n```");
    }
    out.push(sealed);
    if let Some(tag) = fence {
        if tag.len() <= MAX_REOPEN_TAG {
            chunk.push_str("```");
            chunk.push_str(tag);
        }
    }
}

/// Largest byte index `<= room` where `s` may be cut: the last space that
/// fits, or failing that the nearest char boundary. Never lands inside a
/// multibyte character.
fn wrap_point(s: &str, room: usize) -> usize {
    if s.len() <= room {
        return s.len();
    }
    let mut edge = room;
    while edge > 0 && !s.is_char_boundary(edge) {
        edge -= 1;
    }
    match s[..edge].rfind(' ') {
        Some(pos) if pos > 0 => pos,
        _ => edge,
    }
}

/// Fallback for degenerate limits: fixed-size slices that respect char
/// boundaries and nothing else. Every chunk holds at least one character.
fn char_slices(text: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut chunk = String::new();
    for ch in text.chars() {
        if !chunk.is_empty() && chunk.len() + ch.len_utf8() > limit {
            out.push(std::mem::take(&mut chunk));
        }
        chunk.push(ch);
    }
    if !chunk.is_empty() {
        out.push(chunk);
    }
    out
}

/// Deliver one payload through `transport`, chunking text by the dock's
/// limit. Media and polls pass through unchunked.
pub async fn deliver(
    dock: &ChannelDock,
    transport: &dyn ChannelTransport,
    to: &str,
    payload: &OutboundPayload,
    thread_id: Option<&str>,
) -> Result<(), ChannelError> {
    match payload {
        OutboundPayload::Text { text } => {
            let chunks = split_chunks(text, dock.text_chunk_limit);
            let total = chunks.len();
            for (i, chunk) in chunks.iter().enumerate() {
                transport.send_text(to, chunk, thread_id).await?;
                if i + 1 < total {
                    tokio::time::sleep(INTER_CHUNK_DELAY).await;
                }
            }
            Ok(())
        }
        OutboundPayload::Media { url, caption } => {
            if !dock.capabilities.media {
                warn!(channel = dock.id, "dropping media payload: channel has no media support");
                return Ok(());
            }
            transport.send_media(to, url, caption.as_deref()).await
        }
        OutboundPayload::Poll { question, options } => {
            if !dock.capabilities.polls {
                // render a poll as text on channels without native polls
                let mut text = question.clone();
                for (i, option) in options.iter().enumerate() {
                    text.push_str(&format!("\n{}. {option}", i + 1));
                }
                return transport.send_text(to, &text, thread_id).await;
            }
            transport.send_poll(to, question, options).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_within_limit_stays_whole() {
        assert_eq!(split_chunks("Hello, world!", 4000), vec!["Hello, world!"]);
        let exact = "a".repeat(2000);
        assert_eq!(split_chunks(&exact, 2000), vec![exact.clone()]);
    }

    #[test]
    fn splits_prefer_line_boundaries() {
        let line = "a".repeat(900);
        let text = format!("{line}\n{line}\n{line}");
        let chunks = split_chunks(&text, 2000);
        assert_eq!(chunks.len(), 2);
        for c in &chunks {
            assert!(c.len() <= 2000, "chunk too large: {}", c.len());
            assert!(c.starts_with('a') && c.ends_with('a'));
        }
    }

    #[test]
    fn oversized_line_wraps_at_spaces() {
        let text = "word ".repeat(1000); // ~5000 bytes
        let chunks = split_chunks(text.trim_end(), 2000);
        assert!(chunks.len() >= 3);
        for c in &chunks {
            assert!(c.len() <= 2000);
            assert!(!c.starts_with(' ') && !c.ends_with(' '));
        }
    }

    #[test]
    fn oversized_line_without_spaces_force_wraps() {
        let text = "x".repeat(9000);
        let chunks = split_chunks(&text, 4000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
        for c in &chunks {
            assert!(c.len() <= 4000);
        }
    }

    #[test]
    fn multibyte_line_never_cuts_mid_character() {
        // CJK prose has no spaces and every char is 3 UTF-8 bytes; 2000 is
        // not a multiple of 3, so a byte-indexed cut would panic
        let text: String = std::iter::repeat('好').take(2500).collect();
        let chunks = split_chunks(&text, 2000);
        assert!(chunks.len() >= 4);
        for c in &chunks {
            assert!(c.len() <= 2000, "chunk too large: {}", c.len());
            assert!(c.chars().all(|ch| ch == '好'));
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunk_boundary_closes_and_reopens_fence() {
        let mut text = String::from("```python\n");
        for _ in 0..100 {
            text.push_str("print('hello world this is a reasonably long line of python code')\n");
        }
        text.push_str("```\n");

        let chunks = split_chunks(&text, 4090);
        assert!(chunks.len() >= 2);
        for (i, c) in chunks.iter().enumerate() {
            assert!(c.len() <= 4090, "chunk {i} too large: {}", c.len());
        }
        assert!(chunks[0].ends_with("```"), "first chunk must close the fence");
        assert!(
            chunks[1].starts_with("```python\n"),
            "second chunk should reopen with the language tag, got: {}",
            &chunks[1][..chunks[1].len().min(60)]
        );
    }

    #[test]
    fn untagged_fence_reopens_bare() {
        let mut text = String::from("```\n");
        for i in 0..400 {
            text.push_str(&format!("line {i}\n"));
        }
        text.push_str("```\n");
        let chunks = split_chunks(&text, 2000);
        assert!(chunks.len() >= 2);
        assert!(chunks[1].starts_with("```\n"));
    }

    #[test]
    fn degenerate_limit_still_makes_progress() {
        let chunks = split_chunks("héllo wörld", 4);
        assert!(chunks.len() >= 3);
        for c in &chunks {
            assert!(c.len() <= 4);
        }
        assert_eq!(chunks.concat(), "héllo wörld");
    }

    struct RecordingTransport {
        sent: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ChannelTransport for RecordingTransport {
        fn channel(&self) -> &str {
            "whatsapp"
        }
        fn is_linked(&self) -> bool {
            true
        }
        async fn send_text(
            &self,
            _to: &str,
            text: &str,
            _thread_id: Option<&str>,
        ) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
        async fn send_media(
            &self,
            _to: &str,
            _url: &str,
            _caption: Option<&str>,
        ) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn send_poll(
            &self,
            _to: &str,
            _question: &str,
            _options: &[String],
        ) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn deliver_chunks_text_by_dock_limit() {
        let dock = crate::dock::dock("discord").unwrap();
        let transport = RecordingTransport {
            sent: std::sync::Mutex::new(Vec::new()),
        };
        let long = "word ".repeat(1000); // ~5000 chars vs 2000 limit
        deliver(
            dock,
            &transport,
            "chan-1",
            &OutboundPayload::text(long),
            None,
        )
        .await
        .unwrap();
        let sent = transport.sent.lock().unwrap();
        assert!(sent.len() >= 3);
        for chunk in sent.iter() {
            assert!(chunk.len() <= 2000);
        }
    }

    #[tokio::test]
    async fn poll_renders_as_text_without_native_support() {
        let dock = crate::dock::dock("signal").unwrap();
        let transport = RecordingTransport {
            sent: std::sync::Mutex::new(Vec::new()),
        };
        deliver(
            dock,
            &transport,
            "+1555",
            &OutboundPayload::Poll {
                question: "Lunch?".into(),
                options: vec!["pizza".into(), "sushi".into()],
            },
            None,
        )
        .await
        .unwrap();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("1. pizza"));
        assert!(sent[0].contains("2. sushi"));
    }
}
