//! Block streaming: coalesce text deltas into deliverable chunks.
//!
//! The accumulator filters `<think>…</think>` spans, honours
//! `<final>…</final>` gating when enforced, and emits on four break kinds:
//! assistant message end, a closing `</final>`, a paragraph boundary (two
//! consecutive newlines), and the char budget (size threshold crossed AND
//! an idle interval with no new deltas).

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    pub min_chars: usize,
    pub idle_ms: u64,
    pub enforce_final_tag: bool,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            min_chars: 1500,
            idle_ms: 1000,
            enforce_final_tag: false,
        }
    }
}

/// Why a chunk was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakKind {
    MessageEnd,
    FinalTag,
    Paragraph,
    CharBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Normal,
    Think,
    Final,
}

/// Longest tag the parser recognises; partial prefixes at the buffer tail
/// are withheld until the next delta completes them.
const MAX_TAG_LEN: usize = "</final>".len();

pub struct BlockAccumulator {
    cfg: BlockConfig,
    /// Raw text not yet classified (may end in a partial tag).
    raw: String,
    /// Deliverable text awaiting a break condition.
    pending: String,
    state: ParseState,
    last_delta: Option<Instant>,
    /// `</final>` seen in this delta batch — forces an immediate break.
    final_closed: bool,
}

impl BlockAccumulator {
    pub fn new(cfg: BlockConfig) -> Self {
        Self {
            cfg,
            raw: String::new(),
            pending: String::new(),
            state: ParseState::Normal,
            last_delta: None,
            final_closed: false,
        }
    }

    /// Feed one text delta. Returns chunks that became deliverable.
    pub fn push_delta(&mut self, text: &str, now: Instant) -> Vec<(String, BreakKind)> {
        self.raw.push_str(text);
        self.last_delta = Some(now);
        self.drain_raw();

        let mut out = Vec::new();
        if self.final_closed {
            self.final_closed = false;
            if let Some(chunk) = self.take_pending() {
                out.push((chunk, BreakKind::FinalTag));
            }
            return out;
        }

        // Paragraph break: emit up to the last double newline.
        if let Some(pos) = self.pending.rfind("\n\n") {
            let rest = self.pending.split_off(pos + 2);
            let chunk = std::mem::replace(&mut self.pending, rest);
            let chunk = chunk.trim_end().to_string();
            if !chunk.is_empty() {
                out.push((chunk, BreakKind::Paragraph));
            }
        }
        out
    }

    /// Periodic idle check for the char-budget break. Emits only when the
    /// buffer exceeds `min_chars` AND no delta arrived for `idle_ms`.
    pub fn check_idle(&mut self, now: Instant) -> Option<(String, BreakKind)> {
        if self.pending.len() < self.cfg.min_chars {
            return None;
        }
        let idle = Duration::from_millis(self.cfg.idle_ms);
        if self.last_delta.is_some_and(|at| now.duration_since(at) >= idle) {
            return self.take_pending().map(|c| (c, BreakKind::CharBudget));
        }
        None
    }

    /// Assistant message boundary — everything pending becomes deliverable.
    pub fn on_message_end(&mut self) -> Option<(String, BreakKind)> {
        self.drain_raw();
        self.take_pending().map(|c| (c, BreakKind::MessageEnd))
    }

    /// Stream end. Unterminated `<final>` content is still emitted.
    pub fn finish(&mut self) -> Option<(String, BreakKind)> {
        // whatever partial tag was withheld is plain text now
        let leftover = std::mem::take(&mut self.raw);
        if !leftover.is_empty() && self.visible(self.state) {
            self.pending.push_str(&leftover);
        }
        self.take_pending().map(|c| (c, BreakKind::MessageEnd))
    }

    fn take_pending(&mut self) -> Option<String> {
        let chunk = std::mem::take(&mut self.pending);
        let chunk = chunk.trim().to_string();
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    }

    /// Move classified text from `raw` into `pending`, withholding a
    /// potential partial tag at the tail.
    fn drain_raw(&mut self) {
        loop {
            let Some(lt) = self.raw.find('<') else {
                // no tag in sight: everything is plain text
                let text = std::mem::take(&mut self.raw);
                self.append_visible(&text);
                return;
            };

            // text before the tag candidate
            let before: String = self.raw.drain(..lt).collect();
            self.append_visible(&before);

            match self.match_tag() {
                TagMatch::Complete(tag_len, next_state, closed_final) => {
                    self.raw.drain(..tag_len);
                    self.state = next_state;
                    if closed_final {
                        self.final_closed = true;
                    }
                }
                TagMatch::Partial => {
                    // tail might complete into a tag with the next delta
                    if self.raw.len() >= MAX_TAG_LEN {
                        // long enough to know it never will
                        let ch: String = self.raw.drain(..1).collect();
                        self.append_visible(&ch);
                        continue;
                    }
                    return;
                }
                TagMatch::NotATag => {
                    let ch: String = self.raw.drain(..1).collect();
                    self.append_visible(&ch);
                }
            }
        }
    }

    fn match_tag(&self) -> TagMatch {
        const TAGS: &[(&str, ParseState, ParseState, bool)] = &[
            ("<think>", ParseState::Normal, ParseState::Think, false),
            ("</think>", ParseState::Think, ParseState::Normal, false),
            ("<final>", ParseState::Normal, ParseState::Final, false),
            ("</final>", ParseState::Final, ParseState::Normal, true),
        ];
        for (tag, from, to, closes_final) in TAGS {
            if *from != self.state {
                continue;
            }
            if self.raw.starts_with(tag) {
                return TagMatch::Complete(tag.len(), *to, *closes_final);
            }
            if tag.starts_with(&self.raw) {
                return TagMatch::Partial;
            }
        }
        TagMatch::NotATag
    }

    fn append_visible(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.visible(self.state) {
            self.pending.push_str(text);
        }
    }

    /// Is text in `state` user-visible?
    fn visible(&self, state: ParseState) -> bool {
        match state {
            ParseState::Think => false,
            ParseState::Final => true,
            ParseState::Normal => !self.cfg.enforce_final_tag,
        }
    }
}

enum TagMatch {
    Complete(usize, ParseState, bool),
    Partial,
    NotATag,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acc(cfg: BlockConfig) -> BlockAccumulator {
        BlockAccumulator::new(cfg)
    }

    #[test]
    fn paragraph_break_emits_leading_text() {
        let mut a = acc(BlockConfig::default());
        let now = Instant::now();
        assert!(a.push_delta("first paragraph", now).is_empty());
        let out = a.push_delta(" done.\n\nsecond", now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "first paragraph done.");
        assert_eq!(out[0].1, BreakKind::Paragraph);

        let tail = a.finish().unwrap();
        assert_eq!(tail.0, "second");
    }

    #[test]
    fn think_spans_are_stripped() {
        let mut a = acc(BlockConfig::default());
        let now = Instant::now();
        a.push_delta("before <think>internal reasoning</think> after", now);
        let out = a.finish().unwrap();
        assert_eq!(out.0, "before  after");
    }

    #[test]
    fn think_tag_split_across_deltas() {
        let mut a = acc(BlockConfig::default());
        let now = Instant::now();
        a.push_delta("x <th", now);
        a.push_delta("ink>hidden</thi", now);
        a.push_delta("nk> y", now);
        let out = a.finish().unwrap();
        assert_eq!(out.0, "x  y");
    }

    #[test]
    fn enforce_final_tag_gates_output() {
        let mut a = acc(BlockConfig {
            enforce_final_tag: true,
            ..Default::default()
        });
        let now = Instant::now();
        a.push_delta("preamble that should not appear <final>the answer", now);
        let out = a.push_delta("</final> trailing", now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "the answer");
        assert_eq!(out[0].1, BreakKind::FinalTag);
        // trailing text outside the tags stays invisible
        assert!(a.finish().is_none());
    }

    #[test]
    fn unterminated_final_is_emitted_at_stream_end() {
        let mut a = acc(BlockConfig {
            enforce_final_tag: true,
            ..Default::default()
        });
        let now = Instant::now();
        a.push_delta("<final>half an answer", now);
        let out = a.finish().unwrap();
        assert_eq!(out.0, "half an answer");
    }

    #[test]
    fn char_budget_needs_both_size_and_idle() {
        let cfg = BlockConfig {
            min_chars: 1500,
            idle_ms: 1000,
            enforce_final_tag: false,
        };
        let mut a = acc(cfg);
        let start = Instant::now();
        a.push_delta(&"x".repeat(2000), start);

        // size crossed but not idle yet
        assert!(a.check_idle(start + Duration::from_millis(500)).is_none());
        // idle elapsed
        let out = a.check_idle(start + Duration::from_millis(1100)).unwrap();
        assert_eq!(out.0.len(), 2000);
        assert_eq!(out.1, BreakKind::CharBudget);

        // below the size threshold, idle alone never emits
        a.push_delta("short", start + Duration::from_millis(1200));
        assert!(a
            .check_idle(start + Duration::from_millis(99_000))
            .is_none());
    }

    #[test]
    fn message_end_flushes_pending() {
        let mut a = acc(BlockConfig::default());
        a.push_delta("tail text", Instant::now());
        let out = a.on_message_end().unwrap();
        assert_eq!(out.0, "tail text");
        assert_eq!(out.1, BreakKind::MessageEnd);
        assert!(a.on_message_end().is_none());
    }

    #[test]
    fn stray_angle_bracket_is_plain_text() {
        let mut a = acc(BlockConfig::default());
        a.push_delta("a < b and 2 <3", Instant::now());
        let out = a.finish().unwrap();
        assert_eq!(out.0, "a < b and 2 <3");
    }
}
