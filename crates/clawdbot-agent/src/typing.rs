//! Typing indicator state machine and pulse driver.
//!
//! The state machine is pure (testable without a channel); the driver owns
//! a background pulse loop that calls `ChannelTransport::typing` until its
//! TTL lapses or the run stops it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use clawdbot_channels::ChannelTransport;
use clawdbot_core::config::TypingModeConfig;

/// Channels expire typing status after a few seconds; refresh under that.
const PULSE_INTERVAL: Duration = Duration::from_secs(4);

/// Stop pulsing when nothing refreshed the indicator for this long.
const TTL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Refresh,
    None,
}

/// Pure mode/event → signal mapping.
///
/// `never` (and every heartbeat run) never signals. `instant` starts on run
/// start. `message` starts on the first assistant chunk and on text deltas.
/// `thinking` starts on reasoning deltas and merely refreshes on text.
/// Tool activity refreshes the TTL without changing the mode.
#[derive(Debug)]
pub struct TypingState {
    mode: TypingModeConfig,
    active: bool,
}

impl TypingState {
    pub fn new(mode: TypingModeConfig, is_heartbeat: bool) -> Self {
        let mode = if is_heartbeat {
            TypingModeConfig::Never
        } else {
            mode
        };
        Self { mode, active: false }
    }

    pub fn on_run_start(&mut self) -> TypingSignal {
        match self.mode {
            TypingModeConfig::Instant => self.start(),
            _ => TypingSignal::None,
        }
    }

    pub fn on_assistant_message_start(&mut self) -> TypingSignal {
        match self.mode {
            TypingModeConfig::Message => self.start(),
            _ => TypingSignal::None,
        }
    }

    pub fn on_text_delta(&mut self) -> TypingSignal {
        match self.mode {
            TypingModeConfig::Message => self.start(),
            TypingModeConfig::Thinking if self.active => TypingSignal::Refresh,
            _ => TypingSignal::None,
        }
    }

    pub fn on_reasoning_delta(&mut self) -> TypingSignal {
        match self.mode {
            TypingModeConfig::Thinking => self.start(),
            _ => TypingSignal::None,
        }
    }

    pub fn on_tool_activity(&mut self) -> TypingSignal {
        if self.active {
            TypingSignal::Refresh
        } else {
            TypingSignal::None
        }
    }

    fn start(&mut self) -> TypingSignal {
        if self.active {
            TypingSignal::Refresh
        } else {
            self.active = true;
            TypingSignal::Start
        }
    }
}

/// Background pulse loop bound to one delivery target.
pub struct TypingDriver {
    refresh_tx: watch::Sender<std::time::Instant>,
    handle: tokio::task::JoinHandle<()>,
}

impl TypingDriver {
    /// Spawn the pulse loop. It sends a typing action immediately, then
    /// every [`PULSE_INTERVAL`] until the TTL since the last refresh
    /// elapses or `stop` is called.
    pub fn start(transport: Arc<dyn ChannelTransport>, to: String) -> Self {
        let (refresh_tx, refresh_rx) = watch::channel(std::time::Instant::now());
        let handle = tokio::spawn(async move {
            loop {
                let _ = transport.typing(&to).await;
                tokio::time::sleep(PULSE_INTERVAL).await;
                let last = *refresh_rx.borrow();
                if last.elapsed() > TTL {
                    debug!(%to, "typing TTL lapsed");
                    break;
                }
            }
        });
        Self { refresh_tx, handle }
    }

    /// Keep the indicator alive.
    pub fn refresh(&self) {
        let _ = self.refresh_tx.send(std::time::Instant::now());
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}
