pub mod error;
pub mod store;
pub mod transcript;
pub mod types;

pub use error::{Result, SessionError};
pub use store::{SessionEvent, SessionEventKind, SessionPatch, SessionStore};
pub use types::{SessionEntry, SessionKey, ThinkingLevel};
