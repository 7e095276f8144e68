pub mod dock;
pub mod error;
pub mod outbound;
pub mod types;

pub use dock::{dock, docks, ChannelDock, ReplyToMode};
pub use error::ChannelError;
pub use outbound::split_chunks;
pub use types::{ChannelTransport, OutboundPayload};
