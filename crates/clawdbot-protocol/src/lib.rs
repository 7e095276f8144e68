pub mod frames;
pub mod handshake;
pub mod methods;

pub use frames::{ErrorCode, ErrorShape, EventFrame, InboundFrame, ReqFrame, ResFrame};
pub use handshake::{Hello, ServerFeatures};
