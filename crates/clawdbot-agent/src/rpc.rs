//! The in-process RPC boundary.
//!
//! Subagent and heartbeat flows re-enter the system through the same method
//! surface that WS clients use. The gateway implements this trait on its
//! app state; tests implement it with scripted responses.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AgentError;

#[async_trait]
pub trait GatewayRpc: Send + Sync {
    /// Invoke a gateway method. `method` is one of the protocol constants;
    /// the error carries the wire code.
    async fn call(&self, method: &str, params: Value) -> Result<Value, AgentError>;
}
