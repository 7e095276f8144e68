use serde::{Deserialize, Serialize};

/// First server frame after a successful upgrade. Clients wait for this
/// before issuing requests.
/// Wire: `{ "ok": true, "type": "hello", "features": { "methods": [...] }, "serverVersion": "0.3.0" }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub ok: bool,
    #[serde(rename = "type")]
    pub frame_type: String,
    pub features: ServerFeatures,
    #[serde(rename = "serverVersion")]
    pub server_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerFeatures {
    /// Methods this server will route; clients feature-gate on membership.
    pub methods: Vec<String>,
}

impl Hello {
    pub fn new(server_version: impl Into<String>, methods: Vec<String>) -> Self {
        Self {
            ok: true,
            frame_type: "hello".to_string(),
            features: ServerFeatures { methods },
            server_version: server_version.into(),
        }
    }
}
