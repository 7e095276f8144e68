//! Tool surface configuration for a run.
//!
//! Tool *implementations* live with the provider runtime; the orchestrator
//! only decides which definitions the model sees. Channel-owned tools
//! (send/react/poll) appear when the turn originated on a channel whose
//! dock supports them.

use serde_json::json;

use clawdbot_channels::dock::ChannelDock;

use crate::provider::ToolDefinition;

/// Channel-owned tools for the originating dock.
pub fn channel_tools(dock: &ChannelDock) -> Vec<ToolDefinition> {
    let mut tools = vec![ToolDefinition {
        name: "channel_send".to_string(),
        description: format!(
            "Send a message on {} to a recipient other than the current chat.",
            dock.id
        ),
        input_schema: json!({
            "type": "object",
            "properties": {
                "to": { "type": "string" },
                "text": { "type": "string" },
            },
            "required": ["to", "text"],
        }),
    }];

    if dock.capabilities.reactions {
        tools.push(ToolDefinition {
            name: "channel_react".to_string(),
            description: format!("React to a message on {} with an emoji.", dock.id),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "messageId": { "type": "string" },
                    "emoji": { "type": "string" },
                },
                "required": ["messageId", "emoji"],
            }),
        });
    }

    if dock.capabilities.polls {
        tools.push(ToolDefinition {
            name: "channel_poll".to_string(),
            description: format!("Post a poll on {}.", dock.id),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "question": { "type": "string" },
                    "options": { "type": "array", "items": { "type": "string" } },
                },
                "required": ["question", "options"],
            }),
        });
    }

    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawdbot_channels::dock::dock;

    #[test]
    fn whatsapp_gets_send_react_and_poll() {
        let tools = channel_tools(dock("whatsapp").unwrap());
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["channel_send", "channel_react", "channel_poll"]);
    }

    #[test]
    fn webchat_gets_send_only() {
        let tools = channel_tools(dock("webchat").unwrap());
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["channel_send"]);
    }
}
