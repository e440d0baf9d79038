use serde::{Deserialize, Serialize};

use crate::messages::{ChatMessage, Role, ToolCall};

/// One recorded conversation turn. Unlike a wire [`ChatMessage`], a turn
/// carries the thread id and scene index that produced it so the compactor
/// can find and remove it later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_index: Option<i64>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
            thread_id: None,
            scene_index: None,
        }
    }

    pub fn tagged(mut self, thread_id: i64, scene_index: i64) -> Self {
        self.thread_id = Some(thread_id);
        self.scene_index = Some(scene_index);
        self
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        if !calls.is_empty() {
            self.tool_calls = Some(calls);
        }
        self
    }

    /// Strip the compaction tags for the wire.
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_call_id: self.tool_call_id.clone(),
            tool_calls: self.tool_calls.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_do_not_reach_the_wire() {
        let turn = Turn::new(Role::Assistant, "noted").tagged(3, 7);
        let msg = turn.to_message();
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("thread_id").is_none());
        assert!(json.get("scene_index").is_none());
        assert_eq!(json["content"], "noted");
    }

    #[test]
    fn serde_roundtrip_preserves_tags() {
        let turn = Turn::new(Role::Tool, "<corpus_post/>")
            .with_tool_call_id("call_2")
            .tagged(1, 0);
        let json = serde_json::to_string(&turn).unwrap();
        let parsed: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, turn);
    }
}
