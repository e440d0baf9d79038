//! Tool definitions in OpenAI function-calling shape.

use serde_json::json;
use terra_core::messages::ToolDefinition;

pub fn all_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        glossary_search(),
        glossary_create(),
        glossary_update(),
        glossary_delete(),
        read_post(),
        read_thread_range(),
        summon_snapshot(),
        summon_continue(),
        summon_dismiss(),
    ]
}

fn glossary_search() -> ToolDefinition {
    ToolDefinition::function(
        "glossary_search",
        "Search the glossary for entries matching a query.",
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Full-text search query over terms and definitions"
                },
                "tags": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Filter by tags (all must match)"
                },
                "status": {
                    "type": "string",
                    "enum": ["confirmed", "tentative", "all"],
                    "description": "Filter by status (default: all)"
                },
                "include_references": {
                    "type": "boolean",
                    "description": "Expand [[Term]] cross-references found in result definitions"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum results to return (default: 10)"
                }
            },
            "required": ["query"]
        }),
    )
}

fn glossary_create() -> ToolDefinition {
    ToolDefinition::function(
        "glossary_create",
        "Create a new glossary entry.",
        json!({
            "type": "object",
            "properties": {
                "term": {"type": "string", "description": "The term to define"},
                "definition": {"type": "string", "description": "The definition of the term"},
                "tags": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Tags for categorization (e.g., character, location, faction)"
                },
                "status": {
                    "type": "string",
                    "enum": ["tentative", "confirmed"],
                    "description": "Entry status (default: tentative)"
                }
            },
            "required": ["term", "definition", "tags"]
        }),
    )
}

fn glossary_update() -> ToolDefinition {
    ToolDefinition::function(
        "glossary_update",
        "Update an existing glossary entry.",
        json!({
            "type": "object",
            "properties": {
                "entry_id": {"type": "integer", "description": "ID of the entry to update"},
                "term": {"type": "string", "description": "New term (optional)"},
                "definition": {"type": "string", "description": "New definition (optional)"},
                "tags": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "New tags (optional)"
                },
                "status": {
                    "type": "string",
                    "enum": ["tentative", "confirmed"],
                    "description": "New status (optional)"
                }
            },
            "required": ["entry_id"]
        }),
    )
}

fn glossary_delete() -> ToolDefinition {
    ToolDefinition::function(
        "glossary_delete",
        "Delete a glossary entry.",
        json!({
            "type": "object",
            "properties": {
                "entry_id": {"type": "integer", "description": "ID of the entry to delete"},
                "reason": {"type": "string", "description": "Reason for deletion (audit trail)"}
            },
            "required": ["entry_id", "reason"]
        }),
    )
}

fn read_post() -> ToolDefinition {
    ToolDefinition::function(
        "read_post",
        "Read a specific post from the corpus.",
        json!({
            "type": "object",
            "properties": {
                "post_id": {"type": "integer", "description": "ID of the post to read"},
                "include_adjacent": {
                    "type": "boolean",
                    "description": "Also return the two posts before and after"
                }
            },
            "required": ["post_id"]
        }),
    )
}

fn read_thread_range() -> ToolDefinition {
    ToolDefinition::function(
        "read_thread_range",
        "Read a range of posts from a thread.",
        json!({
            "type": "object",
            "properties": {
                "thread_id": {"type": "integer", "description": "ID of the thread to read from"},
                "start_post_id": {"type": "integer", "description": "Start of post range (optional)"},
                "end_post_id": {"type": "integer", "description": "End of post range (optional)"},
                "tag_filter": {"type": "string", "description": "Filter posts by tag (optional)"}
            },
            "required": ["thread_id"]
        }),
    )
}

fn summon_snapshot() -> ToolDefinition {
    ToolDefinition::function(
        "summon_snapshot",
        "Open a read-only dialogue with a historical snapshot of the annotation state. \
         Write tools are blocked while a summon is active.",
        json!({
            "type": "object",
            "properties": {
                "snapshot_id": {"type": "integer", "description": "ID of the snapshot to summon"},
                "query": {"type": "string", "description": "Optional opening question for the historical context"}
            },
            "required": ["snapshot_id"]
        }),
    )
}

fn summon_continue() -> ToolDefinition {
    ToolDefinition::function(
        "summon_continue",
        "Ask a follow-up question in the active summon dialogue.",
        json!({
            "type": "object",
            "properties": {
                "message": {"type": "string", "description": "Follow-up question"}
            },
            "required": ["message"]
        }),
    )
}

fn summon_dismiss() -> ToolDefinition {
    ToolDefinition::function(
        "summon_dismiss",
        "End the active summon dialogue, recording a summary of what was learned.",
        json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string", "description": "What the dialogue established"}
            },
            "required": ["summary"]
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nine_tools_defined() {
        let defs = all_tool_definitions();
        assert_eq!(defs.len(), 9);
        let names: Vec<&str> = defs.iter().map(|d| d.function.name.as_str()).collect();
        for expected in [
            "glossary_search",
            "glossary_create",
            "glossary_update",
            "glossary_delete",
            "read_post",
            "read_thread_range",
            "summon_snapshot",
            "summon_continue",
            "summon_dismiss",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn schemas_declare_required_fields() {
        for def in all_tool_definitions() {
            assert_eq!(def.def_type, "function");
            let params = &def.function.parameters;
            assert_eq!(params["type"], "object");
            assert!(params["required"].is_array(), "{} lacks required", def.function.name);
        }
    }
}
