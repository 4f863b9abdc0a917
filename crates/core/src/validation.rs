//! Tool-call argument validation against JSON Schema.

use serde_json::Value;

use crate::message::Tool;

/// Find a tool by name and validate arguments against its schema.
///
/// Returns validation error messages (empty if valid).
pub fn validate_tool_call(tools: &[Tool], tool_name: &str, arguments: &Value) -> Vec<String> {
    let Some(tool) = tools.iter().find(|t| t.name == tool_name) else {
        return vec![format!("Unknown tool: {tool_name}")];
    };
    validate_tool_arguments(&tool.parameters, arguments)
}

/// Validate arguments against a JSON Schema.
///
/// Returns validation error messages (empty if valid).
pub fn validate_tool_arguments(schema: &Value, arguments: &Value) -> Vec<String> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => return vec![format!("Invalid schema: {e}")],
    };

    validator
        .iter_errors(arguments)
        .map(|error| {
            let path = error.instance_path.to_string();
            let path = if path.is_empty() { "(root)".to_string() } else { path };
            format!("{path}: {error}")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_tool() -> Tool {
        Tool {
            name: "search".into(),
            description: "Search the index".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1 }
                },
                "required": ["query"]
            }),
        }
    }

    #[test]
    fn valid_arguments_pass() {
        let errors = validate_tool_call(
            &[search_tool()],
            "search",
            &json!({"query": "rust", "limit": 5}),
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn wrong_type_is_reported_with_path() {
        let errors = validate_tool_call(&[search_tool()], "search", &json!({"query": 42}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("/query"), "got: {}", errors[0]);
    }

    #[test]
    fn missing_required_field_is_reported() {
        let errors = validate_tool_call(&[search_tool()], "search", &json!({}));
        assert!(!errors.is_empty());
        assert!(errors[0].contains("query"));
    }

    #[test]
    fn unknown_tool_is_reported() {
        let errors = validate_tool_call(&[search_tool()], "rm_rf", &json!({}));
        assert_eq!(errors, vec!["Unknown tool: rm_rf".to_string()]);
    }
}
