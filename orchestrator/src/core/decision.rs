//! Planner decision contract.
//!
//! A planner response is accepted only if it validates against the embedded
//! JSON schema and decodes into exactly one [`PlannerDecision`] variant.

use std::sync::LazyLock;

use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PLANNER_DECISION_SCHEMA: &str =
    include_str!("../../schemas/planner_decision.schema.json");

static DECISION_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(PLANNER_DECISION_SCHEMA)
        .expect("embedded planner decision schema should be valid JSON");
    jsonschema::validator_for(&schema).expect("embedded planner decision schema should compile")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlannerDecision {
    ToolCall {
        name: String,
        #[serde(default = "empty_arguments")]
        arguments: Value,
    },
    UserQuestion {
        text: String,
    },
    Finalize {
        answer: String,
        #[serde(default)]
        references: Vec<String>,
    },
}

fn empty_arguments() -> Value {
    Value::Object(Map::new())
}

impl PlannerDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            PlannerDecision::ToolCall { .. } => "tool_call",
            PlannerDecision::UserQuestion { .. } => "user_question",
            PlannerDecision::Finalize { .. } => "finalize",
        }
    }
}

/// Validate and decode a raw planner response.
///
/// Errors describe every schema violation; the caller reports them as a
/// contract violation.
pub fn decode_decision(raw: &Value) -> Result<PlannerDecision, String> {
    let violations: Vec<String> = DECISION_VALIDATOR
        .iter_errors(raw)
        .map(|err| err.to_string())
        .collect();
    if !violations.is_empty() {
        return Err(violations.join("; "));
    }
    serde_json::from_value(raw.clone()).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_each_variant() {
        assert_eq!(
            decode_decision(&json!({"type": "finalize", "answer": "X", "references": []}))
                .expect("finalize"),
            PlannerDecision::Finalize {
                answer: "X".into(),
                references: Vec::new()
            }
        );
        assert_eq!(
            decode_decision(&json!({"type": "tool_call", "name": "lookup"})).expect("tool"),
            PlannerDecision::ToolCall {
                name: "lookup".into(),
                arguments: json!({})
            }
        );
        assert_eq!(
            decode_decision(&json!({"type": "user_question", "text": "Which year?"}))
                .expect("question")
                .kind(),
            "user_question"
        );
    }

    #[test]
    fn rejects_mixed_or_unknown_shapes() {
        assert!(decode_decision(&json!({"type": "finalize", "answer": "X", "name": "t"})).is_err());
        assert!(decode_decision(&json!({"type": "dance"})).is_err());
        assert!(decode_decision(&json!("finalize")).is_err());
        assert!(decode_decision(&json!({"answer": "X"})).is_err());
    }

    #[test]
    fn rejects_empty_fields_and_non_object_arguments() {
        assert!(decode_decision(&json!({"type": "finalize", "answer": ""})).is_err());
        assert!(decode_decision(&json!({"type": "tool_call", "name": ""})).is_err());
        assert!(
            decode_decision(&json!({"type": "tool_call", "name": "t", "arguments": [1]})).is_err()
        );
        assert!(
            decode_decision(&json!({"type": "finalize", "answer": "X", "references": "seg-1"}))
                .is_err()
        );
    }
}
