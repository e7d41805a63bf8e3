//! Pass-through model call options.
//!
//! Only a small allow-list is forwarded to the model client: a thinking hint
//! and a reasoning effort level. Callers may set them as named fields or hand
//! over an arbitrary map; the map form is normalized (aliases folded, values
//! coerced) and anything outside the allow-list is dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Whether (and how much) the model should reason before answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingHint {
    Enabled,
    Disabled,
    /// Enabled with a token budget for the reasoning trace.
    Budget(u32),
}

impl ThinkingHint {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(true) => Some(Self::Enabled),
            Value::Bool(false) => Some(Self::Disabled),
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Self::Budget),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "enabled" | "on" | "true" => Some(Self::Enabled),
                "disabled" | "off" | "false" => Some(Self::Disabled),
                _ => None,
            },
            Value::Object(obj) => {
                if let Some(budget) = obj.get("budget_tokens").and_then(Value::as_u64) {
                    return u32::try_from(budget).ok().map(Self::Budget);
                }
                obj.get("type").and_then(Self::from_value)
            }
            _ => None,
        }
    }

    fn to_value(self) -> Value {
        match self {
            Self::Enabled => Value::Bool(true),
            Self::Disabled => Value::Bool(false),
            Self::Budget(budget) => serde_json::json!({ "budget_tokens": budget }),
        }
    }
}

/// Reasoning effort level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    fn from_value(value: &Value) -> Option<Self> {
        match value.as_str()?.to_ascii_lowercase().as_str() {
            "low" | "minimal" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// The allow-listed call options forwarded to the model client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct ProviderCallOptions {
    pub thinking: Option<ThinkingHint>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl ProviderCallOptions {
    /// Normalize an open option map, keeping only allow-listed keys.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let mut options = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "thinking" | "reasoning" => match ThinkingHint::from_value(value) {
                    Some(hint) => options.thinking = Some(hint),
                    None => debug!(key = %key, "Dropping unrecognized thinking hint"),
                },
                "reasoning_effort" | "reasoningEffort" | "effort" => {
                    match ReasoningEffort::from_value(value) {
                        Some(effort) => options.reasoning_effort = Some(effort),
                        None => debug!(key = %key, "Dropping unrecognized effort level"),
                    }
                }
                _ => debug!(key = %key, "Dropping provider option outside the allow-list"),
            }
        }
        options
    }

    /// The normalized map handed to the model client.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(thinking) = self.thinking {
            map.insert("thinking".into(), thinking.to_value());
        }
        if let Some(effort) = self.reasoning_effort {
            map.insert("reasoning_effort".into(), Value::String(effort.as_str().into()));
        }
        map
    }

    pub fn is_empty(&self) -> bool {
        self.thinking.is_none() && self.reasoning_effort.is_none()
    }
}

impl From<Map<String, Value>> for ProviderCallOptions {
    fn from(map: Map<String, Value>) -> Self {
        Self::from_map(&map)
    }
}

impl From<ProviderCallOptions> for Map<String, Value> {
    fn from(options: ProviderCallOptions) -> Self {
        options.to_map()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn unknown_keys_are_dropped() {
        let options = ProviderCallOptions::from_map(&map(json!({
            "thinking": true,
            "temperature": 0.2,
            "api_key": "sk-nope"
        })));
        assert_eq!(options.thinking, Some(ThinkingHint::Enabled));
        assert_eq!(options.to_map().len(), 1);
        assert!(!options.to_map().contains_key("api_key"));
    }

    #[test]
    fn effort_aliases_are_folded() {
        for key in ["effort", "reasoningEffort", "reasoning_effort"] {
            let mut raw = Map::new();
            raw.insert(key.to_string(), json!("HIGH"));
            let options = ProviderCallOptions::from_map(&raw);
            assert_eq!(options.reasoning_effort, Some(ReasoningEffort::High), "{key}");
        }
    }

    #[test]
    fn thinking_budget_forms() {
        let from_object =
            ProviderCallOptions::from_map(&map(json!({"thinking": {"budget_tokens": 2048}})));
        assert_eq!(from_object.thinking, Some(ThinkingHint::Budget(2048)));

        let from_number = ProviderCallOptions::from_map(&map(json!({"thinking": 512})));
        assert_eq!(from_number.thinking, Some(ThinkingHint::Budget(512)));

        let disabled = ProviderCallOptions::from_map(&map(json!({"thinking": "off"})));
        assert_eq!(disabled.thinking, Some(ThinkingHint::Disabled));
    }

    #[test]
    fn invalid_values_are_dropped() {
        let options = ProviderCallOptions::from_map(&map(json!({
            "thinking": [1, 2],
            "effort": "extreme"
        })));
        assert!(options.is_empty());
    }

    #[test]
    fn named_fields_forward_normalized_map() {
        let options = ProviderCallOptions {
            thinking: Some(ThinkingHint::Budget(1024)),
            reasoning_effort: Some(ReasoningEffort::Low),
        };
        assert_eq!(
            Value::Object(options.to_map()),
            json!({"thinking": {"budget_tokens": 1024}, "reasoning_effort": "low"})
        );
    }

    #[test]
    fn deserializes_from_open_map() {
        let options: ProviderCallOptions =
            serde_json::from_value(json!({"effort": "medium", "seed": 7})).unwrap();
        assert_eq!(options.reasoning_effort, Some(ReasoningEffort::Medium));
        assert_eq!(options.thinking, None);
    }
}
