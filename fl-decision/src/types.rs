use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    Customer,
    Assistant,
}

/// One exchange in a conversation's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

/// Context handed to the decision engine with each message: the bounded
/// recent history plus whatever per-conversation state the caller tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    pub history: Vec<Turn>,
    #[serde(default)]
    pub session_state: serde_json::Value,
    #[serde(default)]
    pub customer_profile: Option<serde_json::Value>,
}

/// Side effects the engine may instruct alongside the reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SideEffect {
    Notify { target: String, note: String },
    Escalate { reason: String },
    FlagForReview { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub intent: Option<String>,
    pub reply_text: String,
    #[serde(default)]
    pub side_effects: Vec<SideEffect>,
    #[serde(default)]
    pub confidence: f32,
}

#[cfg(test)]
mod tests {
    use super::{Decision, SideEffect};

    #[test]
    fn decision_payload_deserializes_with_defaults() {
        let decision: Decision = serde_json::from_str(r#"{"reply_text":"hi!"}"#)
            .expect("minimal decision should parse");
        assert_eq!(decision.reply_text, "hi!");
        assert!(decision.intent.is_none());
        assert!(decision.side_effects.is_empty());
        assert_eq!(decision.confidence, 0.0);
    }

    #[test]
    fn side_effects_are_tagged_by_type() {
        let decision: Decision = serde_json::from_str(
            r#"{
                "intent": "flight_search",
                "reply_text": "Looking that up now.",
                "side_effects": [
                    {"type": "escalate", "reason": "repeat complaint"},
                    {"type": "flag_for_review", "reason": "possible refund"}
                ],
                "confidence": 0.92
            }"#,
        )
        .expect("decision with side effects should parse");
        assert_eq!(decision.side_effects.len(), 2);
        assert_eq!(
            decision.side_effects[0],
            SideEffect::Escalate {
                reason: "repeat complaint".to_string()
            }
        );
    }
}
