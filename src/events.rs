//! Telemetry event payloads shipped through the async batchers.
//!
//! The wire format is line-delimited JSON; each event serializes to one line of a batch. Context
//! bytes are base64-encoded since they are opaque and not guaranteed to be valid UTF-8.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::Result;

/// One `(action, probability)` pair of a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedAction {
    /// Identifier of the action.
    pub action_id: usize,
    /// Probability the action was chosen with.
    pub probability: f64,
}

/// A decision, as logged for learning. The chosen action is always at position 0 of `ranking`.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingEvent {
    /// Event id the decision was made under. Joins the decision with its later outcome.
    pub event_id: String,
    /// Opaque context bytes the decision was made for.
    #[serde_as(as = "Base64")]
    pub context: Vec<u8>,
    /// The full ranking, chosen action first.
    pub ranking: Vec<RankedAction>,
    /// Identifier of the model that produced the scores.
    pub model_id: String,
    /// When the decision was served.
    pub timestamp: DateTime<Utc>,
}

/// The observed outcome of an earlier decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutcomeValue {
    /// A free-form textual outcome.
    Text(String),
    /// A numeric reward.
    Numeric(f64),
}

impl From<&str> for OutcomeValue {
    fn from(value: &str) -> OutcomeValue {
        OutcomeValue::Text(value.to_owned())
    }
}

impl From<String> for OutcomeValue {
    fn from(value: String) -> OutcomeValue {
        OutcomeValue::Text(value)
    }
}

impl From<f64> for OutcomeValue {
    fn from(value: f64) -> OutcomeValue {
        OutcomeValue::Numeric(value)
    }
}

/// An outcome report, joined to its decision by the event id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeEvent {
    /// Event id of the decision this outcome belongs to.
    pub event_id: String,
    /// The observed outcome.
    pub outcome: OutcomeValue,
    /// When the outcome was reported.
    pub timestamp: DateTime<Utc>,
}

impl RankingEvent {
    /// Serialize to one line of a telemetry batch.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl OutcomeEvent {
    /// Serialize to one line of a telemetry batch.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{OutcomeEvent, OutcomeValue, RankedAction, RankingEvent};

    #[test]
    fn ranking_event_round_trips_binary_context() {
        let event = RankingEvent {
            event_id: "event-1".to_owned(),
            context: vec![0x00, 0xff, 0x7f, 0x80],
            ranking: vec![
                RankedAction {
                    action_id: 2,
                    probability: 0.8,
                },
                RankedAction {
                    action_id: 0,
                    probability: 0.2,
                },
            ],
            model_id: "model-v1".to_owned(),
            timestamp: Utc::now(),
        };

        let bytes = event.to_json_bytes().unwrap();
        let parsed: RankingEvent = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed.event_id, event.event_id);
        assert_eq!(parsed.context, event.context);
        assert_eq!(parsed.ranking, event.ranking);
    }

    #[test]
    fn outcome_values_serialize_untagged() {
        let numeric = OutcomeEvent {
            event_id: "event-1".to_owned(),
            outcome: 1.5.into(),
            timestamp: Utc::now(),
        };
        let json = String::from_utf8(numeric.to_json_bytes().unwrap()).unwrap();
        assert!(json.contains("\"outcome\":1.5"), "{json}");

        let text = OutcomeEvent {
            event_id: "event-1".to_owned(),
            outcome: "converted".into(),
            timestamp: Utc::now(),
        };
        let json = String::from_utf8(text.to_json_bytes().unwrap()).unwrap();
        assert!(json.contains("\"outcome\":\"converted\""), "{json}");
    }

    #[test]
    fn events_are_single_line() {
        let event = OutcomeEvent {
            event_id: "event-1".to_owned(),
            outcome: OutcomeValue::Numeric(1.0),
            timestamp: Utc::now(),
        };
        let bytes = event.to_json_bytes().unwrap();
        assert!(!bytes.contains(&b'\n'), "batch separator must stay unambiguous");
    }
}
