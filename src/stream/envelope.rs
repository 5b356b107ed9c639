//! Wire envelope normalisation
//!
//! The backend has used two encodings for the same events: a legacy one that
//! wraps HITL outcomes in `{"type":"CUSTOM","name":...,"value":{...}}`, and a
//! flat one that puts the outcome in `type` directly. Both are mapped here
//! into `WireEvent` so nothing downstream branches on encoding.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::debug;

use crate::capture::ClassificationMeta;

/// Normalised wire event
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    StepStart { step: String },
    StepFinish { step: String },
    TextDelta { delta: String },
    Classified {
        inbox_item_id: Option<String>,
        bucket: String,
        confidence: f64,
        meta: ClassificationMeta,
    },
    LowConfidence {
        inbox_item_id: String,
        bucket: String,
        confidence: f64,
        all_scores: Option<BTreeMap<String, f64>>,
    },
    ClarificationRequired {
        thread_id: String,
        question_text: String,
        inbox_item_id: Option<String>,
    },
    Misunderstood {
        thread_id: String,
        question_text: String,
        inbox_item_id: String,
    },
    Unresolved { inbox_item_id: Option<String> },
    Complete { result: Option<String> },
    Error { message: Option<String> },
}

/// Fields that may appear either inside `value` or at the top level
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Fields {
    thread_id: Option<String>,
    inbox_item_id: Option<String>,
    question_text: Option<String>,
    bucket: Option<String>,
    confidence: Option<f64>,
    agent_chain: Option<Vec<String>>,
    all_scores: Option<BTreeMap<String, f64>>,
}

impl Fields {
    /// Nested values win over top-level ones
    fn merge(self, fallback: Fields) -> Fields {
        Fields {
            thread_id: self.thread_id.or(fallback.thread_id),
            inbox_item_id: self.inbox_item_id.or(fallback.inbox_item_id),
            question_text: self.question_text.or(fallback.question_text),
            bucket: self.bucket.or(fallback.bucket),
            confidence: self.confidence.or(fallback.confidence),
            agent_chain: self.agent_chain.or(fallback.agent_chain),
            all_scores: self.all_scores.or(fallback.all_scores),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    name: Option<String>,
    step_name: Option<String>,
    delta: Option<String>,
    message: Option<String>,
    result: Option<String>,
    value: Option<Fields>,
    #[serde(flatten)]
    inline: Fields,
}

/// Decode one frame payload. Malformed or unrecognised envelopes yield `None`.
pub fn parse(payload: &str) -> Option<WireEvent> {
    let envelope: Envelope = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "dropping malformed frame");
            return None;
        }
    };

    let event = envelope.normalize();
    if event.is_none() {
        debug!("ignoring unrecognised or incomplete envelope");
    }
    event
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl Envelope {
    fn normalize(self) -> Option<WireEvent> {
        let Envelope {
            kind,
            name,
            step_name,
            delta,
            message,
            result,
            value,
            inline,
        } = self;

        let tag = if kind == "CUSTOM" { name? } else { kind };
        let fields = value.unwrap_or_default().merge(inline);
        let step = || step_name.clone().unwrap_or_else(|| "Unknown".to_string());

        let event = match tag.as_str() {
            "STEP_STARTED" | "STEP_START" => WireEvent::StepStart { step: step() },
            "STEP_FINISHED" | "STEP_END" => WireEvent::StepFinish { step: step() },
            "TEXT_MESSAGE_CONTENT" => WireEvent::TextDelta {
                delta: non_empty(delta)?,
            },
            "CLASSIFIED" => {
                let bucket = fields.bucket?;
                let confidence = fields.confidence.unwrap_or(0.0);
                WireEvent::Classified {
                    inbox_item_id: non_empty(fields.inbox_item_id),
                    meta: ClassificationMeta {
                        bucket: bucket.clone(),
                        confidence,
                        agent_chain: fields.agent_chain.unwrap_or_default(),
                        all_scores: fields.all_scores,
                    },
                    bucket,
                    confidence,
                }
            }
            "LOW_CONFIDENCE" => WireEvent::LowConfidence {
                inbox_item_id: fields.inbox_item_id.unwrap_or_default(),
                bucket: fields.bucket?,
                confidence: fields.confidence.unwrap_or(0.0),
                all_scores: fields.all_scores,
            },
            "HITL_REQUIRED" => WireEvent::ClarificationRequired {
                thread_id: non_empty(fields.thread_id)?,
                question_text: fields.question_text.unwrap_or_default(),
                inbox_item_id: non_empty(fields.inbox_item_id),
            },
            "MISUNDERSTOOD" => match non_empty(fields.inbox_item_id) {
                Some(inbox_item_id) => WireEvent::Misunderstood {
                    thread_id: fields.thread_id.unwrap_or_default(),
                    question_text: fields.question_text.unwrap_or_default(),
                    inbox_item_id,
                },
                // no item to follow up on
                None => WireEvent::Unresolved { inbox_item_id: None },
            },
            "UNRESOLVED" => WireEvent::Unresolved {
                inbox_item_id: non_empty(fields.inbox_item_id),
            },
            "COMPLETE" | "RUN_FINISHED" => WireEvent::Complete {
                result: non_empty(result),
            },
            "ERROR" | "RUN_ERROR" => WireEvent::Error {
                message: non_empty(message),
            },
            _ => return None,
        };

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_aliases() {
        assert_eq!(
            parse(r#"{"type":"STEP_START","stepName":"Classifying"}"#),
            Some(WireEvent::StepStart { step: "Classifying".into() })
        );
        assert_eq!(
            parse(r#"{"type":"STEP_FINISHED"}"#),
            Some(WireEvent::StepFinish { step: "Unknown".into() })
        );
    }

    #[test]
    fn test_legacy_and_flat_misunderstood_match() {
        let legacy = parse(
            r#"{"type":"CUSTOM","name":"MISUNDERSTOOD","value":{"threadId":"t1","inboxItemId":"i1","questionText":"What do you mean?"}}"#,
        );
        let flat = parse(
            r#"{"type":"MISUNDERSTOOD","value":{"threadId":"t1","inboxItemId":"i1","questionText":"What do you mean?"}}"#,
        );
        let inline = parse(
            r#"{"type":"MISUNDERSTOOD","threadId":"t1","inboxItemId":"i1","questionText":"What do you mean?"}"#,
        );
        assert!(legacy.is_some());
        assert_eq!(legacy, flat);
        assert_eq!(flat, inline);
    }

    #[test]
    fn test_classified_builds_meta() {
        let event = parse(
            r#"{"type":"CLASSIFIED","value":{"inboxItemId":"i2","bucket":"People","confidence":0.92,"agentChain":["Classifier"]}}"#,
        );
        match event {
            Some(WireEvent::Classified { bucket, confidence, meta, inbox_item_id }) => {
                assert_eq!(bucket, "People");
                assert_eq!(confidence, 0.92);
                assert_eq!(inbox_item_id.as_deref(), Some("i2"));
                assert_eq!(meta.agent_chain, vec!["Classifier".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_integer_confidence() {
        let event = parse(r#"{"type":"LOW_CONFIDENCE","value":{"inboxItemId":"i1","bucket":"Admin","confidence":1}}"#);
        assert!(matches!(event, Some(WireEvent::LowConfidence { confidence, .. }) if confidence == 1.0));
    }

    #[test]
    fn test_hitl_requires_thread() {
        assert!(parse(r#"{"type":"CUSTOM","name":"HITL_REQUIRED","value":{}}"#).is_none());
        assert_eq!(
            parse(r#"{"type":"CUSTOM","name":"HITL_REQUIRED","value":{"threadId":"t9","questionText":"People or Projects?"}}"#),
            Some(WireEvent::ClarificationRequired {
                thread_id: "t9".into(),
                question_text: "People or Projects?".into(),
                inbox_item_id: None,
            })
        );
    }

    #[test]
    fn test_misunderstood_without_item_degrades() {
        assert_eq!(
            parse(r#"{"type":"MISUNDERSTOOD","value":{"inboxItemId":"","questionText":"?"}}"#),
            Some(WireEvent::Unresolved { inbox_item_id: None })
        );
    }

    #[test]
    fn test_unresolved_empty_id() {
        assert_eq!(
            parse(r#"{"type":"UNRESOLVED","value":{"inboxItemId":""}}"#),
            Some(WireEvent::Unresolved { inbox_item_id: None })
        );
    }

    #[test]
    fn test_terminal_aliases() {
        assert_eq!(
            parse(r#"{"type":"RUN_FINISHED","threadId":"t","runId":"r"}"#),
            Some(WireEvent::Complete { result: None })
        );
        assert_eq!(
            parse(r#"{"type":"ERROR","message":"timeout"}"#),
            Some(WireEvent::Error { message: Some("timeout".into()) })
        );
        assert_eq!(parse(r#"{"type":"RUN_ERROR"}"#), Some(WireEvent::Error { message: None }));
    }

    #[test]
    fn test_ignored_and_malformed() {
        assert!(parse(r#"{"type":"RUN_STARTED"}"#).is_none());
        assert!(parse(r#"{"type":"TEXT_MESSAGE_CONTENT","delta":""}"#).is_none());
        assert!(parse(r#"{"type":"CUSTOM"}"#).is_none());
        assert!(parse("{not json").is_none());
        assert!(parse("[DONE]").is_none());
        assert!(parse(r#"{"delta":"no type"}"#).is_none());
    }
}
