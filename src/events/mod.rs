//! Events module for capture progress and outcomes
//!
//! `CaptureEvent` is the domain callback set produced by one stream.
//! `WorkflowEvent` is what subscribers of a workflow receive: every capture
//! event plus the state transitions they caused.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::capture::ClassificationMeta;

/// Events produced while a capture stream is processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureEvent {
    /// Backend started a processing step
    StepStarted { step: String },

    /// Backend finished a processing step
    StepFinished { step: String },

    /// Incremental result text
    TextDelta { delta: String },

    /// Classified below the confidence threshold, needs a bucket pick
    LowConfidence {
        inbox_item_id: String,
        bucket: String,
        confidence: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        all_scores: Option<BTreeMap<String, f64>>,
    },

    /// Legacy HITL pause asking the user to pick a bucket
    ClarificationRequired {
        thread_id: String,
        question_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inbox_item_id: Option<String>,
    },

    /// Backend could not parse intent and asks a clarifying question
    Misunderstood {
        thread_id: String,
        question_text: String,
        inbox_item_id: String,
    },

    /// Backend gave up; the item stays in the inbox for manual handling
    Unresolved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inbox_item_id: Option<String>,
    },

    /// Capture filed
    Completed {
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        classification: Option<ClassificationMeta>,
    },

    /// Transport or backend failure
    Failed { message: String },
}

impl CaptureEvent {
    /// Terminal events end their stream; exactly one is produced per stream
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            CaptureEvent::StepStarted { .. }
                | CaptureEvent::StepFinished { .. }
                | CaptureEvent::TextDelta { .. }
        )
    }
}

impl std::fmt::Display for CaptureEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureEvent::StepStarted { step } => write!(f, "STEP_STARTED ({})", step),
            CaptureEvent::StepFinished { step } => write!(f, "STEP_FINISHED ({})", step),
            CaptureEvent::TextDelta { delta } => write!(f, "TEXT_DELTA ({} bytes)", delta.len()),
            CaptureEvent::LowConfidence {
                bucket, confidence, ..
            } => write!(f, "LOW_CONFIDENCE ({} {:.2})", bucket, confidence),
            CaptureEvent::ClarificationRequired { thread_id, .. } => {
                write!(f, "CLARIFICATION_REQUIRED ({})", thread_id)
            }
            CaptureEvent::Misunderstood { inbox_item_id, .. } => {
                write!(f, "MISUNDERSTOOD ({})", inbox_item_id)
            }
            CaptureEvent::Unresolved { inbox_item_id } => match inbox_item_id {
                Some(id) => write!(f, "UNRESOLVED ({})", id),
                None => write!(f, "UNRESOLVED"),
            },
            CaptureEvent::Completed { result, .. } => write!(f, "COMPLETED ({})", result),
            CaptureEvent::Failed { message } => write!(f, "FAILED ({})", message),
        }
    }
}

/// Events broadcast by a `CaptureWorkflow` to its subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// An event pulled from the active stream
    Capture { event: CaptureEvent },

    /// The workflow moved between states
    StateChanged { from: String, to: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = CaptureEvent::Completed {
            result: "Filed -> People (0.92)".into(),
            classification: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("completed"));
        assert!(!json.contains("classification"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"unresolved","inbox_item_id":"i9"}"#;
        let event: CaptureEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            CaptureEvent::Unresolved {
                inbox_item_id: Some("i9".into())
            }
        );
    }

    #[test]
    fn test_terminal_classification() {
        assert!(!CaptureEvent::TextDelta { delta: "x".into() }.is_terminal());
        assert!(CaptureEvent::Unresolved { inbox_item_id: None }.is_terminal());
        assert!(CaptureEvent::Failed { message: "boom".into() }.is_terminal());
    }

    #[test]
    fn test_display() {
        let event = CaptureEvent::LowConfidence {
            inbox_item_id: "i1".into(),
            bucket: "Admin".into(),
            confidence: 0.4,
            all_scores: None,
        };
        assert_eq!(event.to_string(), "LOW_CONFIDENCE (Admin 0.40)");
    }
}
