//! Capture data model
//!
//! Requests submitted by the caller, the identifiers that travel with them,
//! and the classification metadata the backend attaches to filed items.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Default file name for uploaded voice captures
pub const DEFAULT_VOICE_FILE_NAME: &str = "voice-capture.m4a";

/// Default MIME type for uploaded voice captures
pub const DEFAULT_VOICE_MIME_TYPE: &str = "audio/m4a";

/// A unit of raw user input submitted for classification
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureRequest {
    /// Typed text
    Text { content: String },
    /// Recorded audio, uploaded as a multipart `file` field
    Voice {
        audio: Vec<u8>,
        file_name: String,
        mime_type: String,
    },
}

impl CaptureRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Voice capture with the default `voice-capture.m4a` / `audio/m4a` naming
    pub fn voice(audio: Vec<u8>) -> Self {
        Self::Voice {
            audio,
            file_name: DEFAULT_VOICE_FILE_NAME.to_string(),
            mime_type: DEFAULT_VOICE_MIME_TYPE.to_string(),
        }
    }

    /// True when there is nothing to classify
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text { content } => content.trim().is_empty(),
            Self::Voice { audio, .. } => audio.is_empty(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Voice { .. } => "voice",
        }
    }
}

/// Caller reply to a `Misunderstood` clarifying question
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUpReply {
    Text(String),
    Voice { audio: Vec<u8>, file_name: String, mime_type: String },
}

impl FollowUpReply {
    pub fn voice(audio: Vec<u8>) -> Self {
        Self::Voice {
            audio,
            file_name: DEFAULT_VOICE_FILE_NAME.to_string(),
            mime_type: DEFAULT_VOICE_MIME_TYPE.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Voice { audio, .. } => audio.is_empty(),
        }
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Client-generated id correlating one capture attempt server-side
    ThreadId
);
string_id!(
    /// Client-generated id for one agent run
    RunId
);
string_id!(
    /// Server-assigned id of the inbox document created for a capture
    InboxItemId
);

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// Submission time in epoch milliseconds, strictly increasing per process
fn next_stamp() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let candidate = if now > last { now } else { last + 1 };
        match LAST_STAMP.compare_exchange_weak(last, candidate, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => return candidate,
            Err(observed) => last = observed,
        }
    }
}

/// Thread and run ids for a new capture attempt
pub fn new_attempt_ids() -> (ThreadId, RunId) {
    let stamp = next_stamp();
    (
        ThreadId(format!("thread-{stamp}")),
        RunId(format!("run-{stamp}")),
    )
}

/// Classification attached to a filed item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationMeta {
    pub bucket: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub agent_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_scores: Option<BTreeMap<String, f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_ids_are_monotonic() {
        let (first, _) = new_attempt_ids();
        let (second, run) = new_attempt_ids();
        let stamp = |id: &ThreadId| -> i64 {
            id.as_str().trim_start_matches("thread-").parse().unwrap()
        };
        assert!(stamp(&second) > stamp(&first));
        assert_eq!(
            run.as_str().trim_start_matches("run-"),
            second.as_str().trim_start_matches("thread-")
        );
    }

    #[test]
    fn test_empty_requests() {
        assert!(CaptureRequest::text("   ").is_empty());
        assert!(CaptureRequest::voice(Vec::new()).is_empty());
        assert!(!CaptureRequest::text("call mom").is_empty());
        assert!(FollowUpReply::Text("\n".into()).is_empty());
    }

    #[test]
    fn test_classification_meta_wire_names() {
        let json = r#"{"bucket":"People","confidence":0.92,"agentChain":["Orchestrator","Classifier"],"allScores":{"People":0.92,"Admin":0.05}}"#;
        let meta: ClassificationMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.agent_chain.len(), 2);
        assert_eq!(meta.all_scores.unwrap()["Admin"], 0.05);
    }
}
