//! second-brain-capture: client engine for capture, classify, clarify, file
//!
//! A capture (typed text or recorded audio) is posted to the classification
//! backend, whose server-sent event stream is decoded into `CaptureEvent`s.
//! `CaptureWorkflow` drives each capture through bucket choice and
//! follow-up clarification until it is filed, left unresolved, or fails.

pub mod capture;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod state;
pub mod stream;

pub use capture::{CaptureRequest, ClassificationMeta, FollowUpReply, InboxItemId, RunId, ThreadId};
pub use config::{ClarificationMode, Config, ConfigError, FollowUpLimit, Protocol};
pub use events::{CaptureEvent, WorkflowEvent};
pub use state::{CaptureFailure, CaptureWorkflow, FailureKind, WorkflowError, WorkflowState};
pub use stream::{CancelHandle, HttpTransport, Operation, StreamHandle, Transport};
