//! Capture workflow state machine
//!
//! Provides an explicit state machine driving one capture at a time:
//! - Idle: ready for a new capture
//! - Submitting: capture stream open
//! - AwaitingBucketChoice: low confidence, waiting for the user's pick
//! - AwaitingFollowUp: misunderstood, waiting for the user's reply
//! - Reclassifying: bucket pick or follow-up in flight
//! - Succeeded / Unresolved / Failed: terminal until acknowledged

mod machine;
mod suggest;

pub use machine::{
    BucketChoice, CaptureFailure, CaptureWorkflow, FailureKind, FollowUpPrompt, WorkflowError,
    WorkflowState, MAX_FOLLOW_UP_ROUNDS,
};
pub use suggest::{suggest_buckets, MAX_SUGGESTIONS};
