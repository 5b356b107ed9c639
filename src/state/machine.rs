//! Core state machine implementation
//!
//! Handles transitions between Idle, Submitting, AwaitingBucketChoice,
//! AwaitingFollowUp, Reclassifying and the terminal states, based on the
//! terminal event of each stream and on explicit caller actions.

use std::time::Instant;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::capture::{
    new_attempt_ids, CaptureRequest, ClassificationMeta, FollowUpReply, InboxItemId, ThreadId,
};
use crate::config::{ClarificationMode, Config, FollowUpLimit};
use crate::events::{CaptureEvent, WorkflowEvent};
use crate::stream::{CancelHandle, Operation, StreamHandle, Transport, ENDED_EARLY};

use super::suggest::suggest_buckets;

/// What `state()` reports for an operation cancelled through its handle
static CANCELLED_TO_IDLE: WorkflowState = WorkflowState::Idle;

/// Follow-up rounds shown to the user ("follow-up 2 of 2")
pub const MAX_FOLLOW_UP_ROUNDS: u32 = 2;

/// Waiting for the user to pick a bucket
#[derive(Debug, Clone, PartialEq)]
pub struct BucketChoice {
    pub inbox_item_id: Option<InboxItemId>,
    pub thread_id: Option<ThreadId>,
    /// Clarifying question, when the backend asked one
    pub question: Option<String>,
    /// The backend's own low-confidence pick
    pub bucket: Option<String>,
    pub confidence: Option<f64>,
    /// Buckets to highlight, best first
    pub suggested: Vec<String>,
}

/// Waiting for the user to answer a clarifying question
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUpPrompt {
    pub inbox_item_id: InboxItemId,
    pub thread_id: Option<ThreadId>,
    pub question: String,
    pub round: u32,
}

impl FollowUpPrompt {
    pub fn round_label(&self) -> String {
        format!("Follow-up {} of {}", self.round, MAX_FOLLOW_UP_ROUNDS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The backend no longer knows the item or session
    Expired,
    Generic,
}

/// A failed capture. `detail` is for logs, not for display.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl CaptureFailure {
    pub fn from_message(message: impl Into<String>) -> Self {
        let detail = message.into();
        let lowered = detail.to_lowercase();
        let kind = if ["expired", "not found", "404"]
            .iter()
            .any(|needle| lowered.contains(needle))
        {
            FailureKind::Expired
        } else {
            FailureKind::Generic
        };
        Self { kind, detail }
    }

    pub fn user_message(&self) -> &'static str {
        match self.kind {
            FailureKind::Expired => "This capture needs to be resubmitted",
            FailureKind::Generic => "Couldn't file your capture. Try again.",
        }
    }
}

/// Workflow states
#[derive(Debug, Clone, PartialEq, Default)]
pub enum WorkflowState {
    /// Ready for a new capture
    #[default]
    Idle,
    /// Capture stream open
    Submitting { thread_id: Option<ThreadId> },
    /// Low confidence or legacy HITL pause
    AwaitingBucketChoice(BucketChoice),
    /// Misunderstood, waiting for a reply
    AwaitingFollowUp(FollowUpPrompt),
    /// Bucket pick or follow-up in flight
    Reclassifying,
    /// Capture filed
    Succeeded {
        result: String,
        classification: Option<ClassificationMeta>,
    },
    /// Item left in the inbox for manual handling
    Unresolved { inbox_item_id: Option<InboxItemId> },
    /// Capture failed; acknowledge and resubmit to retry
    Failed(CaptureFailure),
}

impl WorkflowState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "Idle",
            WorkflowState::Submitting { .. } => "Submitting",
            WorkflowState::AwaitingBucketChoice(_) => "AwaitingBucketChoice",
            WorkflowState::AwaitingFollowUp(_) => "AwaitingFollowUp",
            WorkflowState::Reclassifying => "Reclassifying",
            WorkflowState::Succeeded { .. } => "Succeeded",
            WorkflowState::Unresolved { .. } => "Unresolved",
            WorkflowState::Failed(_) => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Succeeded { .. } | WorkflowState::Unresolved { .. } | WorkflowState::Failed(_)
        )
    }

    /// A stream is expected to be open
    pub fn is_in_flight(&self) -> bool {
        matches!(self, WorkflowState::Submitting { .. } | WorkflowState::Reclassifying)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Caller actions that do not fit the current state
#[derive(Debug, Error, PartialEq)]
pub enum WorkflowError {
    #[error("a capture is already in progress ({state})")]
    Busy { state: &'static str },

    #[error("nothing to capture")]
    EmptyCapture,

    #[error("follow-up reply is empty")]
    EmptyReply,

    #[error("unknown bucket {0:?}")]
    UnknownBucket(String),

    #[error("not waiting for a bucket choice ({state})")]
    NotAwaitingBucketChoice { state: &'static str },

    #[error("not waiting for a follow-up reply ({state})")]
    NotAwaitingFollowUp { state: &'static str },

    #[error("no inbox item or thread to resolve against")]
    MissingIdentifier,

    #[error("workflow is not in a terminal state ({state})")]
    NotTerminal { state: &'static str },
}

/// Drives one capture at a time through the transport
pub struct CaptureWorkflow<T: Transport> {
    transport: T,
    /// Current state
    state: WorkflowState,
    /// Time when the current state was entered
    state_entered_at: Instant,
    follow_up_round: u32,
    /// The active stream answers a follow-up question
    in_follow_up: bool,
    /// Thread id of the current attempt (text captures only)
    thread_id: Option<ThreadId>,
    active: Option<StreamHandle>,
    buckets: Vec<String>,
    clarification: ClarificationMode,
    follow_up_limit: FollowUpLimit,
    /// Channel for emitting workflow events
    event_tx: broadcast::Sender<WorkflowEvent>,
}

impl<T: Transport> CaptureWorkflow<T> {
    /// Create a new workflow in the Idle state
    pub fn new(transport: T, config: &Config, event_tx: broadcast::Sender<WorkflowEvent>) -> Self {
        Self {
            transport,
            state: WorkflowState::Idle,
            state_entered_at: Instant::now(),
            follow_up_round: 0,
            in_follow_up: false,
            thread_id: None,
            active: None,
            buckets: config.buckets.clone(),
            clarification: config.clarification,
            follow_up_limit: config.follow_up_limit,
            event_tx,
        }
    }

    /// Get the current state
    ///
    /// An operation cancelled through its `CancelHandle` already reads as
    /// Idle, before the workflow has observed the cancellation.
    pub fn state(&self) -> &WorkflowState {
        if self.state.is_in_flight() && self.active_cancelled() {
            return &CANCELLED_TO_IDLE;
        }
        &self.state
    }

    pub fn follow_up_round(&self) -> u32 {
        self.follow_up_round
    }

    pub fn buckets(&self) -> &[String] {
        &self.buckets
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_tx.subscribe()
    }

    /// Idle -> Submitting
    pub fn submit(&mut self, request: CaptureRequest) -> Result<CancelHandle, WorkflowError> {
        self.settle_cancelled();
        if self.state != WorkflowState::Idle {
            return Err(WorkflowError::Busy {
                state: self.state.name(),
            });
        }
        if request.is_empty() {
            return Err(WorkflowError::EmptyCapture);
        }

        info!(kind = request.kind(), "submitting capture");

        let operation = match request {
            CaptureRequest::Text { content } => {
                let (thread_id, run_id) = new_attempt_ids();
                self.thread_id = Some(thread_id.clone());
                Operation::CaptureText {
                    text: content.trim().to_string(),
                    thread_id,
                    run_id,
                }
            }
            CaptureRequest::Voice {
                audio,
                file_name,
                mime_type,
            } => {
                self.thread_id = None;
                Operation::CaptureVoice {
                    audio,
                    file_name,
                    mime_type,
                }
            }
        };

        self.follow_up_round = 0;
        self.in_follow_up = false;
        let thread_id = self.thread_id.clone();
        Ok(self.start(operation, WorkflowState::Submitting { thread_id }))
    }

    /// AwaitingBucketChoice -> Reclassifying
    pub fn choose_bucket(&mut self, bucket: &str) -> Result<CancelHandle, WorkflowError> {
        self.settle_cancelled();
        let choice = match &self.state {
            WorkflowState::AwaitingBucketChoice(choice) => choice.clone(),
            other => {
                return Err(WorkflowError::NotAwaitingBucketChoice { state: other.name() });
            }
        };

        let bucket = self
            .buckets
            .iter()
            .find(|known| known.eq_ignore_ascii_case(bucket.trim()))
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownBucket(bucket.to_string()))?;

        let operation = match (self.clarification, choice.inbox_item_id, choice.thread_id) {
            (ClarificationMode::Recategorize, Some(inbox_item_id), _)
            | (ClarificationMode::Respond, Some(inbox_item_id), None) => Operation::Recategorize {
                inbox_item_id,
                bucket,
            },
            (_, inbox_item_id, Some(thread_id)) => Operation::Respond {
                thread_id,
                bucket,
                inbox_item_id,
            },
            (_, None, None) => return Err(WorkflowError::MissingIdentifier),
        };

        info!(operation = operation.name(), "resolving bucket choice");
        self.in_follow_up = false;
        Ok(self.start(operation, WorkflowState::Reclassifying))
    }

    /// AwaitingFollowUp -> Reclassifying
    pub fn submit_follow_up(&mut self, reply: FollowUpReply) -> Result<CancelHandle, WorkflowError> {
        self.settle_cancelled();
        let prompt = match &self.state {
            WorkflowState::AwaitingFollowUp(prompt) => prompt.clone(),
            other => {
                return Err(WorkflowError::NotAwaitingFollowUp { state: other.name() });
            }
        };
        if reply.is_empty() {
            return Err(WorkflowError::EmptyReply);
        }

        let operation = match reply {
            FollowUpReply::Text(text) => Operation::FollowUp {
                inbox_item_id: prompt.inbox_item_id,
                text: text.trim().to_string(),
                round: prompt.round,
            },
            FollowUpReply::Voice {
                audio,
                file_name,
                mime_type,
            } => Operation::FollowUpVoice {
                inbox_item_id: prompt.inbox_item_id,
                audio,
                file_name,
                mime_type,
                round: prompt.round,
            },
        };

        info!(round = prompt.round, "submitting follow-up");
        self.in_follow_up = true;
        Ok(self.start(operation, WorkflowState::Reclassifying))
    }

    /// Pull one event from the active stream and apply it.
    ///
    /// Returns `None` when no stream is active or it was cancelled.
    pub async fn next_event(&mut self) -> Option<CaptureEvent> {
        let handle = self.active.as_mut()?;
        let event = handle.next_event().await;
        let cancelled = handle.is_cancelled();

        let Some(event) = event else {
            self.active = None;
            if cancelled {
                debug!("active stream cancelled");
                if self.state.is_in_flight() {
                    self.transition_to(WorkflowState::Idle);
                }
            } else {
                warn!("stream closed without a terminal event");
                self.transition_to(WorkflowState::Failed(CaptureFailure::from_message(ENDED_EARLY)));
            }
            return None;
        };

        debug!(%event, "stream event");
        self.emit(WorkflowEvent::Capture {
            event: event.clone(),
        });

        if event.is_terminal() {
            self.active = None;
            let next = self.resolve(&event);
            self.transition_to(next);
        }

        Some(event)
    }

    /// Pump the active stream until it finishes
    pub async fn run_until_settled(&mut self) -> &WorkflowState {
        while self.next_event().await.is_some() {}
        &self.state
    }

    /// Cancel the in-flight operation, if any
    pub fn cancel(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.cancel();
            info!(state = %self.state, "operation cancelled");
        }
        if self.state.is_in_flight() {
            self.transition_to(WorkflowState::Idle);
        }
    }

    /// Terminal -> Idle, once the caller has shown the outcome
    pub fn acknowledge(&mut self) -> Result<(), WorkflowError> {
        if !self.state.is_terminal() {
            return Err(WorkflowError::NotTerminal {
                state: self.state.name(),
            });
        }
        self.follow_up_round = 0;
        self.in_follow_up = false;
        self.thread_id = None;
        self.transition_to(WorkflowState::Idle);
        Ok(())
    }

    fn active_cancelled(&self) -> bool {
        self.active.as_ref().is_some_and(StreamHandle::is_cancelled)
    }

    /// Apply a cancellation made through a handle returned to the caller
    fn settle_cancelled(&mut self) {
        if !self.active_cancelled() {
            return;
        }
        self.active = None;
        debug!(state = %self.state, "operation cancelled through its handle");
        if self.state.is_in_flight() {
            self.transition_to(WorkflowState::Idle);
        }
    }

    fn start(&mut self, operation: Operation, next: WorkflowState) -> CancelHandle {
        if let Some(previous) = self.active.take() {
            previous.cancel();
        }
        let handle = self.transport.open(operation);
        let cancel = handle.cancel_handle();
        self.active = Some(handle);
        self.transition_to(next);
        cancel
    }

    /// State reached after a stream's terminal event
    fn resolve(&mut self, event: &CaptureEvent) -> WorkflowState {
        match event {
            CaptureEvent::LowConfidence {
                inbox_item_id,
                bucket,
                confidence,
                all_scores,
            } => WorkflowState::AwaitingBucketChoice(BucketChoice {
                inbox_item_id: Some(inbox_item_id.as_str())
                    .filter(|id| !id.is_empty())
                    .map(InboxItemId::from),
                thread_id: self.thread_id.clone(),
                question: None,
                bucket: Some(bucket.clone()),
                confidence: Some(*confidence),
                suggested: suggest_buckets(
                    &self.buckets,
                    Some(bucket.as_str()),
                    None,
                    all_scores.as_ref(),
                ),
            }),
            CaptureEvent::ClarificationRequired {
                thread_id,
                question_text,
                inbox_item_id,
            } => WorkflowState::AwaitingBucketChoice(BucketChoice {
                inbox_item_id: inbox_item_id.as_deref().map(InboxItemId::from),
                thread_id: Some(ThreadId::from(thread_id.as_str())),
                question: Some(question_text.clone()).filter(|q| !q.is_empty()),
                bucket: None,
                confidence: None,
                suggested: suggest_buckets(&self.buckets, None, Some(question_text.as_str()), None),
            }),
            CaptureEvent::Misunderstood {
                thread_id,
                question_text,
                inbox_item_id,
            } => {
                if self.in_follow_up {
                    if self.follow_up_limit == FollowUpLimit::HardCap
                        && self.follow_up_round >= MAX_FOLLOW_UP_ROUNDS
                    {
                        info!(round = self.follow_up_round, "follow-up limit reached");
                        return WorkflowState::Unresolved {
                            inbox_item_id: Some(InboxItemId::from(inbox_item_id.as_str())),
                        };
                    }
                    self.follow_up_round = (self.follow_up_round + 1).min(MAX_FOLLOW_UP_ROUNDS);
                } else {
                    self.follow_up_round = 1;
                }
                WorkflowState::AwaitingFollowUp(FollowUpPrompt {
                    inbox_item_id: InboxItemId::from(inbox_item_id.as_str()),
                    thread_id: Some(thread_id.as_str())
                        .filter(|id| !id.is_empty())
                        .map(ThreadId::from),
                    question: question_text.clone(),
                    round: self.follow_up_round,
                })
            }
            CaptureEvent::Unresolved { inbox_item_id } => WorkflowState::Unresolved {
                inbox_item_id: inbox_item_id.as_deref().map(InboxItemId::from),
            },
            CaptureEvent::Completed {
                result,
                classification,
            } => WorkflowState::Succeeded {
                result: result.clone(),
                classification: classification.clone(),
            },
            CaptureEvent::Failed { message } => {
                WorkflowState::Failed(CaptureFailure::from_message(message.as_str()))
            }
            CaptureEvent::StepStarted { .. }
            | CaptureEvent::StepFinished { .. }
            | CaptureEvent::TextDelta { .. } => self.state.clone(),
        }
    }

    /// Perform a state transition
    fn transition_to(&mut self, new_state: WorkflowState) {
        let from = self.state.name();
        let to = new_state.name();
        let duration_ms = self.state_entered_at.elapsed().as_millis() as u64;

        info!(
            from,
            to,
            duration_ms,
            round = self.follow_up_round,
            "workflow transition"
        );

        self.state = new_state;
        self.state_entered_at = Instant::now();

        self.emit(WorkflowEvent::StateChanged {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    fn emit(&self, event: WorkflowEvent) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }
}
