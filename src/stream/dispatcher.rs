//! Per-stream event dispatch
//!
//! Maps normalised wire events onto `CaptureEvent`s while tracking the state
//! that only makes sense for a single stream: accumulated text deltas,
//! whether a HITL outcome was already reported, and the terminal guard.

use tracing::{debug, trace};

use crate::events::CaptureEvent;

use super::envelope::WireEvent;

/// Fallback when the backend reports an error without a message
pub const RUN_FAILED: &str = "Run failed";

/// Reported when the body ends before any terminal event
pub const ENDED_EARLY: &str = "stream ended before a result was received";

/// Dispatch state owned by exactly one stream
#[derive(Debug, Default)]
pub struct StreamContext {
    result: String,
    hitl_triggered: bool,
    finished: bool,
}

impl StreamContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a terminal event has been produced (or suppressed)
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Text accumulated from deltas so far
    pub fn accumulated(&self) -> &str {
        &self.result
    }

    /// Map one wire event. Returns `None` when nothing should be delivered.
    pub fn dispatch(&mut self, event: WireEvent) -> Option<CaptureEvent> {
        if self.finished {
            trace!(?event, "stream already finished, dropping event");
            return None;
        }

        match event {
            WireEvent::StepStart { step } => Some(CaptureEvent::StepStarted { step }),
            WireEvent::StepFinish { step } => Some(CaptureEvent::StepFinished { step }),
            WireEvent::TextDelta { delta } => {
                self.result.push_str(&delta);
                Some(CaptureEvent::TextDelta { delta })
            }
            WireEvent::Classified {
                bucket,
                confidence,
                meta,
                ..
            } => self.terminal(CaptureEvent::Completed {
                result: format!("Filed -> {} ({:.2})", bucket, confidence),
                classification: Some(meta),
            }),
            WireEvent::LowConfidence {
                inbox_item_id,
                bucket,
                confidence,
                all_scores,
            } => {
                self.hitl_triggered = true;
                self.terminal(CaptureEvent::LowConfidence {
                    inbox_item_id,
                    bucket,
                    confidence,
                    all_scores,
                })
            }
            WireEvent::ClarificationRequired {
                thread_id,
                question_text,
                inbox_item_id,
            } => {
                self.hitl_triggered = true;
                // older backends streamed the question as text deltas
                let question_text = if question_text.is_empty() {
                    self.result.clone()
                } else {
                    question_text
                };
                self.terminal(CaptureEvent::ClarificationRequired {
                    thread_id,
                    question_text,
                    inbox_item_id,
                })
            }
            WireEvent::Misunderstood {
                thread_id,
                question_text,
                inbox_item_id,
            } => {
                self.hitl_triggered = true;
                self.terminal(CaptureEvent::Misunderstood {
                    thread_id,
                    question_text,
                    inbox_item_id,
                })
            }
            WireEvent::Unresolved { inbox_item_id } => {
                self.terminal(CaptureEvent::Unresolved { inbox_item_id })
            }
            WireEvent::Complete { result } => {
                if self.hitl_triggered {
                    debug!("completion suppressed after HITL outcome");
                    self.finished = true;
                    return None;
                }
                let result = result.unwrap_or_else(|| std::mem::take(&mut self.result));
                self.terminal(CaptureEvent::Completed {
                    result,
                    classification: None,
                })
            }
            WireEvent::Error { message } => self.terminal(CaptureEvent::Failed {
                message: message.unwrap_or_else(|| RUN_FAILED.to_string()),
            }),
        }
    }

    /// Map a transport failure onto the error path
    pub fn fail(&mut self, message: impl Into<String>) -> Option<CaptureEvent> {
        if self.finished {
            return None;
        }
        self.terminal(CaptureEvent::Failed {
            message: message.into(),
        })
    }

    /// Body ended. Produces a failure if no terminal event was seen.
    pub fn end_of_stream(&mut self) -> Option<CaptureEvent> {
        if self.finished {
            return None;
        }
        self.fail(ENDED_EARLY)
    }

    fn terminal(&mut self, event: CaptureEvent) -> Option<CaptureEvent> {
        self.finished = true;
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::envelope;
    use proptest::prelude::*;

    fn run(frames: &[&str]) -> Vec<CaptureEvent> {
        let mut ctx = StreamContext::new();
        let mut out: Vec<CaptureEvent> = frames
            .iter()
            .filter_map(|frame| envelope::parse(frame))
            .filter_map(|event| ctx.dispatch(event))
            .collect();
        out.extend(ctx.end_of_stream());
        out
    }

    #[test]
    fn test_classified_scenario() {
        let events = run(&[
            r#"{"type":"STEP_START","stepName":"classify"}"#,
            r#"{"type":"STEP_END","stepName":"classify"}"#,
            r#"{"type":"CLASSIFIED","value":{"inboxItemId":"i1","bucket":"People","confidence":0.92}}"#,
            r#"{"type":"COMPLETE","threadId":"t","runId":"r"}"#,
        ]);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], CaptureEvent::StepStarted { step: "classify".into() });
        match &events[2] {
            CaptureEvent::Completed { result, classification } => {
                assert_eq!(result, "Filed -> People (0.92)");
                assert_eq!(classification.as_ref().map(|m| m.bucket.as_str()), Some("People"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_low_confidence_suppresses_complete() {
        let events = run(&[
            r#"{"type":"LOW_CONFIDENCE","value":{"inboxItemId":"i1","bucket":"Admin","confidence":0.4}}"#,
            r#"{"type":"COMPLETE"}"#,
        ]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], CaptureEvent::LowConfidence { .. }));
    }

    #[test]
    fn test_complete_uses_accumulated_text() {
        let events = run(&[
            r#"{"type":"TEXT_MESSAGE_CONTENT","delta":"Filed "}"#,
            r#"{"type":"TEXT_MESSAGE_CONTENT","delta":"to Ideas"}"#,
            r#"{"type":"RUN_FINISHED"}"#,
        ]);
        assert_eq!(
            events.last(),
            Some(&CaptureEvent::Completed {
                result: "Filed to Ideas".into(),
                classification: None
            })
        );
    }

    #[test]
    fn test_explicit_result_wins() {
        let events = run(&[
            r#"{"type":"TEXT_MESSAGE_CONTENT","delta":"thinking"}"#,
            r#"{"type":"COMPLETE","result":"Filed -> Ideas"}"#,
        ]);
        assert!(matches!(events.last(), Some(CaptureEvent::Completed { result, .. }) if result == "Filed -> Ideas"));
    }

    #[test]
    fn test_legacy_hitl_falls_back_to_streamed_question() {
        let events = run(&[
            r#"{"type":"TEXT_MESSAGE_CONTENT","delta":"Is this People or Admin?"}"#,
            r#"{"type":"CUSTOM","name":"HITL_REQUIRED","value":{"threadId":"t1"}}"#,
            r#"{"type":"RUN_FINISHED"}"#,
        ]);
        assert_eq!(
            events.last(),
            Some(&CaptureEvent::ClarificationRequired {
                thread_id: "t1".into(),
                question_text: "Is this People or Admin?".into(),
                inbox_item_id: None,
            })
        );
    }

    #[test]
    fn test_error_then_complete_fires_once() {
        let events = run(&[
            r#"{"type":"ERROR","message":"agent timeout"}"#,
            r#"{"type":"COMPLETE"}"#,
        ]);
        assert_eq!(events, vec![CaptureEvent::Failed { message: "agent timeout".into() }]);
    }

    #[test]
    fn test_run_error_fallback_message() {
        let events = run(&[r#"{"type":"RUN_ERROR"}"#]);
        assert_eq!(events, vec![CaptureEvent::Failed { message: RUN_FAILED.into() }]);
    }

    #[test]
    fn test_unresolved_then_complete() {
        let events = run(&[
            r#"{"type":"UNRESOLVED","value":{"inboxItemId":"i4"}}"#,
            r#"{"type":"COMPLETE"}"#,
        ]);
        assert_eq!(events, vec![CaptureEvent::Unresolved { inbox_item_id: Some("i4".into()) }]);
    }

    #[test]
    fn test_eof_without_terminal_fails() {
        let events = run(&[r#"{"type":"STEP_START","stepName":"Classifying"}"#]);
        assert_eq!(events.last(), Some(&CaptureEvent::Failed { message: ENDED_EARLY.into() }));
    }

    #[test]
    fn test_fail_after_terminal_is_silent() {
        let mut ctx = StreamContext::new();
        assert!(ctx.dispatch(WireEvent::Unresolved { inbox_item_id: None }).is_some());
        assert!(ctx.fail("connection reset").is_none());
        assert!(ctx.end_of_stream().is_none());
    }

    fn wire_event() -> impl Strategy<Value = WireEvent> {
        prop_oneof![
            "[a-z]{1,8}".prop_map(|step| WireEvent::StepStart { step }),
            "[a-z]{1,8}".prop_map(|step| WireEvent::StepFinish { step }),
            "[a-z ]{1,8}".prop_map(|delta| WireEvent::TextDelta { delta }),
            (0.0f64..1.0).prop_map(|confidence| WireEvent::Classified {
                inbox_item_id: Some("i".into()),
                bucket: "Ideas".into(),
                confidence,
                meta: crate::capture::ClassificationMeta {
                    bucket: "Ideas".into(),
                    confidence,
                    agent_chain: Vec::new(),
                    all_scores: None,
                },
            }),
            (0.0f64..1.0).prop_map(|confidence| WireEvent::LowConfidence {
                inbox_item_id: "i".into(),
                bucket: "Admin".into(),
                confidence,
                all_scores: None,
            }),
            Just(WireEvent::ClarificationRequired {
                thread_id: "t".into(),
                question_text: "?".into(),
                inbox_item_id: None,
            }),
            Just(WireEvent::Misunderstood {
                thread_id: "t".into(),
                question_text: "?".into(),
                inbox_item_id: "i".into(),
            }),
            Just(WireEvent::Unresolved { inbox_item_id: None }),
            prop::option::of("[a-z]{0,6}").prop_map(|result| WireEvent::Complete { result }),
            prop::option::of("[a-z]{0,6}").prop_map(|message| WireEvent::Error { message }),
        ]
    }

    proptest! {
        #[test]
        fn property_exactly_one_terminal_and_it_is_last(
            events in prop::collection::vec(wire_event(), 0..16),
        ) {
            let mut ctx = StreamContext::new();
            let mut out: Vec<CaptureEvent> = events
                .into_iter()
                .filter_map(|event| ctx.dispatch(event))
                .collect();
            out.extend(ctx.end_of_stream());

            let terminals = out.iter().filter(|e| e.is_terminal()).count();
            prop_assert_eq!(terminals, 1);
            prop_assert!(out.last().map(CaptureEvent::is_terminal).unwrap_or(false));
        }
    }
}
