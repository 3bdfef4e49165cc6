//! CancellationHandler - explicit and race-driven cursor cancellation
//!
//! A client may prefetch a continuation for a stream it later decides it does
//! not need, then cancel that stream while the prefetch may or may not have
//! been sent. Steps marked skip-tolerant model that race: cancellation drops
//! them silently. Dropping a mandatory step is a test authoring error.
//!
//! Cancellation is atomic over the handle list: every handle is validated
//! before any of them is marked Cancelled.

use crate::error::{DeadReason, MockError, Result};
use crate::ledger::{CursorHandle, CursorLedger, CursorState};

/// What a successful cancellation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Open handles that are now Cancelled
    pub cancelled: Vec<CursorHandle>,
    /// Handles that were already Exhausted or Cancelled
    pub already_dead: Vec<CursorHandle>,
    /// Skip-tolerant steps discarded across all handles
    pub discarded_steps: usize,
    /// Distinct handles in the order the request named them
    pub requested: Vec<CursorHandle>,
}

impl CancelOutcome {
    /// Every handle the request named, in request order, duplicates dropped.
    pub fn killed(&self) -> Vec<CursorHandle> {
        self.requested.clone()
    }
}

pub struct CancellationHandler<'a> {
    ledger: &'a mut CursorLedger,
}

impl<'a> CancellationHandler<'a> {
    pub fn new(ledger: &'a mut CursorLedger) -> Self {
        Self { ledger }
    }

    /// Cancel `handles`.
    pub fn cancel(self, handles: &[CursorHandle]) -> Result<CancelOutcome> {
        let mut outcome = CancelOutcome::default();
        let mut seen = Vec::with_capacity(handles.len());

        for &handle in handles {
            if seen.contains(&handle) {
                continue;
            }
            seen.push(handle);

            let entry = self
                .ledger
                .entry(handle)
                .ok_or(MockError::UnknownCursor { handle, reason: DeadReason::NeverRegistered })?;

            match entry.state() {
                CursorState::Exhausted | CursorState::Cancelled => outcome.already_dead.push(handle),
                CursorState::Open => {
                    let mandatory = entry.steps().filter(|s| !s.skippable_by_cancel(handle)).count();
                    if mandatory > 0 {
                        tracing::warn!(handle, mandatory, "cancellation would drop mandatory steps");
                        return Err(MockError::PrematureCancellation { handle, remaining: mandatory });
                    }
                    outcome.cancelled.push(handle);
                }
            }
        }

        for &handle in &outcome.cancelled {
            let discarded = self.ledger.mark_cancelled(handle);
            if discarded > 0 {
                tracing::debug!(handle, discarded, "discarded skip-tolerant steps on cancel");
            }
            outcome.discarded_steps += discarded;
        }
        outcome.requested = seen;

        Ok(outcome)
    }
}

#[cfg(test)]
mod cancel_tests {
    use super::*;
    use crate::ledger::{ScriptedStep, StreamKind};
    use crate::matcher::MatchMode;
    use crate::response::ScriptedResponse;
    use serde_json::json;

    fn continue_step(handle: CursorHandle) -> ScriptedStep {
        ScriptedStep::new(
            json!({"continue": handle, "collection": "coll"}),
            ScriptedResponse::batch("db.coll", vec![json!({"_id": 1})]),
        )
    }

    #[test]
    fn test_cancel_tolerant_only_succeeds() {
        let mut ledger = CursorLedger::new(MatchMode::Subset);
        ledger.register(200, vec![continue_step(200).tolerant()], StreamKind::Metadata).unwrap();

        let outcome = CancellationHandler::new(&mut ledger).cancel(&[200]).unwrap();
        assert_eq!(outcome.cancelled, vec![200]);
        assert_eq!(outcome.discarded_steps, 1);
        assert_eq!(ledger.state(200), Some(CursorState::Cancelled));
        assert!(ledger.state(200).unwrap().is_exhausted());
        assert!(ledger.peek_exhausted(200));
    }

    #[test]
    fn test_cancel_mandatory_fails_without_mutation() {
        let mut ledger = CursorLedger::new(MatchMode::Subset);
        ledger.register(1, vec![continue_step(1).tolerant()], StreamKind::Unspecified).unwrap();
        ledger.register(2, vec![continue_step(2)], StreamKind::Unspecified).unwrap();

        let err = CancellationHandler::new(&mut ledger).cancel(&[1, 2]).unwrap_err();
        assert!(matches!(err, MockError::PrematureCancellation { handle: 2, remaining: 1 }));

        // Atomic: handle 1 was not cancelled either
        assert_eq!(ledger.state(1), Some(CursorState::Open));
        assert_eq!(ledger.state(2), Some(CursorState::Open));
    }

    #[test]
    fn test_cancel_is_idempotent_after_exhaustion() {
        let mut ledger = CursorLedger::new(MatchMode::Subset);
        ledger.register(3, vec![continue_step(3)], StreamKind::Unspecified).unwrap();
        ledger.advance(3, &json!({"continue": 3, "collection": "coll"})).unwrap();

        let outcome = CancellationHandler::new(&mut ledger).cancel(&[3, 3]).unwrap();
        assert_eq!(outcome.already_dead, vec![3]);
        assert!(outcome.cancelled.is_empty());

        let again = CancellationHandler::new(&mut ledger).cancel(&[3]).unwrap();
        assert_eq!(again.killed(), vec![3]);
    }

    #[test]
    fn test_killed_keeps_request_order() {
        let mut ledger = CursorLedger::new(MatchMode::Subset);
        ledger.register(7, vec![continue_step(7)], StreamKind::Unspecified).unwrap();
        ledger.advance(7, &json!({"continue": 7, "collection": "coll"})).unwrap();
        ledger.register(8, vec![continue_step(8).tolerant()], StreamKind::Unspecified).unwrap();

        let outcome = CancellationHandler::new(&mut ledger).cancel(&[7, 8, 7]).unwrap();
        assert_eq!(outcome.cancelled, vec![8]);
        assert_eq!(outcome.already_dead, vec![7]);
        assert_eq!(outcome.killed(), vec![7, 8]);
    }

    #[test]
    fn test_cancel_unregistered_is_unknown_cursor() {
        let mut ledger = CursorLedger::new(MatchMode::Subset);
        let err = CancellationHandler::new(&mut ledger).cancel(&[77]).unwrap_err();
        assert!(matches!(err, MockError::UnknownCursor { handle: 77, reason: DeadReason::NeverRegistered }));
    }

    #[test]
    fn test_scripted_cancel_step_is_acknowledged() {
        let mut ledger = CursorLedger::new(MatchMode::Subset);
        let kill = ScriptedStep::new(
            json!({"cancel": [5], "collection": "coll"}),
            ScriptedResponse::batch("db.coll", vec![]),
        );
        ledger.register(5, vec![kill], StreamKind::Unspecified).unwrap();

        let outcome = CancellationHandler::new(&mut ledger).cancel(&[5]).unwrap();
        assert_eq!(outcome.cancelled, vec![5]);
    }

    #[test]
    fn test_continuation_after_cancel_is_unknown_cursor() {
        let mut ledger = CursorLedger::new(MatchMode::Subset);
        ledger.register(9, vec![continue_step(9).tolerant()], StreamKind::Metadata).unwrap();
        CancellationHandler::new(&mut ledger).cancel(&[9]).unwrap();

        let err = ledger.advance(9, &json!({"continue": 9, "collection": "coll"})).unwrap_err();
        assert!(matches!(err, MockError::UnknownCursor { handle: 9, reason: DeadReason::Cancelled }));
    }
}
