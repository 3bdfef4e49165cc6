//! CursorLedger - per-instance table of scripted cursor histories
//!
//! Each registered handle owns a FIFO queue of scripted steps. Steps are
//! consumed strictly in insertion order; a request that does not match the
//! front step is a protocol violation.
//!
//! Lifecycle per handle:
//!
//! ```text
//! Open --advance (steps remain)--> Open
//! Open --advance (queue drained)--> Exhausted
//! Open --cancel----------------> Cancelled
//! ```
//!
//! Exhausted and Cancelled are terminal. Entries in a terminal state are kept
//! as tombstones so late requests can be told apart from never-registered
//! handles, and so a cancellation after exhaustion stays idempotent.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::command::{cancels_handle, CommandKind};
use crate::error::{DeadReason, MockError, Result};
use crate::matcher::{match_command, Document, MatchMode, MatchResult};
use crate::response::ScriptedResponse;

/// Opaque caller-chosen cursor identifier.
pub type CursorHandle = u64;

/// Reserved handle value meaning "no more data".
pub const EXHAUSTED_CURSOR_ID: CursorHandle = 0;

/// Which stream of a logical query a cursor carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Results,
    #[serde(alias = "meta")]
    Metadata,
    #[default]
    Unspecified,
}

impl StreamKind {
    /// Wire tag, absent for single-stream queries
    pub fn tag(self) -> Option<StreamKind> {
        match self {
            StreamKind::Unspecified => None,
            kind => Some(kind),
        }
    }
}

/// One expected request and the response to send when it arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedStep {
    #[serde(rename = "expectedCommand", alias = "expectedRequest")]
    pub expected_request: Document,
    pub response: ScriptedResponse,
    /// May be dropped by a cancellation without failing the test
    #[serde(rename = "maybeUnused", alias = "tolerateSkip", default)]
    pub tolerate_skip: bool,
}

impl ScriptedStep {
    pub fn new(expected_request: Document, response: ScriptedResponse) -> Self {
        Self { expected_request, response, tolerate_skip: false }
    }

    pub fn tolerant(mut self) -> Self {
        self.tolerate_skip = true;
        self
    }

    /// Step that a cancellation of `handle` may discard silently.
    pub fn skippable_by_cancel(&self, handle: CursorHandle) -> bool {
        self.tolerate_skip || cancels_handle(&self.expected_request, handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Open,
    Exhausted,
    Cancelled,
}

impl CursorState {
    /// Terminal: drained by processing or by a cancellation.
    pub fn is_exhausted(&self) -> bool {
        !matches!(self, CursorState::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CursorState::Open => "open",
            CursorState::Exhausted => "exhausted",
            CursorState::Cancelled => "cancelled",
        }
    }
}

/// Scripted history for one handle.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub handle: CursorHandle,
    pub stream_kind: StreamKind,
    queue: VecDeque<ScriptedStep>,
    state: CursorState,
    /// Set once any step was consumed
    started: bool,
    /// Registration order, used to pick the oldest fresh cursor
    seq: u64,
}

impl LedgerEntry {
    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn steps(&self) -> impl Iterator<Item = &ScriptedStep> {
        self.queue.iter()
    }

    fn is_fresh(&self) -> bool {
        self.state == CursorState::Open
            && !self.started
            && self
                .queue
                .front()
                .map(|s| CommandKind::of(&s.expected_request) == Some(CommandKind::Search))
                .unwrap_or(false)
    }

    fn mandatory_remaining(&self) -> usize {
        self.queue.iter().filter(|s| !s.tolerate_skip).count()
    }
}

/// Result of consuming one step.
#[derive(Debug, Clone)]
pub struct Advanced {
    pub response: ScriptedResponse,
    /// Queue became empty as a result of this request
    pub exhausted: bool,
    pub kind: StreamKind,
}

/// Aggregate counts for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub open: usize,
    pub exhausted: usize,
    pub cancelled: usize,
    pub remaining_steps: usize,
}

#[derive(Debug)]
pub struct CursorLedger {
    entries: HashMap<CursorHandle, LedgerEntry>,
    next_seq: u64,
    mode: MatchMode,
}

impl CursorLedger {
    pub fn new(mode: MatchMode) -> Self {
        Self {
            entries: HashMap::new(),
            next_seq: 0,
            mode,
        }
    }

    pub fn match_mode(&self) -> MatchMode {
        self.mode
    }

    /// Register a scripted history for `handle`.
    ///
    /// A handle whose previous history is in a terminal state is re-armed.
    pub fn register(&mut self, handle: CursorHandle, steps: Vec<ScriptedStep>, kind: StreamKind) -> Result<()> {
        if handle == EXHAUSTED_CURSOR_ID {
            return Err(MockError::ReservedCursorId);
        }
        if steps.is_empty() {
            return Err(MockError::InvalidScript(format!("empty history for cursor {}", handle)));
        }
        for step in &steps {
            step.response.validate()?;
        }
        if let Some(existing) = self.entries.get(&handle) {
            if existing.state == CursorState::Open {
                return Err(MockError::CursorExists(handle));
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        tracing::debug!(handle, steps = steps.len(), ?kind, "registered cursor history");
        self.entries.insert(handle, LedgerEntry {
            handle,
            stream_kind: kind,
            queue: steps.into(),
            state: CursorState::Open,
            started: false,
            seq,
        });
        Ok(())
    }

    /// Compare `actual` with the front step of `handle` without consuming it.
    pub fn match_front(&self, handle: CursorHandle, actual: &Document) -> Result<MatchResult> {
        let entry = self.live_entry(handle)?;
        let step = entry.queue.front().ok_or(MockError::UnknownCursor {
            handle,
            reason: DeadReason::Exhausted,
        })?;
        Ok(match_command(actual, &step.expected_request, self.mode))
    }

    /// Consume the next step of `handle` if `actual` matches it.
    pub fn advance(&mut self, handle: CursorHandle, actual: &Document) -> Result<Advanced> {
        let result = self.match_front(handle, actual)?;
        if !result.ok {
            return Err(MockError::ProtocolViolation { handle, diff: result.describe() });
        }

        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or(MockError::UnknownCursor { handle, reason: DeadReason::NeverRegistered })?;
        let step = entry.queue.pop_front().ok_or(MockError::UnknownCursor {
            handle,
            reason: DeadReason::Exhausted,
        })?;
        entry.started = true;

        let exhausted = entry.queue.is_empty();
        if exhausted {
            entry.state = CursorState::Exhausted;
        }
        tracing::debug!(handle, remaining = entry.queue.len(), exhausted, "consumed scripted step");

        Ok(Advanced {
            response: step.response,
            exhausted,
            kind: entry.stream_kind,
        })
    }

    /// True if the queue of `handle` is empty or the handle was cancelled.
    ///
    /// Unregistered handles report false: there is no queue to inspect.
    pub fn peek_exhausted(&self, handle: CursorHandle) -> bool {
        self.entries
            .get(&handle)
            .map(|e| e.state != CursorState::Open || e.queue.is_empty())
            .unwrap_or(false)
    }

    /// Open with at least one step left.
    pub fn is_live(&self, handle: CursorHandle) -> bool {
        self.entries
            .get(&handle)
            .map(|e| e.state == CursorState::Open && !e.queue.is_empty())
            .unwrap_or(false)
    }

    pub fn state(&self, handle: CursorHandle) -> Option<CursorState> {
        self.entries.get(&handle).map(|e| e.state)
    }

    pub fn entry(&self, handle: CursorHandle) -> Option<&LedgerEntry> {
        self.entries.get(&handle)
    }

    /// Fresh handles (never advanced, first step is an initiating query), oldest first.
    pub fn fresh_handles(&self) -> Vec<CursorHandle> {
        let mut fresh: Vec<&LedgerEntry> = self.entries.values().filter(|e| e.is_fresh()).collect();
        fresh.sort_by_key(|e| e.seq);
        fresh.into_iter().map(|e| e.handle).collect()
    }

    /// Steps still queued across all handles, tolerant ones included.
    pub fn queued_steps(&self) -> usize {
        self.entries.values().map(|e| e.queue.len()).sum()
    }

    /// Handles with mandatory steps left, with the count of such steps.
    pub fn unused_mandatory(&self) -> Vec<(CursorHandle, usize)> {
        let mut unused: Vec<(CursorHandle, usize)> = self
            .entries
            .values()
            .filter(|e| e.state == CursorState::Open)
            .map(|e| (e.handle, e.mandatory_remaining()))
            .filter(|(_, n)| *n > 0)
            .collect();
        unused.sort_unstable();
        unused
    }

    pub fn stats(&self) -> LedgerStats {
        let mut stats = LedgerStats::default();
        for entry in self.entries.values() {
            match entry.state {
                CursorState::Open => stats.open += 1,
                CursorState::Exhausted => stats.exhausted += 1,
                CursorState::Cancelled => stats.cancelled += 1,
            }
            stats.remaining_steps += entry.queue.len();
        }
        stats
    }

    /// Drop all remaining steps and mark the handle Cancelled.
    ///
    /// Returns the number of discarded steps. Caller validates first.
    pub(crate) fn mark_cancelled(&mut self, handle: CursorHandle) -> usize {
        match self.entries.get_mut(&handle) {
            Some(entry) if entry.state == CursorState::Open => {
                let discarded = entry.queue.len();
                entry.queue.clear();
                entry.state = CursorState::Cancelled;
                discarded
            }
            _ => 0,
        }
    }

    fn live_entry(&self, handle: CursorHandle) -> Result<&LedgerEntry> {
        let entry = self
            .entries
            .get(&handle)
            .ok_or(MockError::UnknownCursor { handle, reason: DeadReason::NeverRegistered })?;
        match entry.state {
            CursorState::Open => Ok(entry),
            CursorState::Exhausted => Err(MockError::UnknownCursor { handle, reason: DeadReason::Exhausted }),
            CursorState::Cancelled => Err(MockError::UnknownCursor { handle, reason: DeadReason::Cancelled }),
        }
    }
}
