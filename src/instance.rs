//! MockServerInstance - the search backend endpoint of one shard or member
//!
//! Each instance owns its own cursor ledger and plan queue; nothing is shared
//! between instances, so numerically equal handles on two shards never
//! interfere. Requests are processed one at a time per instance under a single
//! coarse lock, which preserves FIFO ordering of each handle's steps.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cancel::CancellationHandler;
use crate::command::{Command, SearchCommand};
use crate::error::{MockError, Result};
use crate::ledger::{CursorHandle, CursorLedger, LedgerStats, ScriptedStep, StreamKind};
use crate::matcher::{match_command, Document, MatchMode};
use crate::response::{ResponseBuilder, WireEnvelope};

/// Defaults applied to every new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceOptions {
    pub match_mode: MatchMode,
    /// Initiating queries must claim the oldest fresh cursor
    pub order_check: bool,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            match_mode: MatchMode::Subset,
            order_check: true,
        }
    }
}

/// One scripted plan exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(rename = "expectedCommand", alias = "expectedRequest")]
    pub expected_request: Document,
    /// Merge description returned as-is, `ok: 1` added when missing
    pub response: Document,
    #[serde(rename = "maybeUnused", alias = "tolerateSkip", default)]
    pub tolerate_skip: bool,
}

/// Instance information for listHosts response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub host: String,
    pub open_cursors: usize,
    pub exhausted_cursors: usize,
    pub cancelled_cursors: usize,
    pub remaining_steps: usize,
    pub requests_served: u64,
    pub violations: u64,
    pub connection_count: usize,
}

#[derive(Debug)]
struct InstanceState {
    ledger: CursorLedger,
    plan: VecDeque<PlanStep>,
    order_check: bool,
}

#[derive(Debug)]
pub struct MockServerInstance {
    /// Host identity (shard or replica member name)
    pub host: String,
    state: Mutex<InstanceState>,
    requests_served: AtomicU64,
    violations: AtomicU64,
    connection_count: AtomicUsize,
}

impl MockServerInstance {
    pub fn new(host: impl Into<String>, options: InstanceOptions) -> Self {
        Self {
            host: host.into(),
            state: Mutex::new(InstanceState {
                ledger: CursorLedger::new(options.match_mode),
                plan: VecDeque::new(),
                order_check: options.order_check,
            }),
            requests_served: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            connection_count: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InstanceState> {
        // A panicking test thread must not hide later protocol errors
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Scripting
    // ========================================================================

    /// Register a scripted history for `handle`.
    pub fn register(&self, handle: CursorHandle, steps: Vec<ScriptedStep>, kind: StreamKind) -> Result<()> {
        self.lock().ledger.register(handle, steps, kind)
    }

    /// Queue plan exchanges, served before any per-shard cursor.
    pub fn register_plan(&self, steps: Vec<PlanStep>) -> Result<()> {
        if steps.is_empty() {
            return Err(MockError::InvalidScript("empty plan history".to_string()));
        }
        if let Some(bad) = steps.iter().find(|s| !s.response.is_object()) {
            return Err(MockError::InvalidScript(format!("plan response must be a document: {}", bad.response)));
        }
        self.lock().plan.extend(steps);
        Ok(())
    }

    pub fn set_order_check(&self, enabled: bool) {
        self.lock().order_check = enabled;
    }

    // ========================================================================
    // Protocol
    // ========================================================================

    /// Process one protocol request.
    ///
    /// Control commands are not accepted here; they belong to the router.
    pub fn handle(&self, request: &Document) -> Result<WireEnvelope> {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        let result = Command::parse(request).and_then(|command| {
            let mut state = self.lock();
            match command {
                Command::Search(cmd) => self.initiate(&mut state, &cmd, request),
                Command::Continue(cmd) => {
                    let advanced = state.ledger.advance(cmd.cursor_id, request)?;
                    let ledger = &state.ledger;
                    ResponseBuilder::new(cmd.cursor_id, advanced.kind, &cmd.collection)
                        .build(&advanced.response, !advanced.exhausted, |h| ledger.is_live(h))
                }
                Command::Cancel(cmd) => {
                    let outcome = CancellationHandler::new(&mut state.ledger).cancel(&cmd.cursor_ids)?;
                    Ok(WireEnvelope::Killed {
                        cursors_killed: outcome.killed(),
                        ok: 1,
                    })
                }
                Command::PlanShardedSearch(_) => self.plan(&mut state, request),
                Command::Control(_) => Err(MockError::InvalidRequest(format!(
                    "control command sent as protocol traffic: {}",
                    request
                ))),
            }
        });

        if let Err(e) = &result {
            if e.is_protocol_failure()
                || matches!(e, MockError::UnexpectedCommand { .. } | MockError::InvalidScript(_))
            {
                self.violations.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(host = %self.host, code = e.code(), "{}", e);
            }
        }
        result
    }

    fn initiate(&self, state: &mut InstanceState, cmd: &SearchCommand, request: &Document) -> Result<WireEnvelope> {
        let fresh = state.ledger.fresh_handles();
        let oldest = *fresh.first().ok_or_else(|| self.unexpected(request))?;

        let handle = if state.order_check {
            oldest
        } else {
            let mut claimed = oldest;
            for candidate in &fresh {
                if state.ledger.match_front(*candidate, request)?.ok {
                    claimed = *candidate;
                    break;
                }
            }
            claimed
        };

        // Check before consuming so a bad script leaves the queue intact
        if cmd.is_explain() && state.ledger.match_front(handle, request)?.ok {
            let answers = state
                .ledger
                .entry(handle)
                .and_then(|e| e.steps().next())
                .map_or(false, |step| step.response.answers_explain());
            if !answers {
                return Err(MockError::InvalidScript(format!(
                    "explain request on cursor {} must be scripted with an explain response",
                    handle
                )));
            }
        }

        let advanced = state.ledger.advance(handle, request)?;
        if let Some(metadata) = advanced.response.metadata_handle() {
            tracing::debug!(host = %self.host, handle, metadata, "opened dual-stream query");
        }

        let ledger = &state.ledger;
        ResponseBuilder::new(handle, advanced.kind, &cmd.search)
            .explain(cmd.is_explain())
            .build(&advanced.response, !advanced.exhausted, |h| ledger.is_live(h))
    }

    fn plan(&self, state: &mut InstanceState, request: &Document) -> Result<WireEnvelope> {
        let step = state.plan.front().ok_or_else(|| self.unexpected(request))?;
        let result = match_command(request, &step.expected_request, state.ledger.match_mode());
        if !result.ok {
            return Err(MockError::PlanViolation { diff: result.describe() });
        }

        let step = state.plan.pop_front().ok_or_else(|| self.unexpected(request))?;
        let mut response = match step.response {
            Value::Object(map) => map,
            other => return Err(MockError::InvalidScript(format!("plan response must be a document: {}", other))),
        };
        response.entry("ok").or_insert_with(|| Value::from(1));
        tracing::debug!(host = %self.host, "served merge plan");
        Ok(WireEnvelope::Document(response))
    }

    fn unexpected(&self, request: &Document) -> MockError {
        MockError::UnexpectedCommand {
            host: self.host.clone(),
            request: request.to_string(),
        }
    }

    // ========================================================================
    // Inspection and teardown
    // ========================================================================

    /// Cursor and plan steps still queued, skip-tolerant ones included.
    pub fn queued_responses(&self) -> usize {
        let state = self.lock();
        state.ledger.queued_steps() + state.plan.len()
    }

    pub fn ledger_stats(&self) -> LedgerStats {
        self.lock().ledger.stats()
    }

    /// Run `f` with read access to the ledger.
    pub fn with_ledger<R>(&self, f: impl FnOnce(&CursorLedger) -> R) -> R {
        f(&self.lock().ledger)
    }

    /// Fail if any mandatory scripted step was never consumed.
    pub fn check_unused(&self) -> Result<()> {
        let state = self.lock();
        let mut problems: Vec<String> = state
            .ledger
            .unused_mandatory()
            .into_iter()
            .map(|(handle, n)| format!("cursor {} ({} step(s))", handle, n))
            .collect();
        let plan_left = state.plan.iter().filter(|s| !s.tolerate_skip).count();
        if plan_left > 0 {
            problems.push(format!("plan ({} step(s))", plan_left));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MockError::UnusedHistory(format!("host '{}': {}", self.host, problems.join(", "))))
        }
    }

    pub fn info(&self) -> InstanceInfo {
        let stats = self.ledger_stats();
        InstanceInfo {
            host: self.host.clone(),
            open_cursors: stats.open,
            exhausted_cursors: stats.exhausted,
            cancelled_cursors: stats.cancelled,
            remaining_steps: stats.remaining_steps,
            requests_served: self.requests_served.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
            connection_count: self.connection_count(),
        }
    }

    // ========================================================================
    // Connection tracking
    // ========================================================================

    pub fn add_connection(&self) {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove_connection(&self) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    pub fn is_in_use(&self) -> bool {
        self.connection_count() > 0
    }
}
