//! ResponseBuilder - scripted responses and the wire envelopes built from them
//!
//! The cursor id sent to the client is never taken from the script: it is the
//! ledger handle while steps remain and zero once the queue drained, so
//! exhaustion is always signalled structurally.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::deserialize_opt_handle;
use crate::error::{MockError, Result};
use crate::ledger::{CursorHandle, StreamKind, EXHAUSTED_CURSOR_ID};

/// Cursor section of a scripted response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedCursor {
    /// Ignored for the primary stream; names the metadata handle in dual replies
    #[serde(default, deserialize_with = "deserialize_opt_handle", skip_serializing_if = "Option::is_none")]
    pub id: Option<CursorHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ns: Option<String>,
    #[serde(default, alias = "firstBatch", alias = "nextBatch")]
    pub batch: Vec<Value>,
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<StreamKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedCursorReply {
    pub cursor: ScriptedCursor,
}

/// Response half of a scripted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptedResponse {
    /// Results stream plus metadata stream, in that order
    Cursors { cursors: Vec<ScriptedCursorReply> },
    Cursor { cursor: ScriptedCursor },
    Explain { explain: Value },
    /// Returned verbatim as a command failure
    Error {
        errmsg: String,
        #[serde(default)]
        code: i32,
    },
}

impl ScriptedResponse {
    /// Single-stream batch.
    pub fn batch(ns: &str, docs: Vec<Value>) -> Self {
        ScriptedResponse::Cursor {
            cursor: ScriptedCursor {
                id: None,
                ns: Some(ns.to_string()),
                batch: docs,
                kind: None,
            },
        }
    }

    /// Dual-stream reply announcing `metadata_handle` next to the results batch.
    pub fn dual(ns: &str, results: Vec<Value>, metadata_handle: CursorHandle, metadata: Vec<Value>) -> Self {
        ScriptedResponse::Cursors {
            cursors: vec![
                ScriptedCursorReply {
                    cursor: ScriptedCursor {
                        id: None,
                        ns: Some(ns.to_string()),
                        batch: results,
                        kind: Some(StreamKind::Results),
                    },
                },
                ScriptedCursorReply {
                    cursor: ScriptedCursor {
                        id: Some(metadata_handle),
                        ns: Some(ns.to_string()),
                        batch: metadata,
                        kind: Some(StreamKind::Metadata),
                    },
                },
            ],
        }
    }

    pub fn explain(explain: Value) -> Self {
        ScriptedResponse::Explain { explain }
    }

    /// Reject scripts the builder could not turn into a well-formed envelope.
    pub fn validate(&self) -> Result<()> {
        if let ScriptedResponse::Cursors { cursors } = self {
            if cursors.len() != 2 {
                return Err(MockError::InvalidScript(format!(
                    "dual-stream reply needs exactly 2 cursors, got {}",
                    cursors.len()
                )));
            }
            match cursors[1].cursor.id {
                Some(id) if id != EXHAUSTED_CURSOR_ID => {}
                _ => {
                    return Err(MockError::InvalidScript(
                        "metadata cursor of a dual-stream reply must name a nonzero handle".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Can be sent back for an explain request.
    pub fn answers_explain(&self) -> bool {
        matches!(self, ScriptedResponse::Explain { .. } | ScriptedResponse::Error { .. })
    }

    /// Handle of the metadata stream announced by this response, if any.
    pub fn metadata_handle(&self) -> Option<CursorHandle> {
        match self {
            ScriptedResponse::Cursors { cursors } => cursors.get(1).and_then(|c| c.cursor.id),
            _ => None,
        }
    }
}

/// Cursor section of a wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorBody {
    pub id: CursorHandle,
    pub ns: String,
    pub batch: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<StreamKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorReply {
    pub cursor: CursorBody,
    pub ok: i32,
}

/// Everything the mock sends back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WireEnvelope {
    Cursor {
        cursor: CursorBody,
        ok: i32,
    },
    Cursors {
        cursors: Vec<CursorReply>,
        ok: i32,
    },
    /// Explain replies carry no cursor field at all
    Explain {
        explain: Value,
        ok: i32,
    },
    Killed {
        #[serde(rename = "cursorsKilled")]
        cursors_killed: Vec<CursorHandle>,
        ok: i32,
    },
    /// Scripted command failure
    CommandFailed {
        ok: i32,
        errmsg: String,
        code: i32,
    },
    /// Mock-side error with a stable code
    Error {
        ok: i32,
        error: String,
        code: String,
    },
    /// Plan replies and control acknowledgements
    Document(Map<String, Value>),
}

impl WireEnvelope {
    pub fn error(err: &MockError) -> Self {
        WireEnvelope::Error {
            ok: 0,
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }

    /// `{ok: 1}` plus the given fields.
    pub fn ok_with(fields: Vec<(&str, Value)>) -> Self {
        let mut map = Map::new();
        for (k, v) in fields {
            map.insert(k.to_string(), v);
        }
        map.insert("ok".to_string(), Value::from(1));
        WireEnvelope::Document(map)
    }

    /// Primary cursor id, `None` for replies without a cursor.
    pub fn cursor_id(&self) -> Option<CursorHandle> {
        match self {
            WireEnvelope::Cursor { cursor, .. } => Some(cursor.id),
            WireEnvelope::Cursors { cursors, .. } => cursors.first().map(|c| c.cursor.id),
            _ => None,
        }
    }

    pub fn batch(&self) -> Option<&[Value]> {
        match self {
            WireEnvelope::Cursor { cursor, .. } => Some(&cursor.batch),
            WireEnvelope::Cursors { cursors, .. } => cursors.first().map(|c| c.cursor.batch.as_slice()),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self, WireEnvelope::Error { .. } | WireEnvelope::CommandFailed { .. })
    }

    pub fn to_document(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Builds the envelope for one consumed step.
pub struct ResponseBuilder<'a> {
    handle: CursorHandle,
    kind: StreamKind,
    default_ns: &'a str,
    explain: bool,
}

impl<'a> ResponseBuilder<'a> {
    pub fn new(handle: CursorHandle, kind: StreamKind, default_ns: &'a str) -> Self {
        Self { handle, kind, default_ns, explain: false }
    }

    /// Mark the request as explain-only: no cursor is created.
    pub fn explain(mut self, explain: bool) -> Self {
        self.explain = explain;
        self
    }

    /// Build the envelope.
    ///
    /// `remaining` tells whether the ledger entry still has steps after this
    /// one. `is_live` reports whether another handle on the same instance is
    /// open with steps left; it decides the metadata id of dual replies.
    pub fn build<F>(&self, response: &ScriptedResponse, remaining: bool, is_live: F) -> Result<WireEnvelope>
    where
        F: Fn(CursorHandle) -> bool,
    {
        match response {
            ScriptedResponse::Explain { explain } => Ok(WireEnvelope::Explain {
                explain: explain.clone(),
                ok: 1,
            }),
            ScriptedResponse::Error { errmsg, code } => Ok(WireEnvelope::CommandFailed {
                ok: 0,
                errmsg: errmsg.clone(),
                code: *code,
            }),
            _ if self.explain => Err(MockError::InvalidScript(format!(
                "explain request on cursor {} must be scripted with an explain response",
                self.handle
            ))),
            ScriptedResponse::Cursor { cursor } => Ok(WireEnvelope::Cursor {
                cursor: CursorBody {
                    id: self.primary_id(remaining),
                    ns: self.ns_of(cursor),
                    batch: cursor.batch.clone(),
                    kind: self.kind.tag(),
                },
                ok: 1,
            }),
            ScriptedResponse::Cursors { cursors } => {
                response.validate()?;
                let results = &cursors[0].cursor;
                let metadata = &cursors[1].cursor;
                let metadata_id = metadata
                    .id
                    .filter(|id| is_live(*id))
                    .unwrap_or(EXHAUSTED_CURSOR_ID);

                Ok(WireEnvelope::Cursors {
                    cursors: vec![
                        CursorReply {
                            cursor: CursorBody {
                                id: self.primary_id(remaining),
                                ns: self.ns_of(results),
                                batch: results.batch.clone(),
                                kind: Some(StreamKind::Results),
                            },
                            ok: 1,
                        },
                        CursorReply {
                            cursor: CursorBody {
                                id: metadata_id,
                                ns: self.ns_of(metadata),
                                batch: metadata.batch.clone(),
                                kind: Some(StreamKind::Metadata),
                            },
                            ok: 1,
                        },
                    ],
                    ok: 1,
                })
            }
        }
    }

    fn primary_id(&self, remaining: bool) -> CursorHandle {
        if remaining {
            self.handle
        } else {
            EXHAUSTED_CURSOR_ID
        }
    }

    fn ns_of(&self, cursor: &ScriptedCursor) -> String {
        cursor.ns.clone().unwrap_or_else(|| self.default_ns.to_string())
    }
}
