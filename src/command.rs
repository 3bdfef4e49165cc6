//! Command model - the closed set of requests the mock understands
//!
//! Requests arrive as generic documents. Matching is always done on the raw
//! document; the typed `Command` only decides where a request is routed.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{MockError, Result};
use crate::ledger::{CursorHandle, ScriptedStep, StreamKind};
use crate::matcher::Document;
use crate::instance::PlanStep;

/// Discriminator of a request document, decided by key presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Search,
    Continue,
    Cancel,
    PlanShardedSearch,
    Control,
}

impl CommandKind {
    /// Classify a document without fully parsing it.
    pub fn of(doc: &Document) -> Option<CommandKind> {
        let map = doc.as_object()?;
        if map.contains_key("search") {
            Some(CommandKind::Search)
        } else if map.contains_key("continue") {
            Some(CommandKind::Continue)
        } else if map.contains_key("cancel") {
            Some(CommandKind::Cancel)
        } else if map.contains_key("planShardedSearch") {
            Some(CommandKind::PlanShardedSearch)
        } else {
            Some(CommandKind::Control)
        }
    }
}

/// Explain options on an initiating query
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExplainOptions {
    #[serde(default)]
    pub verbosity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CursorOptions {
    #[serde(rename = "batchSize", default)]
    pub batch_size: Option<u64>,
}

/// Initiating query: opens one (or, for dual-stream queries, two) cursors.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchCommand {
    /// Target collection name
    pub search: String,
    #[serde(rename = "collectionUUID", default)]
    pub collection_uuid: Option<String>,
    pub query: Value,
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: Option<u32>,
    /// Materialize stored documents instead of returning matched ids only
    #[serde(rename = "returnStoredSource", default)]
    pub return_stored_source: bool,
    #[serde(default)]
    pub explain: Option<ExplainOptions>,
    /// Merging pipeline the caller intends to apply to metadata
    #[serde(rename = "metadataMergeHint", default)]
    pub metadata_merge_hint: Option<Value>,
    #[serde(rename = "cursorOptions", default)]
    pub cursor_options: Option<CursorOptions>,
}

impl SearchCommand {
    pub fn is_explain(&self) -> bool {
        self.explain.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContinueCommand {
    #[serde(rename = "continue", deserialize_with = "deserialize_handle")]
    pub cursor_id: CursorHandle,
    pub collection: String,
    #[serde(rename = "cursorOptions", default)]
    pub cursor_options: Option<CursorOptions>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CancelCommand {
    #[serde(rename = "cancel", deserialize_with = "deserialize_handles")]
    pub cursor_ids: Vec<CursorHandle>,
    #[serde(default)]
    pub collection: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlanCommand {
    #[serde(rename = "planShardedSearch")]
    pub collection: String,
    #[serde(default)]
    pub query: Value,
}

/// Test-harness administration commands.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ControlCommand {
    CreateHost {
        #[serde(rename = "createHost")]
        name: String,
    },
    DropHost {
        #[serde(rename = "dropHost")]
        name: String,
    },
    Attach {
        #[serde(rename = "attach")]
        name: String,
    },
    Detach {
        #[serde(rename = "detach")]
        _flag: Value,
    },
    ListHosts {
        #[serde(rename = "listHosts")]
        _flag: Value,
    },
    SetMockResponses {
        #[serde(rename = "setMockResponses")]
        _flag: Value,
        #[serde(rename = "cursorId", deserialize_with = "deserialize_handle")]
        cursor_id: CursorHandle,
        history: Vec<ScriptedStep>,
        #[serde(default)]
        kind: StreamKind,
    },
    SetPlanResponses {
        #[serde(rename = "setPlanResponses")]
        _flag: Value,
        history: Vec<PlanStep>,
    },
    GetQueuedResponses {
        #[serde(rename = "getQueuedResponses")]
        _flag: Value,
    },
    SetOrderCheck {
        #[serde(rename = "setOrderCheck")]
        enabled: bool,
    },
    CheckUnused {
        #[serde(rename = "checkUnused")]
        _flag: Value,
    },
    Ping {
        #[serde(rename = "ping")]
        _flag: Value,
    },
    Shutdown {
        #[serde(rename = "shutdown")]
        _flag: Value,
    },
}

/// Any request the mock accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Search(SearchCommand),
    Continue(ContinueCommand),
    Cancel(CancelCommand),
    PlanShardedSearch(PlanCommand),
    Control(ControlCommand),
}

impl Command {
    /// Parse a request document into a typed command.
    pub fn parse(doc: &Document) -> Result<Command> {
        let kind = CommandKind::of(doc)
            .ok_or_else(|| MockError::InvalidRequest(format!("request is not a document: {}", doc)))?;

        let parsed = match kind {
            CommandKind::Search => SearchCommand::deserialize(doc).map(Command::Search),
            CommandKind::Continue => ContinueCommand::deserialize(doc).map(Command::Continue),
            CommandKind::Cancel => CancelCommand::deserialize(doc).map(Command::Cancel),
            CommandKind::PlanShardedSearch => PlanCommand::deserialize(doc).map(Command::PlanShardedSearch),
            CommandKind::Control => ControlCommand::deserialize(doc).map(Command::Control),
        };

        parsed.map_err(|e| MockError::InvalidRequest(format!("{} in {}", e, doc)))
    }

    /// Operation name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Search(cmd) if cmd.is_explain() => "search(explain)",
            Command::Search(_) => "search",
            Command::Continue(_) => "continue",
            Command::Cancel(_) => "cancel",
            Command::PlanShardedSearch(_) => "planShardedSearch",
            Command::Control(ControlCommand::CreateHost { .. }) => "createHost",
            Command::Control(ControlCommand::DropHost { .. }) => "dropHost",
            Command::Control(ControlCommand::Attach { .. }) => "attach",
            Command::Control(ControlCommand::Detach { .. }) => "detach",
            Command::Control(ControlCommand::ListHosts { .. }) => "listHosts",
            Command::Control(ControlCommand::SetMockResponses { .. }) => "setMockResponses",
            Command::Control(ControlCommand::SetPlanResponses { .. }) => "setPlanResponses",
            Command::Control(ControlCommand::GetQueuedResponses { .. }) => "getQueuedResponses",
            Command::Control(ControlCommand::SetOrderCheck { .. }) => "setOrderCheck",
            Command::Control(ControlCommand::CheckUnused { .. }) => "checkUnused",
            Command::Control(ControlCommand::Ping { .. }) => "ping",
            Command::Control(ControlCommand::Shutdown { .. }) => "shutdown",
        }
    }
}

/// True if `doc` is a cancellation whose handle list names `handle`.
pub fn cancels_handle(doc: &Document, handle: CursorHandle) -> bool {
    doc.get("cancel")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().any(|v| handle_from_value(v) == Some(handle)))
        .unwrap_or(false)
}

/// Accept any non-negative integral number as a handle.
pub fn handle_from_value(v: &Value) -> Option<CursorHandle> {
    let n = match v {
        Value::Number(n) => n,
        _ => return None,
    };
    if let Some(u) = n.as_u64() {
        return Some(u);
    }
    let f = n.as_f64()?;
    if f >= 0.0 && f.fract() == 0.0 && f < u64::MAX as f64 {
        Some(f as u64)
    } else {
        None
    }
}

pub(crate) fn deserialize_handle<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<CursorHandle, D::Error> {
    let v = Value::deserialize(d)?;
    handle_from_value(&v).ok_or_else(|| de::Error::custom(format!("invalid cursor handle: {}", v)))
}

pub(crate) fn deserialize_opt_handle<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<CursorHandle>, D::Error> {
    deserialize_handle(d).map(Some)
}

fn deserialize_handles<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<CursorHandle>, D::Error> {
    let values = Vec::<Value>::deserialize(d)?;
    values
        .iter()
        .map(|v| handle_from_value(v).ok_or_else(|| de::Error::custom(format!("invalid cursor handle: {}", v))))
        .collect()
}
