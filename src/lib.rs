//! search-mock - scripted mock of a cursor-oriented remote search backend
//!
//! Tests register, per host and per cursor handle, an ordered history of
//! expected requests and scripted responses. The mock replays those
//! histories over a Unix socket and fails loudly on any deviation:
//! mismatched requests, unknown or dead cursors, premature cancellations and
//! unconsumed steps at teardown.

pub mod cancel;
pub mod command;
pub mod config;
pub mod error;
pub mod instance;
pub mod ledger;
pub mod matcher;
pub mod response;
pub mod router;
pub mod server;
pub mod session;
pub mod wire;

pub use cancel::{CancelOutcome, CancellationHandler};
pub use command::{Command, CommandKind, ControlCommand};
pub use config::ServerConfig;
pub use error::{DeadReason, MockError, Result};
pub use instance::{InstanceInfo, InstanceOptions, MockServerInstance, PlanStep};
pub use ledger::{CursorHandle, CursorLedger, CursorState, ScriptedStep, StreamKind, EXHAUSTED_CURSOR_ID};
pub use matcher::{match_command, Document, MatchMode, MatchResult};
pub use response::{ResponseBuilder, ScriptedResponse, WireEnvelope};
pub use router::HostRouter;
pub use server::{handle_request, HandleOutcome, MockServer};
pub use session::ClientSession;
