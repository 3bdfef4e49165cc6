//! Socket server for the mock search backend
//!
//! One task per connection. Each connection holds a `ClientSession`; control
//! commands administer hosts and scripts, protocol commands are routed to the
//! host the session is attached to.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

use crate::command::{Command, ControlCommand};
use crate::config::ServerConfig;
use crate::error::{MockError, Result};
use crate::instance::MockServerInstance;
use crate::matcher::Document;
use crate::response::WireEnvelope;
use crate::router::HostRouter;
use crate::session::ClientSession;
use crate::wire::{decode_request, encode_response, read_frame, write_frame};

// Global client ID counter
static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// Reply to one request, plus whether the client asked the server to stop.
#[derive(Debug)]
pub struct HandleOutcome {
    pub response: WireEnvelope,
    pub shutdown: bool,
}

impl HandleOutcome {
    fn reply(response: WireEnvelope) -> Self {
        Self { response, shutdown: false }
    }
}

fn attached(session: &ClientSession) -> Result<&Arc<MockServerInstance>> {
    session.current_host.as_ref().ok_or(MockError::NoHostAttached)
}

// ============================================================================
// Request Handler
// ============================================================================

/// Handle one decoded request for `session`.
pub fn handle_request(router: &HostRouter, session: &mut ClientSession, request: &Document) -> HandleOutcome {
    let command = match Command::parse(request) {
        Ok(command) => command,
        Err(e) => return HandleOutcome::reply(WireEnvelope::error(&e)),
    };
    tracing::debug!(client = session.id, host = ?session.current_host_name(), op = command.name(), "request");

    let shutdown = matches!(command, Command::Control(ControlCommand::Shutdown { .. }));
    let result = match command {
        Command::Control(control) => handle_control(router, session, control),
        _ => attached(session).and_then(|host| host.handle(request)),
    };

    HandleOutcome {
        response: result.unwrap_or_else(|e| WireEnvelope::error(&e)),
        shutdown,
    }
}

fn handle_control(router: &HostRouter, session: &mut ClientSession, command: ControlCommand) -> Result<WireEnvelope> {
    match command {
        ControlCommand::CreateHost { name } => {
            router.create_host(&name)?;
            Ok(WireEnvelope::ok_with(vec![("host", Value::from(name))]))
        }

        ControlCommand::DropHost { name } => {
            router.drop_host(&name)?;
            Ok(WireEnvelope::ok_with(vec![]))
        }

        ControlCommand::Attach { name } => {
            let host = router.get_host(&name)?;
            session.attach(host);
            Ok(WireEnvelope::ok_with(vec![("host", Value::from(name))]))
        }

        ControlCommand::Detach { .. } => {
            if !session.has_host() {
                return Err(MockError::NoHostAttached);
            }
            session.detach();
            Ok(WireEnvelope::ok_with(vec![]))
        }

        ControlCommand::ListHosts { .. } => {
            let hosts = serde_json::to_value(router.list_hosts())?;
            Ok(WireEnvelope::ok_with(vec![("hosts", hosts)]))
        }

        ControlCommand::SetMockResponses { cursor_id, history, kind, .. } => {
            attached(session)?.register(cursor_id, history, kind)?;
            Ok(WireEnvelope::ok_with(vec![]))
        }

        ControlCommand::SetPlanResponses { history, .. } => {
            attached(session)?.register_plan(history)?;
            Ok(WireEnvelope::ok_with(vec![]))
        }

        ControlCommand::GetQueuedResponses { .. } => {
            let remaining = attached(session)?.queued_responses();
            Ok(WireEnvelope::ok_with(vec![("numRemainingResponses", Value::from(remaining))]))
        }

        ControlCommand::SetOrderCheck { enabled } => {
            attached(session)?.set_order_check(enabled);
            Ok(WireEnvelope::ok_with(vec![]))
        }

        ControlCommand::CheckUnused { .. } => {
            attached(session)?.check_unused()?;
            Ok(WireEnvelope::ok_with(vec![]))
        }

        ControlCommand::Ping { .. } => Ok(WireEnvelope::ok_with(vec![
            ("pong", json!(true)),
            ("version", Value::from(env!("CARGO_PKG_VERSION"))),
        ])),

        ControlCommand::Shutdown { .. } => Ok(WireEnvelope::ok_with(vec![])),
    }
}

// ============================================================================
// Client Connection Handler
// ============================================================================

async fn handle_client(
    mut stream: UnixStream,
    router: Arc<HostRouter>,
    client_id: usize,
    max_frame_bytes: usize,
    shutdown: Arc<Notify>,
) {
    tracing::debug!(client = client_id, "client connected");
    let mut session = ClientSession::new(client_id);

    loop {
        let msg = match read_frame(&mut stream, max_frame_bytes).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                tracing::debug!(client = client_id, "client disconnected");
                break;
            }
            Err(e) => {
                tracing::warn!(client = client_id, "read error: {}", e);
                break;
            }
        };

        let (request_id, outcome) = match decode_request(&msg) {
            Ok((request_id, request)) => (request_id, handle_request(&router, &mut session, &request)),
            Err(e) => (None, HandleOutcome::reply(WireEnvelope::error(&e))),
        };

        let resp_bytes = match encode_response(request_id.as_deref(), &outcome.response) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(client = client_id, "serialize error: {}", e);
                continue;
            }
        };

        if let Err(e) = write_frame(&mut stream, &resp_bytes).await {
            tracing::warn!(client = client_id, "write error: {}", e);
            break;
        }

        if outcome.shutdown {
            tracing::info!(client = client_id, "shutdown requested");
            shutdown.notify_one();
            break;
        }
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct MockServer {
    router: Arc<HostRouter>,
    socket_path: PathBuf,
    max_frame_bytes: usize,
    shutdown: Arc<Notify>,
}

impl MockServer {
    /// Build the router and pre-create the configured hosts.
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let router = Arc::new(HostRouter::new(config.instance_options()));
        for host in &config.hosts {
            router.create_host(host)?;
        }
        Ok(Self {
            router,
            socket_path: config.socket_path.clone(),
            max_frame_bytes: config.max_frame_bytes,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn router(&self) -> Arc<HostRouter> {
        Arc::clone(&self.router)
    }

    /// Notified to stop `serve`; a stored permit survives until it is awaited.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Bind the socket and accept connections until shutdown.
    pub async fn serve(&self) -> Result<()> {
        // Remove stale socket file
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!(socket = %self.socket_path.display(), "listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(handle_client(
                            stream,
                            Arc::clone(&self.router),
                            client_id,
                            self.max_frame_bytes,
                            Arc::clone(&self.shutdown),
                        ));
                    }
                    Err(e) => tracing::warn!("accept error: {}", e),
                },
                _ = self.shutdown.notified() => break,
            }
        }

        for problem in self.router.check_all_unused() {
            tracing::warn!("{}", problem);
        }
        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!("server stopped");
        Ok(())
    }
}
