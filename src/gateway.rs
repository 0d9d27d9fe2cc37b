//! Per-connection lifecycle: authenticate, resolve, admit, dial, splice.
//!
//! This is the only place that issues WebSocket close codes. Failures before
//! the splice starts are preceded by a best-effort `{"type":"error",..}` text
//! frame so the SDK can show a reason; once bytes are flowing only the close
//! code is emitted.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::dial;
use crate::errors::GatewayError;
use crate::models::{error_text, Protocol, SpiceRendering};
use crate::ocloud::ManagementApi;
use crate::registry::{ConnectionRecord, ConnectionRegistry};
use crate::resolver::TargetResolver;
use crate::session::SessionStore;
use crate::splice;
use crate::token::TokenService;

/// Everything a request handler needs, constructed once at startup.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub resolver: Arc<TargetResolver>,
    pub tokens: Arc<TokenService>,
    pub api: Arc<dyn ManagementApi>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, api: Arc<dyn ManagementApi>) -> Self {
        let sessions = Arc::new(SessionStore::new());
        let registry = Arc::new(ConnectionRegistry::new(
            config.global_max,
            config.per_vm_max,
        ));
        let resolver = Arc::new(TargetResolver::new(api.clone(), sessions.clone()));
        let tokens = Arc::new(TokenService::new(config.token_secret.as_bytes()));
        Self {
            config: Arc::new(config),
            sessions,
            registry,
            resolver,
            tokens,
            api,
        }
    }
}

fn close_reason(code: u16) -> &'static str {
    match code {
        close_code::POLICY => "policy violation",
        close_code::PROTOCOL => "protocol error",
        _ => "internal error",
    }
}

/// Best-effort error frame followed by the close code for `err`.
pub async fn refuse(socket: &mut WebSocket, err: &GatewayError) {
    if err.is_auth_shaped() {
        info!(error = %err, "refusing connection");
    } else {
        warn!(error = %err, "refusing connection");
    }
    let _ = socket
        .send(Message::Text(error_text(&err.to_string()).into()))
        .await;
    let code = err.close_code();
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: close_reason(code).into(),
        })))
        .await;
}

enum DialOutcome {
    Connected(TcpStream, Vec<Message>),
    ClientGone,
    Failed(GatewayError),
}

fn payload_len(msg: &Message) -> usize {
    match msg {
        Message::Binary(data) => data.len(),
        Message::Text(text) => text.len(),
        _ => 0,
    }
}

/// Dial the upstream while capturing inbound frames.
///
/// SPICE clients start their handshake the instant the WebSocket opens, well
/// before the upstream TCP exists. Frames received here are kept in arrival
/// order and handed to the splice, which writes them out before anything
/// else. Closing or erroring clients abandon the dial; the buffer is bounded
/// by `buffer_max_size`.
async fn dial_buffered(
    config: &GatewayConfig,
    socket: &mut WebSocket,
    addr: &str,
) -> DialOutcome {
    let dial = dial::connect(addr, config);
    tokio::pin!(dial);
    let mut buffered: Vec<Message> = Vec::new();
    let mut buffered_bytes = 0usize;

    loop {
        tokio::select! {
            result = &mut dial => {
                return match result {
                    Ok(stream) => DialOutcome::Connected(stream, buffered),
                    Err(e) => DialOutcome::Failed(e),
                };
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None => return DialOutcome::ClientGone,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(msg)) => {
                    buffered_bytes += payload_len(&msg);
                    if buffered_bytes > config.buffer_max_size {
                        return DialOutcome::Failed(GatewayError::BufferOverflow);
                    }
                    buffered.push(msg);
                }
                Some(Err(e)) => {
                    debug!(error = %e, "client went away during dial");
                    return DialOutcome::ClientGone;
                }
            }
        }
    }
}

/// Run one proxied session from upgrade to teardown.
pub async fn handle_connection(
    state: GatewayState,
    mut socket: WebSocket,
    protocol: Protocol,
    vm_id: String,
    bearer: Option<String>,
    client: Option<SocketAddr>,
) {
    if vm_id.trim().is_empty() {
        refuse(
            &mut socket,
            &GatewayError::InvalidPath("missing vm id".into()),
        )
        .await;
        return;
    }

    let Some(bearer) = bearer else {
        refuse(&mut socket, &GatewayError::MissingToken).await;
        return;
    };

    let grant = match state.tokens.verify(&bearer) {
        Ok(grant) => grant,
        Err(e) => {
            refuse(&mut socket, &e).await;
            return;
        }
    };

    let target = match state
        .resolver
        .resolve(&grant, &vm_id, protocol, &SpiceRendering::default())
        .await
    {
        Ok(target) => target,
        Err(e) => {
            refuse(&mut socket, &e).await;
            return;
        }
    };

    let connection_id = match state.registry.admit(&vm_id) {
        Ok(id) => id,
        Err(e) => {
            refuse(&mut socket, &e).await;
            return;
        }
    };

    let addr = format!("{}:{}", target.host, target.port);
    match dial_buffered(&state.config, &mut socket, &addr).await {
        DialOutcome::Connected(stream, buffered) => {
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let record = Arc::new(ConnectionRecord::new(
                connection_id,
                vm_id.clone(),
                protocol,
                addr,
                client,
                control_tx,
            ));
            state.registry.register(record.clone());
            info!(
                connection = %record.id,
                vm = %vm_id,
                %protocol,
                upstream = %record.upstream,
                "session established"
            );
            splice::run(
                socket,
                stream,
                buffered,
                record,
                control_rx,
                state.registry.clone(),
                state.config.text_passthrough,
            )
            .await;
        }
        DialOutcome::ClientGone => {
            debug!(vm = %vm_id, "client closed before upstream was ready");
            state.registry.unregister(&vm_id, &connection_id);
        }
        DialOutcome::Failed(err) => {
            state.registry.unregister(&vm_id, &connection_id);
            refuse(&mut socket, &err).await;
        }
    }
}

/// Graceful teardown: notify every active session, drop login state, then
/// wait out the grace period for the splices to drain.
pub async fn shutdown(state: &GatewayState) {
    let active = state.registry.total();
    info!(active, "shutting down, closing active sessions");
    state.registry.close_all(close_code::AWAY, "server shutting down");
    state.sessions.clear();

    let deadline = tokio::time::Instant::now() + state.config.shutdown_grace;
    while state.registry.total() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                remaining = state.registry.total(),
                "shutdown grace period expired"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
