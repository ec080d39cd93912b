use crate::bridge::{CommandKind, ProcessBridge, split_command};
use crate::config::{PtyConfig, ServerConfig};
use crate::error::{ApiError, ErrorCode, RelayResult};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::pty::{PtyEvent, PtySession, PtyStartOptions};
use crate::session::SessionRegistry;
use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub type ConnectionId = u64;

struct PtySlot {
    session: Arc<PtySession>,
    forwarder: JoinHandle<()>,
}

struct Connection {
    peer: String,
    session_id: Option<String>,
    pty: Option<PtySlot>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    // Last queued command; the next one waits for it so results arrive in order.
    command_tail: Option<JoinHandle<()>>,
}

pub struct Coordinator {
    bridge: Arc<ProcessBridge>,
    registry: Arc<SessionRegistry>,
    pty_config: PtyConfig,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    next_connection_id: AtomicU64,
}

impl Coordinator {
    pub fn new(
        bridge: Arc<ProcessBridge>,
        registry: Arc<SessionRegistry>,
        pty_config: PtyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            registry,
            pty_config,
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn bridge(&self) -> &Arc<ProcessBridge> {
        &self.bridge
    }

    pub fn connect(&self, peer: &str) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ServerMessage::Status {
            status: "connected".to_string(),
            message: "Connected to ptyrelay".to_string(),
        });
        self.lock_connections().insert(
            id,
            Connection {
                peer: peer.to_string(),
                session_id: None,
                pty: None,
                outbound: tx,
                command_tail: None,
            },
        );
        tracing::info!(connection_id = id, peer = %peer, "Client connected");
        (id, rx)
    }

    pub fn disconnect(&self, id: ConnectionId) {
        let Some(mut connection) = self.lock_connections().remove(&id) else {
            return;
        };
        if let Some(slot) = connection.pty.take() {
            stop_pty(slot);
        }
        tracing::info!(
            connection_id = id,
            peer = %connection.peer,
            session_id = ?connection.session_id,
            "Client disconnected"
        );
    }

    pub fn shutdown(&self) {
        let connections: Vec<Connection> = self.lock_connections().drain().map(|(_, c)| c).collect();
        let count = connections.len();
        for mut connection in connections {
            if let Some(slot) = connection.pty.take() {
                stop_pty(slot);
            }
        }
        tracing::info!(connections = count, "Coordinator shut down");
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    pub fn bound_session(&self, id: ConnectionId) -> Option<String> {
        self.lock_connections()
            .get(&id)
            .and_then(|connection| connection.session_id.clone())
    }

    pub fn pty_session(&self, id: ConnectionId) -> Option<Arc<PtySession>> {
        self.lock_connections()
            .get(&id)
            .and_then(|connection| connection.pty.as_ref())
            .map(|slot| slot.session.clone())
    }

    pub async fn handle_text(self: &Arc<Self>, id: ConnectionId, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_message(id, message).await,
            Err(err) => {
                tracing::warn!(connection_id = id, error = %err, "Invalid message");
                self.send(id, ServerMessage::error(&err));
            }
        }
    }

    pub async fn handle_message(self: &Arc<Self>, id: ConnectionId, message: ClientMessage) {
        tracing::debug!(connection_id = id, kind = message.kind(), "Inbound message");
        match message {
            ClientMessage::InitSession { session_id } => self.init_session(id, session_id).await,
            ClientMessage::RequestWelcome => {
                let cwd = self.bridge.current_dir_display();
                self.send(
                    id,
                    ServerMessage::Welcome {
                        message: welcome_message(&cwd),
                    },
                );
            }
            ClientMessage::RequestFiles { prefix } => self.request_files(id, prefix).await,
            ClientMessage::Command { command, use_pty } => {
                self.enqueue_command(id, command, use_pty)
            }
            ClientMessage::PtyInput { data } => self.pty_input(id, &data).await,
            ClientMessage::PtyResize { cols, rows } => self.pty_resize(id, cols, rows),
            ClientMessage::Ping => self.send(id, ServerMessage::Pong {}),
        }
    }

    async fn init_session(&self, id: ConnectionId, session_id: String) {
        if session_id.trim().is_empty() {
            let err = ApiError::new(ErrorCode::MalformedMessage, "Invalid message")
                .with_details("sessionId must not be empty");
            self.send(id, ServerMessage::error(&err.into()));
            return;
        }
        {
            let mut connections = self.lock_connections();
            let Some(connection) = connections.get_mut(&id) else {
                return;
            };
            connection.session_id = Some(session_id.clone());
        }

        let session = self.registry.get_or_create(&session_id).await;
        let history = session.contents();
        if history.trim().is_empty() {
            tracing::info!(connection_id = id, session_id = %session_id, "Starting new session");
            self.send(id, ServerMessage::NewSession {});
        } else {
            tracing::info!(
                connection_id = id,
                session_id = %session_id,
                chunks = session.chunk_count(),
                chars = history.len(),
                "Restoring terminal history"
            );
            self.send(id, ServerMessage::RestoreBuffer { data: history });
        }
        self.send(id, ServerMessage::SessionReady { session_id });
    }

    async fn request_files(&self, id: ConnectionId, prefix: String) {
        let files = match self.bridge.complete_files(&prefix).await {
            Ok(files) => files,
            Err(err) => {
                tracing::warn!(connection_id = id, error = %err, "File completion failed");
                Vec::new()
            }
        };
        self.send(id, ServerMessage::FileCompletion { prefix, files });
    }

    fn enqueue_command(self: &Arc<Self>, id: ConnectionId, command: String, use_pty: bool) {
        if command.trim().is_empty() {
            return;
        }
        let previous = {
            let mut connections = self.lock_connections();
            let Some(connection) = connections.get_mut(&id) else {
                return;
            };
            connection.command_tail.take()
        };
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            coordinator.run_command(id, command.trim(), use_pty).await;
        });
        if let Some(connection) = self.lock_connections().get_mut(&id) {
            connection.command_tail = Some(handle);
        }
    }

    async fn run_command(self: &Arc<Self>, id: ConnectionId, line: &str, use_pty: bool) {
        tracing::info!(connection_id = id, command = %line, use_pty, "Received command");
        if use_pty && self.bridge.classify(line) == CommandKind::Interactive {
            self.start_pty(id, line);
        } else {
            self.run_direct(id, line).await;
        }
    }

    async fn run_direct(&self, id: ConnectionId, line: &str) {
        match self.bridge.execute(line).await {
            Ok(output) => {
                if let Some(session_id) = self.bound_session(id) {
                    if !output.stdout.is_empty() {
                        self.registry.append(&session_id, &output.stdout).await;
                    }
                    if !output.stderr.is_empty() {
                        self.registry.append(&session_id, &output.stderr).await;
                    }
                    self.registry
                        .append(&session_id, &format!("\r\n{}", prompt(&output.cwd)))
                        .await;
                }
                self.send(
                    id,
                    ServerMessage::Output {
                        data: output.stdout,
                        error: output.stderr,
                        exit_code: output.exit_code,
                        cwd: output.cwd,
                    },
                );
            }
            Err(err) => {
                tracing::warn!(connection_id = id, command = %line, error = %err, "Command failed");
                self.send(id, ServerMessage::error(&err));
            }
        }
    }

    fn start_pty(self: &Arc<Self>, id: ConnectionId, line: &str) {
        let previous = self
            .lock_connections()
            .get_mut(&id)
            .and_then(|connection| connection.pty.take());
        if let Some(slot) = previous {
            stop_pty(slot);
        }
        let Some((program, args)) = split_command(line) else {
            return;
        };

        let pty_id = format!("pty-{}", Uuid::new_v4());
        let session = Arc::new(PtySession::new(pty_id.clone()));
        let options = PtyStartOptions::from_config(&self.pty_config, &self.bridge.current_dir());
        let events = match session.start(&program, &args, options) {
            Ok(events) => events,
            Err(err) => {
                tracing::error!(connection_id = id, command = %line, error = %err, "Failed to start PTY");
                self.send(id, ServerMessage::error(&err));
                return;
            }
        };

        let mut connections = self.lock_connections();
        let Some(connection) = connections.get_mut(&id) else {
            drop(connections);
            session.kill(None);
            return;
        };
        // Queue pty-started before the forwarder can emit any pty-output.
        let _ = connection.outbound.send(ServerMessage::PtyStarted {
            session_id: pty_id.clone(),
        });
        let forwarder = tokio::spawn(Arc::clone(self).forward_pty_events(id, pty_id, events));
        connection.pty = Some(PtySlot { session, forwarder });
    }

    async fn forward_pty_events(
        self: Arc<Self>,
        id: ConnectionId,
        pty_id: String,
        mut events: mpsc::UnboundedReceiver<PtyEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Output(data) => {
                    if let Some(session_id) = self.bound_session(id) {
                        self.registry.append(&session_id, &data).await;
                    }
                    self.send(id, ServerMessage::PtyOutput { data });
                }
                PtyEvent::Exit { exit_code, signal } => {
                    let finished = {
                        let mut connections = self.lock_connections();
                        match connections.get_mut(&id) {
                            Some(connection)
                                if connection
                                    .pty
                                    .as_ref()
                                    .is_some_and(|slot| slot.session.id() == pty_id) =>
                            {
                                connection.pty.take()
                            }
                            _ => None,
                        }
                    };
                    // Dropping our own slot only detaches this task's handle.
                    drop(finished);
                    tracing::info!(connection_id = id, pty_id = %pty_id, exit_code, "PTY exited");
                    self.send(id, ServerMessage::PtyExit { exit_code, signal });
                    break;
                }
            }
        }
    }

    async fn pty_input(&self, id: ConnectionId, data: &str) {
        let Some(session) = self.pty_session(id) else {
            return;
        };
        if let Err(err) = session.write(data.as_bytes()).await {
            tracing::warn!(connection_id = id, pty_id = %session.id(), error = %err, "PTY write failed");
        }
    }

    fn pty_resize(&self, id: ConnectionId, cols: u16, rows: u16) {
        let Some(session) = self.pty_session(id) else {
            return;
        };
        if let Err(err) = session.resize(cols, rows) {
            tracing::warn!(connection_id = id, pty_id = %session.id(), error = %err, "PTY resize failed");
        }
    }

    fn send(&self, id: ConnectionId, message: ServerMessage) {
        if let Some(connection) = self.lock_connections().get(&id) {
            let _ = connection.outbound.send(message);
        }
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections.lock().expect("connection table mutex poisoned")
    }
}

fn stop_pty(slot: PtySlot) {
    slot.forwarder.abort();
    slot.session.kill(None);
}

pub fn prompt(cwd: &str) -> String {
    format!("\x1b[1;36m{cwd}\x1b[0m \x1b[1;32m➜\x1b[0m ")
}

pub fn welcome_message(cwd: &str) -> String {
    format!(
        "\x1b[32m✔ Connected to ptyrelay\x1b[0m\r\n\r\n\x1b[90mType a command to get started\x1b[0m\r\n\r\n{}",
        prompt(cwd)
    )
}

pub fn router(coordinator: Arc<Coordinator>, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(websocket_handler))
        .with_state(coordinator)
}

pub async fn serve(
    coordinator: Arc<Coordinator>,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> RelayResult<()> {
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to bind listener")
                .with_details(format!("{}: {}", config.listen, err))
        })?;
    let local_addr = listener.local_addr()?;
    tracing::info!(listen = %local_addr, path = %config.ws_path, "WebSocket relay listening");

    let app = router(coordinator.clone(), &config.ws_path);
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;
    coordinator.shutdown();
    result.map_err(|err| {
        ApiError::new(ErrorCode::IoError, "HTTP server failed")
            .with_details(err.to_string())
            .into()
    })
}

async fn websocket_handler(
    State(coordinator): State<Arc<Coordinator>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, coordinator, peer))
}

async fn handle_socket(socket: WebSocket, coordinator: Arc<Coordinator>, peer: SocketAddr) {
    let (id, mut outbound) = coordinator.connect(&peer.to_string());
    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(connection_id = id, error = %err, "Failed to encode message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => coordinator.handle_text(id, &text).await,
            Ok(Message::Binary(bytes)) => {
                coordinator
                    .handle_text(id, &String::from_utf8_lossy(&bytes))
                    .await
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(connection_id = id, error = %err, "WebSocket error");
                break;
            }
        }
    }

    coordinator.disconnect(id);
    writer.abort();
}
