//! WebSocket server for the marketplace gateway.
//!
//! tokio-tungstenite server with one task per client. Each client has an
//! unbounded outbox channel; the client task multiplexes outgoing frames,
//! incoming events, and shutdown with `select!`. Frames planned by the
//! handlers are routed here by session binding.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use mandi_common::Role;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::events::{ClientEvent, ServerEvent};
use super::handlers::{ClientBinding, Dispatcher, Outbound, Target};
use super::SharedCoreServices;
use crate::error::ErrorKind;

/// Configuration for the gateway server.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Port to listen on.
    pub port: u16,
    /// Maximum number of concurrent clients.
    pub max_clients: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            max_clients: 200,
        }
    }
}

/// Unique client ID.
type ClientId = u64;

/// Handle for a connected client.
struct ClientHandle {
    tx: mpsc::UnboundedSender<Message>,
}

/// Which connections participate in a session.
#[derive(Debug, Default, Clone)]
struct SessionMembers {
    vendor: Option<ClientId>,
    customer: Option<ClientId>,
}

/// Connection registry: outbox channels, session bindings, and session
/// membership for routing.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: DashMap<ClientId, ClientHandle>,
    bindings: DashMap<ClientId, ClientBinding>,
    members: DashMap<String, SessionMembers>,
}

impl ConnectionRegistry {
    fn register(&self, client_id: ClientId, tx: mpsc::UnboundedSender<Message>) {
        self.clients.insert(client_id, ClientHandle { tx });
    }

    fn bind(&self, client_id: ClientId, binding: ClientBinding) {
        let mut members = self.members.entry(binding.session.clone()).or_default();
        match binding.role {
            Role::Vendor => members.vendor = Some(client_id),
            Role::Customer => members.customer = Some(client_id),
        }
        drop(members);
        self.bindings.insert(client_id, binding);
    }

    fn binding(&self, client_id: ClientId) -> Option<ClientBinding> {
        self.bindings.get(&client_id).map(|b| b.clone())
    }

    fn unregister(&self, client_id: ClientId) -> Option<ClientBinding> {
        self.clients.remove(&client_id);
        let binding = self.bindings.remove(&client_id).map(|(_, b)| b)?;
        if let Some(mut members) = self.members.get_mut(&binding.session) {
            match binding.role {
                Role::Vendor => members.vendor = None,
                Role::Customer => members.customer = None,
            }
        }
        Some(binding)
    }

    fn send_to(&self, client_id: ClientId, frame: &Message) {
        if let Some(client) = self.clients.get(&client_id) {
            if client.tx.send(frame.clone()).is_err() {
                debug!(client_id, "Outbox closed, frame dropped");
            }
        }
    }

    /// Deliver one planned frame relative to the requesting client.
    fn deliver(&self, requester: ClientId, session: &str, outbound: &Outbound) {
        let frame = match serde_json::to_string(&outbound.event) {
            Ok(json) => Message::Text(json),
            Err(e) => {
                error!(error = %e, "Failed to serialize server event");
                return;
            }
        };
        let members = self
            .members
            .get(session)
            .map(|m| m.clone())
            .unwrap_or_default();

        match outbound.to {
            Target::Requester => self.send_to(requester, &frame),
            Target::Vendor => {
                if let Some(id) = members.vendor {
                    self.send_to(id, &frame);
                }
            }
            Target::Customer => {
                if let Some(id) = members.customer {
                    self.send_to(id, &frame);
                }
            }
            Target::Both => {
                for id in [members.vendor, members.customer].into_iter().flatten() {
                    self.send_to(id, &frame);
                }
            }
        }
    }
}

/// The gateway server.
pub struct GatewayServer {
    config: GatewayConfig,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
    active_connections: AtomicU64,
    next_client_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, services: SharedCoreServices) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            dispatcher: Arc::new(Dispatcher::new(services)),
            registry: Arc::new(ConnectionRegistry::default()),
            active_connections: AtomicU64::new(0),
            next_client_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Get the shutdown sender for triggering graceful shutdown.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the server. Blocks until shutdown is triggered.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(port = self.config.port, "Gateway WebSocket server started");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            Arc::clone(&self).handle_new_connection(stream, addr).await;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Gateway server shutting down");
                    break;
                }
            }
        }

        for entry in self.registry.clients.iter() {
            let _ = entry.value().tx.send(Message::Close(None));
        }
        info!("Gateway server stopped");
        Ok(())
    }

    async fn handle_new_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let current = self.active_connections.load(Ordering::Relaxed);
        if current >= self.config.max_clients as u64 {
            warn!(%addr, current, max = self.config.max_clients, "Rejecting connection: max clients reached");
            return;
        }

        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%addr, error = %e, "WebSocket handshake failed");
                return;
            }
        };

        self.active_connections.fetch_add(1, Ordering::Relaxed);
        info!(client_id, %addr, "Client connected");

        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        self.registry.register(client_id, tx);

        tokio::spawn(async move {
            self.client_task(client_id, ws_stream, rx).await;
        });
    }

    /// Task that owns a single client's socket.
    async fn client_task(
        self: Arc<Self>,
        client_id: ClientId,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Outgoing frames
                Some(msg) = rx.recv() => {
                    let closing = matches!(msg, Message::Close(_));
                    if let Err(e) = ws_tx.send(msg).await {
                        debug!(client_id, error = %e, "Failed to send frame");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                // Incoming events
                msg_result = ws_rx.next() => {
                    match msg_result {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(client_id, &text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_tx.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            debug!(client_id, "Client requested close");
                            break;
                        }
                        Some(Err(e)) => {
                            debug!(client_id, error = %e, "WebSocket error");
                            break;
                        }
                        None => {
                            debug!(client_id, "Connection closed");
                            break;
                        }
                        _ => {}
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!(client_id, "Shutdown signal received");
                    break;
                }
            }
        }

        self.handle_client_gone(client_id);
    }

    /// Parse and dispatch one inbound text frame.
    async fn handle_frame(&self, client_id: ClientId, text: &str) {
        let event: ClientEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                debug!(client_id, error = %e, "Unparseable client frame");
                let frame = ServerEvent::Error {
                    kind: ErrorKind::Protocol,
                    message: format!("unrecognized frame: {e}"),
                };
                if let Ok(json) = serde_json::to_string(&frame) {
                    self.registry.send_to(client_id, &Message::Text(json));
                }
                return;
            }
        };

        let binding = self.registry.binding(client_id);
        let outcome = self.dispatcher.handle(binding.as_ref(), event).await;

        if let Some(bind) = outcome.bind {
            self.registry.bind(client_id, bind);
        }
        // Frames are delivered only after all handler locks are released.
        let session = self
            .registry
            .binding(client_id)
            .map(|b| b.session)
            .unwrap_or_default();
        for outbound in &outcome.outbound {
            self.registry.deliver(client_id, &session, outbound);
        }
    }

    /// Clean up after a dropped client and notify the counterparty.
    fn handle_client_gone(&self, client_id: ClientId) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        let Some(binding) = self.registry.unregister(client_id) else {
            info!(client_id, "Client disconnected");
            return;
        };
        info!(client_id, session = %binding.session, role = %binding.role, "Participant disconnected");

        for outbound in self.dispatcher.handle_disconnect(&binding) {
            self.registry.deliver(client_id, &binding.session, &outbound);
        }
    }
}

/// Spawn the gateway server as a background task.
pub fn spawn_gateway_server(
    config: GatewayConfig,
    services: SharedCoreServices,
) -> (Arc<GatewayServer>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let server = Arc::new(GatewayServer::new(config, services));
    let server_clone = Arc::clone(&server);
    let handle = tokio::spawn(async move { server_clone.run().await });
    (server, handle)
}
