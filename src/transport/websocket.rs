//! WebSocket transport
//!
//! This file binds the two endpoints and runs the forwarding loop:
//! - Accept TCP connections on the frontend (publishers) and the backend
//!   (subscribers) and perform the WebSocket handshake
//! - Register a `Publisher` or `Subscriber` with the shared `Relay` for each
//!   connection and remove it again when the connection ends
//! - Decode binary messages: published data on the frontend, control frames
//!   on the backend
//! - Keep reading each connection while writes to it are blocked
//! - Stop promptly when the shutdown signal fires, dropping whatever is in
//!   flight
//!
//! Every connection runs in its own task; a fault in one of them is logged
//! and closes only that connection.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep, timeout};
use tokio_tungstenite::{WebSocketStream, accept_async_with_config};
use tracing::{debug, error, info, warn};
use tungstenite::protocol::{Message as WsMessage, WebSocketConfig};

use crate::config::{BindConfig, Endpoint, RelaySettings};
use crate::relay::message::Directive;
use crate::relay::peer::{PeerId, PendingDirectives, Publisher, Subscriber};
use crate::relay::{SharedRelay, lock};
use crate::transport::message::{decode, to_ws};
use crate::utils::RelayError;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// The two bound listeners. Dropping this releases both addresses.
#[derive(Debug)]
pub struct Endpoints {
    frontend: TcpListener,
    backend: TcpListener,
}

impl Endpoints {
    /// Bind the frontend, then the backend.
    ///
    /// # Errors
    ///
    /// `Bind` naming the endpoint that failed. A frontend that was already
    /// bound is released before returning.
    pub async fn bind(config: &BindConfig) -> Result<Self, RelayError> {
        let frontend = bind_endpoint("frontend", &config.frontend, config.frontend_url()).await?;
        let backend = bind_endpoint("backend", &config.backend, config.backend_url()).await?;
        Ok(Self { frontend, backend })
    }

    pub fn frontend_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.frontend.local_addr()?)
    }

    pub fn backend_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.backend.local_addr()?)
    }
}

async fn bind_endpoint(
    role: &'static str,
    endpoint: &Endpoint,
    url: String,
) -> Result<TcpListener, RelayError> {
    match TcpListener::bind((endpoint.bind_host(), endpoint.port)).await {
        Ok(listener) => {
            info!("{role} bound to {url}");
            Ok(listener)
        }
        Err(source) => Err(RelayError::Bind {
            endpoint: role,
            url,
            source,
        }),
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Publisher,
    Subscriber,
}

/// Bind both endpoints and run the forwarding loop on them.
///
/// Nothing is accepted unless both binds succeed.
///
/// # Errors
///
/// `Bind` for the endpoint that could not be bound, otherwise whatever
/// `run_relay` returns.
pub async fn bind_and_run(
    config: &BindConfig,
    relay: SharedRelay,
    settings: RelaySettings,
    shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let endpoints = Endpoints::bind(config).await?;
    run_relay(endpoints, relay, settings, shutdown).await
}

/// Run the forwarding loop until `shutdown` fires (or its sender is dropped).
///
/// On shutdown both accept loops stop, every connection task is aborted and
/// the listeners are released.
///
/// # Errors
///
/// `Transport` when accepting fails in a way that is not tied to a single
/// connection.
pub async fn run_relay(
    endpoints: Endpoints,
    relay: SharedRelay,
    settings: RelaySettings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let Endpoints { frontend, backend } = endpoints;
    let mut connections = JoinSet::new();

    // one slot per admitted connection, reserved before the handshake
    let limit = settings.max_connections.min(Semaphore::MAX_PERMITS);
    let publisher_slots = Arc::new(Semaphore::new(limit));
    let subscriber_slots = Arc::new(Semaphore::new(limit));

    let result = loop {
        tokio::select! {
            accepted = frontend.accept() => match accepted {
                Ok((stream, addr)) => {
                    let Some(slot) = admit(Role::Publisher, &publisher_slots, addr) else {
                        continue;
                    };
                    connections.spawn(handle_connection(
                        Role::Publisher,
                        stream,
                        addr,
                        slot,
                        relay.clone(),
                        settings.clone(),
                    ));
                }
                Err(e) => {
                    if let Err(fatal) = recover_accept_error("frontend", e).await {
                        break Err(fatal);
                    }
                }
            },
            accepted = backend.accept() => match accepted {
                Ok((stream, addr)) => {
                    let Some(slot) = admit(Role::Subscriber, &subscriber_slots, addr) else {
                        continue;
                    };
                    connections.spawn(handle_connection(
                        Role::Subscriber,
                        stream,
                        addr,
                        slot,
                        relay.clone(),
                        settings.clone(),
                    ));
                }
                Err(e) => {
                    if let Err(fatal) = recover_accept_error("backend", e).await {
                        break Err(fatal);
                    }
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => {
                info!("shutdown requested, dropping {} connections", connections.len());
                break Ok(());
            }
        }
    };

    connections.shutdown().await;
    drop(frontend);
    drop(backend);
    info!("relay stopped");
    result
}

/// Reserve a connection slot; `None` means the stream is dropped unserved.
fn admit(role: Role, slots: &Arc<Semaphore>, addr: SocketAddr) -> Option<OwnedSemaphorePermit> {
    match Arc::clone(slots).try_acquire_owned() {
        Ok(permit) => Some(permit),
        Err(_) => {
            warn!("max connections reached, rejecting {role:?} {addr}");
            None
        }
    }
}

/// Decide whether an accept error ends the relay.
async fn recover_accept_error(role: &str, e: std::io::Error) -> Result<(), RelayError> {
    match e.kind() {
        ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::TimedOut => {
            debug!("{role} accept failed: {e}");
            Ok(())
        }
        // EMFILE / ENFILE: back off until descriptors are released
        _ if matches!(e.raw_os_error(), Some(23) | Some(24)) => {
            warn!("{role} accept failed: {e}, backing off");
            sleep(Duration::from_millis(100)).await;
            Ok(())
        }
        _ => {
            error!("{role} accept failed: {e}");
            Err(RelayError::Transport(e))
        }
    }
}

async fn handle_connection(
    role: Role,
    stream: TcpStream,
    addr: SocketAddr,
    _slot: OwnedSemaphorePermit,
    relay: SharedRelay,
    settings: RelaySettings,
) {
    if let Err(e) = serve(role, stream, addr, &relay, &settings).await {
        match e {
            RelayError::WebSocket(_) | RelayError::HandshakeTimeout => {
                debug!("connection from {addr} closed: {e}");
            }
            _ => warn!("connection from {addr} closed: {e}"),
        }
    }
}

async fn serve(
    role: Role,
    stream: TcpStream,
    addr: SocketAddr,
    relay: &SharedRelay,
    settings: &RelaySettings,
) -> Result<(), RelayError> {
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(settings.max_message_size))
        .max_frame_size(Some(settings.max_message_size));
    let ws_stream = timeout(
        Duration::from_secs(settings.handshake_timeout_secs),
        accept_async_with_config(stream, Some(ws_config)),
    )
    .await
    .map_err(|_| RelayError::HandshakeTimeout)??;

    let (ws_sender, ws_receiver) = ws_stream.split();

    match role {
        Role::Publisher => {
            let (tx, rx) = mpsc::unbounded_channel::<Directive>();
            let publisher = Publisher::new(tx);
            let guard = PeerGuard::new(relay, role, publisher.id.clone());
            info!("{} connected from {addr}", guard.id);
            lock(relay).register_publisher(publisher);

            // the two halves run independently so a publisher that never
            // reads its directives is still consumed
            tokio::select! {
                written = write_directives(ws_sender, rx) => written,
                read = read_published(ws_receiver, relay) => read,
            }
        }
        Role::Subscriber => {
            let (tx, rx) = mpsc::channel::<WsMessage>(settings.subscriber_queue);
            let subscriber = Subscriber::new(tx);
            let guard = PeerGuard::new(relay, role, subscriber.id.clone());
            info!("{} connected from {addr}", guard.id);
            lock(relay).register_subscriber(subscriber);

            tokio::select! {
                written = write_queued(ws_sender, rx) => written,
                read = read_control(ws_receiver, relay, &guard.id) => read,
            }
        }
    }
}

/// Consume published messages and fan them out.
async fn read_published(mut ws_rx: WsRecv, relay: &SharedRelay) -> Result<(), RelayError> {
    while let Some(inbound) = ws_rx.next().await {
        match inbound? {
            WsMessage::Binary(data) => {
                let message = decode(&data)?;
                lock(relay).publish(&message);
            }
            WsMessage::Text(_) => return Err(RelayError::UnsupportedFrame("text")),
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// Write directives to a publisher, collapsing whatever piles up while a
/// write is blocked.
async fn write_directives(
    mut ws_tx: WsSink,
    mut directives: mpsc::UnboundedReceiver<Directive>,
) -> Result<(), RelayError> {
    let mut pending = PendingDirectives::new();
    loop {
        let Some(next) = pending.pop() else {
            match directives.recv().await {
                Some(directive) => pending.push(directive),
                None => return Ok(()),
            }
            continue;
        };

        let send = ws_tx.send(to_ws(&next.to_message()));
        tokio::pin!(send);
        loop {
            tokio::select! {
                sent = &mut send => {
                    sent?;
                    break;
                }
                queued = directives.recv() => match queued {
                    Some(directive) => pending.push(directive),
                    None => return Ok(()),
                },
            }
        }
    }
}

/// Apply control frames from a subscriber.
async fn read_control(
    mut ws_rx: WsRecv,
    relay: &SharedRelay,
    subscriber_id: &PeerId,
) -> Result<(), RelayError> {
    while let Some(inbound) = ws_rx.next().await {
        match inbound? {
            WsMessage::Binary(data) => {
                let message = decode(&data)?;
                lock(relay).handle_control(subscriber_id, &message)?;
            }
            WsMessage::Text(_) => return Err(RelayError::UnsupportedFrame("text")),
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// Write a subscriber's queued messages in order.
async fn write_queued(
    mut ws_tx: WsSink,
    mut queue: mpsc::Receiver<WsMessage>,
) -> Result<(), RelayError> {
    while let Some(msg) = queue.recv().await {
        ws_tx.send(msg).await?;
    }
    Ok(())
}

/// Removes a connection from the relay when its task ends, including when
/// the task is aborted at shutdown.
struct PeerGuard<'a> {
    relay: &'a SharedRelay,
    role: Role,
    id: PeerId,
}

impl<'a> PeerGuard<'a> {
    fn new(relay: &'a SharedRelay, role: Role, id: PeerId) -> Self {
        Self { relay, role, id }
    }
}

impl Drop for PeerGuard<'_> {
    fn drop(&mut self) {
        let mut relay = lock(self.relay);
        match self.role {
            Role::Publisher => relay.remove_publisher(&self.id),
            Role::Subscriber => relay.cleanup_subscriber(&self.id),
        }
        info!("{} disconnected", self.id);
    }
}
