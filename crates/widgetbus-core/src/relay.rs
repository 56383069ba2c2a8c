//! Relay client.
//!
//! Mirrors local publishes to the broadcast server and delivers server
//! messages to topic subscribers. Two tasks run per client:
//!
//! - the I/O task owns the connection, writes queued events and reads
//!   inbound events; it acknowledges every well-formed message at once
//! - the dispatch task runs subscriber and listener callbacks, so a slow
//!   handler never stalls the read path and never re-enters the transport

use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, trace, warn};
use widgetbus_protocol::events::names;
use widgetbus_protocol::{Event, RelayMessage, PROTOCOL_VERSION};
use widgetbus_transport::{Connection, TransportError};

use crate::message::is_empty_payload;

/// Called for every message delivered on a subscribed topic.
pub type TopicHandler = Arc<dyn Fn(&RelayMessage) + Send + Sync>;

/// Called with the `data` of a raw server event.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Relay client errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The connection to the server is down.
    #[error("the socket is not connected to the server")]
    SocketDisconnected,

    /// Publish attempted with empty data.
    #[error("publish attempted with empty data")]
    EmptyPayload,

    /// A required string argument is blank.
    #[error("the variable {0:?} is only whitespace")]
    EmptyString(&'static str),

    /// The connection ended before the server answered.
    #[error("no reply to {0}")]
    NoReply(&'static str),
}

/// Handle returned by `RelayClient::subscribe`, rendered as `t_<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(String);

impl SubscriptionToken {
    fn from_sequence(n: u64) -> Self {
        Self(format!("t_{}", n))
    }

    /// The token as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Work handed from the I/O task to the dispatch task.
enum Dispatch {
    Message(RelayMessage),
    Event { name: &'static str, payload: Value },
}

struct RelayInner {
    subscribers: DashMap<String, Vec<(SubscriptionToken, TopicHandler)>>,
    listeners: DashMap<String, Vec<EventHandler>>,
    pending: DashMap<&'static str, VecDeque<oneshot::Sender<Event>>>,
    next_token: AtomicU64,
    connected: AtomicBool,
    connection_id: OnceLock<String>,
    outbound: mpsc::UnboundedSender<Event>,
    shutdown: Arc<Notify>,
}

impl RelayInner {
    fn on_event(&self, event: Event, dispatch: &mpsc::UnboundedSender<Dispatch>) {
        let name = event.name();
        if self.listeners.contains_key(name) {
            let _ = dispatch.send(Dispatch::Event {
                name,
                payload: event.payload(),
            });
        }

        match event {
            Event::Message(raw) => match RelayMessage::try_from(raw.clone()) {
                Ok(msg) => {
                    trace!(topic = %msg.topic, uid = %msg.uid, "Message from server");
                    let _ = dispatch.send(Dispatch::Message(msg));
                    if self.outbound.send(Event::Ack(raw)).is_err() {
                        debug!("Connection closing, ack dropped");
                    }
                }
                Err(_) => {
                    warn!(
                        topic = ?raw.topic,
                        data = %raw.data,
                        uid = ?raw.uid,
                        "Received ill-formed message"
                    );
                }
            },
            Event::Connected {
                connection_id,
                version,
            } => {
                if !version.is_compatible_with(&PROTOCOL_VERSION) {
                    warn!(server = %version, client = %PROTOCOL_VERSION, "Incompatible protocol version");
                }
                info!(connection = %connection_id, "Socket connected, global pub/sub is a go");
                let _ = self.connection_id.set(connection_id);
            }
            reply @ (Event::RoomGetName(_)
            | Event::RoomGetAllName(_)
            | Event::UserGetName(_)
            | Event::UserGetAllName(_)) => {
                let waiter = self
                    .pending
                    .get_mut(name)
                    .and_then(|mut queue| queue.pop_front());
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(event = name, "Reply with no pending request"),
                }
            }
            other => {
                debug!(event = other.name(), "Ignoring unexpected event from server");
            }
        }
    }

    fn deliver(&self, msg: &RelayMessage) {
        let handlers: Vec<TopicHandler> = match self.subscribers.get(&msg.topic) {
            Some(list) if !list.is_empty() => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            _ => {
                debug!(topic = %msg.topic, "Received message but no one is subscribed");
                return;
            }
        };

        for handler in handlers {
            handler(msg);
        }
    }

    fn notify(&self, name: &str, payload: &Value) {
        let handlers: Vec<EventHandler> = match self.listeners.get(name) {
            Some(list) => list.iter().cloned().collect(),
            None => return,
        };
        for handler in handlers {
            handler(payload);
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders fails every outstanding query with NoReply.
        self.pending.clear();
        warn!("Disconnected from server");
    }
}

/// A client of the room-scoped broadcast server.
///
/// Cheap to clone; the connection closes when the last clone is dropped or
/// `close` is called.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<RelayInner>,
}

impl RelayClient {
    /// Dial the broadcast server over WebSocket.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let conn = widgetbus_transport::connect(
            url,
            widgetbus_transport::websocket::DEFAULT_MAX_MESSAGE_SIZE,
        )
        .await?;
        Ok(Self::new(Box::new(conn)))
    }

    /// Run a relay client over an open connection.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(conn: Box<dyn Connection>) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());

        let inner = Arc::new(RelayInner {
            subscribers: DashMap::new(),
            listeners: DashMap::new(),
            pending: DashMap::new(),
            next_token: AtomicU64::new(0),
            connected: AtomicBool::new(conn.is_open()),
            connection_id: OnceLock::new(),
            outbound,
            shutdown: Arc::clone(&shutdown),
        });

        tokio::spawn(io_loop(
            Arc::downgrade(&inner),
            conn,
            outbound_rx,
            dispatch_tx,
            shutdown,
        ));
        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), dispatch_rx));

        Self { inner }
    }

    /// Check whether the connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Server-assigned connection id, once the greeting has arrived.
    #[must_use]
    pub fn connection_id(&self) -> Option<&str> {
        self.inner.connection_id.get().map(String::as_str)
    }

    /// Register `handler` for messages on `topic`.
    ///
    /// Every handler registered for a topic is called on delivery.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> SubscriptionToken
    where
        F: Fn(&RelayMessage) + Send + Sync + 'static,
    {
        let token =
            SubscriptionToken::from_sequence(self.inner.next_token.fetch_add(1, Ordering::SeqCst));
        self.inner
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push((token.clone(), Arc::new(handler)));
        debug!(topic = %topic, token = %token, "Relay subscription added");
        token
    }

    /// Remove the subscription identified by `token`.
    ///
    /// Returns `false` if no subscription holds that token.
    pub fn unsubscribe(&self, token: &str) -> bool {
        let mut removed = false;
        for mut entry in self.inner.subscribers.iter_mut() {
            if let Some(pos) = entry.iter().position(|(t, _)| t.as_str() == token) {
                entry.remove(pos);
                removed = true;
                break;
            }
        }

        if removed {
            self.inner.subscribers.retain(|_, list| !list.is_empty());
            debug!(token = %token, "Relay subscription removed");
        }
        removed
    }

    /// Send a message to every other connection in this client's room.
    ///
    /// # Errors
    ///
    /// Returns `SocketDisconnected` when offline and `EmptyPayload` when
    /// `data` carries no content.
    pub fn publish(&self, topic: &str, data: Value, sender_id: &str) -> Result<(), RelayError> {
        self.ensure_connection()?;
        if is_empty_payload(&data) {
            return Err(RelayError::EmptyPayload);
        }
        self.send(Event::publish(topic, data, sender_id))
    }

    /// Call `handler` with the data of every inbound `event`.
    ///
    /// Besides the relay events this also sees `connected` and the local
    /// `disconnect` notification.
    pub fn listen<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .listeners
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Move this connection to `room`.
    ///
    /// # Errors
    ///
    /// Returns `SocketDisconnected` when offline and `EmptyString` for a
    /// blank room name.
    pub fn switch_room(&self, room: &str) -> Result<(), RelayError> {
        self.ensure_connection()?;
        if room.trim().is_empty() {
            return Err(RelayError::EmptyString("room"));
        }
        self.send(Event::RoomSwitch(room.to_string()))
    }

    /// Register a display name for this connection.
    ///
    /// # Errors
    ///
    /// Returns `SocketDisconnected` when offline and `EmptyString` for a
    /// blank name.
    pub fn set_username(&self, name: &str) -> Result<(), RelayError> {
        self.ensure_connection()?;
        if name.trim().is_empty() {
            return Err(RelayError::EmptyString("name"));
        }
        self.send(Event::UserSetName(name.to_string()))
    }

    /// Ask the server for this connection's room.
    ///
    /// # Errors
    ///
    /// Returns `SocketDisconnected` when offline and `NoReply` if the
    /// connection drops before the answer arrives.
    pub async fn current_room(&self) -> Result<String, RelayError> {
        match self.request(Event::RoomGetName(None)).await? {
            Event::RoomGetName(Some(room)) => Ok(room),
            _ => Err(RelayError::NoReply(names::ROOM_GET_NAME)),
        }
    }

    /// Ask the server for every occupied room except the default one.
    ///
    /// # Errors
    ///
    /// See [`RelayClient::current_room`].
    pub async fn all_rooms(&self) -> Result<Vec<String>, RelayError> {
        match self.request(Event::RoomGetAllName(None)).await? {
            Event::RoomGetAllName(Some(rooms)) => Ok(rooms),
            _ => Err(RelayError::NoReply(names::ROOM_GET_ALL_NAME)),
        }
    }

    /// Ask the server for this connection's display name.
    ///
    /// # Errors
    ///
    /// See [`RelayClient::current_room`].
    pub async fn username(&self) -> Result<String, RelayError> {
        match self.request(Event::UserGetName(None)).await? {
            Event::UserGetName(Some(name)) => Ok(name),
            _ => Err(RelayError::NoReply(names::USER_GET_NAME)),
        }
    }

    /// Ask the server for the display names of everyone in this room.
    ///
    /// # Errors
    ///
    /// See [`RelayClient::current_room`].
    pub async fn all_users(&self) -> Result<Vec<String>, RelayError> {
        match self.request(Event::UserGetAllName(None)).await? {
            Event::UserGetAllName(Some(names)) => Ok(names),
            _ => Err(RelayError::NoReply(names::USER_GET_ALL_NAME)),
        }
    }

    /// Close the connection.
    pub fn close(&self) {
        self.inner.shutdown.notify_one();
    }

    async fn request(&self, event: Event) -> Result<Event, RelayError> {
        self.ensure_connection()?;
        let name = event.name();

        let (tx, rx) = oneshot::channel();
        self.inner.pending.entry(name).or_default().push_back(tx);

        if let Err(e) = self.send(event) {
            drop(rx);
            if let Some(mut queue) = self.inner.pending.get_mut(name) {
                queue.retain(|waiter| !waiter.is_closed());
            }
            return Err(e);
        }

        rx.await.map_err(|_| RelayError::NoReply(name))
    }

    fn send(&self, event: Event) -> Result<(), RelayError> {
        self.inner
            .outbound
            .send(event)
            .map_err(|_| RelayError::SocketDisconnected)
    }

    fn ensure_connection(&self) -> Result<(), RelayError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RelayError::SocketDisconnected)
        }
    }
}

async fn io_loop(
    client: Weak<RelayInner>,
    mut conn: Box<dyn Connection>,
    mut outbound: mpsc::UnboundedReceiver<Event>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            biased;

            () = shutdown.notified() => {
                debug!(connection = %conn.id(), "Relay client closing");
                let _ = conn.close().await;
                break;
            }

            outgoing = outbound.recv() => match outgoing {
                Some(event) => {
                    if let Err(e) = conn.send(event).await {
                        warn!(connection = %conn.id(), error = %e, "Failed to send to server");
                        break;
                    }
                }
                None => {
                    let _ = conn.close().await;
                    break;
                }
            },

            incoming = conn.recv() => match incoming {
                Ok(Some(event)) => {
                    let Some(inner) = client.upgrade() else {
                        break;
                    };
                    inner.on_event(event, &dispatch);
                }
                Ok(None) => {
                    debug!(connection = %conn.id(), "Server closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(connection = %conn.id(), error = %e, "Relay connection error");
                    break;
                }
            },
        }
    }

    // Sends after this point fail, so no query can queue behind the teardown.
    outbound.close();

    if let Some(inner) = client.upgrade() {
        inner.mark_disconnected();
        if inner.listeners.contains_key(names::DISCONNECT) {
            let _ = dispatch.send(Dispatch::Event {
                name: names::DISCONNECT,
                payload: Value::Null,
            });
        }
    }
}

async fn dispatch_loop(client: Weak<RelayInner>, mut queue: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(item) = queue.recv().await {
        let Some(inner) = client.upgrade() else {
            break;
        };
        match item {
            Dispatch::Message(msg) => inner.deliver(&msg),
            Dispatch::Event { name, payload } => inner.notify(name, &payload),
        }
    }
}
