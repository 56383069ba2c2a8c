//! Per-widget channel registry.
//!
//! Maps each channel name to exactly one handler. Subscribing again
//! replaces the previous handler. Publishing posts to the coordinator
//! through the widget's bridge and, when a relay client is attached,
//! mirrors the message to the broadcast server.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};
use widgetbus_protocol::{BridgeEnvelope, RelayMessage};

use crate::bridge::{BridgePort, BridgeState, ContextBridge};
use crate::relay::{RelayClient, SubscriptionToken};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// A local channel handler, called with the payload and the sender's uid.
pub type Handler = Arc<dyn Fn(&Value, &str) + Send + Sync>;

/// Errors returned by the channel registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventingError {
    /// The bridge has not received its uid yet.
    #[error("eventing is not ready: no uid assigned yet")]
    NotReady,

    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// The coordinator side of the bridge is gone.
    #[error("bridge to coordinator is closed")]
    BridgeClosed,
}

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

struct Subscription {
    handler: Handler,
    /// Token of the relay subscription that feeds server messages here.
    relay_token: Option<SubscriptionToken>,
}

struct RegistryInner {
    channels: DashMap<String, Subscription>,
    bridge: ContextBridge,
    relay: Option<RelayClient>,
}

impl RegistryInner {
    fn dispatch(&self, channel: &str, message: &Value, sender: &str) -> bool {
        // Clone the handler out so it can touch the registry without deadlocking.
        let handler = match self.channels.get(channel) {
            Some(sub) => Arc::clone(&sub.handler),
            None => {
                trace!(channel = %channel, "No local subscriber");
                return false;
            }
        };
        handler(message, sender);
        true
    }

    fn on_server_receive(&self, msg: &RelayMessage) {
        if !matches!(self.bridge.state(), BridgeState::Registered { .. }) {
            error!(topic = %msg.topic, "Message received from server before eventing was ready");
            return;
        }
        if !self.dispatch(&msg.topic, &msg.data, &msg.uid) {
            return;
        }

        // Hand the message on to sibling widgets in this context.
        let envelope =
            BridgeEnvelope::publish(msg.topic.as_str(), msg.data.clone(), msg.uid.as_str());
        if let Err(e) = self.bridge.post(envelope) {
            warn!(topic = %msg.topic, error = %e, "Failed to forward server message to coordinator");
        }
    }
}

/// A widget's channel registry.
///
/// Cheap to clone; clones share the same channels and bridge.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    /// Open a registry over a coordinator port.
    ///
    /// Sends `ack` immediately and starts the task that applies envelopes
    /// from the coordinator. Must be called inside a tokio runtime.
    #[must_use]
    pub fn connect(port: BridgePort) -> Self {
        Self::build(port, None)
    }

    /// Open a registry that also mirrors traffic through a relay client.
    #[must_use]
    pub fn with_relay(port: BridgePort, relay: RelayClient) -> Self {
        Self::build(port, Some(relay))
    }

    fn build(port: BridgePort, relay: Option<RelayClient>) -> Self {
        let (bridge, inbound) = ContextBridge::open(port);
        let inner = Arc::new(RegistryInner {
            channels: DashMap::new(),
            bridge,
            relay,
        });

        tokio::spawn(pump(Arc::downgrade(&inner), inbound));

        Self { inner }
    }

    /// Current bridge state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        self.inner.bridge.state()
    }

    /// This widget's uid, once registered.
    #[must_use]
    pub fn uid(&self) -> Option<String> {
        self.inner.bridge.uid()
    }

    /// Check whether the bridge is registered.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), BridgeState::Registered { .. })
    }

    /// Wait for the ready signal and return the uid.
    ///
    /// # Errors
    ///
    /// Returns `BridgeClosed` if the bridge goes away first.
    pub async fn ready(&self) -> Result<String, EventingError> {
        self.inner.bridge.ready().await
    }

    /// Watch bridge state transitions.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<BridgeState> {
        self.inner.bridge.watch()
    }

    /// The attached relay client, if any.
    #[must_use]
    pub fn relay(&self) -> Option<&RelayClient> {
        self.inner.relay.as_ref()
    }

    /// Install `handler` for `channel`, replacing any previous handler.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` before registration and `InvalidChannel` for a
    /// malformed channel name.
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> Result<(), EventingError>
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        if !self.is_ready() {
            return Err(EventingError::NotReady);
        }
        validate_channel_name(channel).map_err(EventingError::InvalidChannel)?;

        let handler: Handler = Arc::new(handler);
        match self.inner.channels.entry(channel.to_string()) {
            Entry::Occupied(mut entry) => {
                debug!(channel = %channel, "Replacing channel handler");
                entry.get_mut().handler = handler;
            }
            Entry::Vacant(entry) => {
                let relay_token = self.inner.relay.as_ref().map(|relay| {
                    let registry = Arc::downgrade(&self.inner);
                    relay.subscribe(channel, move |msg: &RelayMessage| {
                        if let Some(inner) = registry.upgrade() {
                            inner.on_server_receive(msg);
                        }
                    })
                });
                debug!(channel = %channel, relayed = relay_token.is_some(), "Channel subscribed");
                entry.insert(Subscription {
                    handler,
                    relay_token,
                });
            }
        }
        Ok(())
    }

    /// Remove the handler for `channel`.
    ///
    /// Returns `true` if a handler was removed.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        let Some((_, sub)) = self.inner.channels.remove(channel) else {
            return false;
        };

        if let (Some(relay), Some(token)) = (self.inner.relay.as_ref(), sub.relay_token) {
            if !relay.unsubscribe(token.as_str()) {
                warn!(channel = %channel, token = %token, "Relay subscription already gone");
            }
        }
        debug!(channel = %channel, "Channel unsubscribed");
        true
    }

    /// Publish `message` on `channel` to every other widget.
    ///
    /// The local handler for `channel` is not invoked. Relay failures are
    /// logged; the local publish still succeeds.
    ///
    /// # Errors
    ///
    /// Returns `NotReady` before registration and `BridgeClosed` if the
    /// coordinator is gone.
    pub fn publish(&self, channel: &str, message: Value) -> Result<(), EventingError> {
        let uid = self.uid().ok_or(EventingError::NotReady)?;

        if let Some(relay) = &self.inner.relay {
            if let Err(e) = relay.publish(channel, message.clone(), &uid) {
                warn!(channel = %channel, error = %e, "Relay publish failed");
            }
        }

        self.inner
            .bridge
            .post(BridgeEnvelope::publish(channel, message, uid))
    }

    /// Deliver a message to the local handler for `channel`.
    ///
    /// Returns `false` when nothing is subscribed.
    pub fn dispatch(&self, channel: &str, message: &Value, sender: &str) -> bool {
        self.inner.dispatch(channel, message, sender)
    }

    /// Check whether `channel` has a handler.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.inner.channels.contains_key(channel)
    }

    /// Names of all subscribed channels.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.inner.channels.iter().map(|e| e.key().clone()).collect()
    }
}

/// Apply envelopes from the coordinator until either side goes away.
async fn pump(registry: Weak<RegistryInner>, mut inbound: mpsc::UnboundedReceiver<BridgeEnvelope>) {
    while let Some(envelope) = inbound.recv().await {
        let Some(inner) = registry.upgrade() else {
            break;
        };

        match envelope {
            BridgeEnvelope::SetUid { uid } => {
                if !inner.bridge.register(&uid) {
                    warn!(bridge = inner.bridge.id(), uid = %uid, "Ignoring second set_uid");
                }
            }
            BridgeEnvelope::Publish {
                channel,
                message,
                uid,
            } => {
                inner.dispatch(&channel, &message, &uid);
            }
            BridgeEnvelope::Ack => {
                debug!(bridge = inner.bridge.id(), "Unexpected ack from coordinator");
            }
        }
    }
    trace!("Bridge pump stopped");
}
