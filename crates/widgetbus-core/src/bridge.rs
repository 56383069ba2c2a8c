//! Context bridge between a widget and the coordinator.
//!
//! A bridge starts `Unregistered`, sends `ack` as soon as it is opened and
//! becomes `Registered` when the coordinator answers with `set_uid`. The
//! uid never changes afterwards.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use widgetbus_protocol::BridgeEnvelope;

use crate::registry::EventingError;

/// Coordinator-assigned handle of a bridge registration.
pub type BridgeId = u64;

/// Registration state of a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeState {
    /// Waiting for `set_uid`.
    Unregistered,
    /// Identity assigned; publish and subscribe are valid.
    Registered {
        /// The widget's identity token.
        uid: String,
    },
}

impl BridgeState {
    /// The uid, once registered.
    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        match self {
            BridgeState::Unregistered => None,
            BridgeState::Registered { uid } => Some(uid),
        }
    }
}

/// An envelope on its way to the coordinator, tagged with its origin.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// The bridge that posted the envelope.
    pub from: BridgeId,
    /// The envelope itself.
    pub envelope: BridgeEnvelope,
}

/// The widget end of a bridge transport, as handed out by the coordinator.
#[derive(Debug)]
pub struct BridgePort {
    id: BridgeId,
    outbound: mpsc::UnboundedSender<Inbound>,
    inbound: mpsc::UnboundedReceiver<BridgeEnvelope>,
}

impl BridgePort {
    /// Assemble a port from its two directions.
    #[must_use]
    pub fn new(
        id: BridgeId,
        outbound: mpsc::UnboundedSender<Inbound>,
        inbound: mpsc::UnboundedReceiver<BridgeEnvelope>,
    ) -> Self {
        Self {
            id,
            outbound,
            inbound,
        }
    }

    /// The bridge id this port belongs to.
    #[must_use]
    pub fn id(&self) -> BridgeId {
        self.id
    }

    /// Split the port into its id and raw channel ends.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        BridgeId,
        mpsc::UnboundedSender<Inbound>,
        mpsc::UnboundedReceiver<BridgeEnvelope>,
    ) {
        (self.id, self.outbound, self.inbound)
    }
}

/// The widget side of a bridge.
#[derive(Debug)]
pub struct ContextBridge {
    id: BridgeId,
    outbound: mpsc::UnboundedSender<Inbound>,
    state: watch::Sender<BridgeState>,
}

impl ContextBridge {
    /// Open a bridge over `port` and request an identity.
    ///
    /// Returns the bridge and the stream of envelopes addressed to it.
    pub fn open(port: BridgePort) -> (Self, mpsc::UnboundedReceiver<BridgeEnvelope>) {
        let (state, _) = watch::channel(BridgeState::Unregistered);
        let bridge = Self {
            id: port.id,
            outbound: port.outbound,
            state,
        };

        if bridge.post(BridgeEnvelope::Ack).is_err() {
            warn!(bridge = bridge.id, "Coordinator gone before registration");
        } else {
            debug!(bridge = bridge.id, "Sent ack to coordinator");
        }

        (bridge, port.inbound)
    }

    /// The coordinator-side id of this bridge.
    #[must_use]
    pub fn id(&self) -> BridgeId {
        self.id
    }

    /// Current registration state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        self.state.borrow().clone()
    }

    /// The assigned uid, if registered.
    #[must_use]
    pub fn uid(&self) -> Option<String> {
        self.state.borrow().uid().map(str::to_string)
    }

    /// Watch registration state changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Wait until the coordinator has assigned a uid.
    ///
    /// # Errors
    ///
    /// Returns `BridgeClosed` if the bridge is dropped while waiting.
    pub async fn ready(&self) -> Result<String, EventingError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| matches!(state, BridgeState::Registered { .. }))
            .await
            .map_err(|_| EventingError::BridgeClosed)?;
        state
            .uid()
            .map(str::to_string)
            .ok_or(EventingError::BridgeClosed)
    }

    /// Record the uid sent by the coordinator.
    ///
    /// Returns `false` if a uid was already assigned; the first one wins.
    pub(crate) fn register(&self, uid: &str) -> bool {
        let registered = self.state.send_if_modified(|state| match state {
            BridgeState::Unregistered => {
                *state = BridgeState::Registered {
                    uid: uid.to_string(),
                };
                true
            }
            BridgeState::Registered { .. } => false,
        });

        if registered {
            info!(bridge = self.id, uid = %uid, "Bridge registered");
        }
        registered
    }

    /// Post an envelope to the coordinator.
    ///
    /// # Errors
    ///
    /// Returns `BridgeClosed` if the coordinator is gone.
    pub fn post(&self, envelope: BridgeEnvelope) -> Result<(), EventingError> {
        self.outbound
            .send(Inbound {
                from: self.id,
                envelope,
            })
            .map_err(|_| EventingError::BridgeClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port() -> (BridgePort, mpsc::UnboundedReceiver<Inbound>, mpsc::UnboundedSender<BridgeEnvelope>) {
        let (to_coordinator, from_widget) = mpsc::unbounded_channel();
        let (to_widget, from_coordinator) = mpsc::unbounded_channel();
        (BridgePort::new(7, to_coordinator, from_coordinator), from_widget, to_widget)
    }

    #[tokio::test]
    async fn test_open_sends_ack() {
        let (port, mut coordinator, _to_widget) = port();
        let (bridge, _inbound) = ContextBridge::open(port);

        let first = coordinator.recv().await.unwrap();
        assert_eq!(first.from, 7);
        assert_eq!(first.envelope, BridgeEnvelope::Ack);
        assert_eq!(bridge.state(), BridgeState::Unregistered);
        assert!(bridge.uid().is_none());
    }

    #[tokio::test]
    async fn test_register_once() {
        let (port, _coordinator, _to_widget) = port();
        let (bridge, _inbound) = ContextBridge::open(port);

        assert!(bridge.register("u1"));
        assert!(!bridge.register("u2"));
        assert_eq!(bridge.uid().as_deref(), Some("u1"));
        assert_eq!(bridge.ready().await.unwrap(), "u1");
    }

    #[tokio::test]
    async fn test_ready_waits_for_registration() {
        let (port, _coordinator, _to_widget) = port();
        let (bridge, _inbound) = ContextBridge::open(port);
        let mut watch = bridge.watch();

        let waiter = tokio::spawn(async move {
            watch
                .wait_for(|s| matches!(s, BridgeState::Registered { .. }))
                .await
                .map(|s| s.clone())
                .ok()
        });

        tokio::task::yield_now().await;
        bridge.register("u9");

        let state = waiter.await.unwrap().unwrap();
        assert_eq!(state.uid(), Some("u9"));
    }

    #[test]
    fn test_post_after_coordinator_gone() {
        let (port, coordinator, _to_widget) = port();
        drop(coordinator);
        let (bridge, _inbound) = ContextBridge::open(port);

        assert!(matches!(
            bridge.post(BridgeEnvelope::Ack),
            Err(EventingError::BridgeClosed)
        ));
    }
}
