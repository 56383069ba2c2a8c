//! Coordinator router.
//!
//! Runs in the shared context. Hands out bridge ports, issues uids in
//! answer to `ack` and fans every `publish` out to all other registered
//! bridges.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use widgetbus_protocol::BridgeEnvelope;

use crate::bridge::{BridgeId, BridgePort, Inbound};

/// A bridge registration, owned by the coordinator.
struct BridgeEntry {
    tx: mpsc::UnboundedSender<BridgeEnvelope>,
    uid: Option<String>,
}

/// Coordinator statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Bridges attached, registered or not.
    pub attached: usize,
    /// Bridges that have been assigned a uid.
    pub registered: usize,
}

/// Generate a fresh identity token (128 random bits, hex).
#[must_use]
pub fn generate_uid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The shared coordinator.
///
/// Cheap to clone; clones share the same bridge table.
#[derive(Clone)]
pub struct CoordinatorRouter {
    bridges: Arc<DashMap<BridgeId, BridgeEntry>>,
    next_id: Arc<AtomicU64>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl CoordinatorRouter {
    /// Start a coordinator and the task that handles bridge traffic.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (inbound, mut rx) = mpsc::unbounded_channel::<Inbound>();
        let router = Self {
            bridges: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            inbound,
        };

        let worker = router.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                worker.handle(msg);
            }
            debug!("Coordinator stopped");
        });

        info!("Coordinator started");
        router
    }

    /// Attach a new widget context and return its end of the bridge.
    #[must_use]
    pub fn attach(&self) -> BridgePort {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.bridges.insert(id, BridgeEntry { tx, uid: None });
        debug!(bridge = id, "Bridge attached");
        BridgePort::new(id, self.inbound.clone(), rx)
    }

    /// Drop a bridge registration.
    ///
    /// Returns `false` if the bridge was unknown.
    pub fn detach(&self, id: BridgeId) -> bool {
        let removed = self.bridges.remove(&id).is_some();
        if removed {
            debug!(bridge = id, "Bridge detached");
        }
        removed
    }

    /// The uid assigned to a bridge, if any.
    #[must_use]
    pub fn uid_of(&self, id: BridgeId) -> Option<String> {
        self.bridges.get(&id).and_then(|entry| entry.uid.clone())
    }

    /// Get coordinator statistics.
    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            attached: self.bridges.len(),
            registered: self.bridges.iter().filter(|e| e.uid.is_some()).count(),
        }
    }

    /// Apply one envelope posted by a bridge.
    pub fn handle(&self, msg: Inbound) {
        let Inbound { from, envelope } = msg;
        match envelope {
            BridgeEnvelope::Ack => self.register(from),
            BridgeEnvelope::Publish { .. } => self.fan_out(from, &envelope),
            BridgeEnvelope::SetUid { .. } => {
                warn!(bridge = from, "Ignoring set_uid sent by a widget");
            }
        }
    }

    fn register(&self, id: BridgeId) {
        let Some(mut entry) = self.bridges.get_mut(&id) else {
            warn!(bridge = id, "Ack from unknown bridge");
            return;
        };

        if let Some(uid) = &entry.uid {
            debug!(bridge = id, uid = %uid, "Ack from registered bridge ignored");
            return;
        }

        let uid = generate_uid();
        entry.uid = Some(uid.clone());
        if entry.tx.send(BridgeEnvelope::set_uid(uid.as_str())).is_err() {
            trace!(bridge = id, "Bridge gone before set_uid");
        }
        info!(bridge = id, uid = %uid, "Bridge registered");
    }

    fn fan_out(&self, from: BridgeId, envelope: &BridgeEnvelope) {
        let sender_registered = self
            .bridges
            .get(&from)
            .is_some_and(|entry| entry.uid.is_some());
        if !sender_registered {
            warn!(bridge = from, "Publish from unregistered bridge dropped");
            return;
        }

        let mut recipients = 0usize;
        for entry in self.bridges.iter() {
            if *entry.key() == from || entry.uid.is_none() {
                continue;
            }
            // Posts to a torn-down context are a no-op.
            if entry.tx.send(envelope.clone()).is_ok() {
                recipients += 1;
            }
        }

        trace!(bridge = from, recipients, "Publish fanned out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Attach a bridge and drive its ack by hand.
    fn registered(router: &CoordinatorRouter) -> (BridgeId, mpsc::UnboundedReceiver<BridgeEnvelope>) {
        let port = router.attach();
        let id = port.id();
        let (_, _, rx) = port.into_parts();
        router.handle(Inbound {
            from: id,
            envelope: BridgeEnvelope::Ack,
        });
        (id, rx)
    }

    #[tokio::test]
    async fn test_ack_assigns_uid_once() {
        let router = CoordinatorRouter::spawn();
        let (id, mut rx) = registered(&router);

        let uid = match rx.try_recv().unwrap() {
            BridgeEnvelope::SetUid { uid } => uid,
            other => panic!("unexpected envelope: {:?}", other),
        };
        assert_eq!(uid.len(), 32);
        assert_eq!(router.uid_of(id), Some(uid));

        router.handle(Inbound {
            from: id,
            envelope: BridgeEnvelope::Ack,
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_skips_sender() {
        let router = CoordinatorRouter::spawn();
        let (a, mut rx_a) = registered(&router);
        let (_b, mut rx_b) = registered(&router);
        let (_c, mut rx_c) = registered(&router);
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            rx.try_recv().unwrap();
        }

        let envelope = BridgeEnvelope::publish("ping", json!("hi"), "u1");
        router.handle(Inbound {
            from: a,
            envelope: envelope.clone(),
        });

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), envelope);
        assert_eq!(rx_c.try_recv().unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_unregistered_bridges_excluded() {
        let router = CoordinatorRouter::spawn();
        let (a, mut rx_a) = registered(&router);
        rx_a.try_recv().unwrap();

        let pending = router.attach();
        let pending_id = pending.id();
        let (_, _, mut rx_pending) = pending.into_parts();

        router.handle(Inbound {
            from: a,
            envelope: BridgeEnvelope::publish("ping", json!(1), "u1"),
        });
        assert!(rx_pending.try_recv().is_err());

        // A publish from the unregistered bridge goes nowhere.
        router.handle(Inbound {
            from: pending_id,
            envelope: BridgeEnvelope::publish("ping", json!(2), "??"),
        });
        assert!(rx_a.try_recv().is_err());

        assert_eq!(
            router.stats(),
            CoordinatorStats {
                attached: 2,
                registered: 1
            }
        );
    }

    #[tokio::test]
    async fn test_dead_bridge_is_harmless() {
        let router = CoordinatorRouter::spawn();
        let (a, mut rx_a) = registered(&router);
        let (b, rx_b) = registered(&router);
        rx_a.try_recv().unwrap();
        drop(rx_b);

        router.handle(Inbound {
            from: a,
            envelope: BridgeEnvelope::publish("ping", json!("hi"), "u1"),
        });
        assert_eq!(router.stats().attached, 2);

        assert!(router.detach(b));
        assert!(!router.detach(b));
        assert_eq!(router.stats().attached, 1);
    }

    #[test]
    fn test_uids_are_distinct() {
        assert_ne!(generate_uid(), generate_uid());
    }
}
