//! # widgetbus-core
//!
//! Publish/subscribe fabric for isolated widgets.
//!
//! - **ChannelRegistry** - per-widget channel to handler map
//! - **ContextBridge** - a widget's link to the shared coordinator
//! - **CoordinatorRouter** - issues uids and fans publishes out to sibling widgets
//! - **RelayClient** - mirrors publishes to a broadcast server
//! - **RoomHub** - room-scoped broadcast with membership and archive
//! - **RoomStore** - persistence for membership and archives
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  bridge  ┌─────────────┐  bridge  ┌──────────┐
//! │ Registry │─────────▶│ Coordinator │─────────▶│ Registry │
//! └──────────┘          └─────────────┘          └──────────┘
//!      │ relay                                        ▲ relay
//!      ▼                                              │
//! ┌──────────┐          ┌─────────────┐          ┌──────────┐
//! │  Relay   │─────────▶│   RoomHub   │─────────▶│  Relay   │
//! └──────────┘          └─────────────┘          └──────────┘
//!                              │
//!                              ▼
//!                       ┌─────────────┐
//!                       │  RoomStore  │
//!                       └─────────────┘
//! ```

pub mod bridge;
pub mod coordinator;
pub mod hub;
pub mod message;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod session;
pub mod store;

pub use bridge::{BridgeId, BridgePort, BridgeState, ContextBridge};
pub use coordinator::{CoordinatorRouter, CoordinatorStats};
pub use hub::{HubConfig, HubStats, RoomHub, DEFAULT_ROOM};
pub use message::ArchivedMessage;
pub use registry::{ChannelRegistry, EventingError};
pub use relay::{RelayClient, RelayError, SubscriptionToken};
pub use rooms::RoomTable;
pub use session::{serve, SessionSummary};
pub use store::{MemoryStore, RoomStore, StoreError};
