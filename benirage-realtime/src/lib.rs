//! # benirage-realtime: Connection resilience layer for BENIRAGE
//!
//! Keeps one logical realtime connection to the Supabase backend alive,
//! buffers writes while it is down, and explains what is wrong when it
//! cannot recover.
//!
//! ## Architecture
//!
//! ```text
//!  network up/down          ┌────────────────────┐   probe / heartbeat   ┌──────────────┐
//! ┌──────────────┐ ───────► │ ConnectionManager  │ ────────────────────► │ Realtime     │
//! │NetworkMonitor│          │ state machine,     │ ◄──── row changes ─── │ Backend      │
//! └──────────────┘          │ backoff, channels  │                       │ (WS + REST)  │
//!                           └─────────┬──────────┘                       └──────▲───────┘
//!                                     │ state == connected                      │ replay
//!                                     ▼                                         │
//!                           ┌────────────────────┐      ┌─────────────┐         │
//!                           │ OfflineQueue       │ ───► │ QueueStore  │         │
//!                           │ per-target FIFO    │      │ (RocksDB)   │         │
//!                           └─────────┬──────────┘      └─────────────┘         │
//!                                     └─────────────── drain ───────────────────┘
//!
//!                           ┌────────────────────┐
//!                           │ Diagnostics        │  on demand, read-only
//!                           └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: connection state machine, reconnect, subscriptions
//! - [`queue`]: durable offline write queue
//! - [`diagnostics`]: layered connectivity probes and health report
//! - [`backend`]: backend seams and the Supabase implementation
//! - [`protocol`]: Phoenix channel frames
//! - [`network`]: online/offline signal
//! - [`config`] / [`error`]: tunables and the error taxonomy

pub mod backend;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod network;
pub mod protocol;
pub mod queue;

// Re-exports for convenience
pub use backend::{ChannelHandle, ChannelId, DataWriter, RealtimeBackend, SupabaseBackend};
pub use config::{BackendConfig, ConfigError, ConnectionConfig, DiagnosticsConfig};
pub use connection::{
    CallbackHandle, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState,
    ConnectionStatus, Subscription,
};
pub use diagnostics::{
    Check, CheckResult, DiagnosticResult, Diagnostics, HealthStatus, HttpProbe, NetworkProbe,
    NetworkSpeed, SpeedRating,
};
pub use error::{ErrorKind, TransportError};
pub use network::NetworkMonitor;
pub use protocol::{ChangeEvent, ChangeEventType, ChangeSpec, ChannelMessage, ChannelStatus};
pub use queue::{
    drain_on_connect, DrainReport, MemoryQueueStore, OfflineQueue, QueueError, QueuePolicy,
    QueueStatus, QueueStore, QueuedOperation, RocksQueueStore, StoreConfig, StoreError,
    SyncStatus,
};
