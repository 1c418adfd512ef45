//! The relay engine.
//!
//! Live-traffic machinery on top of [`relay_proto`]: per-connection
//! sessions, the access-control gate, the subscription registry with
//! broadcast fan-out, the ingestion pipeline with deletion handling, the
//! query/count dispatcher, hook chains for application policy, the storage
//! contract, and the WebSocket server loop that ties them together.
//!
//! Embedding looks like:
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_engine::{MemoryStore, Relay, RelayConfig};
//!
//! # async fn run() -> Result<(), relay_engine::EngineError> {
//! let relay = Relay::new(RelayConfig::from_env()).with_store(Arc::new(MemoryStore::new()));
//! Arc::new(relay).run().await
//! # }
//! ```

pub mod access;
pub mod acl;
pub mod broadcast;
pub mod config;
pub mod delete;
pub mod error;
pub mod hooks;
pub mod ingest;
pub mod query;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

pub use access::AccessGate;
pub use acl::{AccessList, AclEntry, AclError, Role};
pub use config::RelayConfig;
pub use error::{EngineError, Rejection};
pub use hooks::{
    ConnectionHook, DeletionOverride, EventObserver, EventPolicy, EventRewrite, FilterPolicy,
    FilterRewrite, Hooks, PolicyDecision,
};
pub use query::TaskCounter;
pub use registry::{Registry, Subscription};
pub use server::Relay;
pub use session::{unix_now, ConnId, Outbound, Session};
pub use storage::{EventStore, MemoryStore, SaveOutcome, StorageError};
