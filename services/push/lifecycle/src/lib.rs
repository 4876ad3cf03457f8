//! Background ownership of push sockets.
//!
//! A push connection hands its socket to a background host once registration
//! completes. This crate coordinates everything around that hand-off:
//!
//! - **Background capability**: access grant and trigger registration
//! - **Activations**: resuming a parked socket when the host wakes the process
//! - **Advisory locks**: file locks keeping one owner per socket across processes
//! - **In-process host**: a host implementation for a single daemon process
//!
//! ## Example
//!
//! ```rust,no_run
//! use push_lifecycle::{
//!     AccessStatus, FileLocks, InProcessHost, LifecycleConfig, MemorySessionStore,
//!     SocketLifecycleManager,
//! };
//! use push_session::HttpCapability;
//! use std::sync::Arc;
//!
//! # async fn example(http: Arc<dyn HttpCapability>) -> anyhow::Result<()> {
//! let (host, mut activations) = InProcessHost::new(AccessStatus::Allowed, false);
//! let manager = SocketLifecycleManager::new(
//!     Arc::new(host),
//!     Arc::new(FileLocks::new("/tmp/push-locks")?),
//!     Arc::new(MemorySessionStore::new()),
//!     http,
//!     LifecycleConfig::default(),
//! );
//!
//! while let Some(activation) = activations.recv().await {
//!     manager.run_activation(activation).await;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod host;
pub mod local;
pub mod lock;
pub mod manager;
pub mod store;

// Re-export main types
pub use error::{LifecycleError, Result};
pub use host::{
    AccessStatus, Activation, ActivationReason, BackgroundHost, Deferral, TriggerKind,
    TriggerRegistration, REPLY_ACTION_TASK, SOCKET_ACTIVITY_TASK, SOCKET_REFRESH_INTERVAL,
    SOCKET_REFRESH_TASK,
};
pub use local::{InProcessHost, ACTIVATION_BUDGET};
pub use lock::{AdvisoryLocks, FileLocks, LockGuard};
pub use manager::{
    LifecycleConfig, ResumedConnection, SocketLifecycleManager, ACTIVATION_ENTRY_POINT,
    SOCKET_CLOSED_GRACE,
};
pub use store::{MemorySessionStore, SessionStore};
