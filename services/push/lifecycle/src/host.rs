//! Contract of the host environment that runs code in the background.
//!
//! The host grants background execution, keeps a registry of triggers, takes
//! ownership of transferred sockets and wakes the process with an
//! [`Activation`] when a parked socket needs attention.

use async_trait::async_trait;
use bytes::Bytes;
use push_session::{IoStream, SocketBroker};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

/// Trigger fired when a parked socket becomes active
pub const SOCKET_ACTIVITY_TASK: &str = "BackgroundPushClient.SocketActivity";

/// Timer trigger keeping the socket fresh
pub const SOCKET_REFRESH_TASK: &str = "BackgroundPushClient.SocketRefresh";

/// Trigger fired by notification reply actions
pub const REPLY_ACTION_TASK: &str = "BackgroundPushClient.ReplyAction";

/// Interval of the refresh timer
pub const SOCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Answer to a background access request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    /// Background execution allowed
    Allowed,
    /// Allowed while the device is plugged in or otherwise unrestricted
    AllowedWithRestrictions,
    /// Refused by the user
    DeniedByUser,
    /// Refused by system policy
    DeniedBySystemPolicy,
    /// Host gave no answer
    Unspecified,
}

impl AccessStatus {
    /// Whether background execution may be used
    pub fn is_granted(self) -> bool {
        matches!(
            self,
            AccessStatus::Allowed | AccessStatus::AllowedWithRestrictions
        )
    }
}

/// What fires a background trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerKind {
    /// Activity on a parked socket
    SocketActivity,
    /// Fixed-interval timer
    TimeRefresh {
        /// Timer period
        interval: Duration,
    },
    /// Reply action on a notification
    ReplyAction,
}

/// A registered background trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRegistration {
    /// Host-assigned id
    pub id: Uuid,
    /// Unique trigger name
    pub name: String,
    /// Entry point run when the trigger fires
    pub entry_point: String,
    /// Trigger kind
    pub kind: TriggerKind,
}

/// Why the host woke the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationReason {
    /// Data arrived on the parked socket
    SocketActivity,
    /// The hand-off keep-alive window ran out
    KeepAliveTimerExpired,
    /// The parked socket was closed
    SocketClosed,
}

/// Handle the host waits on until activation processing is finished.
///
/// Completed exactly once, explicitly or when dropped.
#[derive(Debug)]
pub struct Deferral {
    done: Option<oneshot::Sender<()>>,
}

impl Deferral {
    /// New deferral and the receiver the host waits on
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { done: Some(tx) }, rx)
    }

    /// Signal completion
    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl Drop for Deferral {
    fn drop(&mut self) {
        self.finish();
    }
}

/// One wake-up delivered by the host
pub struct Activation {
    /// Socket id the activation is for
    pub socket_id: String,
    /// Why the host woke the process
    pub reason: ActivationReason,
    /// Parked socket, handed back to the process
    pub socket: Option<IoStream>,
    /// Bytes read from `socket` by its previous owner and not yet decoded
    pub buffered: Bytes,
    /// Completion handle
    pub deferral: Deferral,
    /// Cancelled when the host revokes the execution slot
    pub cancellation: CancellationToken,
}

impl Activation {
    /// Build an activation and the receiver that observes its completion
    pub fn new(
        socket_id: impl Into<String>,
        reason: ActivationReason,
        socket: Option<IoStream>,
    ) -> (Self, oneshot::Receiver<()>) {
        let (deferral, done) = Deferral::new();
        (
            Self {
                socket_id: socket_id.into(),
                reason,
                socket,
                buffered: Bytes::new(),
                deferral,
                cancellation: CancellationToken::new(),
            },
            done,
        )
    }

    /// Attach bytes the previous owner read ahead of the socket
    pub fn with_buffered(mut self, buffered: Bytes) -> Self {
        self.buffered = buffered;
        self
    }
}

impl std::fmt::Debug for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activation")
            .field("socket_id", &self.socket_id)
            .field("reason", &self.reason)
            .field("has_socket", &self.socket.is_some())
            .field("buffered", &self.buffered.len())
            .finish()
    }
}

/// Background execution host
#[async_trait]
pub trait BackgroundHost: SocketBroker {
    /// Ask for permission to run in the background
    async fn request_access(&self) -> Result<AccessStatus>;

    /// Triggers currently registered
    fn registered_triggers(&self) -> Vec<TriggerRegistration>;

    /// Whether the host can fire triggers of this kind
    fn supports_trigger(&self, kind: &TriggerKind) -> bool;

    /// Register a trigger
    fn register_trigger(
        &self,
        name: &str,
        entry_point: &str,
        kind: TriggerKind,
    ) -> Result<TriggerRegistration>;

    /// Remove every registered trigger
    fn unregister_all_triggers(&self);

    /// Whether a socket is parked under `socket_id`
    fn is_socket_registered(&self, socket_id: &str) -> bool;

    /// Close and forget the socket parked under `socket_id`
    fn dispose_socket(&self, socket_id: &str) -> bool;
}
