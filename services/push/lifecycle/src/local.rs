//! In-process background host.
//!
//! Parks handed-off sockets inside the running process and turns socket
//! activity, peer hang-up or window expiry into [`Activation`]s delivered on a
//! channel. Used by the daemon and by tests in place of an OS broker.
//!
//! Each activation gets an execution budget. When its deferral is not
//! completed within the budget the host cancels the activation.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use push_session::{IoStream, SocketBroker, StreamActivity};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LifecycleError, Result};
use crate::host::{
    AccessStatus, Activation, ActivationReason, BackgroundHost, TriggerKind, TriggerRegistration,
};

/// Time an activation may run before the host cancels it
pub const ACTIVATION_BUDGET: Duration = Duration::from_secs(25);

struct ParkedSocket {
    id: Uuid,
    release: CancellationToken,
}

/// Background host that keeps parked sockets in this process
pub struct InProcessHost {
    access: AccessStatus,
    reply_action_supported: bool,
    access_requests: AtomicUsize,
    activation_budget: Duration,
    triggers: Arc<DashMap<String, TriggerRegistration>>,
    sockets: Arc<DashMap<String, ParkedSocket>>,
    activations: mpsc::UnboundedSender<Activation>,
}

impl InProcessHost {
    /// Create a host answering access requests with `access`.
    ///
    /// Returns the host and the receiver activations are delivered on.
    pub fn new(
        access: AccessStatus,
        reply_action_supported: bool,
    ) -> (Self, mpsc::UnboundedReceiver<Activation>) {
        let (activations, rx) = mpsc::unbounded_channel();
        (
            Self {
                access,
                reply_action_supported,
                access_requests: AtomicUsize::new(0),
                activation_budget: ACTIVATION_BUDGET,
                triggers: Arc::new(DashMap::new()),
                sockets: Arc::new(DashMap::new()),
                activations,
            },
            rx,
        )
    }

    /// Override the execution budget given to each activation
    pub fn with_activation_budget(mut self, budget: Duration) -> Self {
        self.activation_budget = budget;
        self
    }

    /// Number of access requests answered so far
    pub fn access_requests(&self) -> usize {
        self.access_requests.load(Ordering::Relaxed)
    }

    /// Number of parked sockets
    pub fn parked_count(&self) -> usize {
        self.sockets.len()
    }
}

impl std::fmt::Debug for InProcessHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessHost")
            .field("access", &self.access)
            .field("triggers", &self.triggers.len())
            .field("sockets", &self.sockets.len())
            .finish()
    }
}

#[async_trait]
impl SocketBroker for InProcessHost {
    async fn transfer_ownership(
        &self,
        socket_id: &str,
        socket: IoStream,
        buffered: Bytes,
        keep_alive_window: Duration,
    ) -> io::Result<()> {
        let parked = ParkedSocket {
            id: Uuid::new_v4(),
            release: CancellationToken::new(),
        };
        let token = parked.id;
        let release = parked.release.clone();

        match self.sockets.entry(socket_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("socket {} is already parked", socket_id),
                ));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(parked);
            }
        }
        info!(
            "Parked socket {} (window {}s)",
            socket_id,
            keep_alive_window.as_secs()
        );

        let socket_id = socket_id.to_string();
        let sockets = self.sockets.clone();
        let triggers = self.triggers.clone();
        let activations = self.activations.clone();
        let budget = self.activation_budget;

        tokio::spawn(async move {
            let reason = tokio::select! {
                biased;
                _ = release.cancelled() => {
                    debug!("Released parked socket {}", socket_id);
                    return;
                }
                // Read-ahead bytes are pending input already
                _ = std::future::ready(()), if !buffered.is_empty() => ActivationReason::SocketActivity,
                activity = socket.wait_for_activity() => match activity {
                    Ok(StreamActivity::Readable) => ActivationReason::SocketActivity,
                    Ok(StreamActivity::Closed) => ActivationReason::SocketClosed,
                    Err(e) => {
                        debug!("Parked socket {} failed: {}", socket_id, e);
                        ActivationReason::SocketClosed
                    }
                },
                _ = tokio::time::sleep(keep_alive_window) => ActivationReason::KeepAliveTimerExpired,
            };

            sockets.remove_if(&socket_id, |_, parked| parked.id == token);

            let has_trigger = triggers
                .iter()
                .any(|t| t.value().kind == TriggerKind::SocketActivity);
            if !has_trigger {
                warn!(
                    "No socket activity trigger registered; dropping socket {}",
                    socket_id
                );
                return;
            }

            debug!("Activating {} with {:?}", socket_id, reason);
            let (activation, mut done) = Activation::new(socket_id.clone(), reason, Some(socket));
            let activation = activation.with_buffered(buffered);
            let cancellation = activation.cancellation.clone();
            if activations.send(activation).is_err() {
                debug!("Activation receiver gone");
                return;
            }

            if tokio::time::timeout(budget, &mut done).await.is_err() {
                warn!(
                    "Activation for {} exceeded {}s, cancelling",
                    socket_id,
                    budget.as_secs()
                );
                cancellation.cancel();
                let _ = done.await;
            }
            debug!("Activation for {} completed", socket_id);
        });

        Ok(())
    }
}

#[async_trait]
impl BackgroundHost for InProcessHost {
    async fn request_access(&self) -> Result<AccessStatus> {
        self.access_requests.fetch_add(1, Ordering::Relaxed);
        Ok(self.access)
    }

    fn registered_triggers(&self) -> Vec<TriggerRegistration> {
        self.triggers.iter().map(|t| t.value().clone()).collect()
    }

    fn supports_trigger(&self, kind: &TriggerKind) -> bool {
        match kind {
            TriggerKind::ReplyAction => self.reply_action_supported,
            _ => true,
        }
    }

    fn register_trigger(
        &self,
        name: &str,
        entry_point: &str,
        kind: TriggerKind,
    ) -> Result<TriggerRegistration> {
        if !self.supports_trigger(&kind) {
            return Err(LifecycleError::Host(format!(
                "trigger kind {:?} is not supported",
                kind
            )));
        }
        if let Some(existing) = self.triggers.get(name) {
            return Ok(existing.value().clone());
        }
        let registration = TriggerRegistration {
            id: Uuid::new_v4(),
            name: name.to_string(),
            entry_point: entry_point.to_string(),
            kind,
        };
        self.triggers
            .insert(name.to_string(), registration.clone());
        info!("Registered trigger {}", name);
        Ok(registration)
    }

    fn unregister_all_triggers(&self) {
        let count = self.triggers.len();
        self.triggers.clear();
        info!("Unregistered {} triggers", count);
    }

    fn is_socket_registered(&self, socket_id: &str) -> bool {
        self.sockets.contains_key(socket_id)
    }

    fn dispose_socket(&self, socket_id: &str) -> bool {
        match self.sockets.remove(socket_id) {
            Some((_, parked)) => {
                parked.release.cancel();
                debug!("Disposed parked socket {}", socket_id);
                true
            }
            None => false,
        }
    }
}
