//! Socket lifecycle manager.
//!
//! Decides who owns the broker socket of a session at any time: the
//! foreground connection, the background host holding a parked socket, or a
//! background activation that has resumed it. Ownership changes are
//! coordinated through the host contract and two advisory locks.

use push_session::{
    handoff_window, session_name_from_socket_id, socket_id_for, ConnectionConfig, HttpCapability,
    PushConnection, PushError, PushEvent, PushSession, SocketBroker, WAIT_TIME,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, Result};
use crate::host::{
    Activation, ActivationReason, BackgroundHost, TriggerKind, TriggerRegistration,
    REPLY_ACTION_TASK, SOCKET_ACTIVITY_TASK, SOCKET_REFRESH_INTERVAL, SOCKET_REFRESH_TASK,
};
use crate::lock::{AdvisoryLocks, LockGuard};
use crate::store::SessionStore;

/// Entry point recorded with every trigger registration
pub const ACTIVATION_ENTRY_POINT: &str = "push_lifecycle::SocketLifecycleManager::run_activation";

/// Default pause before restarting after a socket-closed activation
pub const SOCKET_CLOSED_GRACE: Duration = Duration::from_secs(3);

/// Lifecycle manager configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Settings for connections the manager creates
    pub connection: ConnectionConfig,
    /// How long a resumed connection runs before handing the socket back
    pub wait_time: Duration,
    /// Pause before restarting after the parked socket was closed
    pub socket_closed_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            wait_time: WAIT_TIME,
            socket_closed_grace: SOCKET_CLOSED_GRACE,
        }
    }
}

/// Connection resumed from an activation, with the locks that guard it
#[derive(Debug)]
pub struct ResumedConnection {
    /// The running connection
    pub connection: PushConnection,
    _socket_lock: LockGuard,
    foreground_lock: Option<LockGuard>,
}

impl ResumedConnection {
    /// Whether the foreground lock is held, which is the case after a
    /// restart following a socket-closed activation
    pub fn holds_foreground_lock(&self) -> bool {
        self.foreground_lock.is_some()
    }
}

/// Owner-side coordinator of background sockets
pub struct SocketLifecycleManager<H> {
    host: Arc<H>,
    locks: Arc<dyn AdvisoryLocks>,
    store: Arc<dyn SessionStore>,
    http: Arc<dyn HttpCapability>,
    config: LifecycleConfig,
    event_sink: Option<mpsc::UnboundedSender<(String, PushEvent)>>,
}

impl<H> std::fmt::Debug for SocketLifecycleManager<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketLifecycleManager")
            .field("config", &self.config)
            .field("event_sink", &self.event_sink.is_some())
            .finish()
    }
}

impl<H: BackgroundHost + 'static> SocketLifecycleManager<H> {
    /// Create a manager
    pub fn new(
        host: Arc<H>,
        locks: Arc<dyn AdvisoryLocks>,
        store: Arc<dyn SessionStore>,
        http: Arc<dyn HttpCapability>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            host,
            locks,
            store,
            http,
            config,
            event_sink: None,
        }
    }

    /// Forward events of every connection this manager creates to `sink`,
    /// tagged with the connection's socket id
    pub fn with_event_sink(mut self, sink: mpsc::UnboundedSender<(String, PushEvent)>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Background host
    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    /// Advisory lock provider
    pub fn locks(&self) -> &Arc<dyn AdvisoryLocks> {
        &self.locks
    }

    /// Manager configuration
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Idle connection for `session`, handing sockets off to the host
    pub fn connection_for(&self, session: Arc<PushSession>) -> PushConnection {
        let broker: Arc<dyn SocketBroker> = self.host.clone();
        let connection = PushConnection::new(
            session,
            self.config.connection.clone(),
            broker,
            self.http.clone(),
        );

        if let Some(sink) = &self.event_sink {
            let mut events = connection.subscribe();
            let sink = sink.clone();
            let socket_id = connection.socket_id().to_string();
            tokio::spawn(async move {
                // Ends when the connection detaches its subscribers on teardown
                while let Some(event) = events.recv().await {
                    if sink.send((socket_id.clone(), event)).is_err() {
                        break;
                    }
                }
            });
        }

        connection
    }

    /// Make sure background execution is granted and the triggers exist.
    ///
    /// Returns the socket-activity registration, or `None` when access is
    /// refused or that trigger could not be registered.
    pub async fn request_background_capability(&self) -> Option<TriggerRegistration> {
        let existing = self.host.registered_triggers();
        let reply_supported = self.host.supports_trigger(&TriggerKind::ReplyAction);

        let mut required = vec![SOCKET_ACTIVITY_TASK, SOCKET_REFRESH_TASK];
        if reply_supported {
            required.push(REPLY_ACTION_TASK);
        }
        let complete = required
            .iter()
            .all(|name| existing.iter().any(|t| t.name == *name));

        if complete {
            debug!("Background triggers already registered");
        } else {
            match self.host.request_access().await {
                Ok(status) if status.is_granted() => {
                    debug!("Background access granted: {:?}", status)
                }
                Ok(status) => {
                    warn!("Background access refused: {:?}", status);
                    return None;
                }
                Err(e) => {
                    warn!("Background access request failed: {}", e);
                    return None;
                }
            }
        }

        let socket_activity =
            self.register_once(&existing, SOCKET_ACTIVITY_TASK, TriggerKind::SocketActivity);
        if reply_supported {
            self.register_once(&existing, REPLY_ACTION_TASK, TriggerKind::ReplyAction);
        }
        self.register_once(
            &existing,
            SOCKET_REFRESH_TASK,
            TriggerKind::TimeRefresh {
                interval: SOCKET_REFRESH_INTERVAL,
            },
        );

        socket_activity
    }

    fn register_once(
        &self,
        existing: &[TriggerRegistration],
        name: &str,
        kind: TriggerKind,
    ) -> Option<TriggerRegistration> {
        if let Some(found) = existing.iter().find(|t| t.name == name) {
            return Some(found.clone());
        }
        match self
            .host
            .register_trigger(name, ACTIVATION_ENTRY_POINT, kind)
        {
            Ok(registration) => Some(registration),
            Err(e) => {
                warn!("Failed to register trigger {}: {}", name, e);
                None
            }
        }
    }

    /// Whether the host holds a parked socket under `socket_id`
    pub fn is_socket_registered(&self, socket_id: &str) -> bool {
        self.host.is_socket_registered(socket_id)
    }

    /// Start the foreground connection for `session`.
    ///
    /// Defers to the background when the host already holds a socket for the
    /// session. Errors are logged and yield `None`.
    pub async fn start_from_foreground(
        &self,
        session: Arc<PushSession>,
    ) -> Option<PushConnection> {
        let socket_id = session.socket_id();
        if self.is_socket_registered(&socket_id) {
            info!(
                "Socket {} is held by the background host, not starting",
                socket_id
            );
            return None;
        }

        if self.request_background_capability().await.is_none() {
            warn!("Background capability unavailable, push not started");
            return None;
        }

        let connection = self.connection_for(session);
        match connection.start_fresh().await {
            Ok(()) => Some(connection),
            Err(e) if e.is_expected_race() => {
                debug!("Foreground start skipped: {}", e);
                None
            }
            Err(e) => {
                warn!("Failed to start push connection {}: {}", socket_id, e);
                None
            }
        }
    }

    /// Resume the session behind an activation.
    ///
    /// Returns `Ok(None)` when another owner holds the socket lock, the
    /// foreground is live after a socket-closed activation, or the resumed
    /// connection could not be started. A live socket that loses the lock is
    /// given back to the host still open.
    pub async fn resume_from_activation(
        &self,
        activation: &mut Activation,
    ) -> Result<Option<ResumedConnection>> {
        let socket_id = activation.socket_id.clone();
        let Some(session_name) = session_name_from_socket_id(&socket_id) else {
            debug!("Ignoring activation for socket id {:?}", socket_id);
            return Ok(None);
        };

        let Some(socket_lock) = self.locks.try_acquire_socket_lock(&socket_id)? else {
            debug!("Socket {} is owned elsewhere", socket_id);
            if activation.reason != ActivationReason::SocketClosed {
                self.return_socket(activation).await;
            }
            return Ok(None);
        };

        let record = match self.store.load(session_name).await? {
            Some(record) => record,
            None if activation.reason == ActivationReason::SocketClosed => {
                debug!("No session for closed socket {}", socket_id);
                return Ok(None);
            }
            None => return Err(LifecycleError::MissingSession(session_name.to_string())),
        };
        let connection = self.connection_for(Arc::new(PushSession::from_record(record)));

        match activation.reason {
            ActivationReason::SocketActivity | ActivationReason::KeepAliveTimerExpired => {
                let Some(socket) = activation.socket.take() else {
                    debug!("Activation for {} carried no socket", socket_id);
                    return Ok(None);
                };
                let buffered = std::mem::take(&mut activation.buffered);
                if let Err(e) = connection
                    .start_with_handed_off_socket(socket, buffered)
                    .await
                {
                    debug!("Failed to resume {}: {}", socket_id, e);
                    return Ok(None);
                }
                Ok(Some(ResumedConnection {
                    connection,
                    _socket_lock: socket_lock,
                    foreground_lock: None,
                }))
            }
            ActivationReason::SocketClosed => {
                tokio::select! {
                    _ = activation.cancellation.cancelled() => {
                        return Err(PushError::Cancelled.into());
                    }
                    _ = tokio::time::sleep(self.config.socket_closed_grace) => {}
                }

                let Some(foreground_lock) = self.locks.try_acquire_foreground_lock(session_name)?
                else {
                    info!("Main application is running.");
                    return Ok(None);
                };

                drop(activation.socket.take());
                if let Err(e) = connection.start_fresh().await {
                    debug!("Failed to restart {}: {}", socket_id, e);
                    return Ok(None);
                }
                Ok(Some(ResumedConnection {
                    connection,
                    _socket_lock: socket_lock,
                    foreground_lock: Some(foreground_lock),
                }))
            }
        }
    }

    /// Process one host activation to completion.
    ///
    /// Never fails: every error is logged and the deferral is completed on
    /// every path.
    pub async fn run_activation(&self, mut activation: Activation) {
        let socket_id = activation.socket_id.clone();
        info!("Activation {:?} for {}", activation.reason, socket_id);

        match self.process_activation(&mut activation).await {
            Ok(()) => debug!("Activation for {} finished", socket_id),
            Err(LifecycleError::Push(PushError::Cancelled)) => {
                info!("Activation for {} cancelled by host", socket_id)
            }
            Err(e) => error!("Can't finish push cycle for {}: {}. Abort.", socket_id, e),
        }

        activation.deferral.complete();
    }

    async fn process_activation(&self, activation: &mut Activation) -> Result<()> {
        if activation.cancellation.is_cancelled() {
            return Err(PushError::Cancelled.into());
        }

        let Some(resumed) = self.resume_from_activation(activation).await? else {
            return Ok(());
        };
        let connection = resumed.connection.clone();

        tokio::select! {
            _ = activation.cancellation.cancelled() => {
                info!("Host cancelled {}, handing the socket back early", connection.socket_id());
            }
            _ = tokio::time::sleep(self.config.wait_time) => {}
        }

        if let Err(e) = connection.transfer_away().await {
            warn!("Failed to hand {} back: {}", connection.socket_id(), e);
        }
        if !connection.is_transferred() {
            connection.shutdown().await;
        }

        let saved = self.store.save(&connection.session().to_record()).await;
        connection.events().clear();
        drop(resumed);
        saved
    }

    /// Park the activation's socket with the host again, unread bytes included
    async fn return_socket(&self, activation: &mut Activation) {
        let Some(socket) = activation.socket.take() else {
            return;
        };
        let buffered = std::mem::take(&mut activation.buffered);
        let window = handoff_window(self.config.connection.keep_alive_secs);
        match self
            .host
            .transfer_ownership(&activation.socket_id, socket, buffered, window)
            .await
        {
            Ok(()) => debug!("Returned socket {} to the host", activation.socket_id),
            Err(e) => warn!(
                "Host refused socket {}, closing it: {}",
                activation.socket_id, e
            ),
        }
    }

    /// Close the socket the host holds for `session_name`
    pub fn dispose_background_socket(&self, session_name: &str) -> bool {
        let socket_id = socket_id_for(session_name);
        let disposed = self.host.dispose_socket(&socket_id);
        if disposed {
            info!("Disposed background socket {}", socket_id);
        }
        disposed
    }

    /// Remove every background trigger
    pub fn unregister_tasks(&self) {
        self.host.unregister_all_triggers();
    }
}
