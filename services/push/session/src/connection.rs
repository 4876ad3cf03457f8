//! Push connection engine.
//!
//! A [`PushConnection`] owns the broker socket for one session. It runs a
//! single read task per connection, drives registration when the broker
//! accepts the session, and hands the socket to a [`SocketBroker`] when the
//! foreground is done with it.
//!
//! ```text
//! Idle -> Connecting -> Connected -> Registering -> Registered -> Transferred
//!                           \-> ShuttingDown -> Idle
//! ```

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use push_wire::{
    ConnectReturnCode, Packet, PacketDecoder, PubAckPacket, PublishPacket, PushTopic,
    QualityOfService, DEFAULT_MAX_PACKET_SIZE,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::data::PushSession;
use crate::error::{ConcurrencyError, ProtocolError, PushError, Result, TransportError};
use crate::events::{EventHub, PushEvent, Subscription};
use crate::handshake::{recv_packet, send_connect, send_packet};
use crate::keepalive::{build_ping, handoff_window, transfer_grace, KEEP_ALIVE_SECS, WAIT_TIME};
use crate::notification::PushNotification;
use crate::registration::{HttpCapability, RegistrationConfig, RegistrationWorkflow};
use crate::transport::{connect_tcp, tls, IoStream};

/// Default broker host
pub const DEFAULT_BROKER_HOST: &str = "mqtt-mini.facebook.com";

/// Default broker port
pub const DEFAULT_BROKER_PORT: u16 = 443;

/// TLS client configuration for the broker connection
#[derive(Clone, Debug)]
pub struct TlsClientConfig {
    /// Rustls client configuration
    pub client_config: Arc<rustls::ClientConfig>,
    /// Server name for SNI
    pub server_name: String,
}

/// Configuration for a push connection
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// TLS settings; `None` connects over plain TCP
    pub tls: Option<TlsClientConfig>,
    /// Keep-alive negotiated in CONNECT
    pub keep_alive_secs: u16,
    /// Delay between registration completing and the socket hand-off
    pub transfer_grace: Duration,
    /// Largest frame accepted from the broker
    pub max_packet_size: usize,
    /// Registration settings
    pub registration: RegistrationConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BROKER_HOST.to_string(),
            port: DEFAULT_BROKER_PORT,
            tls: None,
            keep_alive_secs: KEEP_ALIVE_SECS,
            transfer_grace: transfer_grace(WAIT_TIME),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            registration: RegistrationConfig::default(),
        }
    }
}

/// Receiver of sockets handed off by a connection
#[async_trait]
pub trait SocketBroker: Send + Sync {
    /// Take ownership of `socket` under `socket_id`, keeping it alive for
    /// `keep_alive_window`.
    ///
    /// `buffered` holds bytes already read from the socket but not yet
    /// decoded; the next owner must consume them before reading the socket.
    async fn transfer_ownership(
        &self,
        socket_id: &str,
        socket: IoStream,
        buffered: Bytes,
        keep_alive_window: Duration,
    ) -> std::io::Result<()>;
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket
    Idle,
    /// Opening the socket
    Connecting,
    /// Socket open, read loop running
    Connected,
    /// Broker accepted the session; registration in progress
    Registering,
    /// Registration confirmed
    Registered,
    /// Socket handed off; terminal for this instance
    Transferred,
    /// Cancellation requested, resources being released
    ShuttingDown,
}

#[derive(Default)]
struct Inner {
    /// Set from the start of `start_*` until teardown has completed
    running: bool,
    /// One-shot hand-off flag
    transferred: bool,
    cancel: Option<CancellationToken>,
    reader: Option<JoinHandle<Option<(ReadHalf<IoStream>, BytesMut)>>>,
}

struct Shared {
    socket_id: String,
    session: Arc<PushSession>,
    config: ConnectionConfig,
    broker: Arc<dyn SocketBroker>,
    http: Arc<dyn HttpCapability>,
    events: EventHub,
    inner: Mutex<Inner>,
    writer: tokio::sync::Mutex<Option<WriteHalf<IoStream>>>,
    registration: Mutex<Option<RegistrationWorkflow>>,
    state: watch::Sender<ConnectionState>,
}

/// Handle to the push connection of one session
#[derive(Clone)]
pub struct PushConnection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PushConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushConnection")
            .field("socket_id", &self.shared.socket_id)
            .field("state", &self.state())
            .finish()
    }
}

impl PushConnection {
    /// Create an idle connection for `session`
    pub fn new(
        session: Arc<PushSession>,
        config: ConnectionConfig,
        broker: Arc<dyn SocketBroker>,
        http: Arc<dyn HttpCapability>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            shared: Arc::new(Shared {
                socket_id: session.socket_id(),
                session,
                config,
                broker,
                http,
                events: EventHub::new(),
                inner: Mutex::new(Inner::default()),
                writer: tokio::sync::Mutex::new(None),
                registration: Mutex::new(None),
                state,
            }),
        }
    }

    /// Socket id this connection registers with the background host
    pub fn socket_id(&self) -> &str {
        &self.shared.socket_id
    }

    /// Session the connection belongs to
    pub fn session(&self) -> &Arc<PushSession> {
        &self.shared.session
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether the connection is started and not being torn down
    pub fn is_running(&self) -> bool {
        let inner = self.shared.lock_inner();
        inner.running
            && inner.cancel.as_ref().is_some_and(|c| !c.is_cancelled())
            && self.state() != ConnectionState::Connecting
    }

    /// Whether the socket has been handed off
    pub fn is_transferred(&self) -> bool {
        self.shared.lock_inner().transferred
    }

    /// Attach an event subscriber
    pub fn subscribe(&self) -> Subscription {
        self.shared.events.subscribe()
    }

    /// Event hub of this connection
    pub fn events(&self) -> &EventHub {
        &self.shared.events
    }

    /// Open a new socket to the broker, send CONNECT and start reading
    pub async fn start_fresh(&self) -> Result<()> {
        if !self.shared.session.is_authenticated() {
            return Err(PushError::NotAuthenticated);
        }

        let cancel = self.shared.claim()?;
        info!("Starting fresh push connection for {}", self.shared.socket_id);

        match self.open_and_connect(&cancel).await {
            Ok((reader, writer)) => {
                self.shared
                    .launch(self, reader, writer, BytesMut::new(), &cancel)?;
                self.ping_after_start().await;
                Ok(())
            }
            Err(e) => {
                self.shared.abandon_start();
                Err(e)
            }
        }
    }

    /// Resume on a socket handed back by the background host.
    ///
    /// The broker already considers the session connected, so no CONNECT is
    /// sent; the read loop starts and a ping announces the client. `buffered`
    /// are bytes the previous owner read but did not decode; they are decoded
    /// before anything read from the socket.
    pub async fn start_with_handed_off_socket(
        &self,
        socket: IoStream,
        buffered: Bytes,
    ) -> Result<()> {
        let cancel = self.shared.claim()?;
        info!(
            "Starting with existing socket for {} ({} buffered bytes)",
            self.shared.socket_id,
            buffered.len()
        );

        let (reader, writer) = tokio::io::split(socket);
        self.shared
            .launch(self, reader, writer, BytesMut::from(buffered.as_ref()), &cancel)?;
        self.ping_after_start().await;
        Ok(())
    }

    /// Send a PINGREQ
    pub async fn send_ping(&self) -> Result<()> {
        if !self.is_running() {
            return Err(ConcurrencyError::NotRunning.into());
        }
        self.shared.send(&build_ping()).await?;
        debug!("Pinging push server");
        Ok(())
    }

    /// Stop the connection and close the socket.
    ///
    /// Returns once the read loop has exited. A no-op when not running or
    /// when a transfer already owns the teardown.
    pub async fn shutdown(&self) {
        let reader = {
            let mut inner = self.shared.lock_inner();
            let Some(cancel) = inner.cancel.as_ref().filter(|c| !c.is_cancelled()) else {
                return;
            };
            if !inner.running || inner.transferred {
                return;
            }
            info!("Stopping push connection for {}", self.shared.socket_id);
            cancel.cancel();
            self.shared.set_state(ConnectionState::ShuttingDown);
            inner.reader.take()
        };

        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                error!("Push read loop for {} panicked: {}", self.shared.socket_id, e);
                self.shared.finish_teardown(ConnectionState::Idle).await;
            }
        }
    }

    /// Hand the socket to the background host.
    ///
    /// One-shot: only the first call on a running, authenticated connection
    /// acts; later calls and calls racing a shutdown are no-ops.
    pub async fn transfer_away(&self) -> Result<()> {
        let reader = {
            let mut inner = self.shared.lock_inner();
            let cancel = match inner.cancel.as_ref() {
                Some(cancel) if !cancel.is_cancelled() => cancel.clone(),
                _ => {
                    debug!("Transfer skipped for {}: not running", self.shared.socket_id);
                    return Ok(());
                }
            };
            if !self.shared.session.is_authenticated() || !inner.running || inner.transferred {
                debug!("Transfer skipped for {}", self.shared.socket_id);
                return Ok(());
            }
            inner.transferred = true;
            cancel.cancel();
            inner.reader.take()
        };

        info!("Transferring socket {}", self.shared.socket_id);
        let read_half = match reader {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        };
        let write_half = self.shared.writer.lock().await.take();

        let result = match (read_half, write_half) {
            (Some((read_half, buffered)), Some(write_half)) => {
                let socket = read_half.unsplit(write_half);
                let window = handoff_window(self.shared.config.keep_alive_secs);
                if !buffered.is_empty() {
                    debug!(
                        "Handing {} buffered bytes over with {}",
                        buffered.len(),
                        self.shared.socket_id
                    );
                }
                if let Err(e) = self
                    .shared
                    .broker
                    .transfer_ownership(&self.shared.socket_id, socket, buffered.freeze(), window)
                    .await
                {
                    // Another context may already have parked this socket
                    debug!("Socket broker refused {}: {}", self.shared.socket_id, e);
                }
                Ok(())
            }
            _ => Err(PushError::Transport(TransportError::Eof)),
        };

        self.shared.finish_teardown(ConnectionState::Transferred).await;
        result
    }

    async fn open_and_connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(ReadHalf<IoStream>, WriteHalf<IoStream>)> {
        let config = &self.shared.config;
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(PushError::Cancelled),
            stream = open_stream(config) => stream?,
        };
        debug!("Connected to {}:{}", config.host, config.port);

        let (reader, mut writer) = tokio::io::split(stream);
        let data = self.shared.session.push_data().clone();
        send_connect(&mut writer, &data, config.keep_alive_secs).await?;
        Ok((reader, writer))
    }

    async fn ping_after_start(&self) {
        if let Err(e) = self.send_ping().await {
            debug!("Failed to ping push server: {}", e);
        }
    }

    async fn dispatch(&self, packet: Packet, cancel: &CancellationToken) -> Result<()> {
        match packet {
            Packet::ConnAck(connack) => {
                info!("Received CONNACK - {:?}", connack.return_code);
                if connack.return_code != ConnectReturnCode::Accepted {
                    return Err(ProtocolError::ConnectionRefused(connack.return_code).into());
                }

                if let Some(auth) = connack.authentication.as_deref() {
                    if let Err(e) = self.shared.session.push_data_mut().update_auth(auth) {
                        warn!("Ignoring malformed CONNACK authentication: {}", e);
                    }
                }

                self.shared.set_state(ConnectionState::Registering);
                let mut workflow = RegistrationWorkflow::new(self.shared.config.registration.clone());
                let request = workflow.build_request()?;
                *self.shared.lock_registration() = Some(workflow);
                self.shared.send(&Packet::Publish(request)).await
            }

            Packet::Publish(publish) => {
                debug!("Received PUBLISH on {:?}", publish.topic);
                if publish.qos == QualityOfService::AtLeastOnce {
                    let ack = PubAckPacket::in_response_to(&publish)?;
                    self.shared.send(&Packet::PubAck(ack)).await?;
                }
                if publish.payload.is_empty() {
                    return Err(ProtocolError::EmptyPayload.into());
                }
                self.on_publish(publish, cancel).await
            }

            Packet::PubAck(ack) => {
                debug!("Received PUBACK for {}", ack.packet_id);
                Ok(())
            }

            Packet::PingResp => {
                debug!("Received PINGRESP");
                Ok(())
            }

            other @ (Packet::Connect(_) | Packet::PingReq) => {
                Err(ProtocolError::UnexpectedPacket(other.packet_type()).into())
            }
        }
    }

    async fn on_publish(&self, publish: PublishPacket, cancel: &CancellationToken) -> Result<()> {
        match publish.topic {
            PushTopic::Message => {
                let json = String::from_utf8_lossy(&publish.payload);
                trace!("Push json: {}", json);
                match PushNotification::parse(&json) {
                    Ok(notification) if notification.is_direct_message() => {
                        self.shared
                            .events
                            .emit(PushEvent::MessageReceived(Arc::new(notification)));
                    }
                    Ok(notification) => {
                        debug!(
                            "Ignoring notification with collapse key {:?}",
                            notification.content.collapse_key
                        );
                    }
                    Err(e) => warn!("Failed to parse push notification: {}", e),
                }
                Ok(())
            }

            PushTopic::RegistrationResponse => {
                let mut workflow = self.shared.lock_registration().take().unwrap_or_else(|| {
                    RegistrationWorkflow::new(self.shared.config.registration.clone())
                });
                let token = workflow.handle_response(&publish.payload)?;
                workflow
                    .confirm(self.shared.http.as_ref(), &self.shared.session, &token, cancel)
                    .await?;

                self.shared.set_state(ConnectionState::Registered);
                self.schedule_transfer(cancel.clone());
                Ok(())
            }

            other => {
                debug!("Unknown topic received: {:?}", other);
                Ok(())
            }
        }
    }

    /// Hand the socket off after the grace delay unless cancelled first
    fn schedule_transfer(&self, cancel: CancellationToken) {
        let connection = self.clone();
        let grace = self.shared.config.transfer_grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            if let Err(e) = connection.transfer_away().await {
                connection
                    .shared
                    .events
                    .emit(PushEvent::ExceptionCaught(Arc::new(e)));
            }
        });
    }

    async fn read_loop(
        self,
        mut reader: ReadHalf<IoStream>,
        mut buffer: BytesMut,
        cancel: CancellationToken,
    ) -> Option<(ReadHalf<IoStream>, BytesMut)> {
        let mut decoder = PacketDecoder::with_max_packet_size(self.shared.config.max_packet_size);
        buffer.reserve(4096);

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = recv_packet(&mut reader, &mut decoder, &mut buffer) => result,
            };

            let packet = match result {
                Ok(packet) => packet,
                Err(e) => {
                    if !cancel.is_cancelled() {
                        warn!("Push read loop for {} failed: {}", self.shared.socket_id, e);
                        self.shared.events.emit(PushEvent::ExceptionCaught(Arc::new(e)));
                        self.shared.begin_teardown(&cancel);
                    }
                    break;
                }
            };

            let packet_type = packet.packet_type();
            if let Err(e) = self.dispatch(packet, &cancel).await {
                let fatal = matches!(e, PushError::Protocol(ProtocolError::ConnectionRefused(_)));
                debug!("Error handling {:?}: {}", packet_type, e);
                self.shared.events.emit(PushEvent::ExceptionCaught(Arc::new(e)));
                if fatal {
                    self.shared.begin_teardown(&cancel);
                    break;
                }
            }
        }

        if self.is_transferred() {
            return Some((reader, buffer));
        }

        drop(reader);
        self.shared.finish_teardown(ConnectionState::Idle).await;
        None
    }
}

impl Shared {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_registration(&self) -> MutexGuard<'_, Option<RegistrationWorkflow>> {
        self.registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}: {:?} -> {:?}", self.socket_id, previous, state);
        }
    }

    /// Reserve the connection for a start; fails on the expected races
    fn claim(&self) -> Result<CancellationToken> {
        let mut inner = self.lock_inner();
        if inner.transferred {
            debug!("{} already transferred", self.socket_id);
            return Err(ConcurrencyError::AlreadyTransferred.into());
        }
        if inner.running {
            debug!("{} already running", self.socket_id);
            return Err(ConcurrencyError::AlreadyRunning.into());
        }
        let cancel = CancellationToken::new();
        inner.running = true;
        inner.cancel = Some(cancel.clone());
        self.set_state(ConnectionState::Connecting);
        Ok(cancel)
    }

    fn abandon_start(&self) {
        let mut inner = self.lock_inner();
        inner.running = false;
        inner.cancel = None;
        // A transfer that won the race owns the final state
        if !inner.transferred {
            self.set_state(ConnectionState::Idle);
        }
    }

    /// Install the writer and spawn the read loop
    fn launch(
        &self,
        connection: &PushConnection,
        reader: ReadHalf<IoStream>,
        writer: WriteHalf<IoStream>,
        buffered: BytesMut,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut inner = self.lock_inner();
        if cancel.is_cancelled() {
            drop(inner);
            self.abandon_start();
            return Err(PushError::Cancelled);
        }

        // Nothing else touches the writer before the read loop is spawned
        match self.writer.try_lock() {
            Ok(mut slot) => *slot = Some(writer),
            Err(_) => {
                drop(inner);
                self.abandon_start();
                return Err(ConcurrencyError::AlreadyRunning.into());
            }
        }

        self.set_state(ConnectionState::Connected);
        let handle = tokio::spawn(connection.clone().read_loop(reader, buffered, cancel.clone()));
        inner.reader = Some(handle);
        Ok(())
    }

    /// Request teardown from inside the read loop
    fn begin_teardown(&self, cancel: &CancellationToken) {
        let inner = self.lock_inner();
        cancel.cancel();
        if !inner.transferred {
            self.set_state(ConnectionState::ShuttingDown);
        }
    }

    /// Release the writer and clear running state and subscribers
    async fn finish_teardown(&self, final_state: ConnectionState) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                trace!("Socket shutdown for {}: {}", self.socket_id, e);
            }
        }

        {
            let mut inner = self.lock_inner();
            inner.running = false;
            inner.cancel = None;
            inner.reader = None;
            self.set_state(final_state);
        }
        self.lock_registration().take();
        self.events.clear();
        info!("Push connection {} is now {:?}", self.socket_id, final_state);
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or(PushError::Concurrency(ConcurrencyError::NotRunning))?;
        send_packet(writer, packet).await
    }
}

async fn open_stream(config: &ConnectionConfig) -> Result<IoStream> {
    let tcp = connect_tcp(&config.host, config.port).await?;
    match &config.tls {
        Some(tls_config) => tls::connect_tls(
            tls_config.client_config.clone(),
            tcp,
            &tls_config.server_name,
        )
        .await
        .map_err(|e| PushError::Transport(TransportError::Tls(format!("{:#}", e)))),
        None => Ok(IoStream::Plain(tcp)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{LoggedInUser, PushConnectionData};
    use crate::registration::{HttpResponse, REGISTER_PATH};
    use bytes::Bytes;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Notify;
    use tokio::time::timeout;
    use uuid::Uuid;

    const STEP: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RecordingHttp {
        calls: Mutex<Vec<HashMap<String, String>>>,
        block: bool,
        entered: Notify,
    }

    #[async_trait]
    impl HttpCapability for RecordingHttp {
        async fn post_form(
            &self,
            path: &str,
            fields: &[(String, String)],
        ) -> anyhow::Result<HttpResponse> {
            assert_eq!(path, REGISTER_PATH);
            self.calls
                .lock()
                .unwrap()
                .push(fields.iter().cloned().collect());
            self.entered.notify_one();
            if self.block {
                std::future::pending::<()>().await;
            }
            Ok(HttpResponse {
                status: 200,
                body: "{\"status\":\"ok\"}".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingBroker {
        transfers: Mutex<Vec<(String, Duration)>>,
        sockets: Mutex<Vec<(IoStream, Bytes)>>,
    }

    #[async_trait]
    impl SocketBroker for RecordingBroker {
        async fn transfer_ownership(
            &self,
            socket_id: &str,
            socket: IoStream,
            buffered: Bytes,
            keep_alive_window: Duration,
        ) -> std::io::Result<()> {
            self.transfers
                .lock()
                .unwrap()
                .push((socket_id.to_string(), keep_alive_window));
            self.sockets.lock().unwrap().push((socket, buffered));
            Ok(())
        }
    }

    struct Harness {
        listener: TcpListener,
        connection: PushConnection,
        http: Arc<RecordingHttp>,
        broker: Arc<RecordingBroker>,
    }

    async fn harness(http: RecordingHttp) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let session = Arc::new(PushSession::new(
            "alice",
            Some(LoggedInUser {
                pk: 1001,
                username: "alice".to_string(),
            }),
            Uuid::new_v4(),
            "csrf",
            PushConnectionData::new("test-agent", "567067343352427"),
        ));
        let config = ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port,
            transfer_grace: Duration::from_millis(50),
            registration: RegistrationConfig {
                confirm_delay: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let http = Arc::new(http);
        let broker = Arc::new(RecordingBroker::default());
        let connection = PushConnection::new(session, config, broker.clone(), http.clone());
        Harness {
            listener,
            connection,
            http,
            broker,
        }
    }

    struct FakeBroker {
        stream: TcpStream,
        decoder: PacketDecoder,
        buffer: BytesMut,
    }

    impl FakeBroker {
        async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = timeout(STEP, listener.accept()).await.unwrap().unwrap();
            Self {
                stream,
                decoder: PacketDecoder::new(),
                buffer: BytesMut::new(),
            }
        }

        async fn recv(&mut self) -> Packet {
            timeout(
                STEP,
                recv_packet(&mut self.stream, &mut self.decoder, &mut self.buffer),
            )
            .await
            .unwrap()
            .unwrap()
        }

        async fn send(&mut self, packet: Packet) {
            let bytes = push_wire::encode(&packet).unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn accept_session(&mut self) -> PublishPacket {
            assert!(matches!(self.recv().await, Packet::Connect(_)));
            assert_eq!(self.recv().await, Packet::PingReq);
            self.send(Packet::ConnAck(push_wire::ConnAckPacket {
                ack_flags: 0,
                return_code: ConnectReturnCode::Accepted,
                authentication: Some(r#"{"ck":7,"cs":"s","di":"device-id","ds":"d"}"#.to_string()),
            }))
            .await;
            match self.recv().await {
                Packet::Publish(publish) => {
                    assert_eq!(publish.topic, PushTopic::RegistrationRequest);
                    publish
                }
                other => panic!("expected registration request, got {:?}", other),
            }
        }

        async fn send_registration_response(&mut self, json: &'static str) {
            self.send(Packet::Publish(PublishPacket::new(
                PushTopic::RegistrationResponse,
                QualityOfService::AtMostOnce,
                0,
                Bytes::from_static(json.as_bytes()),
            )))
            .await;
        }
    }

    async fn wait_for_state(connection: &PushConnection, state: ConnectionState) {
        let mut rx = connection.watch_state();
        timeout(STEP, rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_registration_and_transfer() {
        let h = harness(RecordingHttp::default()).await;
        let mut events = h.connection.subscribe();

        h.connection.start_fresh().await.unwrap();
        let mut broker = FakeBroker::accept(&h.listener).await;
        let request = broker.accept_session().await;
        assert_eq!(h.connection.state(), ConnectionState::Registering);
        assert_eq!(
            h.connection.session().push_data().auth.device_id,
            "device-id"
        );

        broker.send(Packet::PubAck(PubAckPacket::in_response_to(&request).unwrap())).await;
        broker.send_registration_response(r#"{"token":"T"}"#).await;

        wait_for_state(&h.connection, ConnectionState::Transferred).await;
        assert!(h.connection.is_transferred());
        assert!(!h.connection.is_running());

        let calls = h.http.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["device_token"], "T");

        let transfers = h.broker.transfers.lock().unwrap().clone();
        assert_eq!(
            transfers,
            vec![("mqtt_fbns_alice".to_string(), Duration::from_secs(840))]
        );

        // Socket stayed open through the hand-off
        broker.send(Packet::PingResp).await;

        // Second transfer is a no-op
        h.connection.transfer_away().await.unwrap();
        assert_eq!(h.broker.transfers.lock().unwrap().len(), 1);

        // Subscribers were detached without any exception event
        assert!(timeout(STEP, events.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_twice_fails_with_already_running() {
        let h = harness(RecordingHttp::default()).await;
        h.connection.start_fresh().await.unwrap();
        let mut broker = FakeBroker::accept(&h.listener).await;
        assert!(matches!(broker.recv().await, Packet::Connect(_)));

        let err = h.connection.start_fresh().await.unwrap_err();
        assert!(matches!(
            err,
            PushError::Concurrency(ConcurrencyError::AlreadyRunning)
        ));
        assert!(h.connection.is_running());
        assert_eq!(h.connection.state(), ConnectionState::Connected);

        h.connection.shutdown().await;
        assert_eq!(h.connection.state(), ConnectionState::Idle);
        assert!(!h.connection.is_running());
    }

    #[tokio::test]
    async fn test_start_after_transfer_fails() {
        let h = harness(RecordingHttp::default()).await;
        h.connection.start_fresh().await.unwrap();
        let _broker = FakeBroker::accept(&h.listener).await;

        h.connection.transfer_away().await.unwrap();
        assert_eq!(h.connection.state(), ConnectionState::Transferred);
        assert!(matches!(
            h.connection.start_fresh().await,
            Err(PushError::Concurrency(ConcurrencyError::AlreadyTransferred))
        ));
    }

    #[tokio::test]
    async fn test_cancel_mid_read_emits_nothing() {
        let h = harness(RecordingHttp::default()).await;
        let mut events = h.connection.subscribe();
        h.connection.start_fresh().await.unwrap();
        let mut broker = FakeBroker::accept(&h.listener).await;
        assert!(matches!(broker.recv().await, Packet::Connect(_)));

        h.connection.shutdown().await;
        assert!(timeout(STEP, events.recv()).await.unwrap().is_none());

        // Socket closed by the client
        let mut rest = Vec::new();
        let read = timeout(STEP, broker.stream.read_to_end(&mut rest)).await.unwrap();
        assert!(read.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_mid_confirmation_emits_one_failure() {
        let h = harness(RecordingHttp {
            block: true,
            ..Default::default()
        })
        .await;
        let mut events = h.connection.subscribe();
        h.connection.start_fresh().await.unwrap();
        let mut broker = FakeBroker::accept(&h.listener).await;
        broker.accept_session().await;
        broker.send_registration_response(r#"{"token":"T"}"#).await;

        timeout(STEP, h.http.entered.notified()).await.unwrap();
        h.connection.shutdown().await;

        let mut caught = Vec::new();
        while let Some(event) = timeout(STEP, events.recv()).await.unwrap() {
            caught.push(event);
        }
        assert_eq!(caught.len(), 1);
        assert!(matches!(
            &caught[0],
            PushEvent::ExceptionCaught(e) if matches!(
                e.as_ref(),
                PushError::Registration(crate::error::RegistrationError::RegistrationConfirmationFailed(_))
            )
        ));
        assert!(h.broker.transfers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_registration_makes_no_http_call() {
        let h = harness(RecordingHttp::default()).await;
        let mut events = h.connection.subscribe();
        h.connection.start_fresh().await.unwrap();
        let mut broker = FakeBroker::accept(&h.listener).await;
        broker.accept_session().await;
        broker
            .send_registration_response(r#"{"error":"rate_limited"}"#)
            .await;

        let event = timeout(STEP, events.recv()).await.unwrap().unwrap();
        assert!(matches!(
            event,
            PushEvent::ExceptionCaught(e) if matches!(
                e.as_ref(),
                PushError::Registration(crate::error::RegistrationError::RegistrationRejected(r)) if r == "rate_limited"
            )
        ));
        assert!(h.http.calls.lock().unwrap().is_empty());

        // Registration errors leave the connection up
        assert!(h.connection.is_running());
        assert_eq!(h.connection.state(), ConnectionState::Registering);
        h.connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_direct_messages_emitted_and_acked() {
        let h = harness(RecordingHttp::default()).await;
        let mut events = h.connection.subscribe();
        h.connection.start_fresh().await.unwrap();
        let mut broker = FakeBroker::accept(&h.listener).await;
        broker.accept_session().await;

        let other = r#"{"fbpushnotif":"{\"collapse_key\":\"like\"}"}"#;
        broker
            .send(Packet::Publish(PublishPacket::new(
                PushTopic::Message,
                QualityOfService::AtLeastOnce,
                11,
                Bytes::from_static(other.as_bytes()),
            )))
            .await;
        assert_eq!(
            broker.recv().await,
            Packet::PubAck(PubAckPacket { packet_id: 11 })
        );

        let direct = r#"{"token":"x","fbpushnotif":"{\"collapse_key\":\"direct_v2_message\",\"m\":\"hi\"}"}"#;
        let compressed = push_wire::compress(direct.as_bytes()).unwrap();
        broker
            .send(Packet::Publish(PublishPacket::new(
                PushTopic::Message,
                QualityOfService::AtLeastOnce,
                12,
                compressed,
            )))
            .await;
        assert_eq!(
            broker.recv().await,
            Packet::PubAck(PubAckPacket { packet_id: 12 })
        );

        match timeout(STEP, events.recv()).await.unwrap().unwrap() {
            PushEvent::MessageReceived(notification) => {
                assert_eq!(notification.content.message.as_deref(), Some("hi"));
                assert_eq!(notification.json, direct);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Malformed notification is logged only
        broker
            .send(Packet::Publish(PublishPacket::new(
                PushTopic::Message,
                QualityOfService::AtMostOnce,
                0,
                Bytes::from_static(b"{not json"),
            )))
            .await;
        broker.send(Packet::PingResp).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_none());
        assert!(h.connection.is_running());

        h.connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_unexpected_packets_reported() {
        let h = harness(RecordingHttp::default()).await;
        let mut events = h.connection.subscribe();
        h.connection.start_fresh().await.unwrap();
        let mut broker = FakeBroker::accept(&h.listener).await;
        assert!(matches!(broker.recv().await, Packet::Connect(_)));

        broker.send(Packet::PingReq).await;
        let event = timeout(STEP, events.recv()).await.unwrap().unwrap();
        assert!(matches!(
            event,
            PushEvent::ExceptionCaught(e) if matches!(
                e.as_ref(),
                PushError::Protocol(ProtocolError::UnexpectedPacket(push_wire::PacketType::PingReq))
            )
        ));

        broker
            .send(Packet::Publish(PublishPacket::new(
                PushTopic::Message,
                QualityOfService::AtMostOnce,
                0,
                Bytes::new(),
            )))
            .await;
        let event = timeout(STEP, events.recv()).await.unwrap().unwrap();
        assert!(matches!(
            event,
            PushEvent::ExceptionCaught(e) if matches!(
                e.as_ref(),
                PushError::Protocol(ProtocolError::EmptyPayload)
            )
        ));
        assert!(h.connection.is_running());
        h.connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_refused_connack_shuts_down() {
        let h = harness(RecordingHttp::default()).await;
        let mut events = h.connection.subscribe();
        h.connection.start_fresh().await.unwrap();
        let mut broker = FakeBroker::accept(&h.listener).await;
        assert!(matches!(broker.recv().await, Packet::Connect(_)));

        broker
            .send(Packet::ConnAck(push_wire::ConnAckPacket {
                ack_flags: 0,
                return_code: ConnectReturnCode::NotAuthorized,
                authentication: None,
            }))
            .await;

        let event = timeout(STEP, events.recv()).await.unwrap().unwrap();
        assert!(matches!(
            event,
            PushEvent::ExceptionCaught(e) if matches!(
                e.as_ref(),
                PushError::Protocol(ProtocolError::ConnectionRefused(ConnectReturnCode::NotAuthorized))
            )
        ));
        wait_for_state(&h.connection, ConnectionState::Idle).await;
        assert!(!h.connection.is_running());
    }

    #[tokio::test]
    async fn test_broker_disconnect_reported() {
        let h = harness(RecordingHttp::default()).await;
        let mut events = h.connection.subscribe();
        h.connection.start_fresh().await.unwrap();
        let mut broker = FakeBroker::accept(&h.listener).await;
        assert!(matches!(broker.recv().await, Packet::Connect(_)));
        drop(broker);

        let event = timeout(STEP, events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, PushEvent::ExceptionCaught(_)));
        wait_for_state(&h.connection, ConnectionState::Idle).await;

        // A new start is allowed once teardown has finished
        h.connection.start_fresh().await.unwrap();
        let _broker = FakeBroker::accept(&h.listener).await;
        h.connection.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_with_handed_off_socket() {
        let h = harness(RecordingHttp::default()).await;
        let port = h.listener.local_addr().unwrap().port();
        let socket = IoStream::Plain(connect_tcp("127.0.0.1", port).await.unwrap());
        let mut broker = FakeBroker::accept(&h.listener).await;

        h.connection
            .start_with_handed_off_socket(socket, Bytes::new())
            .await
            .unwrap();
        // No CONNECT on a resumed socket, only the ping
        assert_eq!(broker.recv().await, Packet::PingReq);
        assert!(h.connection.is_running());

        h.connection.transfer_away().await.unwrap();
        assert_eq!(h.broker.transfers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_frame_travels_with_socket() {
        let h = harness(RecordingHttp::default()).await;
        let port = h.listener.local_addr().unwrap().port();
        let socket = IoStream::Plain(connect_tcp("127.0.0.1", port).await.unwrap());
        let mut broker = FakeBroker::accept(&h.listener).await;

        h.connection
            .start_with_handed_off_socket(socket, Bytes::new())
            .await
            .unwrap();
        assert_eq!(broker.recv().await, Packet::PingReq);

        let direct = r#"{"fbpushnotif":"{\"collapse_key\":\"direct_v2_message\",\"m\":\"split\"}"}"#;
        let frame = push_wire::encode(&Packet::Publish(PublishPacket::new(
            PushTopic::Message,
            QualityOfService::AtMostOnce,
            0,
            Bytes::from_static(direct.as_bytes()),
        )))
        .unwrap();
        broker.stream.write_all(&frame[..4]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.connection.transfer_away().await.unwrap();
        broker.stream.write_all(&frame[4..]).await.unwrap();

        let (socket, buffered) = h.broker.sockets.lock().unwrap().pop().unwrap();
        assert_eq!(buffered.as_ref(), &frame[..4]);

        // The next owner decodes the split frame intact
        let resumed = PushConnection::new(
            h.connection.session().clone(),
            h.connection.shared.config.clone(),
            h.broker.clone(),
            h.http.clone(),
        );
        let mut events = resumed.subscribe();
        resumed
            .start_with_handed_off_socket(socket, buffered)
            .await
            .unwrap();
        assert_eq!(broker.recv().await, Packet::PingReq);

        match timeout(STEP, events.recv()).await.unwrap().unwrap() {
            PushEvent::MessageReceived(notification) => {
                assert_eq!(notification.content.message.as_deref(), Some("split"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        resumed.shutdown().await;
    }

    #[tokio::test]
    async fn test_transfer_while_connecting_stays_transferred() {
        // A TLS handshake against a silent listener keeps the start in Connecting
        let h = harness(RecordingHttp::default()).await;
        let mut config = h.connection.shared.config.clone();
        config.tls = Some(TlsClientConfig {
            client_config: Arc::new(tls::make_client_config(None).unwrap()),
            server_name: "localhost".to_string(),
        });
        let connection = PushConnection::new(
            h.connection.session().clone(),
            config,
            h.broker.clone(),
            h.http.clone(),
        );

        let starting = tokio::spawn({
            let connection = connection.clone();
            async move { connection.start_fresh().await }
        });
        wait_for_state(&connection, ConnectionState::Connecting).await;

        assert!(connection.transfer_away().await.is_err());
        assert!(matches!(
            timeout(STEP, starting).await.unwrap().unwrap(),
            Err(PushError::Cancelled)
        ));
        assert_eq!(connection.state(), ConnectionState::Transferred);
        assert!(connection.is_transferred());
        assert!(!connection.is_running());
        assert!(h.broker.sockets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unauthenticated_session_does_not_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let session = Arc::new(PushSession::new(
            "bob",
            None,
            Uuid::new_v4(),
            "",
            PushConnectionData::default(),
        ));
        let connection = PushConnection::new(
            session,
            ConnectionConfig {
                host: "127.0.0.1".to_string(),
                port: listener.local_addr().unwrap().port(),
                ..Default::default()
            },
            Arc::new(RecordingBroker::default()),
            Arc::new(RecordingHttp::default()),
        );
        assert!(matches!(
            connection.start_fresh().await,
            Err(PushError::NotAuthenticated)
        ));
        assert_eq!(connection.state(), ConnectionState::Idle);
    }
}
