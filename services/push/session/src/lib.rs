//! Broker connection, registration handshake and socket hand-off for push.
//!
//! This crate provides the push connection engine: TCP/TLS transport to the
//! broker, the read loop that dispatches decoded packets, the two-phase
//! device registration, and the hand-off of a live socket to a background
//! execution context.
//!
//! ## Features
//!
//! - **TCP/TLS Transport**: rustls client with web PKI roots, plain TCP for tests
//! - **Connection State Machine**: one read task per connection, cancellable
//! - **Registration**: token exchange over the broker, then HTTP confirmation
//! - **Socket Hand-off**: one-shot transfer of the open socket to a [`SocketBroker`]
//! - **Events**: message-received and exception notifications for observers
//!
//! ## Example
//!
//! ```rust,no_run
//! use push_session::{
//!     ConnectionConfig, HttpCapability, PushConnection, PushEvent, PushSession, SocketBroker,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     session: Arc<PushSession>,
//! #     broker: Arc<dyn SocketBroker>,
//! #     http: Arc<dyn HttpCapability>,
//! # ) -> anyhow::Result<()> {
//! let connection = PushConnection::new(session, ConnectionConfig::default(), broker, http);
//! let mut events = connection.subscribe();
//!
//! connection.start_fresh().await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         PushEvent::MessageReceived(notification) => {
//!             println!("Message: {:?}", notification.content.message);
//!         }
//!         PushEvent::ExceptionCaught(error) => {
//!             println!("Push error: {}", error);
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod data;
pub mod error;
pub mod events;
pub mod handshake;
pub mod keepalive;
pub mod notification;
pub mod registration;
pub mod transport;

// Re-export main types
pub use connection::{
    ConnectionConfig, ConnectionState, PushConnection, SocketBroker, TlsClientConfig,
    DEFAULT_BROKER_HOST, DEFAULT_BROKER_PORT,
};
pub use data::{
    session_name_from_socket_id, socket_id_for, FbnsAuth, LoggedInUser, PushConnectionData,
    PushSession, SessionRecord, SOCKET_ID_PREFIX,
};
pub use error::{
    ConcurrencyError, ProtocolError, PushError, RegistrationError, Result, TransportError,
};
pub use events::{EventHub, PushEvent, Subscription};
pub use handshake::{recv_packet, send_connect, send_packet};
pub use keepalive::{build_ping, handoff_window, transfer_grace, KEEP_ALIVE_SECS, WAIT_TIME};
pub use notification::{NotificationContent, PushNotification};
pub use registration::{
    HttpCapability, HttpResponse, RegistrationConfig, RegistrationState, RegistrationWorkflow,
    REGISTER_PATH,
};
pub use transport::{connect_tcp, IoStream, StreamActivity};
pub use transport::tls::{connect_tls, make_client_config};
