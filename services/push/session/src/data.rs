//! Session and connection context shared with the push connection.
//!
//! `PushSession` is the authenticated user session the host application
//! persists. It owns the `PushConnectionData` from which CONNECT payloads are
//! rebuilt, and which the connection updates when a CONNACK carries new
//! authentication material.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::Result;

/// Prefix of every socket id handed to the background host
pub const SOCKET_ID_PREFIX: &str = "mqtt_fbns_";

/// Length of the MQTT client identifier
const CLIENT_IDENTIFIER_LEN: usize = 20;

/// Socket id for a session name
pub fn socket_id_for(session_name: &str) -> String {
    format!("{}{}", SOCKET_ID_PREFIX, session_name)
}

/// Session name encoded in a socket id, if the id is well formed
pub fn session_name_from_socket_id(socket_id: &str) -> Option<&str> {
    socket_id
        .strip_prefix(SOCKET_ID_PREFIX)
        .filter(|name| !name.is_empty())
}

/// Auth block issued by the broker in CONNACK
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FbnsAuth {
    /// Connection key (broker-side user id)
    #[serde(rename = "ck")]
    pub connection_key: u64,
    /// Connection secret
    #[serde(rename = "cs")]
    pub connection_secret: String,
    /// Device id
    #[serde(rename = "di")]
    pub device_id: String,
    /// Device secret
    #[serde(rename = "ds")]
    pub device_secret: String,
    /// Opaque broker field, echoed back unchanged
    #[serde(rename = "sr")]
    pub sr: String,
    /// Opaque broker field, echoed back unchanged
    #[serde(rename = "rc")]
    pub rc: String,
}

/// Registration and auth context used to build CONNECT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConnectionData {
    /// User agent reported to the broker
    pub user_agent: String,
    /// Client capability bitmask
    pub client_capabilities: u64,
    /// Endpoint capability bitmask
    pub endpoint_capabilities: u64,
    /// Publish payload format
    pub publish_format: u32,
    /// Do not bring the app to the foreground automatically
    pub no_automatic_foreground: bool,
    /// Report the user as available while in the foreground
    pub make_user_available_in_foreground: bool,
    /// Whether the app starts in the foreground
    pub is_initially_foreground: bool,
    /// Network type
    pub network_type: i32,
    /// Network subtype
    pub network_subtype: i32,
    /// Client-chosen MQTT session id
    pub client_mqtt_session_id: u64,
    /// Topic ids subscribed at connect time
    pub subscribe_topics: Vec<u32>,
    /// Client type
    pub client_type: String,
    /// Application id
    pub app_id: String,
    /// Client stack version
    pub client_stack: u32,
    /// Locally generated device UUID, used until the broker assigns a device id
    pub device_uuid: String,
    /// Auth block from the last CONNACK
    pub auth: FbnsAuth,
}

impl Default for PushConnectionData {
    fn default() -> Self {
        Self {
            user_agent: String::new(),
            client_capabilities: 439,
            endpoint_capabilities: 128,
            publish_format: 1,
            no_automatic_foreground: true,
            make_user_available_in_foreground: false,
            is_initially_foreground: false,
            network_type: 1,
            network_subtype: 0,
            client_mqtt_session_id: 0,
            subscribe_topics: vec![76, 80, 231],
            client_type: "device_auth".to_string(),
            app_id: String::new(),
            client_stack: 3,
            device_uuid: String::new(),
            auth: FbnsAuth::default(),
        }
    }
}

#[derive(Serialize)]
struct ConnectPayload<'a> {
    client_identifier: String,
    client_info: ClientInfo<'a>,
    password: &'a str,
}

#[derive(Serialize)]
struct ClientInfo<'a> {
    user_id: u64,
    user_agent: &'a str,
    client_capabilities: u64,
    endpoint_capabilities: u64,
    publish_format: u32,
    no_automatic_foreground: bool,
    make_user_available_in_foreground: bool,
    device_id: &'a str,
    is_initially_foreground: bool,
    network_type: i32,
    network_subtype: i32,
    client_mqtt_session_id: u64,
    subscribe_topics: &'a [u32],
    client_type: &'a str,
    app_id: &'a str,
    device_secret: &'a str,
    client_stack: u32,
}

impl PushConnectionData {
    /// Fresh connection data with a new device UUID
    pub fn new(user_agent: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            app_id: app_id.into(),
            device_uuid: Uuid::new_v4().to_string(),
            client_mqtt_session_id: u64::from(rand::random::<u32>()),
            ..Default::default()
        }
    }

    /// Replace the auth block with the CONNACK authentication JSON.
    ///
    /// An empty string leaves the current block untouched.
    pub fn update_auth(&mut self, json: &str) -> std::result::Result<(), serde_json::Error> {
        if json.trim().is_empty() {
            return Ok(());
        }
        self.auth = serde_json::from_str(json)?;
        Ok(())
    }

    /// MQTT client identifier
    pub fn client_identifier(&self) -> String {
        let source = if self.auth.device_id.is_empty() {
            &self.device_uuid
        } else {
            &self.auth.device_id
        };
        source.chars().take(CLIENT_IDENTIFIER_LEN).collect()
    }

    /// Deflated JSON payload for CONNECT
    pub fn build_connect_payload(&self) -> Result<Bytes> {
        let payload = ConnectPayload {
            client_identifier: self.client_identifier(),
            client_info: ClientInfo {
                user_id: self.auth.connection_key,
                user_agent: &self.user_agent,
                client_capabilities: self.client_capabilities,
                endpoint_capabilities: self.endpoint_capabilities,
                publish_format: self.publish_format,
                no_automatic_foreground: self.no_automatic_foreground,
                make_user_available_in_foreground: self.make_user_available_in_foreground,
                device_id: &self.auth.device_id,
                is_initially_foreground: self.is_initially_foreground,
                network_type: self.network_type,
                network_subtype: self.network_subtype,
                client_mqtt_session_id: self.client_mqtt_session_id,
                subscribe_topics: &self.subscribe_topics,
                client_type: &self.client_type,
                app_id: &self.app_id,
                device_secret: &self.auth.device_secret,
                client_stack: self.client_stack,
            },
            password: &self.auth.connection_secret,
        };

        let json = serde_json::to_vec(&payload)
            .map_err(|e| push_wire::WireError::Compress(e.into()))?;
        Ok(push_wire::compress(&json)?)
    }
}

/// Logged-in user of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedInUser {
    /// Numeric user id
    pub pk: u64,
    /// User name
    pub username: String,
}

/// Serializable form of a [`PushSession`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session name
    pub session_name: String,
    /// Logged-in user, absent when logged out
    #[serde(default)]
    pub user: Option<LoggedInUser>,
    /// Device UUID sent as `guid` and `_uuid`
    pub device_uuid: Uuid,
    /// Anti-forgery token
    #[serde(default)]
    pub csrf_token: String,
    /// Push connection context
    #[serde(default)]
    pub push_data: PushConnectionData,
}

/// Authenticated user session shared between the host and the connection
#[derive(Debug)]
pub struct PushSession {
    session_name: String,
    user: Option<LoggedInUser>,
    device_uuid: Uuid,
    csrf_token: String,
    push_data: RwLock<PushConnectionData>,
}

impl PushSession {
    /// Build a session
    pub fn new(
        session_name: impl Into<String>,
        user: Option<LoggedInUser>,
        device_uuid: Uuid,
        csrf_token: impl Into<String>,
        push_data: PushConnectionData,
    ) -> Self {
        Self {
            session_name: session_name.into(),
            user,
            device_uuid,
            csrf_token: csrf_token.into(),
            push_data: RwLock::new(push_data),
        }
    }

    /// Restore a session from its persisted form
    pub fn from_record(record: SessionRecord) -> Self {
        Self::new(
            record.session_name,
            record.user,
            record.device_uuid,
            record.csrf_token,
            record.push_data,
        )
    }

    /// Snapshot for persistence
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_name: self.session_name.clone(),
            user: self.user.clone(),
            device_uuid: self.device_uuid,
            csrf_token: self.csrf_token.clone(),
            push_data: self.push_data().clone(),
        }
    }

    /// Session name
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Socket id derived from the session name
    pub fn socket_id(&self) -> String {
        socket_id_for(&self.session_name)
    }

    /// Whether a user is logged in
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Logged-in user
    pub fn user(&self) -> Option<&LoggedInUser> {
        self.user.as_ref()
    }

    /// Device UUID
    pub fn device_uuid(&self) -> Uuid {
        self.device_uuid
    }

    /// Anti-forgery token
    pub fn csrf_token(&self) -> &str {
        &self.csrf_token
    }

    /// Read access to the push connection data
    pub fn push_data(&self) -> RwLockReadGuard<'_, PushConnectionData> {
        self.push_data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write access to the push connection data
    pub fn push_data_mut(&self) -> RwLockWriteGuard<'_, PushConnectionData> {
        self.push_data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
