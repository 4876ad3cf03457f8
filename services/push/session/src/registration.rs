//! Two-phase push registration.
//!
//! Phase one publishes a registration request on the broker and waits for the
//! response publish carrying a device token. Phase two confirms the token over
//! HTTP. The workflow lives for one handshake and is discarded afterwards.

use async_trait::async_trait;
use bytes::Bytes;
use push_wire::{PublishPacket, PushTopic, QualityOfService};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::data::PushSession;
use crate::error::{PushError, RegistrationError, Result};

/// Path of the HTTP confirmation endpoint
pub const REGISTER_PATH: &str = "/api/v1/push/register/";

/// Response of a form POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: String,
}

impl HttpResponse {
    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Authenticated HTTP client used for the confirmation call
#[async_trait]
pub trait HttpCapability: Send + Sync {
    /// POST form-encoded `fields` to `path` on the API host
    async fn post_form(&self, path: &str, fields: &[(String, String)])
        -> anyhow::Result<HttpResponse>;
}

/// Registration settings
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Package name sent in the registration request
    pub package_name: String,
    /// Application id sent in the registration request
    pub app_id: String,
    /// Pause before the HTTP confirmation
    pub confirm_delay: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            package_name: "com.instagram.android".to_string(),
            app_id: "567067343352427".to_string(),
            confirm_delay: Duration::from_secs(1),
        }
    }
}

/// Progress of one registration handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    /// Nothing sent yet
    NotStarted,
    /// Registration request published
    MqttRegisterSent {
        /// Packet id of the request
        packet_id: u16,
    },
    /// Broker issued a token
    TokenReceived {
        /// Device token
        token: String,
    },
    /// Token confirmed over HTTP
    HttpConfirmed,
}

#[derive(Serialize)]
struct RegistrationRequest<'a> {
    pkg_name: &'a str,
    appid: &'a str,
}

/// One registration handshake
#[derive(Debug)]
pub struct RegistrationWorkflow {
    config: RegistrationConfig,
    state: RegistrationState,
}

impl RegistrationWorkflow {
    /// New handshake in `NotStarted`
    pub fn new(config: RegistrationConfig) -> Self {
        Self {
            config,
            state: RegistrationState::NotStarted,
        }
    }

    /// Current progress
    pub fn state(&self) -> &RegistrationState {
        &self.state
    }

    /// Build the registration request publish with a fresh random packet id
    pub fn build_request(&mut self) -> Result<PublishPacket> {
        let payload = serde_json::to_vec(&RegistrationRequest {
            pkg_name: &self.config.package_name,
            appid: &self.config.app_id,
        })
        .map_err(|e| RegistrationError::MalformedResponse(e.to_string()))?;

        let packet_id = rand::thread_rng().gen_range(1..=u16::MAX);
        self.state = RegistrationState::MqttRegisterSent { packet_id };
        debug!("Registration request prepared with packet id {}", packet_id);

        Ok(PublishPacket::new(
            PushTopic::RegistrationRequest,
            QualityOfService::AtLeastOnce,
            packet_id,
            Bytes::from(payload),
        ))
    }

    /// Extract the device token from the broker's response payload.
    ///
    /// An absent or empty `error` field means no error.
    pub fn handle_response(&mut self, payload: &[u8]) -> Result<String> {
        let raw = String::from_utf8_lossy(payload);
        let response: HashMap<String, String> = serde_json::from_slice(payload)
            .map_err(|_| RegistrationError::MalformedResponse(raw.to_string()))?;

        if let Some(error) = response.get("error").filter(|e| !e.is_empty()) {
            return Err(RegistrationError::RegistrationRejected(error.clone()).into());
        }

        let token = response
            .get("token")
            .filter(|t| !t.is_empty())
            .cloned()
            .ok_or_else(|| RegistrationError::InvalidToken(raw.to_string()))?;

        info!("Received push token to register");
        self.state = RegistrationState::TokenReceived {
            token: token.clone(),
        };
        Ok(token)
    }

    /// Confirm `token` over HTTP.
    ///
    /// Cancellation while waiting counts as a failed confirmation.
    pub async fn confirm(
        &mut self,
        http: &dyn HttpCapability,
        session: &PushSession,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let fields = confirmation_fields(session, token)?;
        let delay = self.config.confirm_delay;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RegistrationError::RegistrationConfirmationFailed(
                    "cancelled".to_string(),
                )
                .into());
            }
            outcome = async {
                tokio::time::sleep(delay).await;
                http.post_form(REGISTER_PATH, &fields).await
            } => outcome,
        };

        let response = outcome
            .map_err(|e| RegistrationError::RegistrationConfirmationFailed(format!("{:#}", e)))?;
        if !response.is_success() {
            return Err(RegistrationError::RegistrationConfirmationFailed(format!(
                "HTTP {}: {}",
                response.status, response.body
            ))
            .into());
        }

        info!("Push token confirmed");
        self.state = RegistrationState::HttpConfirmed;
        Ok(())
    }
}

/// Form fields of the confirmation POST
pub fn confirmation_fields(session: &PushSession, token: &str) -> Result<Vec<(String, String)>> {
    let user = session.user().ok_or(PushError::NotAuthenticated)?;
    let uuid = session.device_uuid().to_string();

    Ok(vec![
        ("device_type".to_string(), "android_mqtt".to_string()),
        ("is_main_push_channel".to_string(), "true".to_string()),
        ("device_sub_type".to_string(), "2".to_string()),
        ("device_token".to_string(), token.to_string()),
        ("_csrftoken".to_string(), session.csrf_token().to_string()),
        ("guid".to_string(), uuid.clone()),
        ("_uuid".to_string(), uuid),
        ("users".to_string(), user.pk.to_string()),
    ])
}
