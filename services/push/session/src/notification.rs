//! Push notification payloads delivered on the message topic.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Collapse key of direct message notifications
pub const DIRECT_MESSAGE_COLLAPSE_KEY: &str = "direct_v2_message";

/// Accept strings, numbers and booleans for identifier-like fields
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// `fbpushnotif` holds the content as a JSON document inside a string
fn embedded_content<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<NotificationContent, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(NotificationContent::default()),
        Some(Value::String(raw)) => serde_json::from_str(&raw).map_err(serde::de::Error::custom),
        Some(object @ Value::Object(_)) => {
            serde_json::from_value(object).map_err(serde::de::Error::custom)
        }
        Some(other) => Err(serde::de::Error::custom(format!(
            "unexpected fbpushnotif value: {}",
            other
        ))),
    }
}

/// Displayable content of a notification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContent {
    /// Title
    #[serde(rename = "t", default, deserialize_with = "lenient_string")]
    pub title: Option<String>,
    /// Message body
    #[serde(rename = "m", default, deserialize_with = "lenient_string")]
    pub message: Option<String>,
    /// Ticker text
    #[serde(rename = "tt", default, deserialize_with = "lenient_string")]
    pub ticker_text: Option<String>,
    /// In-app action link
    #[serde(rename = "ig", default, deserialize_with = "lenient_string")]
    pub action: Option<String>,
    /// Collapse key; selects which notifications are surfaced
    #[serde(default, deserialize_with = "lenient_string")]
    pub collapse_key: Option<String>,
    /// Image URL
    #[serde(rename = "i", default, deserialize_with = "lenient_string")]
    pub image: Option<String>,
    /// Sender avatar URL
    #[serde(rename = "a", default, deserialize_with = "lenient_string")]
    pub avatar_url: Option<String>,
    /// Sound name
    #[serde(default, deserialize_with = "lenient_string")]
    pub sound: Option<String>,
    /// Push id
    #[serde(rename = "pi", default, deserialize_with = "lenient_string")]
    pub push_id: Option<String>,
    /// Push category
    #[serde(rename = "c", default, deserialize_with = "lenient_string")]
    pub category: Option<String>,
    /// User the notification is intended for
    #[serde(rename = "u", default, deserialize_with = "lenient_string")]
    pub intended_recipient: Option<String>,
    /// Sending user
    #[serde(rename = "s", default, deserialize_with = "lenient_string")]
    pub source_user_id: Option<String>,
    /// Badge count
    #[serde(rename = "bc", default, deserialize_with = "lenient_string")]
    pub badge_count: Option<String>,
}

/// Notification received on the message topic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    /// Delivery token
    #[serde(default, deserialize_with = "lenient_string")]
    pub token: Option<String>,
    /// Connection key the notification was routed to
    #[serde(rename = "ck", default, deserialize_with = "lenient_string")]
    pub connection_key: Option<String>,
    /// Target package name
    #[serde(rename = "pn", default, deserialize_with = "lenient_string")]
    pub package_name: Option<String>,
    /// Collapse policy
    #[serde(rename = "cp", default, deserialize_with = "lenient_string")]
    pub collapse_policy: Option<String>,
    /// Notification id
    #[serde(rename = "nid", default, deserialize_with = "lenient_string")]
    pub notification_id: Option<String>,
    /// Opaque bundle flag
    #[serde(rename = "bu", default, deserialize_with = "lenient_string")]
    pub bundle: Option<String>,
    /// Decoded `fbpushnotif` content
    #[serde(rename = "fbpushnotif", default, deserialize_with = "embedded_content")]
    pub content: NotificationContent,
    /// Raw JSON the notification was parsed from
    #[serde(skip)]
    pub json: String,
}

impl PushNotification {
    /// Parse a message-topic payload, keeping the raw JSON
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        let mut notification: PushNotification = serde_json::from_str(json)?;
        notification.json = json.to_string();
        Ok(notification)
    }

    /// Whether this notification announces a direct message
    pub fn is_direct_message(&self) -> bool {
        self.content.collapse_key.as_deref() == Some(DIRECT_MESSAGE_COLLAPSE_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIRECT: &str = r#"{"token":"tok","ck":17841400000000000,"pn":"com.instagram.android","cp":"","fbpushnotif":"{\"t\":\"\",\"m\":\"alice: hi there\",\"tt\":\"alice: hi there\",\"ig\":\"direct_v2?id=340282366841710300949128&x=29\",\"collapse_key\":\"direct_v2_message\",\"i\":\"https://example.invalid/a.jpg\",\"a\":\"https://example.invalid/avatar.jpg\",\"sound\":\"default\",\"pi\":\"5a1b\",\"c\":\"direct_v2_message\",\"u\":12345,\"s\":\"678\",\"bc\":\"{\\\"dt\\\":1}\"}","nid":"-123","bu":"false"}"#;

    #[test]
    fn test_parse_direct_message() {
        let notification = PushNotification::parse(DIRECT).unwrap();
        assert!(notification.is_direct_message());
        assert_eq!(notification.token.as_deref(), Some("tok"));
        assert_eq!(
            notification.connection_key.as_deref(),
            Some("17841400000000000")
        );
        assert_eq!(
            notification.content.message.as_deref(),
            Some("alice: hi there")
        );
        assert_eq!(notification.content.intended_recipient.as_deref(), Some("12345"));
        assert_eq!(notification.content.badge_count.as_deref(), Some(r#"{"dt":1}"#));
        assert_eq!(notification.json, DIRECT);
    }

    #[test]
    fn test_other_collapse_keys_not_direct() {
        let json = r#"{"token":"tok","fbpushnotif":"{\"collapse_key\":\"like\",\"m\":\"bob liked your post\"}"}"#;
        let notification = PushNotification::parse(json).unwrap();
        assert!(!notification.is_direct_message());

        let bare = PushNotification::parse(r#"{"token":"tok"}"#).unwrap();
        assert!(!bare.is_direct_message());
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(PushNotification::parse("not json").is_err());
        assert!(PushNotification::parse(r#"{"fbpushnotif":"{broken"}"#).is_err());
        assert!(PushNotification::parse(r#"{"fbpushnotif":[1,2]}"#).is_err());
    }
}
