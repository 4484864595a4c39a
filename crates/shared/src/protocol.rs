//! Wire types for the Bayeux/Faye push protocol.
//!
//! Every request is POSTed as a one-element JSON array; every response body
//! is an array whose first element carries the protocol status. Response
//! types are deliberately lenient (`Option` + `#[serde(default)]`) so a
//! partially filled-in server reply still deserializes; the client decides
//! what counts as success.

use serde::{Deserialize, Serialize};

use crate::domain::{GroupId, UserId};

pub const HANDSHAKE_CHANNEL: &str = "/meta/handshake";
pub const SUBSCRIBE_CHANNEL: &str = "/meta/subscribe";
pub const CONNECT_CHANNEL: &str = "/meta/connect";
pub const BAYEUX_VERSION: &str = "1.0";
pub const LONG_POLLING: &str = "long-polling";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub channel: &'static str,
    pub version: &'static str,
    pub supported_connection_types: Vec<&'static str>,
    pub successful: bool,
    pub id: u64,
}

impl HandshakeRequest {
    pub fn new(id: u64) -> Self {
        Self {
            channel: HANDSHAKE_CHANNEL,
            version: BAYEUX_VERSION,
            supported_connection_types: vec![LONG_POLLING],
            successful: false,
            id,
        }
    }
}

/// The `ext` block carried on subscribe requests: the opaque access
/// credential plus the client's current unix timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeExt {
    pub access_token: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub channel: &'static str,
    pub client_id: String,
    pub subscription: String,
    pub id: u64,
    pub ext: SubscribeExt,
}

impl SubscribeRequest {
    pub fn new(
        client_id: impl Into<String>,
        subscription: impl Into<String>,
        id: u64,
        access_token: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            channel: SUBSCRIBE_CHANNEL,
            client_id: client_id.into(),
            subscription: subscription.into(),
            id,
            ext: SubscribeExt {
                access_token: access_token.into(),
                timestamp,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub channel: &'static str,
    pub client_id: String,
    pub connection_type: &'static str,
    pub id: u64,
}

impl ConnectRequest {
    pub fn new(client_id: impl Into<String>, id: u64) -> Self {
        Self {
            channel: CONNECT_CHANNEL,
            client_id: client_id.into(),
            connection_type: LONG_POLLING,
            id,
        }
    }
}

/// Reconnection advice some servers attach to handshake/connect replies.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ServerAdvice {
    #[serde(default)]
    pub reconnect: Option<String>,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Status element returned for handshakes and mirrored as element 0 of
/// every long-poll response.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub successful: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub advice: Option<ServerAdvice>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub successful: bool,
    #[serde(default)]
    pub subscription: Option<String>,
}

/// Element 1 of a long-poll response: the channel an event arrived on and
/// its opaque payload.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EventDelivery {
    pub channel: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A decoded push notification, keyed by the server's `type` discriminator.
///
/// Payloads stay opaque (`serde_json::Value`): routing only needs the
/// discriminator and the channel the event arrived on. Discriminators this
/// client does not know about decode to [`Notification::Unknown`] rather
/// than failing.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Notification {
    /// A new message was posted in a group.
    #[serde(rename = "line.create")]
    LineCreate {
        #[serde(default)]
        alert: Option<String>,
        #[serde(default)]
        received_at: Option<String>,
        #[serde(default)]
        subject: serde_json::Value,
    },
    /// A new direct message was posted.
    #[serde(rename = "direct_message.create")]
    DirectMessageCreate {
        #[serde(default)]
        alert: Option<String>,
        #[serde(default)]
        received_at: Option<String>,
        #[serde(default)]
        subject: serde_json::Value,
    },
    /// Someone liked a message.
    #[serde(rename = "like.create")]
    LikeCreate {
        #[serde(default)]
        alert: Option<String>,
        #[serde(default)]
        subject: serde_json::Value,
    },
    /// A message's favorite state changed.
    #[serde(rename = "favorite")]
    Favorite {
        #[serde(default)]
        subject: serde_json::Value,
    },
    /// Server keepalive.
    #[serde(rename = "ping")]
    Ping,
    #[serde(other)]
    Unknown,
}

impl Notification {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::LineCreate { .. } => "line.create",
            Notification::DirectMessageCreate { .. } => "direct_message.create",
            Notification::LikeCreate { .. } => "like.create",
            Notification::Favorite { .. } => "favorite",
            Notification::Ping => "ping",
            Notification::Unknown => "unknown",
        }
    }
}

/// Where a notification was routed from: a group's channel or the current
/// user's personal channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationSource {
    CurrentUser { user_id: UserId },
    Group { group_id: GroupId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handshake_request_serializes_wire_field_names() {
        let request = HandshakeRequest::new(3);
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(
            value,
            json!({
                "channel": "/meta/handshake",
                "version": "1.0",
                "supportedConnectionTypes": ["long-polling"],
                "successful": false,
                "id": 3,
            })
        );
    }

    #[test]
    fn subscribe_request_carries_snake_case_ext() {
        let request = SubscribeRequest::new("client-1", "/group/7", 4, "token", 1_700_000_000);
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["clientId"], "client-1");
        assert_eq!(value["subscription"], "/group/7");
        assert_eq!(value["ext"]["access_token"], "token");
        assert_eq!(value["ext"]["timestamp"], 1_700_000_000i64);
    }

    #[test]
    fn handshake_response_tolerates_missing_fields() {
        let response: HandshakeResponse =
            serde_json::from_value(json!({ "successful": true, "clientId": "abc" }))
                .expect("deserialize");
        assert!(response.successful);
        assert_eq!(response.client_id.as_deref(), Some("abc"));
        assert!(response.advice.is_none());
    }

    #[test]
    fn handshake_response_reads_server_advice() {
        let response: HandshakeResponse = serde_json::from_value(json!({
            "channel": "/meta/handshake",
            "successful": true,
            "clientId": "abc",
            "advice": { "reconnect": "retry", "interval": 0, "timeout": 30_000 },
        }))
        .expect("deserialize");
        let advice = response.advice.expect("advice");
        assert_eq!(advice.reconnect.as_deref(), Some("retry"));
        assert_eq!(advice.timeout, Some(30_000));
    }

    #[test]
    fn line_create_notification_decodes() {
        let notification: Notification = serde_json::from_value(json!({
            "type": "line.create",
            "alert": "Alice: hello",
            "received_at": "1700000000",
            "subject": { "id": "1", "text": "hello" },
        }))
        .expect("deserialize");
        match notification {
            Notification::LineCreate { alert, subject, .. } => {
                assert_eq!(alert.as_deref(), Some("Alice: hello"));
                assert_eq!(subject["text"], "hello");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_decodes_to_unknown_variant() {
        let notification: Notification = serde_json::from_value(json!({
            "type": "membership.announce",
            "whatever": 1,
        }))
        .expect("deserialize");
        assert_eq!(notification, Notification::Unknown);
        assert_eq!(notification.kind(), "unknown");
    }

    #[test]
    fn missing_type_discriminator_is_an_error() {
        let result = serde_json::from_value::<Notification>(json!({ "alert": "hi" }));
        assert!(result.is_err());
    }

    #[test]
    fn ping_notification_decodes_without_payload() {
        let notification: Notification =
            serde_json::from_value(json!({ "type": "ping" })).expect("deserialize");
        assert_eq!(notification, Notification::Ping);
    }
}
