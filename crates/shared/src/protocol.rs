use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{MessageId, UserId};

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.trim().is_empty()))
}

/// The authenticated user's profile as known to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "_id", alias = "id")]
    pub id: UserId,
    #[serde(rename = "fullName", alias = "displayName", default)]
    pub display_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(
        rename = "profilePic",
        alias = "avatarRef",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub avatar_ref: Option<String>,
}

/// Identity responses come either flat or nested under `user`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdentityEnvelope {
    Nested { user: Identity },
    Flat(Identity),
}

impl IdentityEnvelope {
    pub fn into_identity(self) -> Identity {
        match self {
            IdentityEnvelope::Nested { user } => user,
            IdentityEnvelope::Flat(identity) => identity,
        }
    }
}

/// Login and signup answer with the identity and a fresh credential together.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthPayload {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub identity: IdentityEnvelope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(rename = "_id", alias = "id")]
    pub id: UserId,
    #[serde(rename = "fullName", alias = "displayName", default)]
    pub display_name: String,
    #[serde(
        rename = "profilePic",
        alias = "avatarRef",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub avatar_ref: Option<String>,
    #[serde(rename = "isOnline", default)]
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_id", alias = "id")]
    pub id: MessageId,
    #[serde(rename = "senderId")]
    pub sender_id: UserId,
    #[serde(rename = "receiverId")]
    pub receiver_id: UserId,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub text: Option<String>,
    #[serde(
        rename = "image",
        alias = "imageRef",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub image_ref: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A message must carry text, an image, or both.
    pub fn has_content(&self) -> bool {
        self.text.is_some() || self.image_ref.is_some()
    }

    pub fn involves(&self, peer_id: &UserId) -> bool {
        &self.sender_id == peer_id || &self.receiver_id == peer_id
    }
}

/// Collection responses: a bare array, or an array under `users`,
/// `messages` or `data`. Anything else is rejected at the boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ListEnvelope<T> {
    Bare(Vec<T>),
    Users { users: Vec<T> },
    Messages { messages: Vec<T> },
    Data { data: Vec<T> },
}

impl<T> ListEnvelope<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            ListEnvelope::Bare(items)
            | ListEnvelope::Users { users: items }
            | ListEnvelope::Messages { messages: items }
            | ListEnvelope::Data { data: items } => items,
        }
    }
}

/// A single sent message: bare, or wrapped under `message` or `data`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageEnvelope {
    Wrapped { message: Message },
    Data { data: Message },
    Bare(Message),
}

impl MessageEnvelope {
    pub fn into_message(self) -> Message {
        match self {
            MessageEnvelope::Wrapped { message } | MessageEnvelope::Data { data: message } => {
                message
            }
            MessageEnvelope::Bare(message) => message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    #[serde(rename = "fullName")]
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(rename = "profilePic")]
    pub avatar_ref: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "image", default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetPasswordRequest {
    pub password: String,
}

/// First frame sent on a freshly opened transport. The credential travels
/// here and never in the URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub auth: HandshakeAuth,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct HandshakeAuth {
    pub token: String,
}

impl std::fmt::Debug for HandshakeAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeAuth")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl HandshakeFrame {
    pub fn connect(token: impl Into<String>) -> Self {
        Self {
            kind: "connect".to_string(),
            auth: HandshakeAuth {
                token: token.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    ConnectError,
    NewMessage,
    GetOnlineUsers,
    Unauthorized,
}

impl EventKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::ConnectError => "connect_error",
            EventKind::NewMessage => "newMessage",
            EventKind::GetOnlineUsers => "getOnlineUsers",
            EventKind::Unauthorized => "unauthorized",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Some(match name {
            "connect" => EventKind::Connect,
            "disconnect" => EventKind::Disconnect,
            "connect_error" => EventKind::ConnectError,
            "newMessage" => EventKind::NewMessage,
            "getOnlineUsers" => EventKind::GetOnlineUsers,
            "unauthorized" => EventKind::Unauthorized,
            _ => return None,
        })
    }
}

/// Inbound transport events, framed as `{ "event": <name>, "data": <payload> }`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connect { sid: Option<String> },
    Disconnect { reason: String },
    ConnectError { message: String },
    NewMessage(Message),
    GetOnlineUsers(Vec<UserId>),
    Unauthorized { message: Option<String> },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed transport frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown transport event '{0}'")]
    UnknownEvent(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrObject {
    Text(String),
    Object {
        #[serde(alias = "reason")]
        message: Option<String>,
    },
}

impl TextOrObject {
    fn into_text(self) -> Option<String> {
        match self {
            TextOrObject::Text(text) => Some(text),
            TextOrObject::Object { message } => message,
        }
    }
}

fn text_payload(data: Value) -> Result<Option<String>, serde_json::Error> {
    if data.is_null() {
        return Ok(None);
    }
    Ok(serde_json::from_value::<TextOrObject>(data)?.into_text())
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Connect { .. } => EventKind::Connect,
            TransportEvent::Disconnect { .. } => EventKind::Disconnect,
            TransportEvent::ConnectError { .. } => EventKind::ConnectError,
            TransportEvent::NewMessage(_) => EventKind::NewMessage,
            TransportEvent::GetOnlineUsers(_) => EventKind::GetOnlineUsers,
            TransportEvent::Unauthorized { .. } => EventKind::Unauthorized,
        }
    }

    pub fn from_frame(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let kind = EventKind::from_wire_name(&raw.event)
            .ok_or_else(|| FrameError::UnknownEvent(raw.event.clone()))?;
        let event = match kind {
            EventKind::Connect => {
                #[derive(Deserialize, Default)]
                struct Ack {
                    sid: Option<String>,
                }
                let ack = if raw.data.is_null() {
                    Ack::default()
                } else {
                    serde_json::from_value::<Ack>(raw.data)?
                };
                TransportEvent::Connect { sid: ack.sid }
            }
            EventKind::Disconnect => TransportEvent::Disconnect {
                reason: text_payload(raw.data)?.unwrap_or_else(|| "io server disconnect".into()),
            },
            EventKind::ConnectError => TransportEvent::ConnectError {
                message: text_payload(raw.data)?.unwrap_or_else(|| "connect_error".into()),
            },
            EventKind::NewMessage => TransportEvent::NewMessage(serde_json::from_value(raw.data)?),
            EventKind::GetOnlineUsers => {
                TransportEvent::GetOnlineUsers(serde_json::from_value(raw.data)?)
            }
            EventKind::Unauthorized => TransportEvent::Unauthorized {
                message: text_payload(raw.data)?,
            },
        };
        Ok(event)
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let data = match self {
            TransportEvent::Connect { sid } => match sid {
                Some(sid) => serde_json::json!({ "sid": sid }),
                None => Value::Null,
            },
            TransportEvent::Disconnect { reason } => Value::String(reason.clone()),
            TransportEvent::ConnectError { message } => serde_json::json!({ "message": message }),
            TransportEvent::NewMessage(message) => serde_json::to_value(message)?,
            TransportEvent::GetOnlineUsers(users) => serde_json::to_value(users)?,
            TransportEvent::Unauthorized { message } => match message {
                Some(message) => serde_json::json!({ "message": message }),
                None => Value::Null,
            },
        };
        serde_json::to_string(&RawFrame {
            event: self.kind().wire_name().to_string(),
            data,
        })
    }
}
