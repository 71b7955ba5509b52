//! Control event envelope
//!
//! Control traffic is a MessagePack map `{event: <name>, data: <map>}`. Incoming
//! envelopes are mapped to [`ServerEvent`] by name; names the client does not know
//! are reported as [`ProtocolError::UnknownEvent`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::error::ProtocolError;

fn empty_data() -> Value {
    Value::Object(Map::new())
}

/// Serialized form of a control event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default = "empty_data")]
    pub data: Value,
}

impl Envelope {
    /// Create an envelope; a `null` payload is replaced by an empty map
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        let data = if data.is_null() { empty_data() } else { data };
        Self {
            event: event.into(),
            data,
        }
    }

    /// Encode as a MessagePack map
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode from MessagePack
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// A participant as announced by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: u16,
    pub name: String,
}

/// Control events understood by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A participant joined the server
    UserJoined(UserInfo),
    /// A participant left
    UserLeft { id: u16 },
    /// Full participant list, sent after login
    UserList(Vec<UserInfo>),
    /// Text message from a participant
    Message { from: u16, text: String },
}

#[derive(Deserialize)]
struct UserLeftData {
    id: u16,
}

#[derive(Deserialize)]
struct UserListData {
    users: Vec<UserInfo>,
}

#[derive(Deserialize)]
struct MessageData {
    from: u16,
    text: String,
}

fn parse_data<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidEventData {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

impl ServerEvent {
    /// Wire name of this event
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::UserList(_) => "user_list",
            Self::Message { .. } => "message",
        }
    }

    /// Map a decoded envelope to a known event
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { event, data } = envelope;
        match event.as_str() {
            "user_joined" => Ok(Self::UserJoined(parse_data(&event, data)?)),
            "user_left" => {
                let UserLeftData { id } = parse_data(&event, data)?;
                Ok(Self::UserLeft { id })
            }
            "user_list" => {
                let UserListData { users } = parse_data(&event, data)?;
                Ok(Self::UserList(users))
            }
            "message" => {
                let MessageData { from, text } = parse_data(&event, data)?;
                Ok(Self::Message { from, text })
            }
            _ => Err(ProtocolError::UnknownEvent(event)),
        }
    }

    /// Decode a MessagePack envelope straight into an event
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_envelope(Envelope::decode(bytes)?)
    }

    /// Build the envelope the server would send for this event
    pub fn to_envelope(&self) -> Envelope {
        let data = match self {
            Self::UserJoined(user) => json!({ "id": user.id, "name": user.name }),
            Self::UserLeft { id } => json!({ "id": id }),
            Self::UserList(users) => json!({ "users": users }),
            Self::Message { from, text } => json!({ "from": from, "text": text }),
        };
        Envelope::new(self.name(), data)
    }
}
