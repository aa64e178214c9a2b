use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One logical protocol message. Serialized as a flat JSON object whose
/// `type` field selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Login or register (client -> server)
    Auth {
        action: AuthAction,
        username: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },

    /// Outcome of a login attempt
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Outcome of a registration attempt
    RegisterResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Ask for the room list
    GetRooms,

    RoomsList { rooms: Vec<String> },

    CreateRoom { room_name: String },

    RoomCreated {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    JoinRoom { room: String },

    /// Sent to the joiner only: recent history plus who is present
    RoomJoined {
        room: String,
        history: Vec<HistoryEntry>,
        users: Vec<String>,
    },

    /// A chat message. Clients send only `body` and `kind`; the server
    /// fills in author, room and timestamp before relaying.
    Message {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        username: String,
        #[serde(alias = "message")]
        body: String,
        #[serde(default, alias = "message_type")]
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    UserJoined {
        username: String,
        room: String,
        timestamp: DateTime<Utc>,
    },

    UserLeft {
        username: String,
        room: String,
        timestamp: DateTime<Utc>,
    },

    /// A request failed on the server side and has no result envelope of its own
    Error { request: String, error: String },
}

impl Envelope {
    /// The wire value of the `type` discriminator.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::AuthResult { .. } => "auth_result",
            Self::RegisterResult { .. } => "register_result",
            Self::GetRooms => "get_rooms",
            Self::RoomsList { .. } => "rooms_list",
            Self::CreateRoom { .. } => "create_room",
            Self::RoomCreated { .. } => "room_created",
            Self::JoinRoom { .. } => "join_room",
            Self::RoomJoined { .. } => "room_joined",
            Self::Message { .. } => "message",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthAction {
    Login,
    Register,
}

/// What a message body carries. Image and file bodies are encoded payloads
/// the server stores and relays without inspecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// One stored message as replayed in `room_joined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub username: String,
    pub body: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}
