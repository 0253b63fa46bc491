use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{Message, MessageDraft, PeerIp, ReadAck, RegisteredUser};

/// Events a client sends over the WebSocket.
///
/// Every frame is a JSON object `{"event": "<name>", "data": <payload>}`;
/// events without a payload omit `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Poll the online/offline snapshot
    RequestClients,

    /// Fetch the history with a peer and select that peer
    RequestChatLog(PeerIp),

    /// Send a text-only message (attachments go through `POST /upload`)
    SendMessage(MessageDraft),

    /// Acknowledge a received message as read
    MarkAsRead(ReadAck),

    /// Poll unread counts per peer
    RequestUnreads,

    /// Change the sender's display name
    SetName(String),
}

impl ClientEvent {
    pub fn from_frame(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Events the server pushes to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Identity assigned to this connection
    ReceiveIp(PeerIp),

    /// Presence snapshot
    UpdateClients(ClientsSnapshot),

    /// Another peer connected
    Connected(PeerInfo),

    /// Another peer disconnected
    Disconnected(PeerInfo),

    /// History response, in append order
    ReceiveChatLog(Vec<Message>),

    /// Live delivery of a message addressed to this connection
    ReceiveMessage(Message),

    /// Unread counts keyed by sender
    ReceiveUnreads(BTreeMap<PeerIp, usize>),

    /// A request from this connection was rejected
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientsSnapshot {
    pub online: Vec<RegisteredUser>,
    pub offline: Vec<RegisteredUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub name: String,
    pub ip: PeerIp,
    pub socket_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub message: String,
}
