use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{DEFAULT_USER_NAME, PAIR_SEPARATOR};
use crate::error::ProtocolError;

// Peer identity = the IP address the peer connects from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct PeerIp(String);

impl PeerIp {
    /// Parse and normalize an address. Anything that is not a literal IPv4
    /// or IPv6 address is rejected, so a `PeerIp` is always safe to use as a
    /// path component.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        s.trim()
            .parse::<IpAddr>()
            .map(Self::from)
            .map_err(|_| ProtocolError::InvalidPeer(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for PeerIp {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

impl TryFrom<String> for PeerIp {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<PeerIp> for String {
    fn from(ip: PeerIp) -> Self {
        ip.0
    }
}

impl std::fmt::Display for PeerIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order-independent key of a two-party conversation.
///
/// Both addresses are sorted lexicographically and joined with `_to_`, so
/// `(a, b)` and `(b, a)` name the same log and the same attachment
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatPairKey(String);

impl ChatPairKey {
    pub fn new(a: &PeerIp, b: &PeerIp) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{lo}{PAIR_SEPARATOR}{hi}"))
    }

    /// Parse a pair directory name, accepting only the canonical form.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let (a, b) = s
            .split_once(PAIR_SEPARATOR)
            .ok_or_else(|| ProtocolError::InvalidPair(s.to_string()))?;
        let a = PeerIp::parse(a).map_err(|_| ProtocolError::InvalidPair(s.to_string()))?;
        let b = PeerIp::parse(b).map_err(|_| ProtocolError::InvalidPair(s.to_string()))?;
        let key = Self::new(&a, &b);
        if key.0 != s {
            return Err(ProtocolError::InvalidPair(s.to_string()));
        }
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChatPairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Any identity ever seen by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredUser {
    pub ip: PeerIp,
    pub name: String,
}

impl RegisteredUser {
    pub fn unnamed(ip: PeerIp) -> Self {
        Self {
            ip,
            name: DEFAULT_USER_NAME.to_string(),
        }
    }
}

/// A file attached to a message. `path` is relative to the pair directory
/// (`attachments/<file>`) and is filled in by the server once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Server-assigned id. Logs written before ids existed may lack it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub text: String,
    pub sent: DateTime<Utc>,
    pub from: PeerIp,
    pub to: PeerIp,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default)]
    pub read: bool,
}

impl Message {
    pub fn pair_key(&self) -> ChatPairKey {
        ChatPairKey::new(&self.from, &self.to)
    }

    pub fn is_unread_for(&self, ip: &PeerIp) -> bool {
        !self.read && &self.to == ip
    }
}

/// A message as submitted by a client, before the server stamps it.
///
/// Any `from`, `id` or `read` the client sends is ignored: the sender is
/// always the identity the server resolved for the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub sent: Option<DateTime<Utc>>,
    pub to: PeerIp,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
}

impl MessageDraft {
    pub fn has_attachments(&self) -> bool {
        self.attachments.as_ref().is_some_and(|a| !a.is_empty())
    }

    pub fn into_message(self, from: PeerIp) -> Message {
        Message {
            id: Some(Uuid::new_v4()),
            text: self.text,
            sent: self.sent.unwrap_or_else(Utc::now),
            from,
            to: self.to,
            attachments: self.attachments,
            read: false,
        }
    }
}

/// Identifies the message a recipient has read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadAck {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub sent: DateTime<Utc>,
    pub from: PeerIp,
}

impl ReadAck {
    /// Whether `message` is the one acknowledged. Matches by id when both
    /// sides carry one, by exact send time otherwise.
    pub fn matches(&self, message: &Message) -> bool {
        match (self.id, message.id) {
            (Some(ack), Some(id)) => ack == id,
            _ => message.sent == self.sent,
        }
    }
}
