//! Relay Engine.
//!
//! Owns the presence tracker and the outbound queue of every live
//! connection. Messages are persisted to the chat log first and then handed
//! to the recipient's connection if it has one; an offline recipient finds
//! the message in the log on its next `requestChatLog`.
//!
//! A connection moves through `connect` (identity resolved, presence
//! registered, user upserted, presence broadcast), an active phase in which
//! its [`Session`] answers client events, and [`Session::close`], which is
//! terminal.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lanchat_shared::constants::DEFAULT_USER_NAME;
use lanchat_shared::protocol::{ClientEvent, ClientsSnapshot, PeerInfo, ServerEvent};
use lanchat_shared::types::{Message, MessageDraft, PeerIp, ReadAck};
use lanchat_shared::ProtocolError;
use lanchat_store::{ChatLogStore, StoreError, UserStore};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::presence::{ConnectionId, PresenceTracker};

/// Events buffered per connection before it counts as stalled.
pub const OUTBOX_CAPACITY: usize = 256;

/// Queue of events waiting to be written to one connection.
pub type Outbox = mpsc::Sender<ServerEvent>;

enum Queued {
    Sent,
    Full,
    Closed,
}

fn queue(tx: &Outbox, event: ServerEvent) -> Queued {
    match tx.try_send(event) {
        Ok(()) => Queued::Sent,
        Err(TrySendError::Full(_)) => Queued::Full,
        Err(TrySendError::Closed(_)) => Queued::Closed,
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl RelayError {
    /// Text sent back to the client. I/O details stay in the server log.
    fn client_message(&self) -> String {
        match self {
            RelayError::Store(StoreError::Io(_) | StoreError::Json(_)) => {
                "storage failure".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Default)]
struct Hub {
    presence: PresenceTracker,
    outboxes: HashMap<ConnectionId, Outbox>,
}

pub struct RelayEngine {
    hub: RwLock<Hub>,
    users: Arc<UserStore>,
    chats: Arc<ChatLogStore>,
    next_id: AtomicU64,
    outbox_capacity: usize,
}

impl RelayEngine {
    pub fn new(users: Arc<UserStore>, chats: Arc<ChatLogStore>) -> Self {
        Self {
            hub: RwLock::new(Hub::default()),
            users,
            chats,
            next_id: AtomicU64::new(1),
            outbox_capacity: OUTBOX_CAPACITY,
        }
    }

    /// Admit a connection whose identity has been resolved to `ip`.
    ///
    /// Returns the session that handles its requests and the receiver of
    /// events to write back to it. The caller must call [`Session::close`]
    /// when the transport goes away.
    pub async fn connect(
        self: &Arc<Self>,
        ip: PeerIp,
    ) -> (Session, mpsc::Receiver<ServerEvent>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.outbox_capacity);

        // Queued before the outbox is visible, so no broadcast can overtake it.
        let _ = tx.try_send(ServerEvent::ReceiveIp(ip.clone()));
        {
            let mut hub = self.hub.write().await;
            hub.presence.register(id, ip.clone());
            hub.outboxes.insert(id, tx);
        }

        // A failed write here does not keep the peer offline.
        if let Err(e) = self.users.upsert(&ip).await {
            error!(ip = %ip, error = %e, "Failed to register user");
        }

        let info = self.peer_info(id, &ip).await;
        self.broadcast_except(id, ServerEvent::Connected(info)).await;
        self.broadcast_presence().await;

        let connections = self.connection_count().await;
        info!(conn = %id, ip = %ip, connections, "Peer connected");

        let session = Session {
            id,
            ip,
            selected_peer: None,
            engine: self.clone(),
        };
        (session, rx)
    }

    async fn disconnect(&self, id: ConnectionId) {
        let ip = {
            let mut hub = self.hub.write().await;
            hub.outboxes.remove(&id);
            hub.presence.unregister(id)
        };
        let Some(ip) = ip else {
            return;
        };

        let info = self.peer_info(id, &ip).await;
        self.broadcast(ServerEvent::Disconnected(info)).await;
        self.broadcast_presence().await;

        let connections = self.connection_count().await;
        info!(conn = %id, ip = %ip, connections, "Peer disconnected");
    }

    async fn peer_info(&self, id: ConnectionId, ip: &PeerIp) -> PeerInfo {
        let name = match self.users.find(ip).await {
            Ok(Some(user)) => user.name,
            Ok(None) => DEFAULT_USER_NAME.to_string(),
            Err(e) => {
                warn!(ip = %ip, error = %e, "Failed to look up user name");
                DEFAULT_USER_NAME.to_string()
            }
        };
        PeerInfo {
            name,
            ip: ip.clone(),
            socket_id: id.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    async fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        let queued = {
            let hub = self.hub.read().await;
            match hub.outboxes.get(&id) {
                Some(tx) => queue(tx, event),
                None => Queued::Closed,
            }
        };
        self.settle(id, queued).await
    }

    async fn settle(&self, id: ConnectionId, queued: Queued) -> bool {
        match queued {
            Queued::Sent => true,
            Queued::Closed => false,
            Queued::Full => {
                self.evict(&[id]).await;
                false
            }
        }
    }

    async fn broadcast(&self, event: ServerEvent) {
        self.broadcast_where(None, event).await;
    }

    async fn broadcast_except(&self, skip: ConnectionId, event: ServerEvent) {
        self.broadcast_where(Some(skip), event).await;
    }

    async fn broadcast_where(&self, skip: Option<ConnectionId>, event: ServerEvent) {
        let stalled: Vec<ConnectionId> = {
            let hub = self.hub.read().await;
            hub.outboxes
                .iter()
                .filter(|(id, _)| Some(**id) != skip)
                .filter_map(|(id, tx)| {
                    matches!(queue(tx, event.clone()), Queued::Full).then_some(*id)
                })
                .collect()
        };
        self.evict(&stalled).await;
    }

    /// Drop the outboxes of connections that stopped reading. Their transport
    /// sees the queue close once it has written what is buffered, and ends
    /// the session.
    async fn evict(&self, ids: &[ConnectionId]) {
        if ids.is_empty() {
            return;
        }
        let mut hub = self.hub.write().await;
        for id in ids {
            if hub.outboxes.remove(id).is_some() {
                warn!(conn = %id, "Outbox full, dropping slow connection");
            }
        }
    }

    pub async fn presence_snapshot(&self) -> Result<ClientsSnapshot, RelayError> {
        let users = self.users.load().await?;
        let hub = self.hub.read().await;
        Ok(hub.presence.snapshot(&users))
    }

    async fn broadcast_presence(&self) {
        match self.presence_snapshot().await {
            Ok(snapshot) => self.broadcast(ServerEvent::UpdateClients(snapshot)).await,
            Err(e) => error!(error = %e, "Failed to build presence snapshot"),
        }
    }

    /// Hand `message` to the recipient's live connection, if any.
    async fn deliver(&self, message: &Message) -> bool {
        let (id, queued) = {
            let hub = self.hub.read().await;
            let Some(id) = hub.presence.find_connection_by_ip(&message.to) else {
                return false;
            };
            let queued = match hub.outboxes.get(&id) {
                Some(tx) => queue(tx, ServerEvent::ReceiveMessage(message.clone())),
                None => Queued::Closed,
            };
            (id, queued)
        };
        self.settle(id, queued).await
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Persist a stamped message and relay it to the recipient if online.
    /// Returns whether it was delivered live.
    pub async fn publish(&self, message: &Message) -> Result<bool, RelayError> {
        self.chats.append(message).await?;
        let delivered = self.deliver(message).await;
        if delivered {
            debug!(from = %message.from, to = %message.to, "Message relayed");
        } else {
            debug!(from = %message.from, to = %message.to, "Recipient offline, message stored");
        }
        Ok(delivered)
    }

    /// Text-only send path. Drafts carrying attachments are left to the
    /// upload endpoint, which stores the files and publishes the message.
    pub async fn send_message(
        &self,
        from: &PeerIp,
        draft: MessageDraft,
    ) -> Result<Option<Message>, RelayError> {
        if draft.has_attachments() {
            debug!(from = %from, to = %draft.to, "Message has attachments, expecting upload");
            return Ok(None);
        }
        let message = draft.into_message(from.clone());
        self.publish(&message).await?;
        Ok(Some(message))
    }

    pub async fn chat_log(
        &self,
        ip: &PeerIp,
        peer: &PeerIp,
    ) -> Result<Vec<Message>, RelayError> {
        Ok(self.chats.read_all(ip, peer).await?)
    }

    /// Unread counts for `ip`, keyed by sender. Peers with nothing unread
    /// are omitted.
    pub async fn unreads(&self, ip: &PeerIp) -> Result<BTreeMap<PeerIp, usize>, RelayError> {
        let mut counts = BTreeMap::new();
        for user in self.users.load().await? {
            if &user.ip == ip {
                continue;
            }
            let count = self.chats.unread_count(ip, &user.ip).await?;
            if count > 0 {
                counts.insert(user.ip, count);
            }
        }
        Ok(counts)
    }

    pub async fn mark_read(&self, reader: &PeerIp, ack: &ReadAck) -> Result<usize, RelayError> {
        Ok(self.chats.mark_read(reader, ack).await?)
    }

    pub async fn rename(&self, ip: &PeerIp, name: &str) -> Result<(), RelayError> {
        self.users.rename(ip, name).await?;
        self.broadcast_presence().await;
        Ok(())
    }

    pub async fn connection_count(&self) -> usize {
        self.hub.read().await.presence.connection_count()
    }
}

/// Request handler for one active connection.
pub struct Session {
    id: ConnectionId,
    ip: PeerIp,
    selected_peer: Option<PeerIp>,
    engine: Arc<RelayEngine>,
}

impl Session {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn ip(&self) -> &PeerIp {
        &self.ip
    }

    /// Process one client event. Failures are reported to this connection
    /// as an `error` event; the connection stays open.
    pub async fn handle(&mut self, event: ClientEvent) {
        if let Err(e) = self.dispatch(event).await {
            warn!(conn = %self.id, ip = %self.ip, error = %e, "Request failed");
            self.reject(e.client_message()).await;
        }
    }

    /// Send an `error` event to this connection.
    pub async fn reject(&self, message: impl Into<String>) {
        self.engine.send_to(self.id, ServerEvent::error(message)).await;
    }

    async fn reply(&self, event: ServerEvent) {
        self.engine.send_to(self.id, event).await;
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<(), RelayError> {
        match event {
            ClientEvent::RequestClients => {
                let snapshot = self.engine.presence_snapshot().await?;
                self.reply(ServerEvent::UpdateClients(snapshot)).await;
            }
            ClientEvent::RequestChatLog(peer) => {
                let log = self.engine.chat_log(&self.ip, &peer).await?;
                self.selected_peer = Some(peer);
                self.reply(ServerEvent::ReceiveChatLog(log)).await;
            }
            ClientEvent::SendMessage(draft) => {
                self.engine.send_message(&self.ip, draft).await?;
            }
            ClientEvent::MarkAsRead(ack) => {
                if self.selected_peer.as_ref() != Some(&ack.from) {
                    debug!(
                        conn = %self.id,
                        from = %ack.from,
                        "Ignoring read ack for unselected peer"
                    );
                    return Ok(());
                }
                self.engine.mark_read(&self.ip, &ack).await?;
            }
            ClientEvent::RequestUnreads => {
                let unreads = self.engine.unreads(&self.ip).await?;
                self.reply(ServerEvent::ReceiveUnreads(unreads)).await;
            }
            ClientEvent::SetName(name) => {
                self.engine.rename(&self.ip, &name).await?;
            }
        }
        Ok(())
    }

    /// Unregister the connection and tell everyone else. Terminal.
    pub async fn close(self) {
        self.engine.disconnect(self.id).await;
    }
}
