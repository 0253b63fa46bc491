//! Per-pair chat logs and their attachments.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use lanchat_shared::constants::{ATTACHMENTS_DIR, MESSAGES_FILE};
use lanchat_shared::types::{Attachment, ChatPairKey, Message, PeerIp, ReadAck};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::json_file;

/// Upper bound on `<millis>_<n>` suffixes tried before giving up.
const MAX_NAME_ATTEMPTS: u32 = 1000;

pub struct ChatLogStore {
    root: PathBuf,
    locks: Mutex<HashMap<ChatPairKey, Arc<Mutex<()>>>>,
}

impl ChatLogStore {
    pub async fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).await?;
        info!(path = %root.display(), "Chat log store initialized");
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pair_dir(&self, key: &ChatPairKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    fn messages_file(&self, key: &ChatPairKey) -> PathBuf {
        self.pair_dir(key).join(MESSAGES_FILE)
    }

    /// Directory of the conversation between `a` and `b`, creating it and its
    /// `attachments/` subdirectory if missing.
    pub async fn path_for(&self, a: &PeerIp, b: &PeerIp) -> Result<PathBuf> {
        let key = ChatPairKey::new(a, b);
        let dir = self.pair_dir(&key);
        // create_dir_all treats an existing directory as success
        fs::create_dir_all(dir.join(ATTACHMENTS_DIR)).await?;
        Ok(dir)
    }

    async fn lock_pair(&self, key: &ChatPairKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Entries nobody holds or waits on are only referenced by the map.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Append `message` to its pair's log.
    pub async fn append(&self, message: &Message) -> Result<()> {
        let key = message.pair_key();
        self.path_for(&message.from, &message.to).await?;

        let _guard = self.lock_pair(&key).await;
        let path = self.messages_file(&key);
        let mut messages: Vec<Message> = json_file::read_or_default(&path).await?;
        messages.push(message.clone());
        json_file::write_atomic(&path, &messages).await?;

        debug!(pair = %key, count = messages.len(), "Appended message");
        Ok(())
    }

    /// Full history of the pair in append order. A pair that never talked
    /// has an empty history.
    pub async fn read_all(&self, a: &PeerIp, b: &PeerIp) -> Result<Vec<Message>> {
        let key = ChatPairKey::new(a, b);
        json_file::read_or_default(&self.messages_file(&key)).await
    }

    /// Mark the message identified by `ack` as read by `reader`.
    ///
    /// Only messages addressed to `reader` are touched. Returns how many
    /// entries flipped; the file is left alone when none did.
    pub async fn mark_read(&self, reader: &PeerIp, ack: &ReadAck) -> Result<usize> {
        let key = ChatPairKey::new(reader, &ack.from);
        let _guard = self.lock_pair(&key).await;
        let path = self.messages_file(&key);
        let mut messages: Vec<Message> = json_file::read_or_default(&path).await?;

        let mut flipped = 0;
        for message in messages
            .iter_mut()
            .filter(|m| &m.to == reader && !m.read && ack.matches(m))
        {
            message.read = true;
            flipped += 1;
        }

        if flipped > 0 {
            json_file::write_atomic(&path, &messages).await?;
            debug!(pair = %key, flipped, "Marked messages read");
        }
        Ok(flipped)
    }

    /// Number of unread messages `peer` has sent to `reader`.
    pub async fn unread_count(&self, reader: &PeerIp, peer: &PeerIp) -> Result<usize> {
        Ok(self
            .read_all(reader, peer)
            .await?
            .iter()
            .filter(|m| m.is_unread_for(reader))
            .count())
    }

    /// Store an uploaded file under the pair's `attachments/` directory.
    ///
    /// The stored name is `<millis><.ext>`; if that exists, `<millis>_<n><.ext>`
    /// is tried instead, so two uploads never share a file.
    pub async fn store_attachment(
        &self,
        from: &PeerIp,
        to: &PeerIp,
        original_name: &str,
        data: &[u8],
    ) -> Result<Attachment> {
        let dir = self.path_for(from, to).await?.join(ATTACHMENTS_DIR);
        let ext = sanitized_extension(original_name)
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let millis = Utc::now().timestamp_millis();

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let file_name = if attempt == 0 {
                format!("{millis}{ext}")
            } else {
                format!("{millis}_{attempt}{ext}")
            };
            let path = dir.join(&file_name);

            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };
            file.write_all(data).await?;
            file.flush().await?;

            debug!(
                pair = %ChatPairKey::new(from, to),
                file = %file_name,
                size = data.len(),
                "Stored attachment"
            );
            return Ok(Attachment {
                name: original_name.to_string(),
                path: Some(format!("{ATTACHMENTS_DIR}/{file_name}")),
            });
        }

        Err(StoreError::Io(std::io::Error::new(
            ErrorKind::AlreadyExists,
            "could not find a free attachment name",
        )))
    }

    /// Resolve an attachment reference to a file path inside the pair's
    /// `attachments/` directory. Accepts either `attachments/<file>` (as
    /// stored on messages) or a bare `<file>`.
    pub fn resolve_attachment(&self, key: &ChatPairKey, relative: &str) -> Result<PathBuf> {
        let prefix = format!("{ATTACHMENTS_DIR}/");
        let file_name = relative.strip_prefix(&prefix).unwrap_or(relative);

        let mut components = Path::new(file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if !file_name.contains('\\') => {
                Ok(self.pair_dir(key).join(ATTACHMENTS_DIR).join(name))
            }
            _ => Err(StoreError::InvalidPath(relative.to_string())),
        }
    }
}

/// Extension of an uploaded file name, kept only if it is short and plain
/// alphanumeric.
fn sanitized_extension(name: &str) -> Option<&str> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 16 && e.chars().all(|c| c.is_ascii_alphanumeric()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn ip(s: &str) -> PeerIp {
        PeerIp::parse(s).unwrap()
    }

    async fn test_store() -> (ChatLogStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ChatLogStore::open(dir.path().join("chats")).await.unwrap();
        (store, dir)
    }

    fn message(from: &str, to: &str, text: &str) -> Message {
        Message {
            id: Some(Uuid::new_v4()),
            text: text.to_string(),
            sent: Utc::now(),
            from: ip(from),
            to: ip(to),
            attachments: None,
            read: false,
        }
    }

    #[tokio::test]
    async fn test_path_for_is_symmetric_and_idempotent() {
        let (store, _dir) = test_store().await;
        let a = ip("10.0.0.1");
        let b = ip("10.0.0.2");

        let ab = store.path_for(&a, &b).await.unwrap();
        let ba = store.path_for(&b, &a).await.unwrap();
        assert_eq!(ab, ba);
        assert!(ab.ends_with("10.0.0.1_to_10.0.0.2"));
        assert!(ab.join(ATTACHMENTS_DIR).is_dir());
    }

    #[tokio::test]
    async fn test_read_all_missing_log_is_empty() {
        let (store, _dir) = test_store().await;
        let log = store.read_all(&ip("10.0.0.1"), &ip("10.0.0.2")).await.unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_append_preserves_order_from_both_sides() {
        let (store, _dir) = test_store().await;
        let first = message("10.0.0.1", "10.0.0.2", "hi");
        let second = message("10.0.0.2", "10.0.0.1", "hello");
        store.append(&first).await.unwrap();
        store.append(&second).await.unwrap();

        let log = store.read_all(&ip("10.0.0.2"), &ip("10.0.0.1")).await.unwrap();
        assert_eq!(log, vec![first, second]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let (store, _dir) = test_store().await;
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..25 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let (from, to) = if i % 2 == 0 {
                    ("10.0.0.1", "10.0.0.2")
                } else {
                    ("10.0.0.2", "10.0.0.1")
                };
                store.append(&message(from, to, &i.to_string())).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let log = store.read_all(&ip("10.0.0.1"), &ip("10.0.0.2")).await.unwrap();
        assert_eq!(log.len(), 25);
    }

    #[tokio::test]
    async fn test_mark_read_by_id_leaves_siblings() {
        let (store, _dir) = test_store().await;
        let mut first = message("10.0.0.1", "10.0.0.2", "one");
        let mut second = message("10.0.0.1", "10.0.0.2", "two");
        // Same timestamp: only the id can tell them apart.
        second.sent = first.sent;
        store.append(&first).await.unwrap();
        store.append(&second).await.unwrap();

        let ack = ReadAck {
            id: first.id,
            sent: first.sent,
            from: first.from.clone(),
        };
        assert_eq!(store.mark_read(&ip("10.0.0.2"), &ack).await.unwrap(), 1);

        first.read = true;
        second.read = false;
        let log = store.read_all(&ip("10.0.0.1"), &ip("10.0.0.2")).await.unwrap();
        assert_eq!(log, vec![first, second]);
    }

    #[tokio::test]
    async fn test_mark_read_by_timestamp_without_id() {
        let (store, _dir) = test_store().await;
        let mut legacy = message("10.0.0.1", "10.0.0.2", "old");
        legacy.id = None;
        store.append(&legacy).await.unwrap();

        let ack = ReadAck {
            id: None,
            sent: legacy.sent,
            from: legacy.from.clone(),
        };
        // The sender cannot mark its own outgoing message read.
        let own = ReadAck {
            from: ip("10.0.0.2"),
            ..ack.clone()
        };
        assert_eq!(store.mark_read(&ip("10.0.0.1"), &own).await.unwrap(), 0);
        assert_eq!(store.mark_read(&ip("10.0.0.2"), &ack).await.unwrap(), 1);
        assert_eq!(
            store
                .unread_count(&ip("10.0.0.2"), &ip("10.0.0.1"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_unread_count_only_counts_incoming() {
        let (store, _dir) = test_store().await;
        store.append(&message("10.0.0.1", "10.0.0.2", "a")).await.unwrap();
        store.append(&message("10.0.0.1", "10.0.0.2", "b")).await.unwrap();
        store.append(&message("10.0.0.2", "10.0.0.1", "c")).await.unwrap();

        let a = ip("10.0.0.1");
        let b = ip("10.0.0.2");
        assert_eq!(store.unread_count(&b, &a).await.unwrap(), 2);
        assert_eq!(store.unread_count(&a, &b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_attachment_round_trip() {
        let (store, _dir) = test_store().await;
        let a = ip("10.0.0.1");
        let b = ip("10.0.0.2");

        let first = store.store_attachment(&a, &b, "photo.PNG", b"one").await.unwrap();
        let second = store.store_attachment(&a, &b, "photo.PNG", b"two").await.unwrap();
        assert_eq!(first.name, "photo.PNG");
        assert_ne!(first.path, second.path, "same-millisecond uploads must not collide");

        let mut msg = message("10.0.0.1", "10.0.0.2", "");
        msg.attachments = Some(vec![first, second]);
        store.append(&msg).await.unwrap();

        let log = store.read_all(&b, &a).await.unwrap();
        let key = ChatPairKey::new(&a, &b);
        for attachment in log[0].attachments.as_ref().unwrap() {
            let rel = attachment.path.as_deref().unwrap();
            assert!(rel.starts_with("attachments/") && rel.ends_with(".PNG"));
            assert!(store.resolve_attachment(&key, rel).unwrap().is_file());
        }
    }

    #[tokio::test]
    async fn test_attachment_extension_is_sanitized() {
        let (store, _dir) = test_store().await;
        let stored = store
            .store_attachment(&ip("10.0.0.1"), &ip("10.0.0.2"), "evil.sh/../x", b"x")
            .await
            .unwrap();
        let path = stored.path.unwrap();
        assert!(!path.contains(".."));
        assert_eq!(path.matches('/').count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_attachment_rejects_traversal() {
        let (store, _dir) = test_store().await;
        let key = ChatPairKey::new(&ip("10.0.0.1"), &ip("10.0.0.2"));

        assert!(store.resolve_attachment(&key, "attachments/1.png").is_ok());
        assert!(store.resolve_attachment(&key, "1.png").is_ok());
        assert!(store.resolve_attachment(&key, "../messages.json").is_err());
        assert!(store.resolve_attachment(&key, "attachments/../../x").is_err());
        assert!(store.resolve_attachment(&key, "/etc/passwd").is_err());
        assert!(store.resolve_attachment(&key, "").is_err());
    }

    #[tokio::test]
    async fn test_idle_pair_locks_are_pruned() {
        let (store, _dir) = test_store().await;
        store.append(&message("10.0.0.1", "10.0.0.2", "a")).await.unwrap();
        store.append(&message("10.0.0.1", "10.0.0.3", "b")).await.unwrap();
        store.append(&message("10.0.0.2", "10.0.0.3", "c")).await.unwrap();
        assert_eq!(store.locks.lock().await.len(), 1);

        let held = store.lock_pair(&ChatPairKey::new(&ip("10.0.0.1"), &ip("10.0.0.2"))).await;
        store.append(&message("10.0.0.4", "10.0.0.5", "d")).await.unwrap();
        assert_eq!(store.locks.lock().await.len(), 2);
        drop(held);
    }
}
