//! Registered-user list: every identity the server has ever seen.

use std::path::{Path, PathBuf};

use lanchat_shared::constants::MAX_NAME_LEN;
use lanchat_shared::types::{PeerIp, RegisteredUser};
use lanchat_shared::ProtocolError;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::json_file;

pub struct UserStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl UserStore {
    /// Open the user list at `path`, creating its parent directory if needed.
    /// The file itself is only created on the first write.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!(path = %path.display(), "User store initialized");
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All registered users in first-seen order; empty if nothing persisted.
    pub async fn load(&self) -> Result<Vec<RegisteredUser>> {
        json_file::read_or_default(&self.path).await
    }

    pub async fn find(&self, ip: &PeerIp) -> Result<Option<RegisteredUser>> {
        Ok(self.load().await?.into_iter().find(|u| &u.ip == ip))
    }

    /// Register `ip` with the default name if it has never been seen.
    ///
    /// Returns `true` when a record was added. Calling it again for the same
    /// address leaves the file untouched.
    pub async fn upsert(&self, ip: &PeerIp) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut users = self.load().await?;
        if users.iter().any(|u| &u.ip == ip) {
            return Ok(false);
        }
        users.push(RegisteredUser::unnamed(ip.clone()));
        json_file::write_atomic(&self.path, &users).await?;
        debug!(ip = %ip, total = users.len(), "Registered new user");
        Ok(true)
    }

    /// Set the display name of an existing user.
    pub async fn rename(&self, ip: &PeerIp, name: &str) -> Result<RegisteredUser> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(ProtocolError::MalformedMessage(format!(
                "display name must be 1..={MAX_NAME_LEN} characters"
            ))
            .into());
        }

        let _guard = self.write_lock.lock().await;
        let mut users = self.load().await?;
        let user = users
            .iter_mut()
            .find(|u| &u.ip == ip)
            .ok_or(StoreError::NotFound)?;
        user.name = name.to_string();
        let updated = user.clone();
        json_file::write_atomic(&self.path, &users).await?;
        info!(ip = %ip, name = %updated.name, "User renamed");
        Ok(updated)
    }
}
