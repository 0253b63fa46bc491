//! # lanchat-store
//!
//! Flat-file persistence for the chat relay.
//!
//! Layout under the chats root:
//!
//! ```text
//! chats/
//!   10.0.0.1_to_10.0.0.2/
//!     messages.json      # array of Message, append order
//!     attachments/       # raw uploaded files
//! registered_users.json  # array of RegisteredUser
//! ```
//!
//! Every file is rewritten whole, through a temp file and a rename, while
//! holding a lock scoped to that file (one per chat pair, one for the user
//! list). Concurrent writers to the same pair are serialized instead of
//! overwriting each other.

pub mod chat_log;
pub mod migrations;
pub mod users;

mod error;
mod json_file;

pub use chat_log::ChatLogStore;
pub use error::StoreError;
pub use users::UserStore;
