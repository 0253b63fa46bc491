/// Application name
pub const APP_NAME: &str = "lanchat";

/// Display name given to a peer the first time it is seen
pub const DEFAULT_USER_NAME: &str = "Unknown User";

/// Separator between the two sorted addresses of a chat pair directory
pub const PAIR_SEPARATOR: &str = "_to_";

/// Per-pair message log file name
pub const MESSAGES_FILE: &str = "messages.json";

/// Per-pair attachment subdirectory name
pub const ATTACHMENTS_DIR: &str = "attachments";

/// Default file name of the registered user list
pub const REGISTERED_USERS_FILE: &str = "registered_users.json";

/// Default HTTP/WebSocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 4000;

/// Maximum upload request size in bytes (500 MiB)
pub const MAX_UPLOAD_SIZE: usize = 500 * 1024 * 1024;

/// Maximum display name length in characters
pub const MAX_NAME_LEN: usize = 64;
