//! The per-client request lifecycle: connect-password check, framed-header
//! parsing, optional request-body buffering, session checkout and the
//! bidirectional forwarding phase.

mod client;
mod client_connection;

use std::path::PathBuf;
use std::time::Duration;

pub(crate) use client::Client;
pub use client::ClientState;
pub use client_connection::ClientConnection;

use crate::pipe::DEFAULT_MEMORY_THRESHOLD;
use crate::response::ErrorPageTemplates;

/// Settings shared by every client connection of one listener.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Fixed prefix every accepted stream must start with. May be empty,
    /// which disables the check.
    pub connect_password: String,
    /// How long a client may take to present the connect password.
    pub connect_password_timeout: Duration,
    /// In-memory window of the body and output spill pipes.
    pub memory_threshold: usize,
    /// Directory the spill pipes put their (immediately unlinked) temp
    /// files into.
    pub spool_dir: PathBuf,
    /// Value of the `X-Powered-By` header added to every response.
    pub identity: String,
    /// Templates for the 500 error page.
    pub templates: ErrorPageTemplates,
}

impl HandlerSettings {
    pub fn new(connect_password: impl Into<String>, templates: ErrorPageTemplates) -> Self {
        Self {
            connect_password: connect_password.into(),
            connect_password_timeout: Duration::from_secs(15),
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            spool_dir: std::env::temp_dir(),
            identity: format!("Vestibule/{}", env!("CARGO_PKG_VERSION")),
            templates,
        }
    }
}
