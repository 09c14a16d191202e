//! Contract between the request-handling core and the application process
//! pool. The pool itself lives outside this crate; the core only checks out
//! sessions and streams bytes over the conduit a session hands back.

use std::collections::BTreeMap;
use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::HeaderSet;

/// A bidirectional byte stream to an application worker (or to a client).
pub trait Conduit: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Conduit for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Options extracted from the framed request header that tell the pool which
/// application the request belongs to and how to spawn it if necessary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolOptions {
    pub app_root: String,
    pub app_type: String,
    pub environment: String,
    pub spawn_method: String,
    pub start_command: String,
    pub load_shell_envvars: bool,
}

impl PoolOptions {
    /// Fills the options from the request headers. Absent keys keep their
    /// defaults; the environment defaults to `"production"`.
    pub fn from_headers(headers: &HeaderSet) -> Self {
        let string = |key: &str| headers.get_str(key).unwrap_or_default().to_string();
        Self {
            app_root: string("PASSENGER_APP_ROOT"),
            app_type: string("PASSENGER_APP_TYPE"),
            environment: headers
                .get_str("PASSENGER_ENVIRONMENT")
                .unwrap_or("production")
                .to_string(),
            spawn_method: string("PASSENGER_SPAWN_METHOD"),
            start_command: string("PASSENGER_START_COMMAND"),
            load_shell_envvars: headers.bool_option("PASSENGER_LOAD_SHELL_ENVVARS", false),
        }
    }
}

/// A checkout failure, typically a failed application spawn.
///
/// Spawn errors may carry a pre-rendered HTML error page and a set of
/// diagnostic annotations; both end up in the error page shown to the user
/// when friendly error pages are enabled.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CheckoutError {
    pub message: String,
    pub error_page: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl CheckoutError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), error_page: None, annotations: BTreeMap::new() }
    }

    pub fn with_error_page(mut self, page: impl Into<String>) -> Self {
        self.error_page = Some(page.into());
        self
    }

    pub fn with_annotation(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(name.into(), value.into());
        self
    }
}

/// A checked-out session with one application worker.
#[async_trait]
pub trait Session: Send {
    /// Opens and verifies the worker connection. Transient failures may be
    /// retried by checking out a fresh session.
    async fn initiate(&mut self) -> io::Result<Box<dyn Conduit>>;

    /// The one-time password the worker expects in the request header block.
    fn connect_password(&self) -> &str;
}

/// The application process pool.
///
/// `checkout` may complete on any runtime thread; the caller's `.await` is
/// what brings the result back onto the task that owns the client state.
#[async_trait]
pub trait SessionPool: Send + Sync {
    async fn checkout(
        &self,
        options: &PoolOptions,
    ) -> Result<Box<dyn Session>, CheckoutError>;
}
