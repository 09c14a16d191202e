use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, warn};

use vestibule_core::connection::{ClientConnection, HandlerSettings};
use vestibule_core::pool::{Conduit, SessionPool};
use vestibule_core::response::ErrorPageTemplates;

use crate::config::{Config, Endpoint};
use crate::pool::StaticPool;

/// Per-listener accept state: assigns client ids and tracks how many
/// clients are currently live, for the accept/disconnect log lines.
struct ClientRegistry {
    sequence: AtomicU64,
    live: AtomicUsize,
}

/// Accept loop: listens on the configured endpoint and spawns one task per
/// accepted client.
pub async fn run(config: &Config) -> anyhow::Result<()> {
    let templates = ErrorPageTemplates::load(&config.resources_dir.join("templates"))
        .context("cannot load error page templates")?;

    let mut settings = HandlerSettings::new(config.connect_password.clone(), templates);
    settings.connect_password_timeout = config.connect_password_timeout;
    settings.memory_threshold = config.memory_threshold;
    settings.spool_dir = config.spool_dir.clone();
    let settings = Arc::new(settings);

    let pool: Arc<dyn SessionPool> =
        Arc::new(StaticPool::new(config.workers.clone(), config.worker_password.clone()));
    let registry = Arc::new(ClientRegistry { sequence: AtomicU64::new(1), live: AtomicUsize::new(0) });

    match &config.listen {
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("cannot listen on tcp:{addr}"))?;
            info!("Listening on tcp:{addr}");
            loop {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "accepted connection");
                spawn_client(stream, settings.clone(), pool.clone(), registry.clone());
            }
        }
        Endpoint::Unix(path) => {
            // A stale socket file from a previous run would fail the bind.
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)
                .with_context(|| format!("cannot listen on unix:{}", path.display()))?;
            info!("Listening on unix:{}", path.display());
            loop {
                let (stream, _) = listener.accept().await?;
                spawn_client(stream, settings.clone(), pool.clone(), registry.clone());
            }
        }
    }
}

fn spawn_client<S>(
    stream: S,
    settings: Arc<HandlerSettings>,
    pool: Arc<dyn SessionPool>,
    registry: Arc<ClientRegistry>,
) where
    S: Conduit + 'static,
{
    let id = registry.sequence.fetch_add(1, Ordering::Relaxed);
    let live = registry.live.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(client = id, live, "new client accepted");

    tokio::spawn(async move {
        let connection = ClientConnection::new(id, settings, pool);
        match connection.process(stream).await {
            Ok(()) => debug!(client = id, "disconnected"),
            Err(e) => warn!(client = id, "disconnecting with error: {e}"),
        }
        let live = registry.live.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(client = id, live, "client released");
    });
}
