use std::path::PathBuf;
use std::time::Duration;

/// A listener or worker endpoint: `tcp:host:port` (or a bare `host:port`)
/// or `unix:/path/to.sock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        if let Some(path) = text.strip_prefix("unix:") {
            anyhow::ensure!(!path.is_empty(), "unix endpoint is missing a path");
            Ok(Self::Unix(PathBuf::from(path)))
        } else {
            let addr = text.strip_prefix("tcp:").unwrap_or(text);
            anyhow::ensure!(addr.contains(':'), "tcp endpoint {addr:?} is missing a port");
            Ok(Self::Tcp(addr.to_string()))
        }
    }
}

/// Agent configuration, read from `VESTIBULE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Endpoint,
    /// Prefix every front-end connection must present. Empty disables the
    /// check.
    pub connect_password: String,
    /// Pre-spawned application workers served round-robin.
    pub workers: Vec<Endpoint>,
    /// Password forwarded to workers inside the header block.
    pub worker_password: String,
    pub resources_dir: PathBuf,
    pub spool_dir: PathBuf,
    pub memory_threshold: usize,
    pub connect_password_timeout: Duration,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let var = |name: &str| std::env::var(name).ok();

        let listen = match var("VESTIBULE_LISTEN") {
            Some(text) => Endpoint::parse(&text)?,
            None => Endpoint::Tcp("127.0.0.1:3128".to_string()),
        };

        let workers = match var("VESTIBULE_WORKERS") {
            Some(list) => list
                .split(',')
                .filter(|item| !item.trim().is_empty())
                .map(|item| Endpoint::parse(item.trim()))
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let memory_threshold = match var("VESTIBULE_MEMORY_THRESHOLD") {
            Some(text) => text
                .parse()
                .map_err(|_| anyhow::anyhow!("VESTIBULE_MEMORY_THRESHOLD is not a byte count"))?,
            None => vestibule_core::pipe::DEFAULT_MEMORY_THRESHOLD,
        };

        let connect_password_timeout = match var("VESTIBULE_CONNECT_PASSWORD_TIMEOUT_MS") {
            Some(text) => Duration::from_millis(text.parse().map_err(|_| {
                anyhow::anyhow!("VESTIBULE_CONNECT_PASSWORD_TIMEOUT_MS is not a duration")
            })?),
            None => Duration::from_secs(15),
        };

        Ok(Self {
            listen,
            connect_password: var("VESTIBULE_CONNECT_PASSWORD").unwrap_or_default(),
            workers,
            worker_password: var("VESTIBULE_WORKER_PASSWORD").unwrap_or_default(),
            resources_dir: var("VESTIBULE_RESOURCES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("resources")),
            spool_dir: var("VESTIBULE_SPOOL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            memory_threshold,
            connect_password_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_endpoints() {
        assert_eq!(Endpoint::parse("tcp:0.0.0.0:80").unwrap(), Endpoint::Tcp("0.0.0.0:80".into()));
        assert_eq!(Endpoint::parse("127.0.0.1:3128").unwrap(), Endpoint::Tcp("127.0.0.1:3128".into()));
    }

    #[test]
    fn parses_unix_endpoints() {
        assert_eq!(
            Endpoint::parse("unix:/run/vestibule.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/run/vestibule.sock"))
        );
    }

    #[test]
    fn rejects_incomplete_endpoints() {
        assert!(Endpoint::parse("unix:").is_err());
        assert!(Endpoint::parse("localhost").is_err());
    }
}
