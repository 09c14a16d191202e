//! A minimal session pool over a fixed set of pre-spawned workers.
//!
//! The real deployment story puts a spawning process pool behind the
//! [`SessionPool`] contract; this one just dials configured endpoints
//! round-robin, which is all the standalone agent needs.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use vestibule_core::pool::{CheckoutError, Conduit, PoolOptions, Session, SessionPool};

use crate::config::Endpoint;

pub struct StaticPool {
    workers: Vec<Endpoint>,
    next: AtomicUsize,
    connect_password: String,
}

impl StaticPool {
    pub fn new(workers: Vec<Endpoint>, connect_password: String) -> Self {
        Self { workers, next: AtomicUsize::new(0), connect_password }
    }
}

#[async_trait]
impl SessionPool for StaticPool {
    async fn checkout(
        &self,
        options: &PoolOptions,
    ) -> Result<Box<dyn Session>, CheckoutError> {
        if self.workers.is_empty() {
            return Err(CheckoutError::new(format!(
                "no application workers configured (app root {:?})",
                options.app_root
            )));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let endpoint = self.workers[index].clone();
        debug!(?endpoint, "handing out worker session");
        Ok(Box::new(StaticSession {
            endpoint,
            connect_password: self.connect_password.clone(),
        }))
    }
}

struct StaticSession {
    endpoint: Endpoint,
    connect_password: String,
}

#[async_trait]
impl Session for StaticSession {
    async fn initiate(&mut self) -> io::Result<Box<dyn Conduit>> {
        match &self.endpoint {
            Endpoint::Tcp(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
            Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        }
    }

    fn connect_password(&self) -> &str {
        &self.connect_password
    }
}
