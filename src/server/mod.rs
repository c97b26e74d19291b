// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Read-only SFTP gateway built on russh.
//!
//! # Overview
//!
//! - [`Gateway`]: accept loop, per-connection tasks, graceful shutdown
//! - [`SshHandler`]: authentication state machine for one connection
//! - [`SftpHandler`]: read-only SFTP request handling over a [`PathGuard`]
//! - [`RandomAccessReader`]: offset reads over sequential storage streams
//! - [`IdleTimeoutStream`]: fails a connection after a period without I/O
//! - [`HostKeyStore`]: persistent server identity
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use treeshare::guard::PathGuard;
//! use treeshare::server::{auth::Credentials, Gateway, GatewayConfig};
//! use treeshare::shared::rate_limit::AuthRateLimiter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let guard = Arc::new(PathGuard::local("/srv/share", vec![".git".into()])?);
//!     let config = GatewayConfig::builder()
//!         .listen_address("0.0.0.0:2022")
//!         .host_key("/var/lib/treeshare/host_ed25519_key")
//!         .build();
//!
//!     let gateway = Gateway::from_config(
//!         config,
//!         guard,
//!         Credentials::plain("alice", "secret"),
//!         AuthRateLimiter::default(),
//!     )?;
//!     gateway.run(CancellationToken::new()).await
//! }
//! ```

pub mod auth;
pub mod config;
pub mod handler;
pub mod host_key;
pub mod idle;
pub mod reader;
pub mod session;
pub mod sftp;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::guard::PathGuard;
use crate::shared::error::GatewayError;
use crate::shared::rate_limit::AuthRateLimiter;

pub use self::auth::{AuthMethod, Authenticator, AuthorizedKeys, Credentials};
pub use self::config::{GatewayConfig, GatewayConfigBuilder};
pub use self::handler::SshHandler;
pub use self::host_key::HostKeyStore;
pub use self::idle::IdleTimeoutStream;
pub use self::reader::RandomAccessReader;
pub use self::session::{ConnectionId, ConnectionInfo, ConnectionPhase};
pub use self::sftp::SftpHandler;

/// How often stale rate-limit records are swept.
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Version string sent during the SSH handshake.
pub fn server_id() -> String {
    format!("SSH-2.0-treeshare_{}", env!("CARGO_PKG_VERSION"))
}

/// The SFTP gateway.
///
/// Owns its rate limiter handle and per-connection state; several gateways
/// in one process do not share anything unless given the same limiter.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    guard: Arc<PathGuard>,
    authenticator: Arc<Authenticator>,
    rate_limiter: AuthRateLimiter,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        guard: Arc<PathGuard>,
        authenticator: Authenticator,
        rate_limiter: AuthRateLimiter,
    ) -> Self {
        Self {
            config: Arc::new(config),
            guard,
            authenticator: Arc::new(authenticator),
            rate_limiter,
        }
    }

    /// Build a gateway, loading the authorized-keys file when public key
    /// authentication is enabled.
    pub fn from_config(
        config: GatewayConfig,
        guard: Arc<PathGuard>,
        credentials: Credentials,
        rate_limiter: AuthRateLimiter,
    ) -> Result<Self> {
        let authorized_keys = if config.methods.contains(&AuthMethod::Publickey) {
            let path = config
                .authorized_keys
                .as_ref()
                .context("Public key authentication requires an authorized keys file")?;
            AuthorizedKeys::load(path)?
        } else {
            AuthorizedKeys::default()
        };

        let authenticator = Authenticator::new(config.methods.clone(), credentials, authorized_keys);
        Ok(Self::new(config, guard, authenticator, rate_limiter))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &AuthRateLimiter {
        &self.rate_limiter
    }

    /// Bind the configured address and serve until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Fails if the host key cannot be obtained or the address cannot be
    /// bound. Errors on individual connections are logged, never returned.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let russh_config = self.build_russh_config()?;

        let addr = &self.config.listen_address;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind SFTP listener to {addr}"))?;

        self.serve(listener, Arc::new(russh_config), shutdown).await
    }

    /// Serve on an already-bound listener.
    pub async fn run_with_listener(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let russh_config = self.build_russh_config()?;
        self.serve(listener, Arc::new(russh_config), shutdown).await
    }

    fn build_russh_config(&self) -> Result<russh::server::Config> {
        let key = HostKeyStore::new(&self.config.host_key).load_or_generate()?;

        Ok(russh::server::Config {
            server_id: russh::SshId::Standard(server_id()),
            keys: vec![key],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            max_auth_attempts: self.config.max_auth_attempts as usize,
            inactivity_timeout: self.config.idle_timeout(),
            ..Default::default()
        })
    }

    async fn serve(
        &self,
        listener: TcpListener,
        russh_config: Arc<russh::server::Config>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        tracing::info!(
            local_addr = ?listener.local_addr(),
            methods = ?self.authenticator.methods(),
            "SFTP gateway listening"
        );

        let mut connections = JoinSet::new();
        let mut cleanup = tokio::time::interval(RATE_LIMIT_CLEANUP_INTERVAL);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    if connections.len() >= self.config.max_connections {
                        tracing::warn!(
                            peer = %peer,
                            limit = self.config.max_connections,
                            "Connection limit reached, dropping connection"
                        );
                        continue;
                    }

                    let _ = stream.set_nodelay(true);
                    tracing::info!(peer = %peer, "Accepted connection");

                    let handler = SshHandler::new(
                        Some(peer),
                        Arc::clone(&self.authenticator),
                        self.rate_limiter.clone(),
                        Arc::clone(&self.guard),
                        self.config.max_auth_attempts,
                    );
                    connections.spawn(serve_connection(
                        Arc::clone(&russh_config),
                        stream,
                        peer,
                        handler,
                        self.config.idle_timeout(),
                    ));
                }

                _ = cleanup.tick() => {
                    self.rate_limiter.cleanup().await;
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Connection task panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        self.drain(connections).await;
        Ok(())
    }

    /// Give in-flight connections the grace period, then abort the rest.
    async fn drain(&self, mut connections: JoinSet<()>) {
        let grace = self.config.shutdown_grace();
        tracing::info!(
            active = connections.len(),
            grace_secs = grace.as_secs(),
            "SFTP gateway shutting down"
        );

        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "Grace period elapsed, closing remaining connections"
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        tracing::info!("SFTP gateway stopped");
    }
}

async fn serve_connection(
    config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
    handler: SshHandler,
    idle_timeout: Option<Duration>,
) {
    let result = match idle_timeout {
        Some(timeout) => run_session(config, IdleTimeoutStream::new(stream, timeout), handler).await,
        None => run_session(config, stream, handler).await,
    };

    if let Err(e) = result {
        if is_idle_timeout(&e) {
            tracing::info!(peer = %peer, "{}", GatewayError::IdleTimeout);
        } else {
            tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
        }
    }
}

async fn run_session<S>(
    config: Arc<russh::server::Config>,
    stream: S,
    handler: SshHandler,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session = russh::server::run_stream(config, stream, handler)
        .await
        .context("SSH handshake failed")?;
    session.await.context("SSH session failed")?;
    Ok(())
}

fn is_idle_timeout(err: &anyhow::Error) -> bool {
    // russh wraps I/O errors transparently, so match on the message as well
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io| io.kind() == io::ErrorKind::TimedOut)
            || cause.to_string().contains(idle::IDLE_TIMEOUT_MESSAGE)
    })
}
