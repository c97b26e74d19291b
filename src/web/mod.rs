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

//! HTTP transport: login with CSRF protection, signed session cookies, and
//! read-only access to the confined tree.
//!
//! # Routes
//!
//! | Method      | Path              | Notes                                   |
//! |-------------|-------------------|-----------------------------------------|
//! | GET         | `/`               | redirects to `/files/`                  |
//! | GET / POST  | `/login`          | login form and submission               |
//! | GET / POST  | `/logout`         | clears the session cookie               |
//! | GET         | `/files/{*path}`  | protected; bytes or a JSON listing      |

pub mod csrf;
pub mod handlers;
pub mod middleware;
pub mod session;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::guard::PathGuard;
use crate::server::auth::Credentials;
use crate::shared::error::{GatewayError, GatewayResult};
use crate::shared::rate_limit::AuthRateLimiter;

pub use self::session::SessionAuthenticator;

pub const LOGIN_PATH: &str = "/login";
pub const LOGOUT_PATH: &str = "/logout";
pub const FILES_PATH: &str = "/files/";

/// Web transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub bind_address: String,
    pub port: u16,
    /// Session lifetime in seconds. Sessions are never renewed.
    pub session_ttl: u64,
    /// HMAC secret for session tokens. Random per process when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Mark cookies `Secure`. Enable when serving behind TLS.
    pub secure_cookies: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            session_ttl: 24 * 60 * 60,
            secret: None,
            secure_cookies: false,
        }
    }
}

impl WebConfig {
    pub fn builder() -> WebConfigBuilder {
        WebConfigBuilder::default()
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl)
    }
}

#[derive(Debug, Default)]
pub struct WebConfigBuilder {
    config: WebConfig,
}

impl WebConfigBuilder {
    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_address = addr.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn session_ttl_secs(mut self, secs: u64) -> Self {
        self.config.session_ttl = secs;
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.config.secret = Some(secret.into());
        self
    }

    pub fn secure_cookies(mut self, secure: bool) -> Self {
        self.config.secure_cookies = secure;
        self
    }

    pub fn build(self) -> WebConfig {
        self.config
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct WebState {
    pub(crate) guard: Arc<PathGuard>,
    pub(crate) sessions: Arc<SessionAuthenticator>,
    pub(crate) credentials: Arc<Credentials>,
    pub(crate) rate_limiter: AuthRateLimiter,
    pub(crate) secure_cookies: bool,
}

impl WebState {
    pub fn new(
        config: &WebConfig,
        guard: Arc<PathGuard>,
        credentials: Credentials,
        rate_limiter: AuthRateLimiter,
    ) -> Self {
        let secret = config.secret.as_deref().map(str::as_bytes);
        Self {
            guard,
            sessions: Arc::new(SessionAuthenticator::new(secret, config.session_ttl())),
            credentials: Arc::new(credentials),
            rate_limiter,
            secure_cookies: config.secure_cookies,
        }
    }

    pub fn sessions(&self) -> &SessionAuthenticator {
        &self.sessions
    }

    /// Verify a username/password pair under the per-IP rate limit.
    ///
    /// A blocked address is refused without looking at the credentials.
    pub(crate) async fn check_credentials(
        &self,
        ip: IpAddr,
        username: &str,
        password: &str,
    ) -> GatewayResult<String> {
        if self.rate_limiter.is_blocked(&ip).await {
            tracing::warn!(peer = %ip, "Login refused, address is rate limited");
            return Err(GatewayError::RateLimitExceeded);
        }

        let credentials = Arc::clone(&self.credentials);
        let candidate = username.to_string();
        let password = Zeroizing::new(password.to_string());
        let verified = tokio::task::spawn_blocking(move || credentials.verify(&candidate, &password))
            .await
            .unwrap_or(false);

        if verified {
            self.rate_limiter.reset_auth_rate_limit(&ip).await;
            tracing::info!(peer = %ip, user = %username, "Web login succeeded");
            Ok(username.to_string())
        } else {
            tracing::warn!(peer = %ip, user = %username, "Web login failed");
            self.record_failure(ip).await;
            Err(GatewayError::AuthenticationFailure)
        }
    }

    pub(crate) async fn record_failure(&self, ip: IpAddr) {
        if !self.rate_limiter.check_auth_rate_limit(ip).await {
            tracing::warn!(peer = %ip, "Address locked out after repeated login failures");
        }
    }
}

/// Build the router. Protected routes sit behind the session gate.
pub fn router(state: WebState) -> Router {
    let protected = Router::new()
        .route("/files", get(handlers::files_root))
        .route(FILES_PATH, get(handlers::files_root))
        .route("/files/{*path}", get(handlers::files))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_session,
        ));

    Router::new()
        .route("/", get(handlers::index))
        .route(
            LOGIN_PATH,
            get(handlers::login_page).post(handlers::login_submit),
        )
        .route(LOGOUT_PATH, get(handlers::logout).post(handlers::logout))
        .merge(protected)
        .with_state(state)
}

/// The HTTP server lifecycle.
pub struct WebServer {
    config: WebConfig,
    state: WebState,
}

impl WebServer {
    pub fn new(
        config: WebConfig,
        guard: Arc<PathGuard>,
        credentials: Credentials,
        rate_limiter: AuthRateLimiter,
    ) -> Self {
        let state = WebState::new(&config, guard, credentials, rate_limiter);
        Self { config, state }
    }

    pub fn config(&self) -> &WebConfig {
        &self.config
    }

    pub fn state(&self) -> &WebState {
        &self.state
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Bind the configured address and serve until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.config.listen_address();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind web listener to {addr}"))?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Serve on an already-bound listener. In-flight requests finish before
    /// this returns.
    pub async fn run_with_listener(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        tracing::info!(
            local_addr = ?listener.local_addr(),
            secure_cookies = self.config.secure_cookies,
            "Web server listening"
        );

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Web server error")?;

        tracing::info!("Web server stopped");
        Ok(())
    }
}
