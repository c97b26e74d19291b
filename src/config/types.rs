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

//! Configuration file types.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::guard::PathGuard;
use crate::server::auth::{AuthMethod, Credentials, PasswordSecret};
use crate::server::GatewayConfig;
use crate::shared::rate_limit::AuthRateLimitConfig;
use crate::web::WebConfig;

/// Complete treeshare configuration.
///
/// # Example YAML
///
/// ```yaml
/// share:
///   root: /srv/share
///   exclude: [".git", "*.key"]
///
/// sftp:
///   port: 2022
///   methods: [password, publickey]
///   authorized_keys: /etc/treeshare/authorized_keys
///
/// web:
///   port: 8080
///
/// auth:
///   username: alice
///   password_hash: "$argon2id$v=19$..."
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub share: ShareConfig,
    pub sftp: SftpSettings,
    pub web: WebSettings,
    pub auth: AuthSettings,
    pub security: SecuritySettings,
}

/// The directory tree being shared.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Root of the shared tree. Required.
    pub root: Option<PathBuf>,

    /// Names, path components, or suffixes hidden from clients.
    pub exclude: Vec<String>,
}

/// SFTP transport settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SftpSettings {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,

    /// Private host key; generated on first start when missing.
    pub host_key: PathBuf,

    /// Idle timeout in seconds. 0 disables it.
    pub idle_timeout: u64,

    pub max_auth_attempts: u32,
    pub max_connections: usize,

    /// Seconds in-flight connections get after shutdown is requested.
    pub shutdown_grace: u64,

    pub methods: Vec<AuthMethod>,

    /// OpenSSH authorized_keys file, required for public key auth.
    pub authorized_keys: Option<PathBuf>,
}

impl Default for SftpSettings {
    fn default() -> Self {
        let gateway = GatewayConfig::default();
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: 2022,
            host_key: gateway.host_key,
            idle_timeout: gateway.idle_timeout_secs,
            max_auth_attempts: gateway.max_auth_attempts,
            max_connections: gateway.max_connections,
            shutdown_grace: gateway.shutdown_grace_secs,
            methods: gateway.methods,
            authorized_keys: None,
        }
    }
}

/// HTTP transport settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSettings {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,

    /// Session lifetime in seconds.
    pub session_ttl: u64,

    /// Session signing secret. Random per process when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    pub secure_cookies: bool,
}

impl Default for WebSettings {
    fn default() -> Self {
        let web = WebConfig::default();
        Self {
            enabled: true,
            bind_address: web.bind_address,
            port: web.port,
            session_ttl: web.session_ttl,
            secret: None,
            secure_cookies: web.secure_cookies,
        }
    }
}

/// The single account accepted by both transports.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Required username. Any name is accepted when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Plaintext password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Argon2 PHC hash, as printed by `treeshare-server hash-password`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_hash", &self.password_hash.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AuthSettings {
    pub fn has_password(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
            || self.password_hash.as_deref().is_some_and(|h| !h.is_empty())
    }
}

/// Brute-force protection shared by both login paths.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Failures tolerated per source address inside the window.
    pub max_attempts: u32,

    /// Window for counting failures, in seconds.
    pub window: u64,

    /// Lockout duration in seconds.
    pub lockout: u64,

    /// Addresses never locked out.
    pub whitelist: Vec<IpAddr>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        let defaults = AuthRateLimitConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            window: defaults.window.as_secs(),
            lockout: defaults.lockout.as_secs(),
            whitelist: Vec::new(),
        }
    }
}

impl AppConfig {
    /// The share root, or an error when unset.
    pub fn root(&self) -> Result<&PathBuf> {
        self.share
            .root
            .as_ref()
            .context("share.root is not set (use --root or TREESHARE_ROOT)")
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        let sftp = &self.sftp;
        let mut builder = GatewayConfig::builder()
            .listen_address(format!("{}:{}", sftp.bind_address, sftp.port))
            .host_key(sftp.host_key.clone())
            .methods(sftp.methods.clone())
            .max_auth_attempts(sftp.max_auth_attempts)
            .max_connections(sftp.max_connections)
            .idle_timeout_secs(sftp.idle_timeout)
            .shutdown_grace_secs(sftp.shutdown_grace);
        if let Some(path) = &sftp.authorized_keys {
            builder = builder.authorized_keys(path.clone());
        }
        builder.build()
    }

    pub fn web_config(&self) -> WebConfig {
        let web = &self.web;
        let mut builder = WebConfig::builder()
            .bind_address(web.bind_address.clone())
            .port(web.port)
            .session_ttl_secs(web.session_ttl)
            .secure_cookies(web.secure_cookies);
        if let Some(secret) = &web.secret {
            builder = builder.secret(secret.clone());
        }
        builder.build()
    }

    pub fn credentials(&self) -> Credentials {
        let secret = PasswordSecret::from_config(
            self.auth.password.as_deref(),
            self.auth.password_hash.as_deref(),
        );
        Credentials::new(self.auth.username.clone(), secret)
    }

    pub fn rate_limit_config(&self) -> AuthRateLimitConfig {
        let security = &self.security;
        AuthRateLimitConfig::new(security.max_attempts, security.window, security.lockout)
            .with_whitelist(security.whitelist.clone())
    }

    /// Build the path guard over the local filesystem.
    pub fn path_guard(&self) -> Result<PathGuard> {
        let root = self.root()?;
        PathGuard::local(root, self.share.exclude.clone())
            .with_context(|| format!("Cannot share {}", root.display()))
    }
}
