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

//! SSH handler implementation for the russh server.
//!
//! One [`SshHandler`] exists per accepted connection. It drives the
//! authentication state machine, consults the shared rate limiter, and hands
//! the `sftp` subsystem to a read-only [`SftpHandler`]. Exec, shell, and PTY
//! requests are refused.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::ssh_key;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty};
use zeroize::Zeroizing;

use super::auth::{AuthMethod, Authenticator};
use super::session::{ConnectionInfo, ConnectionPhase};
use super::sftp::SftpHandler;
use crate::guard::PathGuard;
use crate::shared::rate_limit::AuthRateLimiter;

/// SSH handler for a single client connection.
pub struct SshHandler {
    info: ConnectionInfo,
    authenticator: Arc<Authenticator>,
    rate_limiter: AuthRateLimiter,
    guard: Arc<PathGuard>,
    max_auth_attempts: u32,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl SshHandler {
    pub fn new(
        peer_addr: Option<SocketAddr>,
        authenticator: Arc<Authenticator>,
        rate_limiter: AuthRateLimiter,
        guard: Arc<PathGuard>,
        max_auth_attempts: u32,
    ) -> Self {
        let mut info = ConnectionInfo::new(peer_addr);
        info.advance(ConnectionPhase::Handshaking);

        Self {
            info,
            authenticator,
            rate_limiter,
            guard,
            max_auth_attempts,
            channels: HashMap::new(),
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn is_authenticated(&self) -> bool {
        self.info.is_authenticated()
    }

    fn allowed_methods(&self) -> MethodSet {
        let mut methods = MethodSet::empty();
        for method in self.authenticator.methods() {
            match method {
                AuthMethod::Publickey => methods.push(MethodKind::PublicKey),
                AuthMethod::Password => methods.push(MethodKind::Password),
            }
        }
        methods
    }

    fn reject(&self) -> Auth {
        let methods = self.allowed_methods();
        Auth::Reject {
            proceed_with_methods: if methods.is_empty() { None } else { Some(methods) },
            partial_success: false,
        }
    }

    fn reject_final() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Common preamble for credential-bearing attempts.
    ///
    /// Returns a final rejection when the connection used up its attempts or
    /// the source address is locked out; credentials are not examined then.
    async fn precheck(&mut self, user: &str, method: &'static str) -> Option<Auth> {
        self.info.advance(ConnectionPhase::Authenticating);
        let attempts = self.info.increment_auth_attempts();

        if attempts > self.max_auth_attempts {
            tracing::warn!(
                conn = %self.info.id,
                peer = ?self.info.peer_addr,
                user = %user,
                "Max authentication attempts exceeded"
            );
            return Some(Self::reject_final());
        }

        if let Some(ip) = self.info.peer_ip() {
            if self.rate_limiter.is_blocked(&ip).await {
                tracing::warn!(
                    conn = %self.info.id,
                    peer = %ip,
                    user = %user,
                    method = method,
                    "Authentication rejected, source address is rate limited"
                );
                return Some(Self::reject_final());
            }
        }

        None
    }

    async fn on_success(&mut self, user: &str, method: &'static str) -> Auth {
        if let Some(ip) = self.info.peer_ip() {
            self.rate_limiter.reset_auth_rate_limit(&ip).await;
        }
        self.info.authenticate(user);

        tracing::info!(
            conn = %self.info.id,
            peer = ?self.info.peer_addr,
            user = %user,
            method = method,
            "Authentication succeeded"
        );
        Auth::Accept
    }

    async fn on_failure(&mut self, user: &str, method: &'static str) -> Auth {
        if let Some(ip) = self.info.peer_ip() {
            if !self.rate_limiter.check_auth_rate_limit(ip).await {
                tracing::warn!(
                    conn = %self.info.id,
                    peer = %ip,
                    "Too many failed authentication attempts, source address locked out"
                );
            }
        }

        tracing::info!(
            conn = %self.info.id,
            peer = ?self.info.peer_addr,
            user = %user,
            method = method,
            attempt = self.info.auth_attempts,
            "Authentication failed"
        );
        self.reject()
    }
}

impl russh::server::Handler for SshHandler {
    type Error = anyhow::Error;

    fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        let accepted = self.is_authenticated();
        if accepted {
            tracing::debug!(conn = %self.info.id, channel = ?channel.id(), "Session channel opened");
            self.channels.insert(channel.id(), channel);
        }
        async move { Ok(accepted) }
    }

    fn auth_none(
        &mut self,
        user: &str,
    ) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        tracing::debug!(conn = %self.info.id, user = %user, "Auth none attempt");
        self.info.advance(ConnectionPhase::Authenticating);
        let reply = self.reject();
        async move { Ok(reply) }
    }

    fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        let user = user.to_string();
        let password = Zeroizing::new(password.to_string());

        async move {
            if !self.authenticator.allows(AuthMethod::Password) {
                return Ok(self.reject());
            }
            if let Some(reply) = self.precheck(&user, "password").await {
                return Ok(reply);
            }

            let authenticator = Arc::clone(&self.authenticator);
            let candidate = user.clone();
            let verified = tokio::task::spawn_blocking(move || {
                authenticator.verify_password(&candidate, &password)
            })
            .await
            .unwrap_or(false);

            if verified {
                Ok(self.on_success(&user, "password").await)
            } else {
                Ok(self.on_failure(&user, "password").await)
            }
        }
    }

    /// Only keys on the allow-list are invited to sign.
    fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        let known = self.authenticator.verify_publickey(user, public_key);
        tracing::debug!(
            conn = %self.info.id,
            user = %user,
            key_type = %public_key.algorithm(),
            known = known,
            "Public key offered"
        );
        let reply = if known { Auth::Accept } else { self.reject() };
        async move { Ok(reply) }
    }

    fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> impl std::future::Future<Output = Result<Auth, Self::Error>> + Send {
        let user = user.to_string();
        let verified = self.authenticator.verify_publickey(&user, public_key);
        let comment = self.authenticator.key_comment(public_key).map(str::to_string);

        async move {
            if let Some(reply) = self.precheck(&user, "publickey").await {
                return Ok(reply);
            }
            if verified {
                tracing::debug!(
                    conn = %self.info.id,
                    user = %user,
                    key = comment.as_deref().unwrap_or("-"),
                    "Public key matched authorized key"
                );
                Ok(self.on_success(&user, "publickey").await)
            } else {
                Ok(self.on_failure(&user, "publickey").await)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        tracing::debug!(conn = %self.info.id, term = %term, "PTY request refused");
        let _ = session.channel_failure(channel_id);
        async { Ok(()) }
    }

    fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        tracing::debug!(conn = %self.info.id, "Exec request refused");
        let _ = session.channel_failure(channel_id);
        async { Ok(()) }
    }

    fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        tracing::debug!(conn = %self.info.id, "Shell request refused");
        let _ = session.channel_failure(channel_id);
        async { Ok(()) }
    }

    fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        let channel = if name == "sftp" && self.is_authenticated() {
            self.channels.remove(&channel_id)
        } else {
            None
        };

        match channel {
            Some(channel) => {
                let user = self.info.user.clone().unwrap_or_default();
                tracing::info!(conn = %self.info.id, user = %user, "Starting SFTP subsystem");
                let _ = session.channel_success(channel_id);

                let handler = SftpHandler::new(user, Arc::clone(&self.guard));
                tokio::spawn(russh_sftp::server::run(channel.into_stream(), handler));
            }
            None => {
                tracing::debug!(conn = %self.info.id, subsystem = %name, "Subsystem refused");
                let _ = session.channel_failure(channel_id);
            }
        }

        async { Ok(()) }
    }

    fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send {
        self.channels.remove(&channel_id);
        async { Ok(()) }
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        self.info.advance(ConnectionPhase::Closed);
        tracing::info!(
            conn = %self.info.id,
            peer = ?self.info.peer_addr,
            user = ?self.info.user,
            duration_secs = self.info.duration_secs(),
            "Connection closed"
        );
    }
}
