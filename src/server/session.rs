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

//! Per-connection state for the SFTP gateway.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Unique identifier for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where a connection is in its lifecycle.
///
/// Phases only move forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionPhase {
    Accepted,
    Handshaking,
    Authenticating,
    Authenticated,
    Closed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Accepted => "accepted",
            ConnectionPhase::Handshaking => "handshaking",
            ConnectionPhase::Authenticating => "authenticating",
            ConnectionPhase::Authenticated => "authenticated",
            ConnectionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// State owned by one connection's handler.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: Option<SocketAddr>,
    /// Username, set once authentication succeeds.
    pub user: Option<String>,
    pub phase: ConnectionPhase,
    pub auth_attempts: u32,
    pub started_at: Instant,
}

impl ConnectionInfo {
    pub fn new(peer_addr: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer_addr,
            user: None,
            phase: ConnectionPhase::Accepted,
            auth_attempts: 0,
            started_at: Instant::now(),
        }
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_addr.map(|a| a.ip())
    }

    /// Move to `phase` if it is later than the current one.
    pub fn advance(&mut self, phase: ConnectionPhase) {
        if phase > self.phase {
            tracing::trace!(conn = %self.id, from = %self.phase, to = %phase, "Connection phase");
            self.phase = phase;
        }
    }

    pub fn authenticate(&mut self, username: impl Into<String>) {
        self.user = Some(username.into());
        self.advance(ConnectionPhase::Authenticated);
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == ConnectionPhase::Authenticated
    }

    pub fn increment_auth_attempts(&mut self) -> u32 {
        self.auth_attempts += 1;
        self.auth_attempts
    }

    pub fn duration_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
