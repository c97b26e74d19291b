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

//! Gateway runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::auth::AuthMethod;

/// Settings needed to run the SFTP gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address to listen on (e.g., "0.0.0.0:2022").
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Private host key file; created on first start if missing.
    #[serde(default = "default_host_key")]
    pub host_key: PathBuf,

    /// Authentication methods offered to clients.
    #[serde(default = "default_methods")]
    pub methods: Vec<AuthMethod>,

    /// Allow-list for public key authentication.
    #[serde(default)]
    pub authorized_keys: Option<PathBuf>,

    /// Maximum authentication attempts per connection.
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,

    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Connection idle timeout in seconds. 0 disables it.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How long in-flight connections may run after shutdown is requested.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_listen_address() -> String {
    "0.0.0.0:2022".to_string()
}

fn default_host_key() -> PathBuf {
    PathBuf::from("treeshare_host_ed25519_key")
}

fn default_methods() -> Vec<AuthMethod> {
    vec![AuthMethod::Password]
}

fn default_max_auth_attempts() -> u32 {
    6
}

fn default_max_connections() -> usize {
    100
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            host_key: default_host_key(),
            methods: default_methods(),
            authorized_keys: None,
            max_auth_attempts: default_max_auth_attempts(),
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Returns `None` if the idle timeout is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_secs))
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Builder for [`GatewayConfig`].
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn listen_address(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_address = addr.into();
        self
    }

    pub fn host_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.host_key = path.into();
        self
    }

    pub fn methods(mut self, methods: Vec<AuthMethod>) -> Self {
        self.config.methods = methods;
        self
    }

    pub fn authorized_keys(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.authorized_keys = Some(path.into());
        self
    }

    pub fn max_auth_attempts(mut self, max: u32) -> Self {
        self.config.max_auth_attempts = max;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn idle_timeout_secs(mut self, secs: u64) -> Self {
        self.config.idle_timeout_secs = secs;
        self
    }

    pub fn shutdown_grace_secs(mut self, secs: u64) -> Self {
        self.config.shutdown_grace_secs = secs;
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}
