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

//! Authentication for the SFTP gateway.
//!
//! [`Authenticator`] bundles the configured methods with the account
//! [`Credentials`] and the [`AuthorizedKeys`] allow-list. The SSH handler
//! consults it; the web login reuses the same [`Credentials`].

pub mod password;
pub mod publickey;

use std::fmt;
use std::str::FromStr;

use russh::keys::PublicKey;
use serde::{Deserialize, Serialize};

pub use password::{hash_password, verify_password_hash, Credentials, PasswordSecret};
pub use publickey::{AuthorizedKey, AuthorizedKeys};

/// An SSH authentication method the gateway can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Password,
    #[serde(alias = "public-key", alias = "public_key")]
    Publickey,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password => f.write_str("password"),
            AuthMethod::Publickey => f.write_str("publickey"),
        }
    }
}

impl FromStr for AuthMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "password" => Ok(AuthMethod::Password),
            "publickey" | "public-key" | "public_key" => Ok(AuthMethod::Publickey),
            other => anyhow::bail!("Unknown authentication method: {other}"),
        }
    }
}

/// Parse a comma separated method list such as `password,publickey`.
///
/// `both` is accepted as shorthand for the two methods.
pub fn parse_methods(s: &str) -> anyhow::Result<Vec<AuthMethod>> {
    if s.trim().eq_ignore_ascii_case("both") {
        return Ok(vec![AuthMethod::Password, AuthMethod::Publickey]);
    }
    let mut methods = Vec::new();
    for part in s.split(',').filter(|p| !p.trim().is_empty()) {
        let method: AuthMethod = part.parse()?;
        if !methods.contains(&method) {
            methods.push(method);
        }
    }
    Ok(methods)
}

/// Credential checks for the enabled methods.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    methods: Vec<AuthMethod>,
    credentials: Credentials,
    authorized_keys: AuthorizedKeys,
}

impl Authenticator {
    pub fn new(
        methods: Vec<AuthMethod>,
        credentials: Credentials,
        authorized_keys: AuthorizedKeys,
    ) -> Self {
        Self {
            methods,
            credentials,
            authorized_keys,
        }
    }

    pub fn methods(&self) -> &[AuthMethod] {
        &self.methods
    }

    pub fn allows(&self, method: AuthMethod) -> bool {
        self.methods.contains(&method)
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Password check. Always false when password auth is disabled.
    pub fn verify_password(&self, username: &str, password: &str) -> bool {
        self.allows(AuthMethod::Password) && self.credentials.verify(username, password)
    }

    /// Comment of the allow-list entry for `key`, if it has one.
    pub fn key_comment(&self, key: &PublicKey) -> Option<&str> {
        self.authorized_keys.comment_for(key)
    }

    /// Key check. The configured username, if any, must also match.
    pub fn verify_publickey(&self, username: &str, key: &PublicKey) -> bool {
        self.allows(AuthMethod::Publickey)
            && self.credentials.username_matches(username)
            && self.authorized_keys.contains(key)
    }
}
