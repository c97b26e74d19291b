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

//! Password verification for both transports.
//!
//! One account is configured: an optional username and a secret given either
//! as plaintext or as an Argon2id PHC string. Plaintext comparison runs in
//! constant time and the secret is zeroed on drop.

use std::fmt;

use anyhow::Result;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier as _},
    Algorithm, Argon2, Params, Version,
};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// The configured secret.
#[derive(Clone)]
pub enum PasswordSecret {
    Plain(Zeroizing<String>),
    Hash(String),
}

impl PasswordSecret {
    /// Treat values that look like PHC strings as hashes.
    pub fn from_config(password: Option<&str>, password_hash: Option<&str>) -> Option<Self> {
        if let Some(hash) = password_hash.filter(|h| !h.is_empty()) {
            return Some(Self::Hash(hash.to_string()));
        }
        password.filter(|p| !p.is_empty()).map(|p| {
            if p.starts_with("$argon2") {
                Self::Hash(p.to_string())
            } else {
                Self::Plain(Zeroizing::new(p.to_string()))
            }
        })
    }
}

impl fmt::Debug for PasswordSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("Plain(<redacted>)"),
            Self::Hash(_) => f.write_str("Hash(<redacted>)"),
        }
    }
}

/// The single account accepted by the gateway and the web login.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    username: Option<String>,
    secret: Option<PasswordSecret>,
}

impl Credentials {
    pub fn new(username: Option<String>, secret: Option<PasswordSecret>) -> Self {
        Self {
            username: username.filter(|u| !u.is_empty()),
            secret,
        }
    }

    /// Plaintext convenience constructor.
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(
            Some(username.into()),
            Some(PasswordSecret::Plain(Zeroizing::new(password.into()))),
        )
    }

    /// The required username, if one is configured.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Whether a password is configured at all.
    pub fn has_password(&self) -> bool {
        self.secret.is_some()
    }

    /// Whether `username` is acceptable. Any name passes when none is set.
    pub fn username_matches(&self, username: &str) -> bool {
        match &self.username {
            Some(expected) => bool::from(expected.as_bytes().ct_eq(username.as_bytes())),
            None => true,
        }
    }

    /// Check a username/password pair.
    ///
    /// Both parts are always evaluated so the time taken does not reveal
    /// which one was wrong.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let password = Zeroizing::new(password.to_string());
        let user_ok = self.username_matches(username);

        let password_ok = match &self.secret {
            Some(PasswordSecret::Plain(expected)) => {
                bool::from(expected.as_bytes().ct_eq(password.as_bytes()))
            }
            Some(PasswordSecret::Hash(hash)) => match verify_password_hash(&password, hash) {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::error!(error = %e, "Configured password hash is unusable");
                    false
                }
            },
            None => false,
        };

        user_ok && password_ok
    }
}

/// Generate an Argon2id password hash (m=19 MiB, t=2, p=1).
pub fn hash_password(password: &str) -> Result<String> {
    use argon2::password_hash::SaltString;

    let salt = SaltString::generate(&mut OsRng);
    let params = Params::new(19456, 2, 1, None)
        .map_err(|e| anyhow::anyhow!("Invalid Argon2 parameters: {}", e))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;

    Ok(hash.to_string())
}

/// Verify a password against a PHC hash string.
pub fn verify_password_hash(password: &str, hash: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("Invalid hash format: {}", e))?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(anyhow::anyhow!("Verification error: {}", e)),
    }
}
