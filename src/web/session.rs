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

//! Stateless, signed session tokens for the web transport.
//!
//! A token is `base64url(json{u,exp}) "." base64url(HMAC-SHA256(payload))`.
//! Nothing is stored server side: validation recomputes the signature and
//! checks the expiry fixed at issuance. A forged, truncated, or expired token
//! is indistinguishable from no token at all.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Length of the secret generated when none is configured.
pub const GENERATED_SECRET_LEN: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    u: String,
    exp: u64,
}

/// Issues and validates session tokens with one process-lifetime secret.
pub struct SessionAuthenticator {
    secret: Zeroizing<Vec<u8>>,
    ttl: Duration,
}

impl fmt::Debug for SessionAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAuthenticator")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SessionAuthenticator {
    /// Create an authenticator. Without a configured secret a random one is
    /// generated and held only in memory, so restarts invalidate sessions.
    pub fn new(secret: Option<&[u8]>, ttl: Duration) -> Self {
        let secret = match secret.filter(|s| !s.is_empty()) {
            Some(bytes) => bytes.to_vec(),
            None => {
                let mut bytes = vec![0u8; GENERATED_SECRET_LEN];
                rand::thread_rng().fill_bytes(&mut bytes);
                tracing::debug!("Generated in-memory session secret");
                bytes
            }
        };
        Self {
            secret: Zeroizing::new(secret),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for `username` expiring one TTL from now.
    pub fn issue_session(&self, username: &str) -> String {
        self.issue_session_at(username, SystemTime::now())
    }

    /// Issue a token as if the current time were `now`.
    pub fn issue_session_at(&self, username: &str, now: SystemTime) -> String {
        let exp = unix_secs(now).saturating_add(self.ttl.as_secs());
        let claims = SessionClaims {
            u: username.to_string(),
            exp,
        };
        // Serializing a struct of a string and an integer cannot fail.
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(payload);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(payload.as_bytes()));
        format!("{payload}.{signature}")
    }

    /// Return the username carried by a valid, unexpired token.
    pub fn validate_session(&self, token: &str) -> Option<String> {
        self.validate_session_at(token, SystemTime::now())
    }

    /// Validate as if the current time were `now`.
    pub fn validate_session_at(&self, token: &str, now: SystemTime) -> Option<String> {
        let (payload, signature) = token.split_once('.')?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;

        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature).ok()?;

        let claims: SessionClaims =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).ok()?).ok()?;
        if unix_secs(now) >= claims.exp {
            tracing::debug!(user = %claims.u, "Session expired");
            return None;
        }
        Some(claims.u)
    }

    fn mac(&self) -> HmacSha256 {
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
        }
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> SessionAuthenticator {
        SessionAuthenticator::new(Some(b"test-secret-test-secret-test-sec"), Duration::from_secs(60))
    }

    #[test]
    fn test_issue_then_validate() {
        let auth = authenticator();
        let token = auth.issue_session("alice");
        assert_eq!(auth.validate_session(&token).as_deref(), Some("alice"));
    }

    #[test]
    fn test_token_expires_after_ttl() {
        let auth = authenticator();
        let issued = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let token = auth.issue_session_at("alice", issued);

        let almost = issued + Duration::from_secs(59);
        assert_eq!(auth.validate_session_at(&token, almost).as_deref(), Some("alice"));

        let after = issued + Duration::from_secs(60);
        assert!(auth.validate_session_at(&token, after).is_none());
    }

    #[test]
    fn test_flipped_signature_byte_fails() {
        let auth = authenticator();
        let token = auth.issue_session("alice");
        let (payload, signature) = token.split_once('.').unwrap();

        let mut raw = URL_SAFE_NO_PAD.decode(signature).unwrap();
        raw[0] ^= 0x01;
        let forged = format!("{payload}.{}", URL_SAFE_NO_PAD.encode(raw));

        assert!(auth.validate_session(&forged).is_none());
    }

    #[test]
    fn test_swapped_payload_fails() {
        let auth = authenticator();
        let alice = auth.issue_session("alice");
        let bob = auth.issue_session("bob");
        let (bob_payload, _) = bob.split_once('.').unwrap();
        let (_, alice_sig) = alice.split_once('.').unwrap();

        assert!(auth
            .validate_session(&format!("{bob_payload}.{alice_sig}"))
            .is_none());
    }

    #[test]
    fn test_other_secret_rejects() {
        let token = authenticator().issue_session("alice");
        let other = SessionAuthenticator::new(None, Duration::from_secs(60));
        assert!(other.validate_session(&token).is_none());
    }

    #[test]
    fn test_garbage_tokens() {
        let auth = authenticator();
        for token in ["", ".", "abc", "abc.def", "!!!.???", "a.b.c"] {
            assert!(auth.validate_session(token).is_none(), "{token}");
        }
    }

    #[test]
    fn test_debug_hides_secret() {
        let rendered = format!("{:?}", authenticator());
        assert!(!rendered.contains("test-secret"));
    }
}
