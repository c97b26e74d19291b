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

//! Authorized-keys allow-list for public key authentication.
//!
//! The file is read once at startup. Each non-blank, non-comment line has the
//! OpenSSH form `[options] key-type base64-key [comment]`. Lines that do not
//! parse are logged and skipped; they never fail the load.

use std::path::Path;

use anyhow::{Context, Result};
use russh::keys::PublicKey;

/// One accepted key.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    pub key: PublicKey,
    pub comment: Option<String>,
}

/// Preloaded set of keys allowed to authenticate.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    keys: Vec<AuthorizedKey>,
}

impl AuthorizedKeys {
    /// Read and parse an authorized-keys file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read authorized keys from {}", path.display()))?;

        let keys = Self::parse(&content);
        tracing::debug!(path = %path.display(), "Read authorized keys file");
        tracing::info!(count = keys.len(), "Loaded authorized keys");
        Ok(keys)
    }

    /// Parse file content, skipping lines that are not valid keys.
    pub fn parse(content: &str) -> Self {
        let mut keys = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_authorized_key_line(line) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    tracing::warn!(
                        line = line_num + 1,
                        error = %e,
                        "Skipping malformed authorized_keys line"
                    );
                }
            }
        }

        Self { keys }
    }

    /// Whether the presented key is on the list.
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.iter().any(|k| k.key.key_data() == key.key_data())
    }

    /// Comment of the matching entry, for logging.
    pub fn comment_for(&self, key: &PublicKey) -> Option<&str> {
        self.keys
            .iter()
            .find(|k| k.key.key_data() == key.key_data())
            .and_then(|k| k.comment.as_deref())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<PublicKey> for AuthorizedKeys {
    fn from_iter<I: IntoIterator<Item = PublicKey>>(iter: I) -> Self {
        Self {
            keys: iter
                .into_iter()
                .map(|key| AuthorizedKey {
                    key,
                    comment: None,
                })
                .collect(),
        }
    }
}

fn parse_authorized_key_line(line: &str) -> Result<AuthorizedKey> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    // Options may contain quoted spaces, so locate the key type instead of
    // assuming it is the first or second token
    let key_type_idx = parts
        .iter()
        .position(|p| is_key_type(p))
        .ok_or_else(|| anyhow::anyhow!("No recognised key type"))?;

    let key_data = parts
        .get(key_type_idx + 1)
        .ok_or_else(|| anyhow::anyhow!("Missing key data"))?;

    let comment = (parts.len() > key_type_idx + 2).then(|| parts[key_type_idx + 2..].join(" "));

    let key = russh::keys::parse_public_key_base64(key_data).map_err(|e| {
        anyhow::anyhow!(
            "Failed to parse public key of type {}: {e}",
            parts[key_type_idx]
        )
    })?;

    Ok(AuthorizedKey {
        key,
        comment,
    })
}

fn is_key_type(s: &str) -> bool {
    matches!(
        s,
        "ssh-rsa"
            | "ssh-dss"
            | "ssh-ed25519"
            | "ssh-ed448"
            | "ecdsa-sha2-nistp256"
            | "ecdsa-sha2-nistp384"
            | "ecdsa-sha2-nistp521"
            | "sk-ssh-ed25519@openssh.com"
            | "sk-ecdsa-sha2-nistp256@openssh.com"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::{Algorithm, PrivateKey};

    fn random_public() -> (PublicKey, String) {
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
        let public = key.public_key().clone();
        let line = public.to_openssh().unwrap();
        (public, line)
    }

    #[test]
    fn test_parse_plain_line() {
        let (public, line) = random_public();
        let keys = AuthorizedKeys::parse(&format!("{line} alice@laptop\n"));
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&public));
        assert_eq!(keys.comment_for(&public), Some("alice@laptop"));
    }

    #[test]
    fn test_parse_with_options() {
        let (public, line) = random_public();
        let content = format!("no-pty,command=\"echo hi there\" {line} ci\n");
        let keys = AuthorizedKeys::parse(&content);
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&public));
        assert_eq!(keys.comment_for(&public), Some("ci"));
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let (public, line) = random_public();
        let content = format!(
            "# comment\n\nssh-ed25519 notbase64!@#$\ngarbage line\nssh-rsa\n{line}\n"
        );
        let keys = AuthorizedKeys::parse(&content);
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&public));
        assert_eq!(keys.comment_for(&public), None);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let (_, line) = random_public();
        let (other, _) = random_public();
        let keys = AuthorizedKeys::parse(&line);
        assert!(!keys.contains(&other));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AuthorizedKeys::load(dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let (public, line) = random_public();
        let path = dir.path().join("authorized_keys");
        std::fs::write(&path, format!("{line}\n")).unwrap();

        let keys = AuthorizedKeys::load(&path).unwrap();
        assert!(keys.contains(&public));
    }
}
