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

//! Configuration loading.
//!
//! Sources, highest precedence first:
//! 1. CLI arguments (applied by the binary)
//! 2. Environment variables (`TREESHARE_*`)
//! 3. Configuration file (YAML)
//! 4. Default values

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};

use super::types::AppConfig;
use crate::server::auth::{parse_methods, AuthMethod};

const ENV_PREFIX: &str = "TREESHARE_";

/// Load configuration from a file and the environment.
///
/// If `config_path` is `None`, the first existing file among
/// [`default_config_paths`] is used; with none present, defaults apply.
/// The result is not validated: call [`validate_config`] after applying
/// command-line overrides.
///
/// # Environment Variables
///
/// - `TREESHARE_ROOT` - shared directory
/// - `TREESHARE_EXCLUDE` - comma separated exclude patterns
/// - `TREESHARE_SFTP_PORT`, `TREESHARE_SFTP_BIND_ADDRESS`
/// - `TREESHARE_HOST_KEY` - host key path
/// - `TREESHARE_WEB_PORT`, `TREESHARE_WEB_BIND_ADDRESS`
/// - `TREESHARE_USERNAME`, `TREESHARE_PASSWORD`
/// - `TREESHARE_AUTH_METHODS` - e.g. `password,publickey` or `both`
/// - `TREESHARE_SESSION_TTL` - seconds
/// - `TREESHARE_IDLE_TIMEOUT` - seconds, 0 disables
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig> {
    let mut config = AppConfig::default();

    if let Some(path) = config_path {
        config = load_config_file(path).context("Failed to load configuration file")?;
        tracing::debug!(path = %path.display(), "Loaded configuration from file");
    } else {
        for path in default_config_paths() {
            if path.exists() {
                config = load_config_file(&path).context("Failed to load configuration file")?;
                tracing::debug!(path = %path.display(), "Loaded configuration from file");
                break;
            }
        }
    }

    apply_env_overrides(config)
}

/// Parse one YAML configuration file.
pub fn load_config_file(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Files searched when no `--config` is given.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("./treeshare.yaml"),
        PathBuf::from("/etc/treeshare/config.yaml"),
    ];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("treeshare/config.yaml"));
    }
    paths
}

fn env_var(name: &str) -> Option<(String, String)> {
    let key = format!("{ENV_PREFIX}{name}");
    std::env::var(&key).ok().map(|value| (key, value))
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some((key, value)) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {key} value {value:?}: {e}")),
        None => Ok(None),
    }
}

/// Apply `TREESHARE_*` overrides.
pub fn apply_env_overrides(mut config: AppConfig) -> Result<AppConfig> {
    if let Some((_, root)) = env_var("ROOT") {
        tracing::debug!(root = %root, "Applied TREESHARE_ROOT override");
        config.share.root = Some(PathBuf::from(root));
    }

    if let Some((_, exclude)) = env_var("EXCLUDE") {
        config.share.exclude = exclude
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
        tracing::debug!(
            count = config.share.exclude.len(),
            "Applied TREESHARE_EXCLUDE override"
        );
    }

    if let Some(port) = env_parse("SFTP_PORT")? {
        config.sftp.port = port;
        tracing::debug!(port, "Applied TREESHARE_SFTP_PORT override");
    }

    if let Some((_, addr)) = env_var("SFTP_BIND_ADDRESS") {
        tracing::debug!(address = %addr, "Applied TREESHARE_SFTP_BIND_ADDRESS override");
        config.sftp.bind_address = addr;
    }

    if let Some((_, key)) = env_var("HOST_KEY") {
        tracing::debug!(path = %key, "Applied TREESHARE_HOST_KEY override");
        config.sftp.host_key = PathBuf::from(key);
    }

    if let Some(port) = env_parse("WEB_PORT")? {
        config.web.port = port;
        tracing::debug!(port, "Applied TREESHARE_WEB_PORT override");
    }

    if let Some((_, addr)) = env_var("WEB_BIND_ADDRESS") {
        tracing::debug!(address = %addr, "Applied TREESHARE_WEB_BIND_ADDRESS override");
        config.web.bind_address = addr;
    }

    if let Some((_, username)) = env_var("USERNAME") {
        tracing::debug!(user = %username, "Applied TREESHARE_USERNAME override");
        config.auth.username = Some(username);
    }

    if let Some((_, password)) = env_var("PASSWORD") {
        tracing::debug!("Applied TREESHARE_PASSWORD override");
        config.auth.password = Some(password);
        config.auth.password_hash = None;
    }

    if let Some((key, methods)) = env_var("AUTH_METHODS") {
        config.sftp.methods =
            parse_methods(&methods).with_context(|| format!("Invalid {key} value"))?;
        tracing::debug!(methods = ?config.sftp.methods, "Applied TREESHARE_AUTH_METHODS override");
    }

    if let Some(ttl) = env_parse("SESSION_TTL")? {
        config.web.session_ttl = ttl;
        tracing::debug!(ttl, "Applied TREESHARE_SESSION_TTL override");
    }

    if let Some(timeout) = env_parse("IDLE_TIMEOUT")? {
        config.sftp.idle_timeout = timeout;
        tracing::debug!(timeout, "Applied TREESHARE_IDLE_TIMEOUT override");
    }

    Ok(config)
}

/// Check a fully assembled configuration.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    let root = config.root()?;
    if !root.is_dir() {
        anyhow::bail!("share.root is not a directory: {}", root.display());
    }

    if !config.sftp.enabled && !config.web.enabled {
        anyhow::bail!("Both transports are disabled; enable sftp or web");
    }

    if config.sftp.enabled {
        let sftp = &config.sftp;
        if sftp.port == 0 {
            anyhow::bail!("sftp.port cannot be 0");
        }
        if sftp.methods.is_empty() {
            anyhow::bail!("At least one SFTP authentication method must be enabled (sftp.methods)");
        }
        if sftp.methods.contains(&AuthMethod::Password) && !config.auth.has_password() {
            anyhow::bail!("Password authentication requires auth.password or auth.password_hash");
        }
        if sftp.methods.contains(&AuthMethod::Publickey) && sftp.authorized_keys.is_none() {
            anyhow::bail!("Public key authentication requires sftp.authorized_keys");
        }
        if sftp.max_auth_attempts == 0 {
            anyhow::bail!("sftp.max_auth_attempts must be greater than 0");
        }
        if sftp.max_connections == 0 {
            anyhow::bail!("sftp.max_connections must be greater than 0");
        }
    }

    if config.web.enabled {
        let web = &config.web;
        if web.port == 0 {
            anyhow::bail!("web.port cannot be 0");
        }
        if !config.auth.has_password() {
            anyhow::bail!("The web login requires auth.password or auth.password_hash");
        }
        if web.session_ttl == 0 {
            anyhow::bail!("web.session_ttl must be greater than 0");
        }
        if web.secret.as_deref().is_some_and(|s| s.len() < 32) {
            tracing::warn!("web.secret is shorter than 32 bytes");
        }
        if config.sftp.enabled
            && web.port == config.sftp.port
            && web.bind_address == config.sftp.bind_address
        {
            anyhow::bail!("sftp and web cannot listen on the same address");
        }
    }

    if config.security.max_attempts == 0 {
        anyhow::bail!("security.max_attempts must be greater than 0");
    }

    tracing::debug!("Configuration validation passed");
    Ok(())
}

/// A commented configuration template.
pub fn generate_config_template() -> String {
    let mut config = AppConfig::default();
    config.share.root = Some(PathBuf::from("/srv/share"));
    config.share.exclude = vec![".git".to_string(), "*.key".to_string()];
    config.auth.username = Some("treeshare".to_string());
    config.auth.password_hash =
        Some("paste the output of `treeshare-server hash-password` here".to_string());

    let mut yaml = String::new();
    yaml.push_str("# treeshare configuration file\n");
    yaml.push_str("#\n");
    yaml.push_str("# Precedence (highest first):\n");
    yaml.push_str("# 1. CLI arguments\n");
    yaml.push_str("# 2. Environment variables (TREESHARE_* prefix)\n");
    yaml.push_str("# 3. This configuration file\n");
    yaml.push_str("# 4. Default values\n");
    yaml.push_str("#\n");
    yaml.push_str("# sftp.methods accepts password and publickey.\n");
    yaml.push_str("# Times are in seconds; sftp.idle_timeout of 0 disables the idle timeout.\n");
    yaml.push_str("# web.secret is optional; without it sessions end on restart.\n\n");
    yaml.push_str(&serde_yaml::to_string(&config).unwrap_or_default());
    yaml
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_config(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.share.root = Some(root.to_path_buf());
        config.auth.password = Some("pw".into());
        config
    }

    #[test]
    fn test_template_parses() {
        let template = generate_config_template();
        assert!(template.contains("treeshare configuration"));
        assert!(template.contains("share:"));
        assert!(template.contains("sftp:"));
        assert!(template.contains("web:"));

        let parsed: AppConfig = serde_yaml::from_str(&template).unwrap();
        assert_eq!(parsed.share.root, Some(PathBuf::from("/srv/share")));
    }

    #[test]
    fn test_load_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"share:\n  root: /data\nsftp:\n  port: 2223\n")
            .unwrap();
        file.flush().unwrap();

        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.share.root, Some(PathBuf::from("/data")));
        assert_eq!(config.sftp.port, 2223);
    }

    #[test]
    fn test_load_config_file_rejects_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"sftp: [not, a, map]\n").unwrap();
        file.flush().unwrap();
        assert!(load_config_file(file.path()).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_env_overrides() {
        std::env::set_var("TREESHARE_ROOT", "/from/env");
        std::env::set_var("TREESHARE_SFTP_PORT", "3333");
        std::env::set_var("TREESHARE_EXCLUDE", ".git, secrets ,");
        std::env::set_var("TREESHARE_AUTH_METHODS", "both");

        let config = apply_env_overrides(AppConfig::default()).unwrap();

        std::env::remove_var("TREESHARE_ROOT");
        std::env::remove_var("TREESHARE_SFTP_PORT");
        std::env::remove_var("TREESHARE_EXCLUDE");
        std::env::remove_var("TREESHARE_AUTH_METHODS");

        assert_eq!(config.share.root, Some(PathBuf::from("/from/env")));
        assert_eq!(config.sftp.port, 3333);
        assert_eq!(config.share.exclude, vec![".git", "secrets"]);
        assert_eq!(config.sftp.methods.len(), 2);
    }

    #[test]
    #[serial_test::serial]
    fn test_env_override_invalid_port() {
        std::env::set_var("TREESHARE_WEB_PORT", "not-a-port");
        let result = apply_env_overrides(AppConfig::default());
        std::env::remove_var("TREESHARE_WEB_PORT");
        assert!(result.is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_env_password_replaces_hash() {
        let mut config = AppConfig::default();
        config.auth.password_hash = Some("$argon2id$stale".into());
        std::env::set_var("TREESHARE_PASSWORD", "fresh");
        let config = apply_env_overrides(config).unwrap();
        std::env::remove_var("TREESHARE_PASSWORD");

        assert_eq!(config.auth.password.as_deref(), Some("fresh"));
        assert!(config.auth.password_hash.is_none());
    }

    #[test]
    fn test_validate_accepts_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        validate_config(&valid_config(dir.path())).unwrap();
    }

    #[test]
    fn test_validate_requires_existing_root() {
        assert!(validate_config(&AppConfig::default()).is_err());

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(validate_config(&valid_config(&missing)).is_err());
    }

    #[test]
    fn test_validate_requires_a_transport() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path());
        config.sftp.enabled = false;
        config.web.enabled = false;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_password_mode_needs_password() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path());
        config.web.enabled = false;
        config.auth.password = None;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_publickey_mode_needs_keys_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path());
        config.sftp.methods = vec![AuthMethod::Publickey];
        assert!(validate_config(&config).is_err());

        config.sftp.authorized_keys = Some(dir.path().join("authorized_keys"));
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_validate_rejects_port_zero_and_clash() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path());
        config.sftp.port = 0;
        assert!(validate_config(&config).is_err());

        let mut config = valid_config(dir.path());
        config.web.port = config.sftp.port;
        assert!(validate_config(&config).is_err());
    }
}
