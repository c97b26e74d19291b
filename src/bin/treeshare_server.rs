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

//! treeshare-server binary: serve one directory tree read-only over SFTP and
//! HTTP.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use treeshare::config::{generate_config_template, load_config, validate_config, AppConfig};
use treeshare::server::auth::parse_methods;
use treeshare::server::host_key::{fingerprint, HostKeyStore};
use treeshare::shared::rate_limit::AuthRateLimiter;
use treeshare::utils::logging;
use treeshare::{Gateway, WebServer};

/// Read-only SFTP and HTTP gateway for one directory tree
#[derive(Parser, Debug)]
#[command(name = "treeshare-server")]
#[command(version)]
#[command(about = "Read-only SFTP and HTTP gateway for one directory tree", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory to share
    #[arg(short, long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Exclude pattern (repeatable)
    #[arg(short = 'x', long = "exclude", global = true, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// SFTP port
    #[arg(long, global = true, value_name = "PORT")]
    sftp_port: Option<u16>,

    /// Web port
    #[arg(long, global = true, value_name = "PORT")]
    web_port: Option<u16>,

    /// Bind address for both transports
    #[arg(short = 'b', long, global = true, value_name = "ADDR")]
    bind_address: Option<String>,

    /// Host key file
    #[arg(short = 'k', long = "host-key", global = true, value_name = "FILE")]
    host_key: Option<PathBuf>,

    /// SFTP authentication methods: password, publickey, or both
    #[arg(long, global = true, value_name = "METHODS")]
    auth_methods: Option<String>,

    /// Disable the SFTP transport
    #[arg(long, global = true)]
    no_sftp: bool,

    /// Disable the web transport
    #[arg(long, global = true)]
    no_web: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway (default)
    Run,

    /// Generate a configuration file template
    GenConfig {
        /// Output path (stdout if not specified)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Check the configuration for errors
    CheckConfig,

    /// Create the Ed25519 host key if it does not exist yet
    GenHostKey {
        /// Output file path
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },

    /// Hash a password for the configuration file
    HashPassword,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(cli.verbose);

    match &cli.command {
        None | Some(Commands::Run) => run_server(&cli).await,
        Some(Commands::GenConfig { output }) => gen_config(output.as_deref()),
        Some(Commands::CheckConfig) => check_config(&cli),
        Some(Commands::GenHostKey { output, force }) => gen_host_key(output, *force),
        Some(Commands::HashPassword) => hash_password(),
    }
}

/// Load file and environment configuration, then apply CLI overrides.
fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(Some(path))
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => load_config(None)?,
    };

    if let Some(root) = &cli.root {
        config.share.root = Some(root.clone());
    }
    if !cli.exclude.is_empty() {
        config.share.exclude = cli.exclude.clone();
    }
    if let Some(port) = cli.sftp_port {
        config.sftp.port = port;
    }
    if let Some(port) = cli.web_port {
        config.web.port = port;
    }
    if let Some(addr) = &cli.bind_address {
        config.sftp.bind_address = addr.clone();
        config.web.bind_address = addr.clone();
    }
    if let Some(key) = &cli.host_key {
        config.sftp.host_key = key.clone();
    }
    if let Some(methods) = &cli.auth_methods {
        config.sftp.methods = parse_methods(methods)?;
    }
    if cli.no_sftp {
        config.sftp.enabled = false;
    }
    if cli.no_web {
        config.web.enabled = false;
    }

    validate_config(&config)?;
    Ok(config)
}

async fn run_server(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;

    let guard = Arc::new(config.path_guard()?);
    let credentials = config.credentials();
    // One limiter for both transports: failures on either count together
    let rate_limiter = AuthRateLimiter::new(config.rate_limit_config());
    let shutdown = CancellationToken::new();

    let mut tasks = JoinSet::new();

    if config.sftp.enabled {
        let gateway = Gateway::from_config(
            config.gateway_config(),
            Arc::clone(&guard),
            credentials.clone(),
            rate_limiter.clone(),
        )?;
        let token = shutdown.clone();
        tasks.spawn(async move { gateway.run(token).await.context("SFTP gateway failed") });
    }

    if config.web.enabled {
        let web = WebServer::new(
            config.web_config(),
            Arc::clone(&guard),
            credentials,
            rate_limiter,
        );
        let token = shutdown.clone();
        tasks.spawn(async move { web.run(token).await.context("Web server failed") });
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    tracing::info!(
        sftp = config.sftp.enabled,
        web = config.web.enabled,
        "treeshare started"
    );

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(anyhow::Error::from).and_then(|r| r);
        if let Err(e) = result {
            tracing::error!(error = %format!("{e:#}"), "Transport stopped with an error");
            shutdown.cancel();
            first_error.get_or_insert(e);
        }
    }

    tracing::info!("treeshare stopped");
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

fn gen_config(output: Option<&Path>) -> Result<()> {
    let template = generate_config_template();

    let Some(path) = output else {
        print!("{template}");
        return Ok(());
    };

    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .context("Failed to create configuration file")?;
        file.write_all(template.as_bytes())
            .context("Failed to write configuration file")?;
    }

    #[cfg(not(unix))]
    std::fs::write(path, &template).context("Failed to write configuration file")?;

    println!("Configuration template written to {}", path.display());
    Ok(())
}

fn check_config(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;

    println!("✓ Configuration is valid\n");
    if let Some(root) = &config.share.root {
        println!("Share root: {}", root.display());
    }
    println!("Exclude patterns: {:?}", config.share.exclude);

    println!("\nSFTP: {}", if config.sftp.enabled { "enabled" } else { "disabled" });
    if config.sftp.enabled {
        println!("  Listen: {}:{}", config.sftp.bind_address, config.sftp.port);
        println!("  Host key: {}", config.sftp.host_key.display());
        println!("  Methods: {:?}", config.sftp.methods);
        println!("  Idle timeout: {}s", config.sftp.idle_timeout);
        println!("  Max auth attempts: {}", config.sftp.max_auth_attempts);
    }

    println!("\nWeb: {}", if config.web.enabled { "enabled" } else { "disabled" });
    if config.web.enabled {
        println!("  Listen: {}:{}", config.web.bind_address, config.web.port);
        println!("  Session TTL: {}s", config.web.session_ttl);
        println!(
            "  Session secret: {}",
            if config.web.secret.is_some() { "configured" } else { "generated per process" }
        );
    }

    println!("\nRate limiting:");
    println!("  Max failures: {}", config.security.max_attempts);
    println!("  Window: {}s", config.security.window);
    println!("  Lockout: {}s", config.security.lockout);

    Ok(())
}

fn gen_host_key(output: &Path, force: bool) -> Result<()> {
    let store = HostKeyStore::new(output);

    let key = if output.exists() && !force {
        let key = store.load()?;
        println!("Host key already exists: {}", output.display());
        key
    } else {
        let key = store.generate()?;
        println!("✓ Host key generated: {}", output.display());
        key
    };

    println!("Fingerprint: {}", fingerprint(&key));
    println!("\nIn YAML config:");
    println!("sftp:");
    println!("  host_key: {}", output.display());
    Ok(())
}

fn hash_password() -> Result<()> {
    use treeshare::server::auth::hash_password as generate_hash;
    use zeroize::Zeroizing;

    print!("Enter password: ");
    io::stdout().flush()?;
    let password = Zeroizing::new(rpassword::read_password()?);

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    if password.len() < 8 {
        println!("\n Warning: Password is shorter than 8 characters.\n");
    }

    print!("Confirm password: ");
    io::stdout().flush()?;
    let confirm = Zeroizing::new(rpassword::read_password()?);

    if *password != *confirm {
        anyhow::bail!("Passwords do not match");
    }

    let hash = generate_hash(&password).context("Failed to hash password")?;

    println!("\nPassword hash (use in configuration):");
    println!("{hash}");
    println!("\nExample configuration:");
    println!("auth:");
    println!("  username: alice");
    println!("  password_hash: \"{hash}\"");
    Ok(())
}
