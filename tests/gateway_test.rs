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

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh_sftp::client::SftpSession;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use treeshare::guard::PathGuard;
use treeshare::server::{Credentials, GatewayConfig};
use treeshare::shared::AuthRateLimiter;
use treeshare::Gateway;

struct AcceptAnyHostKey;

impl russh::client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn share() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("share")).unwrap();
    let root = dir.path().join("share");
    std::fs::write(root.join("root-file.txt"), b"served over sftp").unwrap();
    std::fs::create_dir(root.join(".git")).unwrap();
    std::fs::write(root.join(".git/config"), b"[core]\n").unwrap();
    std::fs::create_dir(root.join("subdir")).unwrap();
    std::fs::write(root.join("subdir/nested-file.txt"), b"nested").unwrap();
    dir
}

struct Running {
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn start(dir: &Path, idle_timeout_secs: u64) -> Running {
    let guard = Arc::new(PathGuard::local(dir.join("share"), vec![".git".to_string()]).unwrap());
    let config = GatewayConfig::builder()
        .host_key(dir.join("host_key"))
        .idle_timeout_secs(idle_timeout_secs)
        .shutdown_grace_secs(1)
        .build();
    let gateway = Gateway::from_config(
        config,
        guard,
        Credentials::plain("alice", "wonderland"),
        AuthRateLimiter::default(),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move { gateway.run_with_listener(listener, token).await });

    Running {
        addr,
        shutdown,
        task,
    }
}

async fn stop(running: Running) {
    running.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(15), running.task)
        .await
        .expect("gateway did not stop")
        .unwrap()
        .unwrap();
}

async fn read_banner(stream: &mut TcpStream) -> String {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    line
}

#[tokio::test]
async fn test_banner_and_graceful_shutdown() {
    let dir = share();
    let running = start(dir.path(), 600).await;

    let mut stream = TcpStream::connect(running.addr).await.unwrap();
    let banner = read_banner(&mut stream).await;
    assert!(banner.starts_with("SSH-2.0-treeshare_"), "{banner}");
    drop(stream);

    stop(running).await;
}

#[tokio::test]
async fn test_host_key_reused_across_restarts() {
    let dir = share();
    let key_path = dir.path().join("host_key");

    stop(start(dir.path(), 600).await).await;
    let first = std::fs::metadata(&key_path).unwrap();
    let first_bytes = std::fs::read(&key_path).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    stop(start(dir.path(), 600).await).await;
    let second = std::fs::metadata(&key_path).unwrap();

    assert_eq!(first.len(), second.len());
    assert_eq!(first.modified().unwrap(), second.modified().unwrap());
    assert_eq!(first_bytes, std::fs::read(&key_path).unwrap());
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let dir = share();
    let running = start(dir.path(), 1).await;

    let mut stream = TcpStream::connect(running.addr).await.unwrap();
    let mut buf = [0u8; 1024];
    let closed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "idle connection was not closed");

    stop(running).await;
}

#[tokio::test]
async fn test_sftp_session_is_read_only() {
    let dir = share();
    let running = start(dir.path(), 600).await;

    let config = Arc::new(russh::client::Config::default());
    let mut handle = russh::client::connect(config, running.addr, AcceptAnyHostKey)
        .await
        .unwrap();

    let rejected = handle
        .authenticate_password("alice", "not-the-password")
        .await
        .unwrap();
    assert!(!rejected.success());

    let accepted = handle
        .authenticate_password("alice", "wonderland")
        .await
        .unwrap();
    assert!(accepted.success());

    let channel = handle.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "sftp").await.unwrap();
    let sftp = SftpSession::new(channel.into_stream()).await.unwrap();

    let names: Vec<String> = sftp
        .read_dir("/")
        .await
        .unwrap()
        .map(|entry| entry.file_name())
        .collect();
    assert!(names.contains(&"root-file.txt".to_string()));
    assert!(names.contains(&"subdir".to_string()));
    assert!(!names.contains(&".git".to_string()));

    let mut file = sftp.open("/root-file.txt").await.unwrap();
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).await.unwrap();
    assert_eq!(contents, b"served over sftp");

    assert!(sftp.create("/new.txt").await.is_err());
    assert!(sftp.create_dir("/newdir").await.is_err());
    assert!(sftp.remove_file("/root-file.txt").await.is_err());
    assert!(sftp.open("/subdir/../../etc/passwd").await.is_err());
    assert!(!dir.path().join("share/new.txt").exists());
    assert!(dir.path().join("share/root-file.txt").exists());

    drop(sftp);
    stop(running).await;
}
