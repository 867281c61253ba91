//! CLI commands for the peer node
//!
//! Implements the command handlers behind the `peer-mesh` binary.

use crate::config::NodeConfig;
use crate::dispatch::{Event, EventKind};
use crate::network::Node;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Load the config file, falling back to defaults when it does not exist
pub fn load_config(path: &Path) -> CliResult<NodeConfig> {
    if path.exists() {
        Ok(NodeConfig::load(path)?)
    } else {
        log::info!("No config at {}, using defaults", path.display());
        Ok(NodeConfig::default())
    }
}

/// Write a default config file
pub fn cmd_init(path: &Path, force: bool) -> CliResult<()> {
    if path.exists() && !force {
        println!("⚠️  Config already exists at {}", path.display());
        println!("   Use --force to overwrite it.");
        return Ok(());
    }

    let config = NodeConfig::default();
    config.save(path)?;

    println!("✅ Wrote default config to {}", path.display());
    println!("   Listen address: {}", config.listen_addr());
    println!("   Data directory: {}", config.data_dir.display());
    Ok(())
}

/// Run a node until SIGINT/SIGTERM. Lines typed on stdin are sent as chat.
pub async fn cmd_start(config: NodeConfig, shares: &[PathBuf]) -> CliResult<()> {
    let node = Node::new(config)?;

    for path in shares {
        let metadata = node.share_file(path)?;
        println!(
            "📄 Sharing {} ({} bytes, {} chunks) as {}",
            metadata.filename,
            metadata.file_size,
            metadata.chunk_count(),
            metadata.file_id
        );
    }

    node.events().subscribe(EventKind::ChatReceived, |event| {
        if let Event::ChatReceived { from, text } = event {
            println!("[{}]: {}", from, text);
        }
    });

    let addr = node.start().await?;
    println!("🌐 P2P node listening on {}", addr);
    if !node.config().seed_nodes.is_empty() {
        println!("   Connecting to seeds: {:?}", node.config().seed_nodes);
    }
    println!("   Type a line to chat with connected peers.");

    let chat_node = node.clone();
    let chat = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            if chat_node.send_chat(text) == 0 {
                println!("⚠️  No peers connected");
            }
        }
    });

    shutdown_signal().await;
    println!("\n📴 Shutting down node...");
    chat.abort();
    node.shutdown().await;

    Ok(())
}

/// Fetch one file from a peer, then shut down. Returns the stored path.
pub async fn cmd_fetch(
    config: NodeConfig,
    peer: &str,
    file: &str,
    timeout: Duration,
) -> CliResult<PathBuf> {
    let node = Node::new(config)?;
    node.start().await?;

    let result = fetch(&node, peer, file, timeout).await;
    node.shutdown().await;

    let path = result?;
    println!("✅ Saved {} to {}", file, path.display());
    Ok(path)
}

async fn fetch(node: &Node, peer: &str, file: &str, timeout: Duration) -> CliResult<PathBuf> {
    // Wait on the id this peer announces, not on a same-named local file
    let (tx, mut announced) = mpsc::unbounded_channel();
    let (from_peer, wanted) = (peer.to_string(), file.to_string());
    let subscription = node
        .events()
        .subscribe(EventKind::FileMetadataStored, move |event| {
            if let Event::FileMetadataStored { from, metadata } = event {
                if *from == from_peer && (metadata.filename == wanted || metadata.file_id == wanted)
                {
                    let _ = tx.send(metadata.file_id.clone());
                }
            }
        });

    let transfer = async {
        node.connect_to(peer).await?;
        node.request_file(peer, file).await?;
        println!("📥 Requested {} from {}", file, peer);

        let file_id = announced.recv().await.ok_or("event bus closed")?;
        let files = node.files();
        loop {
            if files.is_complete(&file_id)? {
                return Ok::<_, Box<dyn std::error::Error>>(files.file_path(&file_id)?);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };

    let result = tokio::time::timeout(timeout, transfer).await;
    node.events()
        .unsubscribe(EventKind::FileMetadataStored, subscription);

    match result {
        Ok(path) => path,
        Err(_) => Err(format!("timed out after {:?} waiting for {}", timeout, file).into()),
    }
}

/// Resolve on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_loadable_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.json");

        cmd_init(&path, false).unwrap();
        assert_eq!(load_config(&path).unwrap(), NodeConfig::default());

        // Existing file is kept without --force
        std::fs::write(&path, r#"{"port": 9100}"#).unwrap();
        cmd_init(&path, false).unwrap();
        assert_eq!(load_config(&path).unwrap().port, 9100);

        cmd_init(&path, true).unwrap();
        assert_eq!(load_config(&path).unwrap().port, 8080);
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = load_config(&temp_dir.path().join("absent.json")).unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[tokio::test]
    async fn test_fetch_from_running_node() {
        let serve_dir = tempfile::tempdir().unwrap();
        let fetch_dir = tempfile::tempdir().unwrap();

        let server = Node::new(NodeConfig {
            port: 0,
            data_dir: serve_dir.path().join("data"),
            ..Default::default()
        })
        .unwrap();
        let source = serve_dir.path().join("notes.txt");
        std::fs::write(&source, b"meet at the usual place").unwrap();
        server.share_file(&source).unwrap();
        let addr = server.start().await.unwrap().to_string();

        let path = cmd_fetch(
            NodeConfig {
                port: 0,
                data_dir: fetch_dir.path().to_path_buf(),
                ..Default::default()
            },
            &addr,
            "notes.txt",
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"meet at the usual place");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_ignores_same_named_local_file() {
        let serve_dir = tempfile::tempdir().unwrap();
        let fetch_dir = tempfile::tempdir().unwrap();

        // Stale local copy under the same name
        let local = crate::transfer::FileStore::new(fetch_dir.path()).unwrap();
        let stale = local.register_file("notes.txt", &b"old draft"[..]).unwrap();

        let server = Node::new(NodeConfig {
            port: 0,
            data_dir: serve_dir.path().join("data"),
            ..Default::default()
        })
        .unwrap();
        let source = serve_dir.path().join("notes.txt");
        std::fs::write(&source, b"final version").unwrap();
        let shared = server.share_file(&source).unwrap();
        let addr = server.start().await.unwrap().to_string();

        let path = cmd_fetch(
            NodeConfig {
                port: 0,
                data_dir: fetch_dir.path().to_path_buf(),
                ..Default::default()
            },
            &addr,
            "notes.txt",
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(path, fetch_dir.path().join(&shared.file_id));
        assert_ne!(shared.file_id, stale.file_id);
        assert_eq!(std::fs::read(path).unwrap(), b"final version");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_times_out_for_unknown_file() {
        let serve_dir = tempfile::tempdir().unwrap();
        let fetch_dir = tempfile::tempdir().unwrap();

        let server = Node::new(NodeConfig {
            port: 0,
            data_dir: serve_dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let addr = server.start().await.unwrap().to_string();

        let result = cmd_fetch(
            NodeConfig {
                port: 0,
                data_dir: fetch_dir.path().to_path_buf(),
                ..Default::default()
            },
            &addr,
            "nothing-here.bin",
            Duration::from_millis(300),
        )
        .await;
        assert!(result.is_err());

        server.shutdown().await;
    }
}
