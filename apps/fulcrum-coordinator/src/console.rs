//! Operator console: a small stdin-driven loop for `stop|exit|quit`,
//! `inspect servers`, `inspect proxies`, and `broadcast <msg>`.

use std::sync::Arc;

use fulcrum_registry::{ControlSurface, Inspector};
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn run(inspector: Arc<Inspector>, control: Arc<ControlSurface>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("stdin closed; shutting down");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "error reading operator console input");
                return;
            }
        };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }

        match command {
            "stop" | "exit" | "quit" => return,
            "inspect servers" => {
                for view in inspector.servers().await {
                    println!(
                        "{}  status={:?}  players={}/{}  recentlyDead={}",
                        view.snapshot.identity.id,
                        view.snapshot.identity.status,
                        view.snapshot.player_count,
                        view.snapshot.max_capacity,
                        view.recently_dead,
                    );
                }
            }
            "inspect proxies" => {
                for view in inspector.proxies().await {
                    println!(
                        "{}  status={:?}  recentlyDead={}  unavailableSince={:?}",
                        view.proxy_id, view.status, view.recently_dead, view.unavailable_since,
                    );
                }
            }
            other if other.starts_with("broadcast ") => {
                let message = &other["broadcast ".len()..];
                if let Err(err) = control.broadcast(None, message).await {
                    tracing::warn!(error = %err, "broadcast failed");
                }
            }
            other => {
                println!("unrecognized command: {other:?}");
            }
        }
    }
}
