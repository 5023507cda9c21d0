//! Overlay node binary.
//!
//! Starts one peer, joins the DHT through an entry point and logs its
//! neighbor set until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # entry point, reachable on a fixed port
//! overlay-node --name entrypoint --port 23000
//! # any other peer
//! overlay-node --name peer-1 --port 0 --entry-point entrypoint@127.0.0.1:23000
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

use overlay_dht::{derive_peer_id, ConnectivityMethod, NodeConfig, OverlayNode, PeerDescriptor};

#[derive(Debug, Parser)]
#[command(name = "overlay-node", about = "Run one overlay DHT peer")]
struct Args {
    /// JSON config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Human-readable name the peer id is derived from.
    #[arg(long)]
    name: Option<String>,

    /// Interface the WebSocket server binds and advertises [default: 127.0.0.1].
    #[arg(long)]
    host: Option<String>,

    /// WebSocket server port; omit to run without a server.
    #[arg(long)]
    port: Option<u16>,

    /// Entry point as `name@host:port`.
    #[arg(long = "entry-point")]
    entry_points: Vec<String>,

    /// Seconds between neighbor reports.
    #[arg(long, default_value_t = 30)]
    report_interval: u64,
}

/// Parse `name@host:port` into a descriptor.
fn parse_entry_point(raw: &str) -> Result<PeerDescriptor> {
    let (name, address) = raw
        .split_once('@')
        .ok_or_else(|| anyhow!("entry point {raw:?} must look like name@host:port"))?;
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("entry point {raw:?} is missing a port"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in entry point {raw:?}"))?;
    Ok(PeerDescriptor::new(derive_peer_id(name)).with_websocket(ConnectivityMethod::new(host, port)))
}

/// Layer the flags that were given over the loaded config.
fn apply_overrides(config: &mut NodeConfig, args: &Args) -> Result<()> {
    if args.name.is_some() {
        config.peer_name = args.name.clone();
    }
    if let Some(host) = &args.host {
        config.connections.websocket_host = host.clone();
    }
    if args.port.is_some() {
        config.connections.websocket_port = args.port;
    }
    for raw in &args.entry_points {
        config.connections.entry_points.push(parse_entry_point(raw)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };
    apply_overrides(&mut config, &args)?;

    let node = OverlayNode::start(config).await?;
    info!(peer_id = %node.peer_id(), descriptor = %node.local_descriptor(), "node started");

    let neighbors = node.join_dht().await;
    info!(count = neighbors.len(), "joined");

    let mut interval = time::interval(Duration::from_secs(args.report_interval.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let neighbors = node.neighbors().await;
                let connected = node.connection_manager().connected_peers().await;
                info!(neighbors = neighbors.len(), connections = connected.len(), "status");
                for neighbor in neighbors {
                    info!(%neighbor, "neighbor");
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    node.stop().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_parses_name_host_and_port() {
        let entry = parse_entry_point("entrypoint@10.0.0.1:23000").expect("valid entry point");
        assert_eq!(entry.peer_id, derive_peer_id("entrypoint"));
        assert_eq!(entry.websocket, Some(ConnectivityMethod::new("10.0.0.1", 23000)));
    }

    #[test]
    fn entry_point_without_port_is_rejected() {
        assert!(parse_entry_point("entrypoint@10.0.0.1").is_err());
        assert!(parse_entry_point("10.0.0.1:23000").is_err());
    }

    #[test]
    fn omitted_flags_keep_config_file_values() {
        let mut config = NodeConfig::default();
        config.connections.websocket_host = "10.0.0.5".to_string();
        config.connections.websocket_port = Some(23000);

        let args = Args::try_parse_from(["overlay-node", "--name", "peer-1"]).expect("args");
        apply_overrides(&mut config, &args).expect("overrides");
        assert_eq!(config.connections.websocket_host, "10.0.0.5");
        assert_eq!(config.connections.websocket_port, Some(23000));
        assert_eq!(config.peer_name.as_deref(), Some("peer-1"));

        let args = Args::try_parse_from(["overlay-node", "--host", "0.0.0.0"]).expect("args");
        apply_overrides(&mut config, &args).expect("overrides");
        assert_eq!(config.connections.websocket_host, "0.0.0.0");
    }
}
