// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use nbrd::engine::Engine;
use nbrd::logging::{Facility, Logger, Severity};
use nbrd::{log_error, log_info, log_notice};
use nbrd::{Config, InterfaceDatabase, InterfaceInfo, IpNetwork};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON5 configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Override the UDP multicast port from the config.
    #[arg(long)]
    port: Option<u16>,

    /// Override the minimum log severity from the config
    /// (error, warning, notice, info, debug).
    #[arg(long)]
    log_level: Option<String>,

    /// How often to re-enumerate local interfaces, in milliseconds.
    /// The built-in poller stands in for an external link monitor.
    #[arg(long, default_value_t = 10_000)]
    link_poll_interval_ms: u64,
}

/// Enumerate local interfaces into a link-monitor-style snapshot.
///
/// A deployment with a real link monitor feeds snapshots through
/// `EngineHandle::push_interface_db` instead; this poller keeps the
/// standalone binary usable.
fn collect_interface_db(node_name: &str) -> InterfaceDatabase {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::{if_nametoindex, InterfaceFlags};

    let mut interfaces: HashMap<String, InterfaceInfo> = HashMap::new();

    if let Ok(addrs) = getifaddrs() {
        for entry in addrs {
            let name = entry.interface_name.clone();
            let is_up = entry.flags.contains(InterfaceFlags::IFF_UP)
                && entry.flags.contains(InterfaceFlags::IFF_RUNNING);

            let info = interfaces.entry(name.clone()).or_insert_with(|| InterfaceInfo {
                is_up,
                if_index: if_nametoindex(name.as_str()).unwrap_or(0),
                networks: Vec::new(),
            });
            info.is_up = is_up;

            let Some(address) = entry.address else {
                continue;
            };
            if let Some(sin) = address.as_sockaddr_in() {
                let prefix_len = entry
                    .netmask
                    .as_ref()
                    .and_then(|m| m.as_sockaddr_in())
                    .map(|m| u32::from(m.ip()).count_ones() as u8)
                    .unwrap_or(32);
                info.networks
                    .push(IpNetwork::new(IpAddr::V4(sin.ip()), prefix_len));
            } else if let Some(sin6) = address.as_sockaddr_in6() {
                let prefix_len = entry
                    .netmask
                    .as_ref()
                    .and_then(|m| m.as_sockaddr_in6())
                    .map(|m| u128::from_be_bytes(m.ip().octets()).count_ones() as u8)
                    .unwrap_or(128);
                info.networks
                    .push(IpNetwork::new(IpAddr::V6(sin6.ip()), prefix_len));
            }
        }
    }

    InterfaceDatabase {
        node_name: node_name.to_string(),
        interfaces,
    }
}

// The engine is a single cooperative event loop; one thread is all it gets.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_from_file(&args.config)?;
    if let Some(port) = args.port {
        config.udp_mcast_port = port;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    let level = Severity::parse(&config.log_level)
        .with_context(|| format!("unknown log level '{}'", config.log_level))?;

    let logger = Logger::stderr(level);
    let node_name = config.node_name.clone();

    let (engine, handle) = Engine::new(config, logger.clone())?;

    // Built-in link monitor: push an initial snapshot, then refresh
    // periodically. Identical snapshots reconcile to nothing.
    {
        let handle = handle.clone();
        let logger = logger.clone();
        let node_name = node_name.clone();
        let poll_interval = Duration::from_millis(args.link_poll_interval_ms.max(100));
        tokio::spawn(async move {
            loop {
                let db = collect_interface_db(&node_name);
                if handle.push_interface_db(db).await.is_err() {
                    return;
                }
                log_info!(logger, Facility::Interface, "Pushed interface snapshot");
                tokio::time::sleep(poll_interval).await;
            }
        });
    }

    // SIGINT/SIGTERM trigger the graceful shutdown path: restarting hellos
    // go out before the socket closes.
    {
        let handle = handle.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
                return;
            };
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                return;
            };
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            log_notice!(logger, Facility::Engine, "Shutdown signal received");
            handle.shutdown();
        });
    }

    if let Err(e) = engine.run().await {
        log_error!(logger, Facility::Engine, "Fatal: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_parsing() {
        let args = Args::parse_from(["nbrd", "--config", "/etc/nbrd.conf", "--port", "7777"]);
        assert_eq!(args.config, PathBuf::from("/etc/nbrd.conf"));
        assert_eq!(args.port, Some(7777));
        assert_eq!(args.link_poll_interval_ms, 10_000);
    }

    #[test]
    fn test_collect_interface_db_runs() {
        // Whatever the host looks like, enumeration must not panic and the
        // snapshot must carry our node name.
        let db = collect_interface_db("node-1");
        assert_eq!(db.node_name, "node-1");
    }
}
