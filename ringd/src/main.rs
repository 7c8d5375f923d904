//! Daemon entrypoint.
//!
//! Wiring only: parse the CLI, seed the configuration tree, construct
//! the shared tables, then hand control to the DNS listeners with the
//! relay workers, config watchers, and signal task running alongside.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use env_logger::Env;

use ringd::clients::ClientTable;
use ringd::dns::{names, DnsOptions, DnsResponder};
use ringd::error::app::{AppError, Result};
use ringd::events::{EventSink, LogSink};
use ringd::relay::{Relay, RelayOptions};
use ringd::rings::RingMap;

#[derive(Debug, clap::Parser)]
#[command(version, about = "edge DNS responder and multicast relay")]
struct Cli {
    /// Address the DNS responder listens on (UDP and TCP).
    #[arg(long = "dns-listen", default_value = "0.0.0.0:53")]
    dns_listen: std::net::SocketAddr,

    /// Byte budget for the upstream response cache; 0 disables it.
    #[arg(long = "cache-bytes", default_value_t = 1 << 20)]
    cache_bytes: usize,

    /// TTL on answers synthesized from local data.
    #[arg(long = "local-ttl", default_value_t = 300)]
    local_ttl: u32,

    /// Deployed hostname blocklist file.
    #[arg(long = "blocklist")]
    blocklist: Option<PathBuf>,

    /// First port of the SSDP reply range.
    #[arg(long = "ssdp-base", default_value_t = 31000)]
    ssdp_base: u16,

    /// Number of ports in the SSDP reply range.
    #[arg(long = "ssdp-ports", default_value_t = 20)]
    ssdp_ports: usize,

    /// Bootstrap properties loaded into the config tree at startup,
    /// one `@/path=value` per line.
    #[arg(long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(Env::default().default_filter_or("info"));
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let tree = Arc::new(cfgtree::ConfigTree::new());
    if let Some(path) = &cli.config {
        load_bootstrap(&tree, path)?;
    }

    let rings = Arc::new(RingMap::from_config(&tree)?);
    let clients = Arc::new(ClientTable::from_config(&tree));
    let sink: Arc<dyn EventSink> = Arc::new(LogSink);
    log::info!(
        "{} rings, {} known clients",
        rings.len(),
        clients.len()
    );

    let responder = Arc::new(DnsResponder::new(
        &tree,
        Arc::clone(&rings),
        Arc::clone(&clients),
        Arc::clone(&sink),
        DnsOptions {
            local_ttl: cli.local_ttl,
            cache_budget: cli.cache_bytes,
            blocklist: cli.blocklist.clone(),
        },
    )?);
    let relay = Relay::start(
        &tree,
        Arc::clone(&rings),
        Arc::clone(&sink),
        RelayOptions {
            ssdp_base: cli.ssdp_base,
            ssdp_pool: cli.ssdp_ports,
        },
    )
    .await?;

    tokio::spawn(Arc::clone(&responder).watch_config(Arc::clone(&tree)));
    tokio::spawn(Arc::clone(&relay).watch_config(Arc::clone(&tree)));
    tokio::spawn(lease_sweeper(Arc::clone(&tree)));
    tokio::spawn(signal_task(Arc::clone(&tree), Arc::clone(&clients)));

    // Watchers are live; derived names written here flow back through
    // the tree into the client table and host map.
    names::reconcile(&tree, &clients);

    responder
        .serve(cli.dns_listen, cli.dns_listen)
        .await
        .map_err(AppError::Io)
}

/// Sweep expired leases out of the tree so their records disappear.
async fn lease_sweeper(tree: Arc<cfgtree::ConfigTree>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let swept = tree.expire_stale();
        if swept > 0 {
            log::info!("{} expired properties swept", swept);
        }
    }
}

/// INT/TERM exit the process; HUP re-runs friendly-name
/// reconciliation.
async fn signal_task(tree: Arc<cfgtree::ConfigTree>, clients: Arc<ClientTable>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            log::error!("signal setup failed: {}", err);
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            log::error!("signal setup failed: {}", err);
            return;
        }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            log::error!("signal setup failed: {}", err);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                log::info!("interrupt, exiting");
                std::process::exit(0);
            }
            _ = terminate.recv() => {
                log::info!("terminated, exiting");
                std::process::exit(0);
            }
            _ = hangup.recv() => {
                log::info!("hangup, reconciling friendly names");
                names::reconcile(&tree, &clients);
            }
        }
    }
}

/// Load `@/path=value` lines into the tree. Blank lines and `#`
/// comments are skipped.
fn load_bootstrap(tree: &cfgtree::ConfigTree, path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(path)?;
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((prop, value)) => tree.set(prop.trim(), value.trim(), None),
            None => {
                return Err(AppError::Config(format!(
                    "{}:{}: expected @/path=value",
                    path.display(),
                    lineno + 1
                )))
            }
        }
    }
    Ok(())
}
