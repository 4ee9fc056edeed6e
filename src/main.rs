mod buffer;
mod error;
mod hash;
mod index;
mod net;
mod protocol;
mod reconciler;
mod syncer;

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use protocol::ProtocolLimits;
use syncer::Config;

/// Default ceiling on a single file transfer: 64 GiB minus one byte,
/// matching `DEFAULT_MAX_FILE_SIZE_BYTES` in the system this is modeled on.
const DEFAULT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024 * 1024 - 1;

#[derive(Parser, Debug)]
#[command(
    name = "foldersync",
    version,
    about = "Two-peer directory synchronization over a single TCP stream"
)]
struct Cli {
    /// Connect to ip:port as the initiating peer.
    #[arg(short = 's', value_name = "IP:PORT")]
    connect: Option<String>,

    /// Listen on this port as the receiving peer (binds 127.0.0.1).
    #[arg(short = 'd', value_name = "PORT")]
    listen: Option<u16>,

    /// Maximum transmit rate in Hz; 0 or omitted means unlimited.
    #[arg(short = 'r', value_name = "HZ", default_value_t = 0.0)]
    rate: f64,

    /// Skip the interactive prompts and execute the reconciled commands.
    #[arg(short = 'y')]
    auto_sync: bool,

    /// Compute and export sync commands but never execute them.
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Listener only: close after delivering SyncDone instead of accepting
    /// another connection. Mainly useful for tests.
    #[arg(long = "exit-after-sync")]
    exit_after_sync: bool,

    /// Optional `key = value` config file; only `max_file_size_bytes` is
    /// recognized.
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the maximum single-file transfer size, in bytes. Takes
    /// precedence over a config-file value.
    #[arg(long = "max-file-size", value_name = "BYTES")]
    max_file_size: Option<u64>,

    /// Directory to synchronize. Must already exist.
    path: PathBuf,
}

/// Parses the handful of `key = value` lines a config file may contain.
/// Unrecognized keys are ignored.
fn parse_config_file(path: &std::path::Path) -> Result<Option<u64>> {
    let contents = fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
    let mut max_file_size = None;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else { continue };
        let key = key.trim();
        let value = value.trim();
        if key == "max_file_size_bytes" {
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("parsing max_file_size_bytes value {value:?}"))?;
            if parsed == 0 {
                bail!("max_file_size_bytes must be greater than zero");
            }
            max_file_size = Some(parsed);
        }
    }
    Ok(max_file_size)
}

fn resolve_max_file_size(cli: &Cli) -> Result<u64> {
    if let Some(bytes) = cli.max_file_size {
        return Ok(bytes);
    }
    if let Some(config_path) = &cli.config {
        if let Some(bytes) = parse_config_file(config_path)? {
            return Ok(bytes);
        }
    }
    Ok(DEFAULT_MAX_FILE_SIZE)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.connect.is_some() == cli.listen.is_some() {
        bail!("specify exactly one of -s <ip:port> or -d <port>");
    }
    if cli.rate < 0.0 {
        bail!("-r rate limit must be non-negative");
    }

    let canonical_path = cli
        .path
        .canonicalize()
        .with_context(|| format!("{} does not exist or is not accessible", cli.path.display()))?;
    if !canonical_path.is_dir() {
        bail!("{} is not a directory", cli.path.display());
    }

    let max_file_size = resolve_max_file_size(&cli)?;
    let limits = ProtocolLimits { max_file_size, ..ProtocolLimits::default() };

    let cfg = Config {
        local_root: canonical_path,
        limits,
        rate_hz: cli.rate,
        auto_sync: cli.auto_sync,
        dry_run: cli.dry_run,
        exit_after_sync: cli.exit_after_sync,
        verbose: cli.dry_run || cli.auto_sync,
    };

    if let Some(target) = cli.connect {
        let addr = resolve_connect_addr(&target)?;
        net::run_initiator(addr, cfg).await
    } else {
        let port = cli.listen.expect("listen is Some, checked above");
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port);
        net::run_listener(addr, cfg).await
    }
}

fn resolve_connect_addr(target: &str) -> Result<SocketAddr> {
    target
        .parse()
        .with_context(|| format!("expected <ip>:<port>, got {target:?}"))
}
