//! rust-tunnel: userspace encrypted tunnel daemon
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! rust-tunnel
//!
//! # Run with custom configuration
//! rust-tunnel -c /path/to/config.json
//!
//! # Generate a starter configuration with a fresh identity
//! rust-tunnel --generate-config
//!
//! # Validate a configuration and exit
//! rust-tunnel -c config.json --check
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rust_tunnel::config::{load_config_with_env, Config};
use rust_tunnel::device::Device;
use rust_tunnel::tun::FileTun;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/rust-tunnel/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("rust-tunnel v{}", rust_tunnel::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"rust-tunnel v{}

Userspace point-to-point encrypted tunnel daemon.

USAGE:
    rust-tunnel [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/rust-tunnel/config.json]
    -g, --generate-config   Print a starter configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    RUST_TUNNEL_LISTEN_ADDR   Override listen address
    RUST_TUNNEL_LOG_LEVEL     Override log level (trace, debug, info, warn, error)
    RUST_TUNNEL_PRIVATE_KEY   Override the private key

REQUIREMENTS:
    - A configured TUN device node (tun_path in the configuration)
    - Peers' static public keys exchanged out of band"#,
        rust_tunnel::VERSION
    );
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rust_tunnel={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let config = Config::example();
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path)
        .with_context(|| format!("loading {:?}", args.config_path))?;

    if args.check_config {
        println!("Configuration OK: {:?}", args.config_path);
        return Ok(());
    }

    init_tracing(&config.log.level);
    info!("rust-tunnel v{} starting", rust_tunnel::VERSION);

    let tun_path = config
        .tun_path
        .as_ref()
        .context("tun_path must be set to run the daemon")?;
    let tun = Arc::new(
        FileTun::open(tun_path)
            .await
            .with_context(|| format!("opening TUN device {tun_path:?}"))?,
    );

    let mut device = Device::new(&config, tun)
        .await
        .context("starting device")?;

    // Establish sessions eagerly toward peers with known endpoints.
    for peer in device.peers() {
        if let Some(endpoint) = peer.endpoint() {
            match peer.begin_initiation(device.shared()) {
                Ok(packet) => {
                    if let Err(e) = device.shared().send_to(&packet, endpoint).await {
                        error!(%endpoint, "failed to send handshake initiation: {e}");
                    }
                }
                Err(e) => error!(%endpoint, "failed to create handshake initiation: {e}"),
            }
        }
    }

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    device.shutdown().await;
    Ok(())
}
