//! routemark: DNS-driven policy-routing daemon
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo routemark
//!
//! # Run with custom configuration
//! sudo routemark -c /path/to/config.json
//!
//! # Run with environment overrides
//! ROUTEMARK_LOG_LEVEL=debug sudo routemark
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use routemark::config::{create_default_config, load_config_with_env, Config};
use routemark::daemon::Daemon;
use routemark::nf::{CommandDriver, MemoryDriver, NetfilterDriver};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Run against the in-memory driver (no kernel mutations)
    dry_run: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/routemark/config.json");
        let mut generate_config = false;
        let mut check_config = false;
        let mut dry_run = false;

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
                "--dry-run" => {
                    dry_run = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("routemark v{}", routemark::VERSION);
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
            dry_run,
        }
    }
}

fn print_help() {
    println!(
        r"routemark v{}

DNS-driven policy-routing daemon: diverts traffic for configured domains
through per-group network interfaces.

USAGE:
    routemark [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/routemark/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    --dry-run               Run without touching the kernel (in-memory driver)
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    ROUTEMARK_LISTEN_PORT     Override the proxy listen port
    ROUTEMARK_UPSTREAM        Override the upstream resolver address
    ROUTEMARK_LOG_LEVEL       Override log level (trace, debug, info, warn, error)
    ROUTEMARK_NOTIFY_SOCKET   Override the notification socket path

REQUIREMENTS:
    - Linux with iptables, ipset and iproute2
    - CAP_NET_ADMIN capability (or root)

NOTIFICATIONS:
    External firewall hooks can report a flushed netfilter table by writing
    `netfilter.d:<event>:<table>` to the notification socket:

        printf 'netfilter.d:hook:nat' | nc -U /var/run/routemark.sock
",
        routemark::VERSION
    );
}

/// Initialize logging
///
/// Log level priority (highest to lowest):
/// 1. `RUST_LOG` environment variable
/// 2. `ROUTEMARK_LOG_LEVEL` environment variable
/// 3. Config file `log.level` setting
/// 4. Default: "info"
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("routemark={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config_path)?;
        println!("Wrote default configuration to {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path)?;

    if args.check_config {
        println!("Configuration OK: {:?}", args.config_path);
        return Ok(());
    }

    init_logging(&config);
    info!(version = routemark::VERSION, "starting routemark");

    let driver: Arc<dyn NetfilterDriver> = if args.dry_run {
        info!("dry run: kernel state will not be touched");
        Arc::new(MemoryDriver::new())
    } else {
        Arc::new(CommandDriver::new())
    };

    let daemon = Arc::new(Daemon::new(config, driver)?);

    let mut runner = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.run().await })
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
        result = &mut runner => {
            // The daemon stopped on its own; surface the reason and exit.
            match result? {
                Ok(()) => info!("daemon stopped"),
                Err(e) => {
                    error!(error = %e, "daemon failed");
                    return Err(e.into());
                }
            }
            return Ok(());
        }
    }

    daemon.shutdown();
    match runner.await? {
        Ok(()) => info!("shutdown complete"),
        Err(e) => {
            error!(error = %e, "shutdown finished with errors");
            return Err(e.into());
        }
    }

    Ok(())
}
