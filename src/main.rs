//! pipeprobe - provider server and interactive controller
//!
//! Entry point that handles CLI argument parsing and mode switching
//! between serving a target and connecting to one.

use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};

use pipeprobe::core::{Provider, SimulatedBackend, TargetBackend};
use pipeprobe::protocol::Architecture;
use pipeprobe::session::{transport, Server, Session, SessionConfig};
use pipeprobe::ui::cli::run_cli;

/// pipeprobe: remote process introspection
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Where a session runs
#[derive(ClapArgs, Debug)]
#[group(required = true, multiple = false)]
struct Endpoint {
    /// Unix socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// TCP address (host:port)
    #[arg(long)]
    tcp: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a target to controllers
    Serve {
        #[command(flatten)]
        endpoint: Endpoint,

        /// Serve the built-in simulated target instead of this machine
        #[arg(long, default_value_t = false)]
        simulate: bool,

        /// Simulated target width (32 or 64)
        #[arg(long, default_value_t = 64)]
        bits: u8,

        /// Largest frame payload in bytes
        #[arg(long, default_value_t = 1 << 20)]
        max_payload: usize,

        /// Debug-event poll interval in milliseconds
        #[arg(long, default_value_t = 50)]
        poll_ms: u64,

        /// Give up on a debug-event pull after this many milliseconds
        #[arg(long)]
        event_wait_ms: Option<u64>,
    },

    /// Connect to a provider and open the REPL
    Connect {
        #[command(flatten)]
        endpoint: Endpoint,
    },
}

fn serve<B: TargetBackend>(backend: B, endpoint: Endpoint, config: SessionConfig) -> anyhow::Result<()> {
    println!(
        "[*] pipeprobe v{} - serving {} target",
        env!("CARGO_PKG_VERSION"),
        backend.architecture()
    );
    let server = Server::new(Arc::new(Provider::new(backend)), config);

    if let Some(path) = endpoint.socket {
        // A stale socket file from an earlier run blocks bind()
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("binding {}", path.display()))?;
        log::info!("Listening on {}", path.display());
        server.serve_unix(listener)?;
    } else if let Some(addr) = endpoint.tcp {
        let listener = std::net::TcpListener::bind(&addr).with_context(|| format!("binding {}", addr))?;
        log::info!("Listening on {}", addr);
        server.serve_tcp(listener)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // 1. Parse command line arguments
    let args = Args::parse();

    // 2. Initialize logger with verbosity level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    log::debug!("Command: {:?}", args.command);

    // 3. Branch based on execution mode
    match args.command {
        Command::Serve {
            endpoint,
            simulate,
            bits,
            max_payload,
            poll_ms,
            event_wait_ms,
        } => {
            let config = SessionConfig {
                max_payload,
                poll_interval: Duration::from_millis(poll_ms),
                event_wait: event_wait_ms.map(Duration::from_millis),
            };
            if simulate {
                let arch = Architecture::from_wire(bits)?;
                serve(SimulatedBackend::demo(arch), endpoint, config)
            } else {
                serve_local(endpoint, config)
            }
        }
        Command::Connect { endpoint } => {
            let config = SessionConfig::default();
            if let Some(path) = endpoint.socket {
                let stream = transport::connect_unix(&path)
                    .with_context(|| format!("connecting to {}", path.display()))?;
                run_cli(Session::open(stream, config)?)
            } else if let Some(addr) = endpoint.tcp {
                let stream = transport::connect_tcp(&addr)
                    .with_context(|| format!("connecting to {}", addr))?;
                run_cli(Session::open(stream, config)?)
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn serve_local(endpoint: Endpoint, config: SessionConfig) -> anyhow::Result<()> {
    serve(pipeprobe::core::LinuxBackend::new(), endpoint, config)
}

#[cfg(not(target_os = "linux"))]
fn serve_local(_endpoint: Endpoint, _config: SessionConfig) -> anyhow::Result<()> {
    anyhow::bail!("no local backend on this platform; use --simulate")
}
