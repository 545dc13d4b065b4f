use anyhow::{Result, bail};
use clap::Parser;
use socksrelay::{Config, Socks5Server, auth::UserPass, config::DEFAULT_BUFFER_SIZE};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "A SOCKS5 proxy with CONNECT, BIND and UDP ASSOCIATE", long_about = None)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// Username for SOCKS5 proxy
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS5 proxy
    #[arg(short, long)]
    password: Option<String>,

    /// Relay buffer size per direction, in bytes
    #[arg(short, long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Timeout for CONNECT and the BIND accept wait, in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Address BIND listeners and UDP relay sockets are opened on
    #[arg(long)]
    bind_ip: Option<IpAddr>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    // Check for auth and grab it if present
    let auth = match (args.username, args.password) {
        (Some(u), Some(p)) => {
            info!("Authentication enabled");
            Some(UserPass::new(u, p))
        }
        (None, None) => None,
        _ => bail!("[ERR] must provide both username and password (or neither)"),
    };

    let config = Config::default()
        .with_buffer_size(args.buffer_size)
        .with_command_timeout(args.timeout.map(Duration::from_secs))
        .with_bind_ip(args.bind_ip);

    // Instantiate server
    let mut server = Socks5Server::new(args.listen)
        .with_auth(auth)
        .with_config(config);
    server.bind().await?;

    // Ctrl-C closes the listener and every live session
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let closed = shutdown.shutdown();
                info!("shutting down, {closed} sessions closed");
            }
            Err(e) => warn!("unable to listen for Ctrl-C: {e}"),
        }
    });

    // Run it
    info!("Starting SOCKS5 proxy: {}", server.listen_addr);
    server.run().await
}
