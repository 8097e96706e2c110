//! Diode Tunnel
//!
//! Command-line client for the Diode relay network.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tunnel::config::{BindConfig, Config};
use tunnel::rpc::DEFAULT_PORT_FLAGS;
use tunnel::transport::{TlsDialer, TlsProfile};
use tunnel::{
    Binding, Connection, ConnectionOptions, PortBinder, PortPublisher, PublishOptions, Rpc,
    TicketParams, TicketSigner,
};

/// Diode Tunnel - bind and publish ports over the Diode relay network.
#[derive(Parser, Debug)]
#[command(name = "diode-tunnel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Relay host
    #[arg(long)]
    pub host: Option<String>,

    /// Relay port
    #[arg(long)]
    pub port: Option<u16>,

    /// PEM file holding the client certificate and key
    #[arg(long, value_name = "FILE")]
    pub cert: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Connect, ping the relay and print the latest block
    Ping,

    /// Tunnel a local port to a port on a remote device
    Bind {
        /// Local port to listen on
        #[arg(long)]
        local_port: u16,

        /// Remote device address (40 hex characters)
        #[arg(long)]
        device: String,

        /// Port on the remote device
        #[arg(long)]
        remote_port: u16,

        /// Channel flags
        #[arg(long, default_value = DEFAULT_PORT_FLAGS)]
        flags: String,
    },

    /// Expose local ports to remote devices
    Publish {
        /// Port to publish (repeatable)
        #[arg(long = "port", required = true, value_delimiter = ',')]
        ports: Vec<u16>,
    },

    /// Start every configured binding and published port
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    apply_cli_overrides(&cli, &mut config);

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.log.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }
    config.validate()?;

    let profile = TlsProfile::new(&config.identity.cert_path);
    let rpc = build_rpc(&config, &profile)?;

    let result = match cli.command {
        Commands::Ping => ping(&rpc).await,
        Commands::Bind { .. } | Commands::Publish { .. } | Commands::Run => {
            run_services(&rpc, &profile, &config).await
        }
    };

    rpc.connection().close().await;
    result
}

/// Applies command-line flags on top of file and environment settings.
fn apply_cli_overrides(cli: &Cli, config: &mut Config) {
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(cert) = &cli.cert {
        config.identity.cert_path = cert.clone();
    }

    match &cli.command {
        Commands::Bind {
            local_port,
            device,
            remote_port,
            flags,
        } => config.bind.push(BindConfig {
            local_port: *local_port,
            device: device.clone(),
            remote_port: *remote_port,
            flags: flags.clone(),
        }),
        Commands::Publish { ports } => {
            for port in ports {
                if !config.publish.ports.contains(port) {
                    config.publish.ports.push(*port);
                }
            }
        }
        Commands::Ping | Commands::Run => {}
    }
}

fn build_rpc(config: &Config, profile: &TlsProfile) -> Result<Rpc> {
    let identity = profile.load_identity().with_context(|| {
        format!(
            "Failed to load identity from {}",
            config.identity.cert_path.display()
        )
    })?;
    tracing::info!("Client address: {}", identity.address());

    let signer = TicketSigner::new(
        identity,
        TicketParams {
            chain_id: config.ticket.chain_id,
            fleet_contract: config.ticket.fleet_address()?,
        },
    );
    let dialer = TlsDialer::new(config.server.host.clone(), config.server.port, profile)?;
    let options = ConnectionOptions {
        connect_timeout: config.server.connect_timeout(),
        request_timeout: config.server.request_timeout(),
    };
    Ok(Rpc::new(Connection::new(dialer, signer, options)))
}

async fn ping(rpc: &Rpc) -> Result<()> {
    rpc.connection()
        .connect()
        .await
        .context("Failed to connect to relay")?;
    if let Some(server) = rpc.connection().server_id() {
        println!("server:       {}", server);
    }

    let pong = rpc.ping().await?;
    println!("ping:         {}", if pong { "pong" } else { "no answer" });

    let peak = rpc.get_block_peak().await?;
    println!("block peak:   {}", peak);

    let header = rpc.get_block_header(peak).await?;
    println!("block header: {}", header);
    Ok(())
}

async fn run_services(rpc: &Rpc, profile: &TlsProfile, config: &Config) -> Result<()> {
    if config.bind.is_empty() && config.publish.ports.is_empty() {
        anyhow::bail!("Nothing to do: configure [[bind]] entries or [publish] ports");
    }

    rpc.connection()
        .connect()
        .await
        .context("Failed to connect to relay")?;

    let binder = if config.bind.is_empty() {
        None
    } else {
        let binder = PortBinder::new(rpc.clone());
        for entry in &config.bind {
            let binding = Binding::from_config(entry)?;
            binder
                .bind(binding)
                .await
                .with_context(|| format!("Failed to bind local port {}", entry.local_port))?;
        }
        Some(binder)
    };

    let publisher = if config.publish.ports.is_empty() {
        None
    } else {
        let tls = profile
            .acceptor()
            .context("Failed to set up TLS for published ports")?;
        Some(PortPublisher::new(
            rpc.clone(),
            PublishOptions {
                ports: config.publish.ports.clone(),
                local_host: config.publish.local_host.clone(),
                tls: Some(tls),
            },
        ))
    };

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    if let Some(binder) = &binder {
        binder.shutdown();
    }
    if let Some(publisher) = &publisher {
        publisher.shutdown();
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
