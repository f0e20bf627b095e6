//! dmsg CLI
//!
//! Key generation and a self-contained local relay environment.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::EnvConfig;
use dmsg_core::{Addr, BackoffConfig, Client, ClientConfig, Server, ServerConfig};
use dmsg_discovery::{DiscoveryClient, MemoryDiscovery};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

/// Upper bound for the whole echo exchange
const ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(30);

/// dmsg - relayed streams between public-key addressed peers
#[derive(Parser)]
#[command(name = "dmsg")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity keypair
    Keygen,

    /// Run relays and two clients locally and echo a message across a relay
    Env {
        /// Environment config file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_config = match &cli.command {
        Commands::Env {
            config: Some(path),
        } => EnvConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        _ => EnvConfig::default(),
    };
    env_config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        env_config.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Keygen => keygen(),
        Commands::Env { .. } => run_env(&env_config).await,
    }
}

fn keygen() -> anyhow::Result<()> {
    let (pk, sk) = dmsg_crypto::generate_keypair();
    let secret = Zeroizing::new(hex::encode(sk.to_bytes()));
    println!("public_key: {pk}");
    println!("secret_key: {}", secret.as_str());
    Ok(())
}

fn env_client_config(min_sessions: usize) -> ClientConfig {
    ClientConfig {
        min_sessions,
        backoff: BackoffConfig {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(2),
            ..BackoffConfig::default()
        },
        ..ClientConfig::default()
    }
}

async fn start_client(
    disc: Arc<dyn DiscoveryClient>,
    config: ClientConfig,
) -> anyhow::Result<(Client, JoinHandle<Result<(), dmsg_core::Error>>)> {
    let (_, sk) = dmsg_crypto::generate_keypair();
    let client = Client::new(sk, disc, config)?;
    let serving = tokio::spawn({
        let client = client.clone();
        async move { client.serve().await }
    });
    client.ready().await?;
    Ok((client, serving))
}

async fn run_env(config: &EnvConfig) -> anyhow::Result<()> {
    let disc: Arc<dyn DiscoveryClient> = Arc::new(MemoryDiscovery::new());

    let mut servers = Vec::with_capacity(config.servers);
    let mut tasks = Vec::new();
    for _ in 0..config.servers {
        let (_, sk) = dmsg_crypto::generate_keypair();
        let server = Server::new(sk, disc.clone(), ServerConfig::default())?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        tasks.push(tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener, addr).await }
        }));
        server.ready().await?;
        info!(pk = %server.local_pk(), "Relay ready");
        servers.push(server);
    }

    let (responder, responder_task) =
        start_client(disc.clone(), env_client_config(config.min_sessions)).await?;
    let (initiator, initiator_task) =
        start_client(disc.clone(), env_client_config(config.min_sessions)).await?;
    tasks.push(responder_task);
    tasks.push(initiator_task);
    info!(
        responder = %responder.local_pk(),
        relays = ?responder.sessions().iter().map(|pk| pk.short()).collect::<Vec<_>>(),
        initiator = %initiator.local_pk(),
        "Clients ready"
    );

    let outcome = tokio::time::timeout(
        ROUND_TRIP_TIMEOUT,
        echo_round_trip(&initiator, &responder, config),
    )
    .await
    .context("round trip timed out")
    .and_then(|r| r);

    initiator.close().await;
    responder.close().await;
    for server in &servers {
        server.close().await;
    }
    for task in tasks {
        task.await??;
    }
    outcome
}

async fn echo_round_trip(
    initiator: &Client,
    responder: &Client,
    config: &EnvConfig,
) -> anyhow::Result<()> {
    let listener = responder.listen(config.port)?;
    let len = config.message.len();
    let echo = tokio::spawn(async move {
        let mut stream = listener.accept().await?;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        stream.write_all(&buf).await?;
        Ok::<_, anyhow::Error>(())
    });

    let mut stream = initiator
        .dial(Addr::new(responder.local_pk(), config.port))
        .await
        .context("dial failed")?;
    stream.write_all(config.message.as_bytes()).await?;
    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).await?;
    echo.await??;

    if reply != config.message.as_bytes() {
        anyhow::bail!("echo mismatch: got {:?}", String::from_utf8_lossy(&reply));
    }
    info!(
        local = %stream.local_addr(),
        remote = %stream.remote_addr(),
        bytes = len,
        "Round trip complete"
    );
    stream.close();
    Ok(())
}
