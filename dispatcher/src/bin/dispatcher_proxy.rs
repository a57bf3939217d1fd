//! Dispatcher proxy binary: the intercepting-proxy addon (C11) wired to a
//! live attestor over WebSocket.
//!
//! Run with:
//! ```bash
//! dispatcher-proxy --cert cert.pem --key key.pem --owner-key owner.hex \
//!     --attestor-url ws://127.0.0.1:8001 --providers providers.json
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dispatcher::proxy::{run_server, Dispatcher, DispatcherConfig};
use dispatcher::worker_pool::{WorkerPool, WorkerPoolConfig};
use dispatcher::ws_client::WsAttestorClient;
use k256::ecdsa::SigningKey;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dispatcher-proxy")]
#[command(about = "Intercepting HTTPS proxy that dispatches matched flows to a zero-knowledge attestor")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:8443")]
    listen: SocketAddr,

    #[arg(long, env = "DISPATCHER_TLS_CERT")]
    cert: String,

    #[arg(long, env = "DISPATCHER_TLS_KEY")]
    key: String,

    #[arg(long, env = "OWNER_PRIVATE_KEY")]
    owner_key_hex: String,

    #[arg(long, env = "ATTESTOR_URL", default_value = "ws://127.0.0.1:8001")]
    attestor_url: String,

    #[arg(long, env = "PROVIDERS_CONFIG", default_value = "providers.json")]
    providers: PathBuf,

    #[arg(long, env = "STORE_DIR", default_value = "store")]
    store_dir: PathBuf,

    #[arg(long, default_value_t = 3)]
    max_workers: usize,

    #[arg(long, default_value_t = 60)]
    task_deadline_secs: u64,

    #[arg(long, default_value_t = 100)]
    max_invocations_per_minute: u32,

    #[arg(long, default_value_t = 0.8)]
    match_threshold: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "dispatcher=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let owner_key = load_signing_key_hex(&args.owner_key_hex)?;

    info!(attestor_url = %args.attestor_url, "connecting to attestor");
    let rpc = Arc::new(WsAttestorClient::connect(&args.attestor_url).await?);

    let pool = WorkerPool::new(WorkerPoolConfig {
        max_workers: args.max_workers,
        task_deadline: Duration::from_secs(args.task_deadline_secs),
        max_invocations_per_minute: args.max_invocations_per_minute,
        ..Default::default()
    });

    let config = DispatcherConfig {
        listen_addr: args.listen,
        cert_path: args.cert,
        key_path: args.key,
        store_dir: args.store_dir,
        provider_registry_path: args.providers,
        match_threshold: args.match_threshold,
    };

    let dispatcher = Arc::new(Dispatcher::new(&config, rpc, owner_key, pool).context("initializing dispatcher")?);

    run_server(config, dispatcher).await
}

fn load_signing_key_hex(hex_str: &str) -> Result<SigningKey> {
    let bytes = hex::decode(hex_str.trim_start_matches("0x")).context("owner key is not valid hex")?;
    SigningKey::from_slice(&bytes).context("owner key is not a valid secp256k1 scalar")
}
