use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fs_err as fs;
use ledgerkv::config::DEFAULT_ROOT_PATH;
use ledgerkv::{
    Env, EnvConfig, LocalStore, MemberId, MemoryCluster, MemoryLedgerService, ReplayConfig,
    RetryConfig, Role,
};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ledgerkv")]
#[command(about = "Write and replay one record through a ledgerkv cluster member", long_about = None)]
struct Cli {
    /// This member's id
    member_id: MemberId,

    /// Coordination config (members, root_path, [retry], [replay])
    coordination: PathBuf,

    /// Ledger service config (available_nodes, digest_key)
    ledger: PathBuf,

    /// Directory for the local engine's WAL and snapshot; in memory if unset
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Keyspace to write to
    #[arg(short, long, default_value = "coldb")]
    keyspace: String,
}

#[derive(Debug, Deserialize)]
struct CoordinationFile {
    members: Vec<MemberId>,
    #[serde(default = "default_root_path")]
    root_path: String,
    #[serde(default)]
    retry: RetryConfig,
    #[serde(default)]
    replay: ReplayConfig,
}

fn default_root_path() -> String {
    DEFAULT_ROOT_PATH.to_string()
}

#[derive(Debug, Deserialize)]
struct LedgerFile {
    available_nodes: usize,
    #[serde(default)]
    digest_key: String,
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let content = fs::read_to_string(path)?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let coordination: CoordinationFile = read_toml(&cli.coordination)?;
    let ledger: LedgerFile = read_toml(&cli.ledger)?;

    let config = EnvConfig {
        member_id: cli.member_id,
        members: coordination.members,
        root_path: coordination.root_path,
        data_dir: cli.data_dir.clone(),
        digest_key: ledger.digest_key,
        retry: coordination.retry,
        replay: ReplayConfig {
            enabled: false,
            ..coordination.replay
        },
    };
    config.validate()?;

    let engine = match &config.data_dir {
        Some(dir) => LocalStore::open(cli.member_id, dir.join("engine"))?,
        None => LocalStore::new(cli.member_id),
    };
    let cluster = MemoryCluster::new();
    let ledgers = MemoryLedgerService::new(ledger.available_nodes);

    let env = Env::open(config, cluster.client(cli.member_id), ledgers, engine).await?;
    if !env.wait_for_role(Role::Leader, Duration::from_secs(5)).await {
        warn!("Not leader, skipping the write");
    }

    let db = env.open_keyspace(&cli.keyspace).await?;
    if env.is_leader() {
        db.put(b"oi", b"hello").await?;
        info!("Wrote oi=hello to {}", cli.keyspace);
    }

    let report = env.replayer().run_once().await?;
    info!("Replay cycle: {report:?}");

    match db.get(b"oi")? {
        Some(value) => println!("oi = {}", String::from_utf8_lossy(&value)),
        None => println!("oi is not set"),
    }
    println!("{:#?}", env.status().await?);

    db.close();
    env.close().await?;
    Ok(())
}
