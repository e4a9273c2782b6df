//! Quiz node: a shard region hosting quiz progress entities.
//!
//! ```bash
//! # single node on a local file journal
//! quiz-node serve --address 127.0.0.1:7400 --data-dir ./quiz-data
//! quiz-node send --node 127.0.0.1:7400 --owner alice --command answer \
//!     --payload '{"question_id":"q1","correct":true}'
//!
//! # several nodes sharing a Postgres journal (built with `--features sql`)
//! quiz-node serve --address 127.0.0.1:7400 --peers 127.0.0.1:7401 --postgres-url $URL
//! quiz-node serve --address 127.0.0.1:7401 --coordinator 127.0.0.1:7400 --postgres-url $URL
//! ```
//!
//! The file journal keeps per-key write positions in process memory, so it
//! must not be shared between nodes.

mod quiz;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use shardhold::allocation::LeastShardsStrategy;
use shardhold::membership::HealthMonitor;
use shardhold::metrics::RegionMetrics;
use shardhold::prelude::*;
use shardhold::reply::Reply;
use shardhold::storage::file_journal::FileJournal;
use shardhold::storage::memory_membership::MemoryMembership;
use shardhold::transport::tcp::{RemoteCoordinatorClient, TcpServer, TcpTransport};
use shardhold::transport::{CoordinatorClient, RegionEndpoint};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use quiz::QuizProgress;

#[derive(Parser, Debug)]
#[command(name = "quiz-node")]
#[command(about = "Sharded quiz progress node")]
struct Cli {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run a region, optionally hosting the coordinator.
    Serve(ServeArgs),
    /// Submit one command to a node and print the reply as JSON.
    Send(SendArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address of this region, host:port. Also the listen port.
    #[arg(long, env = "QUIZ_ADDRESS")]
    address: RegionAddress,

    /// Interface to bind. Defaults to all interfaces on the region's port.
    #[arg(long, env = "QUIZ_BIND")]
    bind: Option<String>,

    /// Coordinator node. This node hosts the coordinator when absent.
    #[arg(long, env = "QUIZ_COORDINATOR")]
    coordinator: Option<RegionAddress>,

    /// Other regions, comma-separated. Only read by the coordinator node.
    #[arg(long, env = "QUIZ_PEERS", value_delimiter = ',')]
    peers: Vec<RegionAddress>,

    /// File journal directory. Ignored when a Postgres URL is given.
    #[arg(long, env = "QUIZ_DATA_DIR", default_value = "./quiz-data")]
    data_dir: PathBuf,

    /// Postgres journal shared by every node.
    #[cfg(feature = "sql")]
    #[arg(long, env = "QUIZ_POSTGRES_URL")]
    postgres_url: Option<String>,

    #[arg(long, env = "QUIZ_NUM_SHARDS", default_value_t = 100)]
    num_shards: u32,

    #[arg(long, env = "QUIZ_SNAPSHOT_EVERY", default_value_t = 100)]
    snapshot_every: u64,

    #[arg(long, env = "QUIZ_IDLE_TIMEOUT_SECS", default_value_t = 120)]
    idle_timeout_secs: u64,

    #[arg(long, env = "QUIZ_ASK_TIMEOUT_MS", default_value_t = 10_000)]
    ask_timeout_ms: u64,

    #[arg(long, env = "QUIZ_HANDOFF_TIMEOUT_MS", default_value_t = 30_000)]
    handoff_timeout_ms: u64,

    #[arg(long, env = "QUIZ_REBALANCE_INTERVAL_SECS", default_value_t = 10)]
    rebalance_interval_secs: u64,
}

impl ServeArgs {
    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            region_address: self.address.clone(),
            num_shards: self.num_shards,
            snapshot_every: self.snapshot_every,
            entity_idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            ask_timeout: Duration::from_millis(self.ask_timeout_ms),
            handoff_timeout: Duration::from_millis(self.handoff_timeout_ms),
            rebalance_interval: Duration::from_secs(self.rebalance_interval_secs),
            ..Default::default()
        }
    }
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Node to submit to, host:port.
    #[arg(long, env = "QUIZ_NODE")]
    node: RegionAddress,

    #[arg(long)]
    owner: String,

    /// Command type: answer, progress or reset.
    #[arg(long)]
    command: String,

    /// Command body as JSON.
    #[arg(long, default_value = "null")]
    payload: String,

    /// Request id for an idempotent retry.
    #[arg(long)]
    request_id: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("quiz_node=info".parse()?)
                .add_directive("shardhold=info".parse()?),
        )
        .init();

    match Cli::parse().command {
        Mode::Serve(args) => serve(args).await,
        Mode::Send(args) => send(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = Arc::new(args.runtime_config());
    config.validate()?;

    let journal = open_journal(&args).await?;
    let transport = Arc::new(TcpTransport::new(config.connect_timeout));
    let metrics = Arc::new(RegionMetrics::unregistered());
    let cancel = CancellationToken::new();

    let hosts_coordinator = args
        .coordinator
        .as_ref()
        .map_or(true, |coordinator| *coordinator == args.address);

    let mut server = TcpServer::new();
    let coordinator_client: Arc<dyn CoordinatorClient>;
    let feed;
    let mut membership_handle = None;
    let mut coordinator = None;

    if hosts_coordinator {
        let membership = Arc::new(MemoryMembership::with_members(
            std::iter::once(args.address.clone()).chain(args.peers.iter().cloned()),
        ));
        let hosted = ShardCoordinator::recover(
            config.clone(),
            journal.clone(),
            Arc::new(LeastShardsStrategy::new(
                config.rebalance_threshold,
                config.max_simultaneous_rebalance,
            )),
            transport.clone(),
            membership.clone(),
            metrics.clone(),
        )
        .await
        .context("recovering coordinator")?;
        hosted.start();

        let monitor = HealthMonitor::new(
            transport.clone(),
            membership.clone(),
            config.health_check_interval,
            config.health_failure_threshold,
        );
        let monitor_cancel = cancel.child_token();
        tokio::spawn(async move { monitor.run(monitor_cancel).await });

        server = server.with_coordinator(hosted.clone());
        feed = AssignmentFeed::Watch(hosted.subscribe());
        coordinator_client = hosted.clone() as Arc<dyn CoordinatorClient>;
        membership_handle = Some(membership);
        coordinator = Some(hosted);
        info!(region = %args.address, "hosting coordinator");
    } else {
        let address = args.coordinator.clone().context("coordinator address")?;
        info!(coordinator = %address, "using remote coordinator");
        coordinator_client = Arc::new(RemoteCoordinatorClient::new(transport.clone(), address));
        feed = AssignmentFeed::Poll;
    }

    let region = ShardRegion::new(
        config.clone(),
        QuizProgress,
        journal,
        coordinator_client,
        transport,
        metrics,
    )?;
    region.start(
        feed,
        membership_handle.map(|m| m as Arc<dyn shardhold::membership::Membership>),
    );
    let server = Arc::new(server.with_region(region.clone() as Arc<dyn RegionEndpoint>));

    let bind = args
        .bind
        .clone()
        .unwrap_or_else(|| format!("0.0.0.0:{}", args.address.port));
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let server_task = tokio::spawn(server.serve(listener, cancel.child_token()));
    info!(region = %args.address, bind = %bind, "quiz node ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    region.shutdown().await;
    if let Some(coordinator) = coordinator {
        coordinator.shutdown().await;
    }
    cancel.cancel();
    let _ = server_task.await;
    Ok(())
}

async fn open_journal(args: &ServeArgs) -> Result<Arc<dyn EventJournal>> {
    #[cfg(feature = "sql")]
    if let Some(url) = &args.postgres_url {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .context("connecting to postgres")?;
        let journal = shardhold::storage::sql_journal::SqlJournal::new(pool);
        journal.migrate().await?;
        info!("using postgres journal");
        return Ok(Arc::new(journal));
    }

    let journal = FileJournal::open(&args.data_dir)
        .await
        .with_context(|| format!("opening journal at {}", args.data_dir.display()))?;
    info!(dir = %args.data_dir.display(), "using file journal");
    Ok(Arc::new(journal))
}

async fn send(args: SendArgs) -> Result<()> {
    let body: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload is not valid JSON")?;
    let command = InboundCommand {
        owner_key: OwnerKey::new(args.owner),
        command_type: args.command,
        payload: rmp_serde::to_vec_named(&body)?,
        request_id: args.request_id.map(RequestId),
    };

    let transport = TcpTransport::new(Duration::from_secs(5));
    let reply = transport.send_inbound(&args.node, command).await?;
    let rendered = match reply {
        Reply::Success(bytes) => {
            let value: serde_json::Value =
                rmp_serde::from_slice(&bytes).context("undecodable reply")?;
            serde_json::json!({ "success": value })
        }
        Reply::Failure(failure) => serde_json::json!({ "failure": failure }),
    };
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}
