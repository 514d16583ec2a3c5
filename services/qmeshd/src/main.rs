//! Headless QMesh daemon.
//!
//! Participates fully as a mesh node (beacons, forwarding, dedup), stores
//! chat history, answers sync requests and logs activity until SIGINT or
//! SIGTERM, then shuts the stack down in order: sync and beacons first,
//! receive drain, event bus, links.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use qmesh_chat::{ChatClient, NodeMode, SyncEngine};
use qmesh_codec::{frame::DEFAULT_COMPRESS_THRESHOLD, FrameCodec, NodeId, PayloadCipher};
use qmesh_events::{Event, EventBus, EventSink};
use qmesh_link::{ArdopLink, Multiplexer, TcpMeshClientLink, TcpMeshServerLink};
use qmesh_mesh::MeshNode;
use qmesh_store::ChatStore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;

use config::DaemonConfig;

/// Grace period for the receive side to drain after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Parser)]
#[command(name = "qmeshd", version, about = "Headless QMesh store-and-forward chat daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "qmesh.toml")]
    config: PathBuf,

    /// Override mesh.callsign
    #[arg(long)]
    callsign: Option<String>,

    /// Override chat.db_path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Override chat.node_mode
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Full,
    Relay,
    Monitor,
}

impl From<ModeArg> for NodeMode {
    fn from(mode: ModeArg) -> NodeMode {
        match mode {
            ModeArg::Full => NodeMode::Full,
            ModeArg::Relay => NodeMode::Relay,
            ModeArg::Monitor => NodeMode::Monitor,
        }
    }
}

/// Observer that mirrors every stack event into the daemon log.
struct LogSink;

impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn on_event(&self, event: &Event) {
        match event {
            Event::MessageSent { channel, dest, seqno } => {
                info!(%channel, %dest, seqno, "message sent");
            }
            Event::MessageReceived { channel, origin, seqno, nick } => {
                info!(%channel, %origin, seqno, %nick, "message received");
            }
            Event::MessageStored { channel, origin, seqno } => {
                info!(%channel, %origin, seqno, "message stored");
            }
            Event::GapDetected { channel, origin, start, end } => {
                info!(%channel, %origin, start, end, "gap confirmed");
            }
            Event::SyncApplied { channel, applied_count } => {
                info!(%channel, applied_count, "sync applied");
            }
            Event::PruneExecuted { deleted_rows } => {
                info!(deleted_rows, "retention prune executed");
            }
            Event::LinkStateChange { link, up } => {
                info!(%link, up, "link state change");
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("qmesh={0},qmeshd={0}", default_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(callsign) = cli.callsign {
        config.mesh.callsign = callsign;
    }
    if let Some(db_path) = cli.db_path {
        config.chat.db_path = db_path;
    }
    if let Some(mode) = cli.mode {
        config.chat.node_mode = mode.into();
    }
    config.validate()?;

    let node_id = NodeId::from_callsign(&config.mesh.callsign)
        .context("mesh.callsign is not a usable callsign")?;
    info!(
        callsign = %node_id,
        node_id_hex = %node_id.to_hex(),
        mode = ?config.chat.node_mode,
        "qmeshd starting"
    );

    let events = EventBus::start(1024, vec![Box::new(LogSink)]);

    let store = Arc::new(
        ChatStore::open(&config.chat.db_path, Duration::from_secs(2))
            .context("cannot open chat database")?,
    );

    let mux = Arc::new(Multiplexer::new(1024));
    if let Some(ardop) = config.ardop_link_config() {
        mux.add_link(ArdopLink::start(
            "ardop",
            ardop,
            mux.inbound_sender(),
            events.clone(),
        ));
    }
    if let Some(server) = config.tcp_server_config() {
        let link = TcpMeshServerLink::start(
            "tcp-server",
            server,
            mux.inbound_sender(),
            events.clone(),
        )
        .await
        .context("cannot bind tcp_mesh.listen")?;
        mux.add_link(link);
    }
    for (name, peer) in config.tcp_client_configs() {
        mux.add_link(TcpMeshClientLink::start(
            &name,
            peer,
            mux.inbound_sender(),
            events.clone(),
        ));
    }

    let cipher = PayloadCipher::new(
        config.security.enable_encryption,
        config.encryption_key().as_deref(),
    )
    .context("bad security configuration")?;
    let codec = FrameCodec::new(DEFAULT_COMPRESS_THRESHOLD, cipher);

    let (node, delivery_rx) = MeshNode::new(node_id, config.mesh_config(), codec, mux.clone());
    node.start().context("mesh node start failed")?;

    let chat_config = config.chat_config()?;
    let sync = SyncEngine::new(
        config.sync_config(),
        chat_config.nick.clone(),
        store.clone(),
        node.clone(),
        events.clone(),
    );
    sync.start();

    let client = ChatClient::new(chat_config, node.clone(), store, sync.clone(), events.clone())?;
    client.start(delivery_rx);

    if client.mode() == NodeMode::Full {
        sync.kick_startup_inventory(config.default_peer_node_id());
    }

    wait_for_shutdown_signal().await?;
    info!("shutdown requested");

    // Producers first, then a bounded drain, then the plumbing.
    sync.shutdown();
    client.shutdown();
    node.shutdown();
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    events.shutdown();
    mux.shutdown();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    info!("qmeshd stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("cannot wait for SIGINT")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}
