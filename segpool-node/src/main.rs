//! `segpool` CLI: create and inspect drives, launch a pool, join one as a
//! worker, deliver results, and run finalization by hand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use segpool_core::identity::{Keypair, PublicKey};
use segpool_core::{paths, EncodeOpts, SourceMeta, DEFAULT_BITRATE_KBPS};
use segpool_node::encode::FfmpegEncoder;
use segpool_node::finalize::{self, FfmpegFinalizer};
use segpool_node::peer::{self, Peer, PeerEvent, TaskMode};
use segpool_node::pool::{Pool, PoolEvent};
use segpool_node::store::{self, Store, StoreError};
use segpool_node::swarm::Swarm;
use segpool_node::config;

#[derive(Parser)]
#[command(name = "segpool", version, about = "Swarm-distributed segment encoding")]
struct Cli {
    /// Local drive id under the storage root. Defaults to "pool" for pool
    /// commands and "work" for worker commands.
    #[arg(long, short = 'i', global = true)]
    id: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create a local drive and print its key.
    Create {
        /// Profile marker to write: "pool" or "work".
        #[arg(default_value = "pool")]
        profile: String,
    },
    /// Launch a pool serving this drive's job.
    Launch {
        /// Target video bitrate in kbit/s.
        #[arg(long, short = 'B', default_value_t = DEFAULT_BITRATE_KBPS)]
        bitrate: u64,
        /// H.264 level to request from the encoder.
        #[arg(long, short = 'L')]
        level: Option<f64>,
    },
    /// Join a pool and encode segments until it runs dry.
    Join {
        /// The pool drive key, hex.
        pool_key: String,
    },
    /// Deliver previously encoded outputs to a pool.
    Send {
        /// The pool drive key, hex.
        pool_key: String,
    },
    /// Import a local file or directory into the drive.
    Add {
        path: PathBuf,
        /// Drive directory to place entries under.
        #[arg(long, short = 'p', default_value = "")]
        prefix: String,
    },
    /// List entries under a drive directory.
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write a drive file to stdout.
    Cat {
        path: String,
    },
    /// Concatenate segment outputs, optionally muxing the result.
    Concat {
        #[arg(default_value = paths::SEGMENTS_OUT)]
        dir: String,
        /// Also mux the concatenated stream with the job's tracks.
        #[arg(long, short = 'm')]
        mux: bool,
    },
}

impl Cli {
    fn drive_id(&self) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        match self.cmd {
            Cmd::Join { .. } | Cmd::Send { .. } => "work".to_string(),
            _ => "pool".to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load();
    let id = cli.drive_id();

    match cli.cmd {
        Cmd::Create { ref profile } => {
            let drive = Store::open(&cfg.storage_dir, &id).await?;
            drive.write_profile(profile).await?;
            info!(drive = %id, key = %drive.key_hex(), %profile, "drive ready");
        }
        Cmd::Launch { bitrate, level } => {
            launch(&cfg, &id, bitrate, level).await?;
        }
        Cmd::Join { ref pool_key } => {
            run_peer(&cfg, &id, pool_key, TaskMode::Work).await?;
        }
        Cmd::Send { ref pool_key } => {
            run_peer(&cfg, &id, pool_key, TaskMode::Send).await?;
        }
        Cmd::Add { ref path, ref prefix } => {
            let drive = Store::open(&cfg.storage_dir, &id).await?;
            let written = store::import(&drive, path, prefix)
                .await
                .with_context(|| format!("importing {}", path.display()))?;
            for p in written {
                info!(path = %p, "imported");
            }
        }
        Cmd::Ls { ref path } => {
            let drive = Store::open(&cfg.storage_dir, &id).await?;
            for entry in drive.list(path).await? {
                println!("{entry}");
            }
        }
        Cmd::Cat { ref path } => {
            let drive = Store::open(&cfg.storage_dir, &id).await?;
            let bytes = drive.get(path).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&bytes).await?;
            stdout.flush().await?;
        }
        Cmd::Concat { ref dir, mux } => {
            let drive = Store::open(&cfg.storage_dir, &id).await?;
            let concat_path = finalize::concat(&drive, dir).await?;
            info!(path = %concat_path, "concat written");
            if mux {
                let tracks = read_tracks(&drive).await?;
                let muxer = FfmpegFinalizer::new(cfg.ffmpeg_bin.clone());
                let out = muxer.mux(&drive, &concat_path, &tracks).await?;
                info!(path = %out, "mux written");
            }
        }
    }
    Ok(())
}

async fn launch(
    cfg: &config::Config,
    id: &str,
    bitrate: u64,
    level: Option<f64>,
) -> anyhow::Result<()> {
    let (mut pool, events) = Pool::new(id, cfg.storage_dir.clone());
    let logger = tokio::spawn(log_pool_events(events));
    pool.create_drive().await?;
    pool.load_config().await?;
    if !pool.is_ready() {
        warn!("job config incomplete; serving no-work until staged");
    }
    let opts = pool_encode_opts(pool.drive()?, bitrate, level).await?;
    pool.set_encode_opts(opts);

    let key = pool.key()?.to_hex();
    info!(%key, "pool key");

    let swarm = Swarm::new(
        Arc::new(Keypair::generate()),
        cfg.discovery_port,
        cfg.transport_port,
    );
    let finalizer = Arc::new(FfmpegFinalizer::new(cfg.ffmpeg_bin.clone()));
    let pool = Arc::new(pool);
    pool.launch(&swarm, finalizer).await?;

    shutdown_signal().await;
    pool.destroy().await;
    logger.abort();
    Ok(())
}

async fn run_peer(
    cfg: &config::Config,
    id: &str,
    pool_key: &str,
    mode: TaskMode,
) -> anyhow::Result<()> {
    let pool_key = PublicKey::from_hex(pool_key).context("pool key")?;
    let drive = Store::open(&cfg.storage_dir, id).await?;
    if !drive.exists(paths::PROFILE).await? {
        drive.write_profile("work").await?;
    }
    let (peer, events) = Peer::new(pool_key, drive);
    let peer = Arc::new(peer);
    let logger = tokio::spawn(log_peer_events(events));

    let swarm = Swarm::new(Arc::new(Keypair::generate()), cfg.discovery_port, 0);
    let encoder = FfmpegEncoder::new(cfg.ffmpeg_bin.clone());
    tokio::select! {
        res = peer::join_pool(&swarm, peer.clone(), mode, &encoder) => res?,
        _ = shutdown_signal() => {
            peer.destroy();
            info!("interrupted; local outputs kept for a later send");
        }
    }
    logger.abort();
    Ok(())
}

/// Pool-wide encode options from probed source metadata, when present.
async fn pool_encode_opts(
    drive: &Store,
    bitrate: u64,
    level: Option<f64>,
) -> anyhow::Result<Option<EncodeOpts>> {
    match drive.get(paths::SOURCE_META).await {
        Ok(bytes) => {
            let meta: SourceMeta =
                serde_json::from_slice(&bytes).context("parsing source metadata")?;
            Ok(Some(EncodeOpts::from_source(&meta, bitrate, level)?))
        }
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_tracks(drive: &Store) -> anyhow::Result<Vec<String>> {
    match drive.get(paths::TRACKS_CONFIG).await {
        Ok(bytes) => serde_json::from_slice(&bytes).context("parsing tracks config"),
        Err(StoreError::NotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn log_pool_events(mut rx: tokio::sync::mpsc::UnboundedReceiver<PoolEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PoolEvent::ConfigLoaded {
                segments,
                tracks,
                ready,
            } => info!(segments, tracks, ready, "job config loaded"),
            PoolEvent::Announced { key } => info!(%key, "announced on swarm"),
            PoolEvent::WorkerSeen { peer, drive_key } => {
                info!(peer = %peer.short(), %drive_key, "worker joined")
            }
            PoolEvent::SegmentAssigned { peer, segment } => {
                info!(peer = %peer.short(), %segment, "assigned")
            }
            PoolEvent::ResultStored { peer, path } => {
                info!(peer = %peer.short(), %path, "result stored")
            }
            PoolEvent::DeliveryFailed { peer, error } => {
                warn!(peer = %peer.short(), %error, "delivery failed")
            }
            PoolEvent::AllComplete => info!("all segments complete"),
            PoolEvent::Finalized { output } => info!(%output, "finalized"),
            PoolEvent::FinalizeFailed { error } => warn!(%error, "finalize failed"),
        }
    }
}

async fn log_peer_events(mut rx: tokio::sync::mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PeerEvent::SegmentClaimed { segment } => info!(%segment, "claimed"),
            PeerEvent::SegmentEncoded { segment, output } => {
                info!(%segment, %output, "encoded")
            }
            PeerEvent::EncodeFailed { segment, error } => {
                warn!(%segment, %error, "encode failed")
            }
            PeerEvent::NoWork => info!("no more work"),
            PeerEvent::NoResults => info!("nothing to deliver"),
            PeerEvent::ResultsDelivered { segments } => {
                info!(count = segments.len(), "results delivered")
            }
            PeerEvent::DeliveryFailed { error } => warn!(%error, "delivery failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
