//! Worker side: join a pool's topic, loop requesting assignments until the
//! pool runs dry, encode each segment into the local drive, and deliver the
//! accumulated outputs back in one batch.

use std::sync::Arc;

use segpool_core::identity::{PublicKey, Topic};
use segpool_core::protocol::verbs;
use segpool_core::{
    paths, resolve_encode_opts, ResultsReply, ResultsRequest, SourceMeta, WorkLog, WorkReply,
    WorkRequest,
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use crate::encode::Encoder;
use crate::rpc::{self, RpcClient, RpcError, RpcHandler};
use crate::store::{self, RemoteStore, Replicator, Store, StoreError};
use crate::swarm::{Swarm, SwarmError};

/// Worker lifecycle notifications, consumed by the CLI's log task.
#[derive(Debug)]
pub enum PeerEvent {
    SegmentClaimed { segment: String },
    SegmentEncoded { segment: String, output: String },
    EncodeFailed { segment: String, error: String },
    NoWork,
    NoResults,
    ResultsDelivered { segments: Vec<String> },
    DeliveryFailed { error: String },
}

/// What a worker needs from the pool: the two coordination verbs. Implemented
/// over a live channel by `RpcClient` and by scripted fakes in tests.
pub trait PoolClient: Send + Sync {
    fn request_work(
        &self,
        req: &WorkRequest,
    ) -> impl std::future::Future<Output = Result<WorkReply, RpcError>> + Send;
    fn send_results(
        &self,
        req: &ResultsRequest,
    ) -> impl std::future::Future<Output = Result<ResultsReply, RpcError>> + Send;
}

impl PoolClient for RpcClient {
    async fn request_work(&self, req: &WorkRequest) -> Result<WorkReply, RpcError> {
        let body = serde_json::to_vec(req)?;
        let reply = self.request(verbs::REQUEST_WORK, body).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    async fn send_results(&self, req: &ResultsRequest) -> Result<ResultsReply, RpcError> {
        let body = serde_json::to_vec(req)?;
        let reply = self.request(verbs::SEND_RESULTS, body).await?;
        Ok(serde_json::from_slice(&reply)?)
    }
}

pub struct Peer {
    pool_key: PublicKey,
    drive: Store,
    log: Mutex<WorkLog>,
    cancel_tx: watch::Sender<bool>,
    cancel: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl Peer {
    pub fn new(pool_key: PublicKey, drive: Store) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel) = watch::channel(false);
        let peer = Peer {
            pool_key,
            drive,
            log: Mutex::new(WorkLog::new()),
            cancel_tx,
            cancel,
            events,
        };
        (peer, rx)
    }

    pub fn pool_key(&self) -> &PublicKey {
        &self.pool_key
    }

    pub fn drive(&self) -> &Store {
        &self.drive
    }

    /// Stop after the current segment. Everything already encoded stays in
    /// the local drive and can be delivered by a later send run.
    pub fn destroy(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Request, pull, encode, store. Runs until the pool answers no-work or
    /// `destroy` is called. Encode failures skip the segment and keep going;
    /// transport failures propagate.
    pub async fn work_loop<C, R, E>(
        &self,
        pool: &C,
        pool_drive: &R,
        encoder: &E,
    ) -> Result<(), PeerError>
    where
        C: PoolClient,
        R: Replicator,
        E: Encoder,
    {
        // Source metadata is fetched at most once; None caches its absence.
        let mut source_meta: Option<Option<SourceMeta>> = None;
        loop {
            if *self.cancel.borrow() {
                info!("work loop cancelled");
                return Ok(());
            }
            let reply = pool
                .request_work(&WorkRequest {
                    drive_key: self.drive.key_hex(),
                })
                .await?;
            if reply.is_no_work() {
                info!("pool has no more work");
                let _ = self.events.send(PeerEvent::NoWork);
                return Ok(());
            }
            let Some(segment) = reply.segment.clone() else {
                return Err(PeerError::BadAssignment);
            };
            self.log.lock().await.claim(segment.clone());
            let _ = self.events.send(PeerEvent::SegmentClaimed {
                segment: segment.clone(),
            });

            // Settle before reading assigned bytes; skipping the barrier
            // risks a stale view of the pool drive.
            pool_drive.sync().await?;
            let opts = match reply.encode_opts {
                Some(opts) => opts,
                None => {
                    let meta = match &source_meta {
                        Some(cached) => cached.clone(),
                        None => {
                            let fetched = fetch_source_meta(pool_drive).await?;
                            source_meta = Some(fetched.clone());
                            fetched
                        }
                    };
                    resolve_encode_opts(None, meta.as_ref())
                }
            };

            self.log.lock().await.start(segment.clone());
            let input = pool_drive.fetch(&segment).await?;
            match encoder.encode(&input, &opts).await {
                Ok(encoded) => {
                    let output = paths::output_path(&segment);
                    self.drive.put(&output, &encoded).await?;
                    self.log.lock().await.finish(segment.clone());
                    info!(%segment, %output, "segment encoded");
                    let _ = self.events.send(PeerEvent::SegmentEncoded { segment, output });
                }
                Err(e) => {
                    warn!(%segment, error = %e, "encode failed, moving on");
                    let _ = self.events.send(PeerEvent::EncodeFailed {
                        segment,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Deliver every output in the local drive in one batch. An empty drive
    /// is a no-op; a rejected batch leaves the outputs in place for a retry.
    pub async fn send_loop<C: PoolClient>(&self, pool: &C) -> Result<(), PeerError> {
        let names = self.drive.list(paths::SEGMENTS_OUT).await?;
        if names.is_empty() {
            info!("no results to deliver");
            let _ = self.events.send(PeerEvent::NoResults);
            return Ok(());
        }
        let segments: Vec<String> = names
            .iter()
            .map(|n| paths::join(paths::SEGMENTS_OUT, n))
            .collect();
        let reply = pool
            .send_results(&ResultsRequest {
                drive_key: self.drive.key_hex(),
                segments: segments.clone(),
            })
            .await?;
        if reply.success {
            info!(count = segments.len(), "results delivered");
            self.log.lock().await.deliver_all(segments.clone());
            let _ = self.events.send(PeerEvent::ResultsDelivered { segments });
        } else {
            let error = reply.error.unwrap_or_else(|| "delivery rejected".to_string());
            warn!(%error, "delivery failed");
            let _ = self.events.send(PeerEvent::DeliveryFailed { error });
        }
        Ok(())
    }

    pub async fn log_snapshot(&self) -> WorkLog {
        self.log.lock().await.clone()
    }
}

async fn fetch_source_meta<R: Replicator>(pool_drive: &R) -> Result<Option<SourceMeta>, PeerError> {
    match pool_drive.fetch(paths::SOURCE_META).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(RpcError::Remote(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Whether a joined peer encodes or only delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    Work,
    Send,
}

/// Serves the `store-*` verbs against the worker drive so the pool can pull
/// delivered outputs back over the same channel.
struct PeerResponder {
    peer: Arc<Peer>,
}

impl RpcHandler for PeerResponder {
    async fn handle(
        &self,
        _peer: segpool_core::identity::PeerId,
        verb: String,
        body: Vec<u8>,
        _client: RpcClient,
    ) -> Result<Vec<u8>, String> {
        match store::serve_store_verb(self.peer.drive(), &verb, &body).await {
            Some(result) => result,
            None => Err(format!("unknown verb: {verb}")),
        }
    }
}

/// Run an RPC channel over an existing connection, serving the worker drive
/// to the pool. Returns the client used to call the pool.
pub fn attach(peer: Arc<Peer>, conn: crate::swarm::Connection) -> RpcClient {
    let responder = Arc::new(PeerResponder { peer });
    rpc::spawn_channel(conn, responder)
}

/// Connect to the pool's topic and run one task mode to completion. The
/// connection drops on return, which leaves the swarm.
pub async fn join_pool<E: Encoder>(
    swarm: &Swarm,
    peer: Arc<Peer>,
    mode: TaskMode,
    encoder: &E,
) -> Result<(), PeerError> {
    let topic = Topic::for_drive(peer.pool_key());
    info!(pool = %peer.pool_key().to_hex(), ?mode, "joining pool");
    let conn = swarm.connect(topic).await?;
    let client = attach(peer.clone(), conn);
    let pool_drive = RemoteStore::new(peer.pool_key().clone(), client.clone());
    match mode {
        TaskMode::Work => peer.work_loop(&client, &pool_drive, encoder).await,
        TaskMode::Send => peer.send_loop(&client).await,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Swarm(#[from] SwarmError),
    #[error("assignment reply carried no segment")]
    BadAssignment,
}
