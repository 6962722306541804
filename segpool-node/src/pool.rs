//! Pool side: owns the canonical drive, hands out segment assignments,
//! pulls results back from workers, and finalizes exactly once when every
//! expected segment is present.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use segpool_core::identity::{PeerId, PublicKey, Topic};
use segpool_core::paths;
use segpool_core::protocol::verbs;
use segpool_core::{
    EncodeOpts, ResultsReply, ResultsRequest, SegmentRegistry, WorkReply, WorkRequest,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::finalize::Finalizer;
use crate::rpc::{self, RpcClient, RpcHandler};
use crate::store::{self, RemoteStore, Replicator, Store, StoreError};
use crate::swarm::{Swarm, SwarmError};
use crate::util::epoch;

/// Pool lifecycle notifications, consumed by the CLI's log task.
#[derive(Debug)]
pub enum PoolEvent {
    ConfigLoaded {
        segments: usize,
        tracks: usize,
        ready: bool,
    },
    Announced {
        key: String,
    },
    WorkerSeen {
        peer: PeerId,
        drive_key: String,
    },
    SegmentAssigned {
        peer: PeerId,
        segment: String,
    },
    ResultStored {
        peer: PeerId,
        path: String,
    },
    DeliveryFailed {
        peer: PeerId,
        error: String,
    },
    AllComplete,
    Finalized {
        output: String,
    },
    FinalizeFailed {
        error: String,
    },
}

pub struct Pool {
    id: String,
    created_at: u64,
    storage_root: PathBuf,
    drive: Option<Store>,
    tracks: Vec<String>,
    encode_opts: Option<EncodeOpts>,
    ready: bool,
    registry: Mutex<SegmentRegistry>,
    workers: Mutex<HashMap<PeerId, String>>,
    finalized: AtomicBool,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl Pool {
    pub fn new(id: impl Into<String>, storage_root: PathBuf) -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let pool = Pool {
            id: id.into(),
            created_at: epoch(),
            storage_root,
            drive: None,
            tracks: Vec::new(),
            encode_opts: None,
            ready: false,
            registry: Mutex::new(SegmentRegistry::new(Vec::new())),
            workers: Mutex::new(HashMap::new()),
            finalized: AtomicBool::new(false),
            accept_task: Mutex::new(None),
            events,
        };
        (pool, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn drive(&self) -> Result<&Store, PoolError> {
        self.drive.as_ref().ok_or(PoolError::NoDrive)
    }

    pub fn key(&self) -> Result<&PublicKey, PoolError> {
        Ok(self.drive()?.key())
    }

    pub fn set_encode_opts(&mut self, opts: Option<EncodeOpts>) {
        self.encode_opts = opts;
    }

    /// Open the canonical drive, creating it on first use. Idempotent.
    pub async fn create_drive(&mut self) -> Result<(), PoolError> {
        if self.drive.is_some() {
            return Ok(());
        }
        let drive = Store::open(&self.storage_root, &self.id).await?;
        if !drive.exists(paths::PROFILE).await? {
            drive.write_profile("pool").await?;
        }
        self.drive = Some(drive);
        Ok(())
    }

    /// Read the job config from the drive and seed the registry. A drive
    /// without both config documents loads as not-ready rather than erroring
    /// so an operator can launch first and stage the job afterwards.
    pub async fn load_config(&mut self) -> Result<(), PoolError> {
        self.create_drive().await?;
        let drive = self.drive()?;
        let tracks = read_json_list(drive, paths::TRACKS_CONFIG).await?;
        let segments = read_json_list(drive, paths::SEGMENTS_CONFIG).await?;
        match (tracks, segments) {
            (Some(tracks), Some(segments)) => {
                self.ready = !segments.is_empty();
                let count = segments.len();
                self.tracks = tracks;
                *self.registry.get_mut() = SegmentRegistry::new(segments);
                let _ = self.events.send(PoolEvent::ConfigLoaded {
                    segments: count,
                    tracks: self.tracks.len(),
                    ready: self.ready,
                });
            }
            _ => {
                self.ready = false;
                let _ = self.events.send(PoolEvent::ConfigLoaded {
                    segments: 0,
                    tracks: 0,
                    ready: false,
                });
            }
        }
        Ok(())
    }

    /// Pop one segment from the available set. The registry lock makes the
    /// claim atomic: no segment is ever handed to two workers.
    pub async fn assign_segment(&self) -> Option<String> {
        self.registry.lock().await.assign()
    }

    /// Handle `request-work`. An exhausted pool answers no-work, which the
    /// caller must treat as a normal end-of-work signal.
    pub async fn handle_request_work(&self, peer: PeerId, req: WorkRequest) -> WorkReply {
        self.note_worker(peer, &req.drive_key).await;
        if !self.ready {
            return WorkReply::no_work();
        }
        match self.assign_segment().await {
            Some(segment) => {
                info!(peer = %peer.short(), %segment, "segment assigned");
                let _ = self.events.send(PoolEvent::SegmentAssigned {
                    peer,
                    segment: segment.clone(),
                });
                WorkReply::assignment(segment, self.encode_opts.clone())
            }
            None => WorkReply::no_work(),
        }
    }

    /// Handle `send-results`: pull each listed output from the worker's
    /// drive into the canonical drive, then run the completion check. The
    /// first failed pull aborts the rest of the list; outputs already stored
    /// stay stored, and the worker is told the batch failed.
    pub async fn handle_send_results<R, F>(
        &self,
        peer: PeerId,
        req: ResultsRequest,
        worker_drive: &R,
        finalizer: &F,
    ) -> ResultsReply
    where
        R: Replicator,
        F: Finalizer,
    {
        self.note_worker(peer, &req.drive_key).await;
        let drive = match self.drive() {
            Ok(d) => d,
            Err(e) => return self.delivery_failed(peer, e.to_string()),
        };

        if let Err(e) = worker_drive.sync().await {
            return self.delivery_failed(peer, format!("sync failed: {e}"));
        }
        for segment in &req.segments {
            let bytes = match worker_drive.fetch(segment).await {
                Ok(b) => b,
                Err(e) => return self.delivery_failed(peer, format!("pull {segment}: {e}")),
            };
            let out = paths::output_path(segment);
            if let Err(e) = drive.put(&out, &bytes).await {
                return self.delivery_failed(peer, format!("store {out}: {e}"));
            }
            self.registry
                .lock()
                .await
                .record_complete(paths::basename(segment));
            let _ = self.events.send(PoolEvent::ResultStored { peer, path: out });
        }

        match self.check_completion(finalizer).await {
            Ok(_) => ResultsReply::ok(),
            Err(e) => ResultsReply::failed(e.to_string()),
        }
    }

    fn delivery_failed(&self, peer: PeerId, error: String) -> ResultsReply {
        warn!(peer = %peer.short(), %error, "result delivery failed");
        let _ = self.events.send(PoolEvent::DeliveryFailed {
            peer,
            error: error.clone(),
        });
        ResultsReply::failed(error)
    }

    async fn note_worker(&self, peer: PeerId, drive_key: &str) {
        let mut workers = self.workers.lock().await;
        if workers.insert(peer, drive_key.to_string()).is_none() {
            let _ = self.events.send(PoolEvent::WorkerSeen {
                peer,
                drive_key: drive_key.to_string(),
            });
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Finalize if every expected segment is present. The swap latch admits
    /// one attempt at a time and stays set only after a success; a failed
    /// attempt releases it so the next qualifying delivery retries.
    pub async fn check_completion<F: Finalizer>(
        &self,
        finalizer: &F,
    ) -> Result<Option<String>, PoolError> {
        if !self.registry.lock().await.is_complete() {
            return Ok(None);
        }
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        info!(pool = %self.id, "all segments complete");
        let _ = self.events.send(PoolEvent::AllComplete);
        let result = match self.drive() {
            Ok(drive) => finalizer.finalize(drive, &self.tracks).await.map_err(Into::into),
            Err(e) => Err(e),
        };
        match result {
            Ok(output) => {
                let _ = self.events.send(PoolEvent::Finalized {
                    output: output.clone(),
                });
                Ok(Some(output))
            }
            Err(e) => {
                self.finalized.store(false, Ordering::SeqCst);
                let _ = self.events.send(PoolEvent::FinalizeFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Announce the drive topic and serve workers until `destroy`.
    pub async fn launch<F: Finalizer + Send + Sync + 'static>(
        self: &Arc<Self>,
        swarm: &Swarm,
        finalizer: Arc<F>,
    ) -> Result<(), PoolError> {
        let key = self.key()?.clone();
        let topic = Topic::for_drive(&key);
        let mut listener = swarm.listen(topic).await?;
        let _ = self.events.send(PoolEvent::Announced { key: key.to_hex() });

        // The task owns the listener; aborting it drops the listener, which
        // stops the beacon and accept loops.
        let pool = self.clone();
        let accept = tokio::spawn(async move {
            while let Some(conn) = listener.accept().await {
                let _client = pool.attach(conn, finalizer.clone());
            }
        });
        *self.accept_task.lock().await = Some(accept);
        Ok(())
    }

    /// Serve one connection. Split from `launch` so a connection made
    /// without discovery (tests, single-process setups) can be served too.
    pub fn attach<F: Finalizer + Send + Sync + 'static>(
        self: &Arc<Self>,
        conn: crate::swarm::Connection,
        finalizer: Arc<F>,
    ) -> RpcClient {
        let responder = Arc::new(PoolResponder {
            pool: self.clone(),
            finalizer,
        });
        rpc::spawn_channel(conn, responder)
    }

    /// Leave the topic and stop accepting. The drive stays open; outputs
    /// already stored remain on disk.
    pub async fn destroy(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        info!(pool = %self.id, "pool destroyed");
    }
}

async fn read_json_list(drive: &Store, path: &str) -> Result<Option<Vec<String>>, PoolError> {
    match drive.get(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
            PoolError::BadConfig(path.to_string(), e.to_string())
        })?)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Per-connection verb dispatcher on the pool side. Also serves the `store-*`
/// verbs against the canonical drive so workers can pull inputs.
struct PoolResponder<F> {
    pool: Arc<Pool>,
    finalizer: Arc<F>,
}

impl<F: Finalizer + Send + Sync + 'static> RpcHandler for PoolResponder<F> {
    async fn handle(
        &self,
        peer: PeerId,
        verb: String,
        body: Vec<u8>,
        client: RpcClient,
    ) -> Result<Vec<u8>, String> {
        match verb.as_str() {
            verbs::REQUEST_WORK => {
                let req: WorkRequest =
                    serde_json::from_slice(&body).map_err(|e| e.to_string())?;
                let reply = self.pool.handle_request_work(peer, req).await;
                serde_json::to_vec(&reply).map_err(|e| e.to_string())
            }
            verbs::SEND_RESULTS => {
                let req: ResultsRequest =
                    serde_json::from_slice(&body).map_err(|e| e.to_string())?;
                let worker_key =
                    PublicKey::from_hex(&req.drive_key).map_err(|e| e.to_string())?;
                let worker_drive = RemoteStore::new(worker_key, client);
                let reply = self
                    .pool
                    .handle_send_results(peer, req, &worker_drive, &*self.finalizer)
                    .await;
                serde_json::to_vec(&reply).map_err(|e| e.to_string())
            }
            other => {
                let drive = self.pool.drive().map_err(|e| e.to_string())?;
                match store::serve_store_verb(drive, other, &body).await {
                    Some(result) => result,
                    None => Err(format!("unknown verb: {other}")),
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Swarm(#[from] SwarmError),
    #[error(transparent)]
    Finalize(#[from] crate::finalize::FinalizeError),
    #[error("bad config document {0}: {1}")]
    BadConfig(String, String),
    #[error("pool has no drive yet")]
    NoDrive,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalize::FinalizeError;
    use crate::rpc::RpcError;
    use segpool_core::identity::Keypair;
    use std::sync::atomic::AtomicUsize;

    /// Worker drive fake backed by a path map.
    struct FakeWorkerDrive {
        files: HashMap<String, Vec<u8>>,
        fail_on: Option<String>,
    }

    impl FakeWorkerDrive {
        fn with(files: &[(&str, &[u8])]) -> Self {
            FakeWorkerDrive {
                files: files
                    .iter()
                    .map(|(p, b)| (p.to_string(), b.to_vec()))
                    .collect(),
                fail_on: None,
            }
        }
    }

    impl Replicator for FakeWorkerDrive {
        async fn sync(&self) -> Result<(), RpcError> {
            Ok(())
        }

        async fn fetch(&self, path: &str) -> Result<Vec<u8>, RpcError> {
            if self.fail_on.as_deref() == Some(path) {
                return Err(RpcError::Remote("injected pull failure".into()));
            }
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| RpcError::Remote(format!("not found: {path}")))
        }

        async fn list(&self, _dir: &str) -> Result<Vec<String>, RpcError> {
            Ok(Vec::new())
        }
    }

    /// Counts invocations so the one-shot latch is observable.
    struct CountingFinalizer {
        calls: AtomicUsize,
    }

    impl CountingFinalizer {
        fn new() -> Self {
            CountingFinalizer {
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Finalizer for CountingFinalizer {
        async fn finalize(&self, _: &Store, _: &[String]) -> Result<String, FinalizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("/outputs/muxes/final.mp4".to_string())
        }
    }

    async fn ready_pool(
        dir: &tempfile::TempDir,
        segments: &[&str],
    ) -> (Arc<Pool>, mpsc::UnboundedReceiver<PoolEvent>) {
        let (mut pool, events) = Pool::new("test/pool", dir.path().to_path_buf());
        pool.create_drive().await.unwrap();
        let drive = pool.drive().unwrap();
        drive
            .put(
                paths::SEGMENTS_CONFIG,
                &serde_json::to_vec(&segments).unwrap(),
            )
            .await
            .unwrap();
        drive
            .put(paths::TRACKS_CONFIG, b"[]")
            .await
            .unwrap();
        pool.load_config().await.unwrap();
        (Arc::new(pool), events)
    }

    fn peer() -> PeerId {
        Keypair::generate().peer_id()
    }

    #[tokio::test]
    async fn load_config_tolerates_missing_documents() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pool, _events) = Pool::new("bare", dir.path().to_path_buf());
        pool.load_config().await.unwrap();
        assert!(!pool.is_ready());
        assert!(pool
            .handle_request_work(
                peer(),
                WorkRequest {
                    drive_key: "00".repeat(32)
                }
            )
            .await
            .is_no_work());
    }

    #[tokio::test]
    async fn each_segment_assigned_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _events) =
            ready_pool(&dir, &["/segments/inputs/a.264", "/segments/inputs/b.264"]).await;

        let p1 = pool.clone();
        let p2 = pool.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { p1.assign_segment().await }),
            tokio::spawn(async move { p2.assign_segment().await })
        );
        let mut got = vec![r1.unwrap().unwrap(), r2.unwrap().unwrap()];
        got.sort();
        assert_eq!(
            got,
            vec![
                "/segments/inputs/a.264".to_string(),
                "/segments/inputs/b.264".to_string()
            ]
        );
        assert!(pool.assign_segment().await.is_none());
    }

    #[tokio::test]
    async fn exhausted_pool_replies_no_work() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _events) = ready_pool(&dir, &["/segments/inputs/a.264"]).await;
        let req = WorkRequest {
            drive_key: "11".repeat(32),
        };
        let first = pool.handle_request_work(peer(), req.clone()).await;
        assert_eq!(first.segment.as_deref(), Some("/segments/inputs/a.264"));
        let second = pool.handle_request_work(peer(), req).await;
        assert!(second.is_no_work());
    }

    #[tokio::test]
    async fn send_results_stores_outputs_and_finalizes_once() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _events) =
            ready_pool(&dir, &["/segments/inputs/a.264", "/segments/inputs/b.264"]).await;
        let worker = FakeWorkerDrive::with(&[
            ("/segments/outputs/a.264", b"AA"),
            ("/segments/outputs/b.264", b"BB"),
        ]);
        let finalizer = CountingFinalizer::new();

        let reply = pool
            .handle_send_results(
                peer(),
                ResultsRequest {
                    drive_key: "22".repeat(32),
                    segments: vec![
                        "/segments/outputs/a.264".into(),
                        "/segments/outputs/b.264".into(),
                    ],
                },
                &worker,
                &finalizer,
            )
            .await;
        assert!(reply.success);
        assert_eq!(finalizer.calls(), 1);
        assert!(pool.is_finalized());
        let drive = pool.drive().unwrap();
        assert_eq!(drive.get("/segments/outputs/a.264").await.unwrap(), b"AA");
        assert_eq!(drive.get("/segments/outputs/b.264").await.unwrap(), b"BB");

        // A duplicate delivery stores again but never re-finalizes.
        let again = pool
            .handle_send_results(
                peer(),
                ResultsRequest {
                    drive_key: "22".repeat(32),
                    segments: vec!["/segments/outputs/a.264".into()],
                },
                &worker,
                &finalizer,
            )
            .await;
        assert!(again.success);
        assert_eq!(finalizer.calls(), 1);
    }

    #[tokio::test]
    async fn failed_pull_keeps_earlier_outputs_and_fails_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _events) =
            ready_pool(&dir, &["/segments/inputs/a.264", "/segments/inputs/b.264"]).await;
        let mut worker = FakeWorkerDrive::with(&[
            ("/segments/outputs/a.264", b"AA"),
            ("/segments/outputs/b.264", b"BB"),
        ]);
        worker.fail_on = Some("/segments/outputs/b.264".to_string());
        let finalizer = CountingFinalizer::new();

        let reply = pool
            .handle_send_results(
                peer(),
                ResultsRequest {
                    drive_key: "33".repeat(32),
                    segments: vec![
                        "/segments/outputs/a.264".into(),
                        "/segments/outputs/b.264".into(),
                    ],
                },
                &worker,
                &finalizer,
            )
            .await;
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("b.264"));
        assert_eq!(finalizer.calls(), 0);
        // The first output survives the failed batch.
        let drive = pool.drive().unwrap();
        assert_eq!(drive.get("/segments/outputs/a.264").await.unwrap(), b"AA");
        assert!(matches!(
            drive.get("/segments/outputs/b.264").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn completion_requires_exact_basename_set() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _events) =
            ready_pool(&dir, &["/segments/inputs/a.264", "/segments/inputs/b.264"]).await;
        let worker = FakeWorkerDrive::with(&[("/segments/outputs/a.264", b"AA")]);
        let finalizer = CountingFinalizer::new();

        let reply = pool
            .handle_send_results(
                peer(),
                ResultsRequest {
                    drive_key: "44".repeat(32),
                    segments: vec!["/segments/outputs/a.264".into()],
                },
                &worker,
                &finalizer,
            )
            .await;
        assert!(reply.success);
        assert_eq!(finalizer.calls(), 0);
        assert!(!pool.is_finalized());
    }

    /// Fails its first invocation, succeeds afterwards.
    struct FlakyFinalizer {
        calls: AtomicUsize,
    }

    impl Finalizer for FlakyFinalizer {
        async fn finalize(&self, _: &Store, _: &[String]) -> Result<String, FinalizeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(FinalizeError::NoSegments("/segments/outputs".into()));
            }
            Ok("/outputs/muxes/final.mp4".to_string())
        }
    }

    #[tokio::test]
    async fn failed_finalize_retries_on_next_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _events) = ready_pool(&dir, &["/segments/inputs/a.264"]).await;
        let worker = FakeWorkerDrive::with(&[("/segments/outputs/a.264", b"AA")]);
        let finalizer = FlakyFinalizer {
            calls: AtomicUsize::new(0),
        };
        let req = ResultsRequest {
            drive_key: "77".repeat(32),
            segments: vec!["/segments/outputs/a.264".into()],
        };

        // First delivery completes the set but the finalize attempt fails:
        // the batch is reported failed and the latch is released.
        let first = pool
            .handle_send_results(peer(), req.clone(), &worker, &finalizer)
            .await;
        assert!(!first.success);
        assert_eq!(finalizer.calls.load(Ordering::SeqCst), 1);
        assert!(!pool.is_finalized());

        // The next qualifying delivery retries and succeeds.
        let second = pool
            .handle_send_results(peer(), req, &worker, &finalizer)
            .await;
        assert!(second.success);
        assert_eq!(finalizer.calls.load(Ordering::SeqCst), 2);
        assert!(pool.is_finalized());
    }

    #[tokio::test]
    async fn single_segment_concurrent_claim_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _events) = ready_pool(&dir, &["/segments/inputs/only.264"]).await;

        let p1 = pool.clone();
        let p2 = pool.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { p1.assign_segment().await }),
            tokio::spawn(async move { p2.assign_segment().await })
        );
        let outcomes = [r1.unwrap(), r2.unwrap()];
        let winners: Vec<_> = outcomes.iter().flatten().collect();
        assert_eq!(winners, vec!["/segments/inputs/only.264"]);
        assert!(outcomes.iter().any(Option::is_none));
    }

    #[tokio::test]
    async fn racing_deliveries_finalize_once() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _events) =
            ready_pool(&dir, &["/segments/inputs/a.264", "/segments/inputs/b.264"]).await;
        let finalizer = Arc::new(CountingFinalizer::new());

        let mut tasks = Vec::new();
        for name in ["a", "b"] {
            let pool = pool.clone();
            let finalizer = finalizer.clone();
            let path = format!("/segments/outputs/{name}.264");
            tasks.push(tokio::spawn(async move {
                let worker = FakeWorkerDrive::with(&[(path.as_str(), b"X")]);
                pool.handle_send_results(
                    peer(),
                    ResultsRequest {
                        drive_key: "55".repeat(32),
                        segments: vec![path.clone()],
                    },
                    &worker,
                    &*finalizer,
                )
                .await
            }));
        }
        for t in tasks {
            assert!(t.await.unwrap().success);
        }
        assert_eq!(finalizer.calls(), 1);
    }

    #[tokio::test]
    async fn worker_registry_tracks_first_contact() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, mut events) = ready_pool(&dir, &["/segments/inputs/a.264"]).await;
        let p = peer();
        let req = WorkRequest {
            drive_key: "66".repeat(32),
        };
        pool.handle_request_work(p, req.clone()).await;
        pool.handle_request_work(p, req).await;
        assert_eq!(pool.worker_count().await, 1);

        let mut seen = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PoolEvent::WorkerSeen { .. }) {
                seen += 1;
            }
        }
        assert_eq!(seen, 1);
    }
}
