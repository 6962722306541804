//! End-to-end coordination over in-process connections: a pool with three
//! segments, two workers encoding concurrently, delivery, completion and
//! one-shot finalization, all through the real RPC channel and drive stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use segpool_core::identity::Keypair;
use segpool_core::{paths, EncodeOpts, DEFAULT_BITRATE_KBPS};
use segpool_node::encode::{EncodeError, Encoder};
use segpool_node::finalize::{self, FinalizeError, Finalizer};
use segpool_node::peer::{self, Peer};
use segpool_node::pool::Pool;
use segpool_node::store::{RemoteStore, Store};
use segpool_node::swarm::Connection;

const SEGMENTS: [&str; 3] = [
    "/segments/inputs/part_1.264",
    "/segments/inputs/part_2.264",
    "/segments/inputs/part_3.264",
];

/// Uppercases bytes and remembers the options it was handed.
struct ShoutEncoder {
    seen_opts: Mutex<Vec<EncodeOpts>>,
}

impl Encoder for ShoutEncoder {
    async fn encode(&self, input: &[u8], opts: &EncodeOpts) -> Result<Vec<u8>, EncodeError> {
        self.seen_opts.lock().unwrap().push(opts.clone());
        Ok(input.to_ascii_uppercase())
    }
}

/// Concat without the mux step, counting invocations.
struct ConcatFinalizer {
    calls: AtomicUsize,
}

impl Finalizer for ConcatFinalizer {
    async fn finalize(&self, store: &Store, _tracks: &[String]) -> Result<String, FinalizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        finalize::concat(store, paths::SEGMENTS_OUT).await
    }
}

async fn staged_pool(dir: &tempfile::TempDir) -> Arc<Pool> {
    let (mut pool, _events) = Pool::new("pool", dir.path().to_path_buf());
    pool.create_drive().await.unwrap();
    let drive = pool.drive().unwrap();
    drive
        .put(
            paths::SEGMENTS_CONFIG,
            &serde_json::to_vec(&SEGMENTS).unwrap(),
        )
        .await
        .unwrap();
    drive.put(paths::TRACKS_CONFIG, b"[]").await.unwrap();
    drive
        .put(
            paths::SOURCE_META,
            br#"{"video":[{"width":1280,"height":720,"r_frame_rate":"24/1"}],"tracks":[]}"#,
        )
        .await
        .unwrap();
    for (i, segment) in SEGMENTS.iter().enumerate() {
        drive
            .put(segment, format!("segment-{i}-bytes").as_bytes())
            .await
            .unwrap();
    }
    pool.load_config().await.unwrap();
    assert!(pool.is_ready());
    Arc::new(pool)
}

#[tokio::test]
async fn pool_and_workers_complete_a_job() {
    let pool_dir = tempfile::tempdir().unwrap();
    let pool = staged_pool(&pool_dir).await;
    let pool_key = pool.key().unwrap().clone();
    let finalizer = Arc::new(ConcatFinalizer {
        calls: AtomicUsize::new(0),
    });

    let mut workers = Vec::new();
    for name in ["worker-a", "worker-b"] {
        let worker_dir = tempfile::tempdir().unwrap();
        let drive = Store::open(worker_dir.path(), name).await.unwrap();
        let (worker, _events) = Peer::new(pool_key.clone(), drive);
        let worker = Arc::new(worker);

        let pool_kp = Keypair::generate();
        let worker_kp = Keypair::generate();
        // The pool's end sees the worker's transport identity.
        let (pool_conn, worker_conn) = Connection::pair(&pool_kp, &worker_kp);
        let _serving = pool.attach(pool_conn, finalizer.clone());
        let client = peer::attach(worker.clone(), worker_conn);

        let pool_key = pool_key.clone();
        workers.push(tokio::spawn(async move {
            let pool_drive = RemoteStore::new(pool_key, client.clone());
            let encoder = ShoutEncoder {
                seen_opts: Mutex::new(Vec::new()),
            };
            worker.work_loop(&client, &pool_drive, &encoder).await.unwrap();
            worker.send_loop(&client).await.unwrap();
            let encoded = worker.log_snapshot().await.done().len();
            let opts = encoder.seen_opts.into_inner().unwrap();
            let _ = worker_dir;
            (encoded, opts)
        }));
    }

    let mut total_encoded = 0;
    for handle in workers {
        let (encoded, opts) = handle.await.unwrap();
        total_encoded += encoded;
        // No pool-wide options staged, so workers fall back to the default
        // bitrate and the probed frame rate.
        for o in opts {
            assert_eq!(o.bitrate, DEFAULT_BITRATE_KBPS);
            assert_eq!(o.fps.as_deref(), Some("24/1"));
        }
    }
    assert_eq!(total_encoded, SEGMENTS.len());

    let drive = pool.drive().unwrap();
    for (i, segment) in SEGMENTS.iter().enumerate() {
        let out = paths::output_path(segment);
        let expected = format!("segment-{i}-bytes").to_ascii_uppercase();
        assert_eq!(drive.get(&out).await.unwrap(), expected.as_bytes());
    }

    assert!(pool.is_finalized());
    assert_eq!(finalizer.calls.load(Ordering::SeqCst), 1);
    let concats = drive.list(paths::OUTPUTS_CONCATS).await.unwrap();
    assert_eq!(concats.len(), 1);
    let joined = drive
        .get(&paths::join(paths::OUTPUTS_CONCATS, &concats[0]))
        .await
        .unwrap();
    // Name order, not delivery order.
    assert_eq!(
        joined,
        b"SEGMENT-0-BYTESSEGMENT-1-BYTESSEGMENT-2-BYTES"
    );
}

#[tokio::test]
async fn late_worker_sees_no_work_and_empty_send_is_noop() {
    let pool_dir = tempfile::tempdir().unwrap();
    let pool = staged_pool(&pool_dir).await;
    let pool_key = pool.key().unwrap().clone();
    let finalizer = Arc::new(ConcatFinalizer {
        calls: AtomicUsize::new(0),
    });

    // Drain the pool directly.
    while pool.assign_segment().await.is_some() {}

    let worker_dir = tempfile::tempdir().unwrap();
    let drive = Store::open(worker_dir.path(), "late").await.unwrap();
    let (worker, mut events) = Peer::new(pool_key.clone(), drive);
    let worker = Arc::new(worker);

    let (pool_conn, worker_conn) =
        Connection::pair(&Keypair::generate(), &Keypair::generate());
    let _serving = pool.attach(pool_conn, finalizer.clone());
    let client = peer::attach(worker.clone(), worker_conn);

    let pool_drive = RemoteStore::new(pool_key, client.clone());
    let encoder = ShoutEncoder {
        seen_opts: Mutex::new(Vec::new()),
    };
    // No work is a normal outcome, not an error.
    worker.work_loop(&client, &pool_drive, &encoder).await.unwrap();
    worker.send_loop(&client).await.unwrap();

    let mut saw_no_work = false;
    let mut saw_no_results = false;
    while let Ok(event) = events.try_recv() {
        match event {
            segpool_node::peer::PeerEvent::NoWork => saw_no_work = true,
            segpool_node::peer::PeerEvent::NoResults => saw_no_results = true,
            _ => {}
        }
    }
    assert!(saw_no_work);
    assert!(saw_no_results);
    assert!(!pool.is_finalized());
}
