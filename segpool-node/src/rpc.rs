//! Request/response RPC over a swarm connection. Both ends can issue
//! requests on the same channel; responses correlate by frame id. Handlers
//! run as spawned tasks so a slow verb never blocks the reader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use segpool_core::identity::PeerId;
use segpool_core::wire::{decode_frame, encode_frame, FrameHeader, FrameKind};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::swarm::Connection;

type Pending = Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>, RpcError>>>>;

struct ClientInner {
    out: mpsc::UnboundedSender<Vec<u8>>,
    pending: Pending,
    next_id: AtomicU64,
}

/// Cheap-to-clone handle for issuing requests on a channel.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Issue one request and wait for its response body. A response frame
    /// with `error` set surfaces as `RpcError::Remote`.
    pub async fn request(&self, verb: &str, body: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode_frame(&FrameHeader::request(id, verb), &body)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().expect("pending lock");
            pending.insert(id, tx);
        }
        if self.inner.out.send(frame).is_err() {
            let mut pending = self.inner.pending.lock().expect("pending lock");
            pending.remove(&id);
            return Err(RpcError::ChannelClosed);
        }
        rx.await.map_err(|_| RpcError::ChannelClosed)?
    }
}

/// One end's verb dispatcher. The client handle is passed back in so a
/// handler can issue its own requests on the same channel, which is how the
/// pool pulls results from the worker that just called `send-results`.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(
        &self,
        peer: PeerId,
        verb: String,
        body: Vec<u8>,
        client: RpcClient,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, String>> + Send;
}

/// Run an RPC channel over a connection. Returns the local request handle;
/// inbound requests dispatch to `handler` until the connection closes.
pub fn spawn_channel<H: RpcHandler>(mut conn: Connection, handler: Arc<H>) -> RpcClient {
    let peer = conn.peer_id();
    let client = RpcClient {
        inner: Arc::new(ClientInner {
            out: conn.out.clone(),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }),
    };

    let reader_client = client.clone();
    tokio::spawn(async move {
        while let Some(message) = conn.recv().await {
            let (header, body, _) = match decode_frame(&message) {
                Ok(x) => x,
                Err(e) => {
                    warn!(peer = %peer.short(), error = %e, "bad frame, closing channel");
                    break;
                }
            };
            match header.kind {
                FrameKind::Request { verb } => {
                    let handler = handler.clone();
                    let client = reader_client.clone();
                    let out = conn.out.clone();
                    let id = header.id;
                    tokio::spawn(async move {
                        let result = handler.handle(peer, verb, body, client).await;
                        let frame = match result {
                            Ok(reply) => encode_frame(&FrameHeader::response(id), &reply),
                            Err(e) => encode_frame(&FrameHeader::error_response(id, e), &[]),
                        };
                        match frame {
                            Ok(f) => {
                                let _ = out.send(f);
                            }
                            Err(e) => warn!(error = %e, "response encode failed"),
                        }
                    });
                }
                FrameKind::Response { error } => {
                    let waiter = {
                        let mut pending =
                            reader_client.inner.pending.lock().expect("pending lock");
                        pending.remove(&header.id)
                    };
                    let Some(waiter) = waiter else {
                        debug!(id = header.id, "response with no waiter");
                        continue;
                    };
                    let result = match error {
                        Some(e) => Err(RpcError::Remote(e)),
                        None => Ok(body),
                    };
                    let _ = waiter.send(result);
                }
            }
        }
        // Connection gone: wake every in-flight request with a closed error.
        let waiters: Vec<_> = {
            let mut pending = reader_client.inner.pending.lock().expect("pending lock");
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in waiters {
            let _ = tx.send(Err(RpcError::ChannelClosed));
        }
    });

    client
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("remote error: {0}")]
    Remote(String),
    #[error("rpc channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Encode(#[from] segpool_core::wire::FrameEncodeError),
    #[error("bad payload: {0}")]
    Payload(#[from] serde_json::Error),
}
