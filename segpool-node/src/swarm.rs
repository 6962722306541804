//! Swarm transport: topic-keyed discovery over UDP multicast beacons, TCP
//! connections with an X25519 handshake, and ChaCha20-Poly1305 encrypted
//! message framing. A pool announces its canonical drive's topic; workers
//! derive the same topic from the pool key and dial whoever beacons it.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use segpool_core::identity::{
    decrypt_wire, derive_session_key, encrypt_wire, Keypair, PeerId, PublicKey, Topic,
};
use segpool_core::wire::MAX_FRAME_LEN;
use segpool_core::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 90, 90);
const BEACON_INTERVAL_SECS: u64 = 2;
const HANDSHAKE_LEN: usize = 1 + 16 + 32;
// Ciphertexts carry the AEAD tag on top of the frame bytes, so the transport
// cap needs headroom over the frame cap or a maximum-size frame is dropped.
const MAX_MESSAGE_LEN: u32 = MAX_FRAME_LEN + 64;

/// Discovery beacon announcing a topic listener. Sent as JSON to the
/// multicast group on the configured discovery port.
#[derive(Debug, Serialize, Deserialize)]
struct Beacon {
    version: u8,
    topic: Topic,
    port: u16,
}

/// An authenticated, encrypted peer connection. Messages are whole plaintext
/// buffers; the transport length-frames and encrypts each one with its own
/// nonce counter per direction.
pub struct Connection {
    peer_id: PeerId,
    peer_key: PublicKey,
    pub(crate) out: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) inbound: mpsc::Receiver<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn peer_key(&self) -> &PublicKey {
        &self.peer_key
    }

    pub fn send(&self, message: Vec<u8>) -> bool {
        self.out.send(message).is_ok()
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// In-process pair wired back to back, no sockets. Each end sees the
    /// other's identity. Used by tests and single-process setups.
    pub fn pair(a: &Keypair, b: &Keypair) -> (Connection, Connection) {
        let (a_tx, b_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (b_tx, a_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (a_in_tx, a_in) = mpsc::channel(64);
        let (b_in_tx, b_in) = mpsc::channel(64);
        let pump_a = tokio::spawn(pump(b_rx, b_in_tx));
        let pump_b = tokio::spawn(pump(a_rx, a_in_tx));
        let conn_a = Connection {
            peer_id: b.peer_id(),
            peer_key: b.public_key().clone(),
            out: a_tx,
            inbound: a_in,
            tasks: vec![pump_a],
        };
        let conn_b = Connection {
            peer_id: a.peer_id(),
            peer_key: a.public_key().clone(),
            out: b_tx,
            inbound: b_in,
            tasks: vec![pump_b],
        };
        (conn_a, conn_b)
    }
}

async fn pump(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, tx: mpsc::Sender<Vec<u8>>) {
    while let Some(msg) = rx.recv().await {
        if tx.send(msg).await.is_err() {
            break;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

/// Swarm handle: one per process, carries the transport identity and the
/// discovery/listen ports.
pub struct Swarm {
    keypair: Arc<Keypair>,
    discovery_port: u16,
    transport_port: u16,
}

impl Swarm {
    pub fn new(keypair: Arc<Keypair>, discovery_port: u16, transport_port: u16) -> Self {
        Swarm {
            keypair,
            discovery_port,
            transport_port,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    /// Announce a topic and accept inbound connections on it. The returned
    /// listener keeps beaconing until `leave` or drop.
    pub async fn listen(&self, topic: Topic) -> Result<SwarmListener, SwarmError> {
        let listener = TcpListener::bind(("0.0.0.0", self.transport_port)).await?;
        let port = listener.local_addr()?.port();

        let beacon = serde_json::to_vec(&Beacon {
            version: PROTOCOL_VERSION,
            topic,
            port,
        })
        .map_err(|e| SwarmError::Beacon(e.to_string()))?;
        let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let group: SocketAddr = (MULTICAST_GROUP, self.discovery_port).into();
        let announce = tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(BEACON_INTERVAL_SECS));
            loop {
                tick.tick().await;
                if let Err(e) = udp.send_to(&beacon, group).await {
                    debug!(error = %e, "beacon send failed");
                }
            }
        });

        let (conns_tx, conns) = mpsc::channel(16);
        let keypair = self.keypair.clone();
        let accept = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(x) => x,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let keypair = keypair.clone();
                let conns_tx = conns_tx.clone();
                tokio::spawn(async move {
                    match handshake(stream, &keypair).await {
                        Ok(conn) => {
                            debug!(peer = %conn.peer_id().short(), %addr, "peer connected");
                            let _ = conns_tx.send(conn).await;
                        }
                        Err(e) => warn!(%addr, error = %e, "handshake failed"),
                    }
                });
            }
        });

        Ok(SwarmListener {
            conns,
            tasks: vec![announce, accept],
        })
    }

    /// Dial the first peer seen beaconing `topic`. Waits indefinitely; the
    /// caller decides how long to keep looking.
    pub async fn connect(&self, topic: Topic) -> Result<Connection, SwarmError> {
        let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.discovery_port)).await?;
        udp.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, from) = udp.recv_from(&mut buf).await?;
            let beacon: Beacon = match serde_json::from_slice(&buf[..n]) {
                Ok(b) => b,
                Err(_) => continue,
            };
            if beacon.version != PROTOCOL_VERSION || beacon.topic != topic {
                continue;
            }
            let addr = SocketAddr::new(from.ip(), beacon.port);
            debug!(%addr, "dialing pool");
            let stream = TcpStream::connect(addr).await?;
            return handshake(stream, &self.keypair).await;
        }
    }
}

/// A joined topic: accepted connections arrive here until `leave`.
pub struct SwarmListener {
    conns: mpsc::Receiver<Connection>,
    tasks: Vec<JoinHandle<()>>,
}

impl SwarmListener {
    pub async fn accept(&mut self) -> Option<Connection> {
        self.conns.recv().await
    }

    /// Stop beaconing and accepting. Existing connections stay up.
    pub fn leave(&mut self) {
        for t in self.tasks.drain(..) {
            t.abort();
        }
    }
}

impl Drop for SwarmListener {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Symmetric handshake: both sides write version, peer id and public key,
/// then derive the pairwise session key. Messages after the handshake are
/// encrypted with per-direction nonce counters starting at zero.
async fn handshake(mut stream: TcpStream, keypair: &Keypair) -> Result<Connection, SwarmError> {
    let mut hello = [0u8; HANDSHAKE_LEN];
    hello[0] = PROTOCOL_VERSION;
    hello[1..17].copy_from_slice(keypair.peer_id().as_bytes());
    hello[17..49].copy_from_slice(keypair.public_key().as_bytes());
    stream.write_all(&hello).await?;
    stream.flush().await?;

    let mut theirs = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut theirs).await?;
    if theirs[0] != PROTOCOL_VERSION {
        return Err(SwarmError::Version(theirs[0]));
    }
    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&theirs[17..49]);
    let peer_key = PublicKey::from_bytes(key_bytes);
    let peer_id = PeerId::from_public_key(peer_key.as_bytes());
    let mut claimed = [0u8; 16];
    claimed.copy_from_slice(&theirs[1..17]);
    if claimed != *peer_id.as_bytes() {
        return Err(SwarmError::IdentityMismatch);
    }

    let session_key = derive_session_key(&keypair.shared_secret(&peer_key));
    let (read_half, write_half) = stream.into_split();

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (in_tx, inbound) = mpsc::channel::<Vec<u8>>(64);
    let writer = tokio::spawn(write_loop(write_half, out_rx, session_key));
    let reader = tokio::spawn(read_loop(read_half, in_tx, session_key));

    Ok(Connection {
        peer_id,
        peer_key,
        out: out_tx,
        inbound,
        tasks: vec![writer, reader],
    })
}

async fn write_loop(
    mut half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    key: [u8; 32],
) {
    let mut nonce = 0u64;
    while let Some(plain) = rx.recv().await {
        let cipher = match encrypt_wire(&key, nonce, &plain) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "encrypt failed, closing connection");
                break;
            }
        };
        nonce += 1;
        let len = (cipher.len() as u32).to_le_bytes();
        if half.write_all(&len).await.is_err() || half.write_all(&cipher).await.is_err() {
            break;
        }
        if half.flush().await.is_err() {
            break;
        }
    }
}

async fn read_loop(
    mut half: tokio::net::tcp::OwnedReadHalf,
    tx: mpsc::Sender<Vec<u8>>,
    key: [u8; 32],
) {
    let mut nonce = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        if half.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_MESSAGE_LEN {
            warn!(len, "oversized message, closing connection");
            break;
        }
        let mut cipher = vec![0u8; len as usize];
        if half.read_exact(&mut cipher).await.is_err() {
            break;
        }
        let plain = match decrypt_wire(&key, nonce, &cipher) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "decrypt failed, closing connection");
                break;
            }
        };
        nonce += 1;
        if tx.send(plain).await.is_err() {
            break;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol version mismatch: peer sent {0}")]
    Version(u8),
    #[error("peer id does not match public key")]
    IdentityMismatch,
    #[error("beacon encode failed: {0}")]
    Beacon(String),
}
