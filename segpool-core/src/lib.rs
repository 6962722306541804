//! Segpool coordination protocol.
//! No I/O here: identity and session crypto, wire framing, RPC payloads,
//! the pool-side segment registry and the peer-side work log.

pub mod identity;
pub mod job;
pub mod paths;
pub mod protocol;
pub mod registry;
pub mod wire;
pub mod worklog;

pub use identity::{Keypair, PeerId, PublicKey, Topic};
pub use job::{resolve_encode_opts, EncodeOpts, SourceMeta, DEFAULT_BITRATE_KBPS};
pub use protocol::{ResultsReply, ResultsRequest, WorkReply, WorkRequest, PROTOCOL_VERSION};
pub use registry::SegmentRegistry;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, FrameHeader};
pub use worklog::WorkLog;
