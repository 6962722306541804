//! Segpool node: tokio daemon pieces behind the `segpool` CLI. The pool and
//! peer coordination logic lives here; the pure protocol and state machine
//! live in `segpool-core`.

pub mod config;
pub mod encode;
pub mod finalize;
pub mod peer;
pub mod pool;
pub mod rpc;
pub mod store;
pub mod swarm;
pub mod util;
