mod block;
mod conn;
mod peer;
mod services;
mod stats;
mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use block::BlockDescriptor;
pub use conn::{Connection, TcpConnection};
pub use peer::{
    allowed_fast_set, Message, MessageCodec, OutboundQueue, Peer, PeerError, PeerSession,
    PeerState, PieceMessage,
};
pub use services::PeerServices;
pub use stats::{Counter, ThroughputStats};
pub use storage::{HashChain, PieceStore, PieceStyle, StorageDescriptor, TorrentInfo, ViewSignature};

use std::time::Duration;

// Canonical block request length.
pub const BLOCK_SIZE: u32 = 0x4000;

// Largest block a single request may ask for.
pub const MAX_BLOCK_LEN: u32 = 0x20000;

// Size of the Allowed Fast set we grant a peer, and the piece count at which
// a peer stops being considered piece-poor.
pub const ALLOWED_FAST_THRESHOLD: u32 = 10;

// Target number of outstanding block requests kept in flight per peer.
pub const REQUEST_PIPELINE_DEPTH: usize = 20;

// A peer that has sent nothing for this long is dropped on the next
// keepalive tick.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

// Extension identifiers understood by this crate.
pub const EXT_MERKLE: u8 = 1;
pub const EXT_ELASTIC: u8 = 2;

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;
