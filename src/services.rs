use std::net::SocketAddr;
use bytes::Bytes;
use crate::{
    block::BlockDescriptor,
    storage::{HashChain, ViewSignature},
};

// The torrent-wide coordinator as seen from a single peer session: piece
// bookkeeping, request scheduling and choking policy live behind this trait.
//
// Sessions call these methods synchronously while holding their own peer
// lock. Implementations must be thread safe across sessions and must not
// call back into the session that is currently invoking them.
pub trait PeerServices: Send + Sync {

    // A single piece became available at the peer. Returns whether the peer
    // now has anything we want.
    fn piece_available(&self, peer: SocketAddr, piece: u32) -> bool;

    // The peer announced its full piece set. Returns whether the peer has
    // anything we want.
    fn pieces_available(&self, peer: SocketAddr) -> bool;

    // The peer allows us to request this piece while it is choking us.
    fn piece_allowed_fast(&self, peer: SocketAddr, piece: u32);

    // The peer suggests we download this piece from it.
    fn piece_suggested(&self, peer: SocketAddr, piece: u32);

    // Up to `count` new block requests for this peer. Under
    // `allowed_fast_only`, restricted to pieces the peer has allowed us to
    // request while choked.
    fn get_requests(
        &self,
        peer: SocketAddr,
        count: usize,
        allowed_fast_only: bool,
    ) -> Vec<BlockDescriptor>;

    // A block that matched one of our outstanding requests, together with
    // whatever authenticates its position: a sibling path under Merkle, a
    // signed view plus sibling path under Elastic.
    fn block_received(
        &self,
        peer: SocketAddr,
        desc: BlockDescriptor,
        view_signature: Option<ViewSignature>,
        hash_chain: Option<HashChain>,
        data: Bytes,
    );

    // Cryptographic check of a signed view root. A false return is fatal for
    // the peer that sent it.
    fn verify_view_signature(&self, sig: &ViewSignature) -> bool;

    // The peer's interest in us changed; re-evaluate unchoking.
    fn adjust_choking(&self, we_are_choking: bool);

    fn peer_extensions_changed(
        &self,
        peer: SocketAddr,
        added: &[u8],
        removed: &[u8],
        extra: &Bytes,
    );

    fn extension_message(&self, peer: SocketAddr, id: u8, data: Bytes);

    // Invited once at session start when the extension protocol was
    // negotiated.
    fn offer_extensions(&self, peer: SocketAddr);

    // Fired exactly once per session, however it ends.
    fn peer_disconnected(&self, peer: SocketAddr);
}
