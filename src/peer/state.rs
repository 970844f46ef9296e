use std::{
    collections::{BTreeMap, HashSet},
    time::Instant,
};
use crate::{
    storage::{StorageDescriptor, ViewSignature},
    Bitfield,
};

// Pairwise protocol state for one remote peer. Pure data; every policy
// decision lives in the session.
#[derive(Debug)]
pub struct PeerState {

    pub remote_id: [u8; 20],

    // Whether we are serving the peer's requests.
    pub we_are_choking: bool,

    // Whether we want pieces the peer has.
    pub we_are_interested: bool,

    // Whether the peer is serving our requests.
    pub they_are_choking: bool,

    // Whether the peer wants pieces we have.
    pub they_are_interested: bool,

    pub fast_enabled: bool,

    pub extension_protocol_enabled: bool,

    // Pieces the peer claims to have, sized to its declared view.
    pub remote_bitfield: Bitfield,

    // The extent of the torrent as the peer declared it; only ever grows.
    pub remote_view: StorageDescriptor,

    // Accepted view signatures keyed by view length; the current and the
    // previously accepted one.
    pub remote_view_signatures: BTreeMap<u64, ViewSignature>,

    // Extensions the peer enabled on this connection.
    pub remote_extensions: HashSet<u8>,

    pub last_data_received: Instant,

}

impl PeerState {

    pub fn new(
        remote_id: [u8; 20],
        remote_view: StorageDescriptor,
        fast_enabled: bool,
        extension_protocol_enabled: bool,
    ) -> Self {
        Self {
            remote_id,
            we_are_choking: true,
            we_are_interested: false,
            they_are_choking: true,
            they_are_interested: false,
            fast_enabled,
            extension_protocol_enabled,
            remote_bitfield: Bitfield::repeat(false, remote_view.num_pieces() as usize),
            remote_view,
            remote_view_signatures: BTreeMap::new(),
            remote_extensions: HashSet::new(),
            last_data_received: Instant::now(),
        }
    }

    // Widen the declared view to `total_len` at unchanged piece size and
    // stretch the bitfield over the new piece count.
    pub fn grow_view(&mut self, total_len: u64) {
        debug_assert!(total_len >= self.remote_view.total_len);
        self.remote_view.total_len = total_len;
        let num_pieces = self.remote_view.num_pieces() as usize;
        if self.remote_bitfield.len() < num_pieces {
            self.remote_bitfield.resize(num_pieces, false);
        }
    }

    // Keep at most the two most recent view signatures.
    pub fn record_view_signature(&mut self, sig: ViewSignature) {
        while self.remote_view_signatures.len() >= 2 {
            self.remote_view_signatures.pop_first();
        }
        self.remote_view_signatures.insert(sig.view_length, sig);
    }
}
