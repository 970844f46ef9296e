use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};
use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use crate::{
    block::BlockDescriptor,
    conn::Connection,
    storage::{PieceStore, PieceStyle},
    REQUEST_PIPELINE_DEPTH,
};
use super::{
    message::{Message, MessageCodec, PieceMessage},
    Result,
};

// Pending outbound entries. Control messages are stored fully formed;
// requests and piece blocks keep only their descriptor so they can be
// cancelled, requeued or purged before anything reaches the wire. Block data
// is read from the piece store at serialisation time, which keeps queued
// responses in step with the store.
enum Pending {
    Control(Message),
    Request(BlockDescriptor),
    Block(BlockDescriptor),
}

// Ordered buffer of outbound messages for one peer. Messages leave in
// enqueue order except where the protocol wants pairs to cancel out
// (interested against not-interested, a cancel against its unsent request)
// and where requests are held back while plugged.
pub struct OutboundQueue {

    store: Arc<dyn PieceStore>,

    codec: MessageCodec,

    fast_enabled: bool,

    pending: VecDeque<Pending>,

    // Serialised bytes of the head message not yet accepted by the
    // connection; the partial-write cursor.
    head: BytesMut,

    // Requests already on the wire, awaiting a piece or a reject.
    sent_requests: Vec<BlockDescriptor>,

    // Pieces the remote allows us to request while it chokes us.
    remote_allowed_fast: HashSet<u32>,

    // Pieces we allow the remote to request while we choke it.
    local_allowed_fast: HashSet<u32>,

    // While set, request messages stay buffered instead of being serialised.
    // Requests for pieces in the remote's Allowed Fast set are exempt when
    // the fast extension is on.
    requests_plugged: bool,

}

impl OutboundQueue {

    pub fn new(store: Arc<dyn PieceStore>, fast_enabled: bool) -> Self {
        Self {
            store,
            codec: MessageCodec::new(fast_enabled),
            fast_enabled,
            pending: VecDeque::new(),
            head: BytesMut::new(),
            sent_requests: Vec::new(),
            remote_allowed_fast: HashSet::new(),
            local_allowed_fast: HashSet::new(),
            requests_plugged: false,
        }
    }

    // Emit choke or unchoke. Choking discards every unsent piece block that
    // is not covered by our Allowed Fast grant; the discarded descriptors are
    // returned so the session can follow up with rejects.
    pub fn send_choke_message(&mut self, choking: bool) -> Vec<BlockDescriptor> {
        let mut discarded = Vec::new();
        if choking {
            let allowed = &self.local_allowed_fast;
            self.pending.retain(|entry| match entry {
                Pending::Block(desc) if !allowed.contains(&desc.piece) => {
                    discarded.push(*desc);
                    false
                }
                _ => true,
            });
        }
        let msg = if choking { Message::Choke } else { Message::Unchoke };
        self.pending.push_back(Pending::Control(msg));
        discarded
    }

    // An interest flip that lands before the older message got out cancels
    // in place: the queued message is necessarily the opposite of the new
    // one, so both disappear and nothing is transmitted.
    pub fn send_interested_message(&mut self, interested: bool) {
        if let Some(at) = self.pending.iter().position(|entry| {
            matches!(entry, Pending::Control(Message::Interested | Message::NotInterested))
        }) {
            self.pending.remove(at);
            return;
        }
        let msg = if interested { Message::Interested } else { Message::NotInterested };
        self.pending.push_back(Pending::Control(msg));
    }

    pub fn send_request_message(&mut self, desc: BlockDescriptor) {
        self.pending.push_back(Pending::Request(desc));
    }

    pub fn send_block_message(&mut self, desc: BlockDescriptor) {
        self.pending.push_back(Pending::Block(desc));
    }

    pub fn send_have_message(&mut self, piece: u32) {
        self.pending.push_back(Pending::Control(Message::Have { piece }));
    }

    pub fn send_reject_message(&mut self, desc: BlockDescriptor) {
        self.pending.push_back(Pending::Control(Message::Reject(desc)));
    }

    // Redundant keepalives coalesce while one is still queued.
    pub fn send_keepalive_message(&mut self) {
        let queued = self
            .pending
            .iter()
            .any(|entry| matches!(entry, Pending::Control(Message::KeepAlive)));
        if !queued {
            self.pending.push_back(Pending::Control(Message::KeepAlive));
        }
    }

    pub fn send_message(&mut self, msg: Message) {
        self.pending.push_back(Pending::Control(msg));
    }

    // Grant the remote these pieces for choked requesting and tell it so.
    pub fn send_allowed_fast_messages(&mut self, pieces: &[u32]) {
        for &piece in pieces {
            if self.local_allowed_fast.insert(piece) {
                self.pending.push_back(Pending::Control(Message::AllowedFast { piece }));
            }
        }
    }

    pub fn clear_allowed_fast_pieces(&mut self) {
        self.local_allowed_fast.clear();
    }

    pub fn is_piece_allowed_fast(&self, piece: u32) -> bool {
        self.local_allowed_fast.contains(&piece)
    }

    pub fn set_request_allowed_fast(&mut self, piece: u32) {
        self.remote_allowed_fast.insert(piece);
    }

    pub fn set_requests_plugged(&mut self, plugged: bool) {
        self.requests_plugged = plugged;
    }

    // A piece message arrived; true iff it matched a tracked request, which
    // is cleared.
    pub fn request_received(&mut self, desc: &BlockDescriptor) -> bool {
        self.clear_tracked(desc)
    }

    // A reject arrived; same contract as `request_received`.
    pub fn reject_received(&mut self, desc: &BlockDescriptor) -> bool {
        self.clear_tracked(desc)
    }

    fn clear_tracked(&mut self, desc: &BlockDescriptor) -> bool {
        if let Some(at) = self.sent_requests.iter().position(|sent| sent == desc) {
            self.sent_requests.remove(at);
            true
        } else {
            false
        }
    }

    // Cancel a request of ours. Still unsent: it is removed outright and no
    // cancel is transmitted. Already on the wire: a cancel goes out, and
    // under `retain_tracking` the tracking entry survives so the late piece
    // or reject still matches.
    pub fn cancel_message(&mut self, desc: &BlockDescriptor, retain_tracking: bool) {
        if let Some(at) = self
            .pending
            .iter()
            .position(|entry| matches!(entry, Pending::Request(queued) if queued == desc))
        {
            self.pending.remove(at);
            return;
        }
        if let Some(at) = self.sent_requests.iter().position(|sent| sent == desc) {
            if !retain_tracking {
                self.sent_requests.remove(at);
            }
            self.pending.push_back(Pending::Control(Message::Cancel(*desc)));
        }
    }

    // The remote cancelled a request of its own; true iff a matching block
    // response was still unsent and has been dropped.
    pub fn cancel_block_message(&mut self, desc: &BlockDescriptor) -> bool {
        if let Some(at) = self
            .pending
            .iter()
            .position(|entry| matches!(entry, Pending::Block(queued) if queued == desc))
        {
            self.pending.remove(at);
            true
        } else {
            false
        }
    }

    // Drop every unsent block response for this piece.
    pub fn reject_piece(&mut self, piece: u32) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|entry| !matches!(entry, Pending::Block(desc) if desc.piece == piece));
        before - self.pending.len()
    }

    // Move every in-flight request back to the unsent queue, in order. The
    // base protocol drops outstanding requests when choked; they will be
    // retransmitted after the next unchoke.
    pub fn requeue_sent_requests(&mut self) {
        for desc in std::mem::take(&mut self.sent_requests) {
            self.pending.push_back(Pending::Request(desc));
        }
    }

    pub fn requests_needed(&self) -> usize {
        REQUEST_PIPELINE_DEPTH.saturating_sub(self.tracked_requests())
    }

    pub fn has_outstanding_requests(&self) -> bool {
        self.tracked_requests() > 0
    }

    fn tracked_requests(&self) -> usize {
        self.sent_requests.len()
            + self
                .pending
                .iter()
                .filter(|entry| matches!(entry, Pending::Request(_)))
                .count()
    }

    pub fn unsent_block_count(&self) -> usize {
        self.pending
            .iter()
            .filter(|entry| matches!(entry, Pending::Block(_)))
            .count()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.head.is_empty() || self.pending.iter().any(|entry| self.is_sendable(entry))
    }

    // Push queued bytes into the connection until it stops accepting them.
    // Returns the number of bytes written.
    pub fn send_data(&mut self, conn: &mut dyn Connection) -> Result<u64> {
        let mut sent = 0;
        loop {
            if self.head.is_empty() && !self.serialise_next()? {
                break;
            }
            let n = conn.fill(&self.head)?;
            if n == 0 {
                break;
            }
            self.head.advance(n);
            sent += n as u64;
        }
        Ok(sent)
    }

    fn is_sendable(&self, entry: &Pending) -> bool {
        match entry {
            Pending::Request(desc) => {
                !self.requests_plugged
                    || (self.fast_enabled && self.remote_allowed_fast.contains(&desc.piece))
            }
            _ => true,
        }
    }

    // Serialise the first sendable entry into the head buffer. Requests move
    // to the tracking list at this point; block data is read from the store.
    fn serialise_next(&mut self) -> Result<bool> {
        let Some(at) = self.pending.iter().position(|entry| self.is_sendable(entry)) else {
            return Ok(false);
        };
        let Some(entry) = self.pending.remove(at) else {
            return Ok(false);
        };
        let msg = match entry {
            Pending::Control(msg) => msg,
            Pending::Request(desc) => {
                self.sent_requests.push(desc);
                Message::Request(desc)
            }
            Pending::Block(desc) => {
                let data = self.store.read_block(&desc)?;
                Message::Piece(self.block_message(desc, data))
            }
        };
        tracing::trace!("send: {}", msg);
        self.codec.encode(msg, &mut self.head)?;
        Ok(true)
    }

    fn block_message(&self, desc: BlockDescriptor, data: bytes::Bytes) -> PieceMessage {
        let style = self.store.info().piece_style;
        let (view_length, hash_chain) = match style {
            PieceStyle::Base => (None, None),
            PieceStyle::Merkle => (None, self.store.hash_chain(desc.piece)),
            PieceStyle::Elastic => (
                Some(self.store.storage_descriptor().total_len),
                self.store.hash_chain(desc.piece),
            ),
        };
        PieceMessage {
            style,
            piece: desc.piece,
            offset: desc.offset,
            view_length,
            hash_chain,
            data,
        }
    }
}
