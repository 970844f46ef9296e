use std::{io, net::SocketAddr, sync::Arc, time::Instant};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use crate::{
    block::BlockDescriptor,
    conn::Connection,
    services::PeerServices,
    stats::ThroughputStats,
    storage::{PieceStore, PieceStyle, ViewSignature},
    Bitfield, ALLOWED_FAST_THRESHOLD, EXT_ELASTIC, EXT_MERKLE, IDLE_TIMEOUT,
};
use super::{
    fast::allowed_fast_set,
    message::{Message, MessageCodec, PieceMessage},
    queue::OutboundQueue,
    state::PeerState,
    PeerError, Result,
};

const READ_CHUNK_LEN: usize = 16 * 1024;

// Protocol engine for one remote peer. Owns the connection, the tokeniser,
// the pairwise state and the outbound queue; talks upward to the coordinator
// through `PeerServices`. All methods run under the per-peer lock held by the
// `Peer` handle, so the struct itself is single threaded.
pub struct PeerSession {

    addr: SocketAddr,

    conn: Box<dyn Connection>,

    store: Arc<dyn PieceStore>,

    services: Arc<dyn PeerServices>,

    // Tokeniser for the inbound byte stream.
    parser: MessageCodec,

    read_buf: BytesMut,

    state: PeerState,

    queue: OutboundQueue,

    throughput: ThroughputStats,

    closed: bool,

    disconnect_reported: bool,

}

impl PeerSession {

    pub fn new(
        remote_id: [u8; 20],
        conn: Box<dyn Connection>,
        store: Arc<dyn PieceStore>,
        services: Arc<dyn PeerServices>,
        fast_enabled: bool,
        extension_protocol_enabled: bool,
    ) -> Self {
        let addr = conn.remote_addr();
        let state = PeerState::new(
            remote_id,
            store.info().storage,
            fast_enabled,
            extension_protocol_enabled,
        );
        let mut session = Self {
            addr,
            conn,
            parser: MessageCodec::new(fast_enabled),
            queue: OutboundQueue::new(store.clone(), fast_enabled),
            store,
            services: services.clone(),
            read_buf: BytesMut::new(),
            state,
            throughput: ThroughputStats::default(),
            closed: false,
            disconnect_reported: false,
        };
        session.send_initial_messages();
        if extension_protocol_enabled {
            services.offer_extensions(addr);
        }
        session
    }

    // Availability announcement, queued before any inbound byte is processed.
    fn send_initial_messages(&mut self) {
        let present = self.store.present_pieces();
        match self.store.info().piece_style {

            PieceStyle::Elastic => {
                self.queue.send_message(Message::HaveNone);
                self.queue.send_message(Message::ExtensionHandshake {
                    added: vec![EXT_ELASTIC],
                    removed: Vec::new(),
                    extra: Bytes::new(),
                });
                // Announce our extended length if we grew past the info.
                let current = self.store.storage_descriptor();
                if current.total_len > self.store.info().storage.total_len {
                    if let Some(sig) = self.store.view_signature(current.total_len) {
                        self.queue.send_message(Message::ElasticSignature(sig));
                    }
                }
                self.queue.send_message(Message::ElasticBitfield(present));
            }

            style => {
                if self.state.fast_enabled {
                    if present.not_any() {
                        self.queue.send_message(Message::HaveNone);
                    } else if present.all() {
                        self.queue.send_message(Message::HaveAll);
                    } else {
                        self.queue.send_message(Message::Bitfield(present));
                    }
                } else if present.any() {
                    self.queue.send_message(Message::Bitfield(present));
                }
                if style == PieceStyle::Merkle {
                    self.queue.send_message(Message::ExtensionHandshake {
                        added: vec![EXT_MERKLE],
                        removed: Vec::new(),
                        extra: Bytes::new(),
                    });
                }
            }
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_pending_output(&self) -> bool {
        self.queue.has_pending_output()
    }

    pub fn throughput(&self) -> ThroughputStats {
        self.throughput
    }

    #[cfg(test)]
    pub(crate) fn state_mut(&mut self) -> &mut PeerState {
        &mut self.state
    }

    // Entry point from the connection layer. Drain and dispatch inbound
    // bytes, top the request pipeline up, then push queued bytes out. The
    // top-up runs even on a write-only wakeup: an earlier choke flip may
    // have freed pipeline slots. Every fatal condition, protocol or I/O,
    // ends in the close path before it is reported to the caller.
    pub fn connection_ready(&mut self, readable: bool, writable: bool) -> Result<()> {
        let result = self.ready_inner(readable, writable);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn ready_inner(&mut self, readable: bool, writable: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if readable {
            self.read_messages()?;
        }
        if self.state.we_are_interested {
            self.top_up_requests();
        }
        if writable {
            let sent = self.queue.send_data(&mut *self.conn)?;
            self.throughput.up.add(sent);
        }
        Ok(())
    }

    fn read_messages(&mut self) -> Result<()> {
        let mut chunk = [0; READ_CHUNK_LEN];
        let mut drained = 0;
        loop {
            let n = match self.conn.drain(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(PeerError::ConnectionClosed)
                }
                Err(e) => return Err(e.into()),
            };
            drained += n as u64;
            self.read_buf.extend_from_slice(&chunk[..n]);
            while let Some(msg) = self.parser.decode(&mut self.read_buf)? {
                self.handle_message(msg)?;
            }
        }
        if drained > 0 {
            self.throughput.down.add(drained);
            self.state.last_data_received = Instant::now();
        }
        Ok(())
    }

    fn handle_message(&mut self, msg: Message) -> Result<()> {
        tracing::trace!("read: {}", msg);
        match msg {
            Message::KeepAlive => {}
            Message::Choke => self.handle_choke(true),
            Message::Unchoke => self.handle_choke(false),
            Message::Interested => self.handle_interested(true),
            Message::NotInterested => self.handle_interested(false),
            Message::Have { piece } => self.handle_have(piece)?,
            // The elastic bitfield framing is a thin wrapper over the plain
            // bitfield, so both funnel into the same handler.
            Message::Bitfield(bits) | Message::ElasticBitfield(bits) => self.handle_bitfield(bits)?,
            Message::Request(desc) => self.handle_request(desc)?,
            Message::Piece(piece) => self.handle_piece(piece)?,
            Message::Cancel(desc) => self.handle_cancel(desc)?,
            Message::Suggest { piece } => self.handle_suggest(piece)?,
            Message::HaveAll => self.handle_have_all()?,
            Message::HaveNone => self.handle_have_none(),
            Message::Reject(desc) => self.handle_reject(desc)?,
            Message::AllowedFast { piece } => self.handle_allowed_fast(piece)?,
            Message::ExtensionHandshake { added, removed, extra } => {
                self.handle_extension_handshake(added, removed, extra)
            }
            Message::ExtensionMessage { id, payload } => {
                self.services.extension_message(self.addr, id, payload)
            }
            Message::ElasticSignature(sig) => self.handle_view_signature(sig)?,
            Message::ResourceDirectory(_) | Message::ResourceSubscribe(_) => {}
            Message::Unknown { .. } => {}
        }
        Ok(())
    }

    fn handle_choke(&mut self, choking: bool) {
        self.state.they_are_choking = choking;
        self.queue.set_requests_plugged(choking);
        if choking && !self.state.fast_enabled {
            // Base protocol: a choke voids in-flight requests. They return to
            // the unsent queue and go out again after the next unchoke; under
            // the fast extension they stay out, pending an explicit reject.
            self.queue.requeue_sent_requests();
        }
    }

    fn handle_interested(&mut self, interested: bool) {
        self.state.they_are_interested = interested;
        self.services.adjust_choking(self.state.we_are_choking);
    }

    fn handle_have(&mut self, piece: u32) -> Result<()> {
        if piece >= self.state.remote_view.num_pieces() {
            return Err(PeerError::PieceOutOfRange(piece));
        }
        if self.state.remote_bitfield[piece as usize] {
            return Ok(());
        }
        self.state.remote_bitfield.set(piece as usize, true);
        let interested = self.services.piece_available(self.addr, piece);
        self.update_interest(interested);

        // The peer just stopped being piece-poor; withdraw its fast grant.
        if self.state.remote_bitfield.count_ones() as u32 == ALLOWED_FAST_THRESHOLD {
            self.queue.clear_allowed_fast_pieces();
        }
        Ok(())
    }

    fn handle_bitfield(&mut self, mut bits: Bitfield) -> Result<()> {
        let num_pieces = self.state.remote_view.num_pieces() as usize;
        // The wire bitfield is padded to whole bytes.
        if bits.len() != (num_pieces + 7) / 8 * 8 {
            return Err(PeerError::BitfieldSizeMismatch);
        }
        bits.resize(num_pieces, false);
        tracing::trace!("peer has {}/{} pieces", bits.count_ones(), num_pieces);
        self.state.remote_bitfield = bits;

        let interested = self.services.pieces_available(self.addr);
        self.update_interest(interested);

        if self.state.fast_enabled
            && self.store.info().piece_style != PieceStyle::Elastic
            && (self.state.remote_bitfield.count_ones() as u32) < ALLOWED_FAST_THRESHOLD
        {
            self.grant_allowed_fast();
        }
        Ok(())
    }

    fn handle_request(&mut self, desc: BlockDescriptor) -> Result<()> {
        if !desc.is_valid(&self.store.storage_descriptor()) {
            return Err(PeerError::InvalidDescriptor(desc));
        }
        if self.store.have_piece(desc.piece) {
            if !self.state.we_are_choking {
                self.queue.send_block_message(desc);
            } else if self.state.fast_enabled {
                if self.queue.is_piece_allowed_fast(desc.piece) {
                    self.queue.send_block_message(desc);
                } else {
                    self.queue.send_reject_message(desc);
                }
            }
            // Choked requests without fast capability are dropped silently.
        } else if self.state.fast_enabled {
            self.queue.send_reject_message(desc);
        } else {
            return Err(PeerError::PieceNotPresent(desc.piece));
        }
        Ok(())
    }

    fn handle_piece(&mut self, piece: PieceMessage) -> Result<()> {
        let style = self.store.info().piece_style;
        if piece.style != style {
            return Err(PeerError::PieceStyleMismatch);
        }
        let desc = piece.descriptor();
        if !desc.is_valid(&self.state.remote_view) {
            return Err(PeerError::InvalidDescriptor(desc));
        }

        // Elastic blocks must reference a view we hold a signature for.
        let view_signature = if style == PieceStyle::Elastic {
            let view_length = piece
                .view_length
                .ok_or(PeerError::MalformedPayload("piece"))?;
            let sig = self
                .state
                .remote_view_signatures
                .get(&view_length)
                .cloned()
                .ok_or(PeerError::UnknownViewLength(view_length))?;
            Some(sig)
        } else {
            None
        };

        if !self.queue.request_received(&desc) {
            if self.state.fast_enabled {
                return Err(PeerError::UnrequestedPiece);
            }
            // A block can legally cross our cancel on the wire.
            tracing::trace!("dropping unrequested block {}", desc);
            return Ok(());
        }
        self.services
            .block_received(self.addr, desc, view_signature, piece.hash_chain, piece.data);
        Ok(())
    }

    fn handle_cancel(&mut self, desc: BlockDescriptor) -> Result<()> {
        if !desc.is_valid(&self.store.storage_descriptor()) {
            return Err(PeerError::InvalidDescriptor(desc));
        }
        if self.queue.cancel_block_message(&desc) && self.state.fast_enabled {
            self.queue.send_reject_message(desc);
        }
        Ok(())
    }

    fn handle_suggest(&mut self, piece: u32) -> Result<()> {
        if piece >= self.state.remote_view.num_pieces() {
            return Err(PeerError::PieceOutOfRange(piece));
        }
        // A suggestion for a piece the peer does not hold is meaningless.
        if self.state.remote_bitfield[piece as usize] {
            self.services.piece_suggested(self.addr, piece);
        }
        Ok(())
    }

    fn handle_have_all(&mut self) -> Result<()> {
        self.state.remote_bitfield.fill(true);
        let interested = self.services.pieces_available(self.addr);
        self.update_interest(interested);
        Ok(())
    }

    fn handle_have_none(&mut self) {
        // The bitfield starts out empty, nothing to update.
        if self.store.info().piece_style != PieceStyle::Elastic {
            self.grant_allowed_fast();
        }
    }

    fn handle_reject(&mut self, desc: BlockDescriptor) -> Result<()> {
        // A reject implies a tracked request; anything else is a protocol
        // violation.
        if !self.queue.reject_received(&desc) {
            return Err(PeerError::UnrequestedReject);
        }
        Ok(())
    }

    fn handle_allowed_fast(&mut self, piece: u32) -> Result<()> {
        if piece >= self.state.remote_view.num_pieces() {
            return Err(PeerError::PieceOutOfRange(piece));
        }
        // Only useful if the peer can actually serve the piece.
        if self.state.remote_bitfield[piece as usize] {
            self.queue.set_request_allowed_fast(piece);
            self.services.piece_allowed_fast(self.addr, piece);
        }
        Ok(())
    }

    fn handle_extension_handshake(&mut self, added: Vec<u8>, removed: Vec<u8>, extra: Bytes) {
        for id in &added {
            self.state.remote_extensions.insert(*id);
        }
        for id in &removed {
            self.state.remote_extensions.remove(id);
        }
        self.services
            .peer_extensions_changed(self.addr, &added, &removed, &extra);
    }

    fn handle_view_signature(&mut self, sig: ViewSignature) -> Result<()> {
        if sig.view_length > self.state.remote_view.total_len {
            self.state.grow_view(sig.view_length);
        }
        if !self.services.verify_view_signature(&sig) {
            return Err(PeerError::SignatureRejected);
        }
        self.state.record_view_signature(sig);
        Ok(())
    }

    // Compute and transmit the Allowed Fast grant for this peer.
    fn grant_allowed_fast(&mut self) {
        let set = allowed_fast_set(
            &self.addr.ip(),
            &self.store.info().info_hash,
            self.store.info().storage.num_pieces(),
            ALLOWED_FAST_THRESHOLD,
        );
        self.queue.send_allowed_fast_messages(&set);
    }

    fn update_interest(&mut self, interested: bool) {
        if interested && !self.state.we_are_interested {
            self.state.we_are_interested = true;
            self.queue.send_interested_message(true);
        }
    }

    // Ask the coordinator for enough block requests to fill the pipeline.
    // While choked it may only hand out pieces the peer allowed us fast.
    // When it has nothing for us and nothing is in flight, our interest in
    // this peer is spent.
    fn top_up_requests(&mut self) {
        let needed = self.queue.requests_needed();
        if needed == 0 {
            return;
        }
        let requests = self
            .services
            .get_requests(self.addr, needed, self.state.they_are_choking);
        if !requests.is_empty() {
            for desc in requests {
                tracing::trace!("send request: {}", desc);
                self.queue.send_request_message(desc);
            }
        } else if !self.state.they_are_choking
            && !self.queue.has_outstanding_requests()
            && self.state.we_are_interested
        {
            self.state.we_are_interested = false;
            self.queue.send_interested_message(false);
        }
    }

    // Control surface for the coordinator.

    pub fn set_we_are_choking(&mut self, choking: bool) {
        if self.state.we_are_choking == choking {
            return;
        }
        self.state.we_are_choking = choking;
        let discarded = self.queue.send_choke_message(choking);
        if self.state.fast_enabled {
            for desc in discarded {
                self.queue.send_reject_message(desc);
            }
        }
    }

    pub fn set_we_are_interested(&mut self, interested: bool) {
        if self.state.we_are_interested == interested {
            return;
        }
        self.state.we_are_interested = interested;
        self.queue.send_interested_message(interested);
    }

    // Withdraw requests of ours. Under the fast extension the tracking entry
    // is kept so the racing piece or reject still matches.
    pub fn cancel_requests(&mut self, descs: &[BlockDescriptor]) {
        for desc in descs {
            self.queue.cancel_message(desc, self.state.fast_enabled);
        }
    }

    // A piece of ours went away; stop serving queued responses for it.
    pub fn reject_piece(&mut self, piece: u32) {
        let purged = self.queue.reject_piece(piece);
        if purged > 0 {
            tracing::trace!("purged {} queued blocks of piece {}", purged, piece);
        }
    }

    pub fn send_have_piece(&mut self, piece: u32) {
        self.queue.send_have_message(piece);
    }

    // Keepalive tick: close a connection that has gone quiet for too long,
    // otherwise keep it warm.
    pub fn send_keepalive_or_close(&mut self) {
        if self.state.last_data_received.elapsed() > IDLE_TIMEOUT {
            tracing::info!("closing idle connection");
            self.close();
        } else {
            self.queue.send_keepalive_message();
        }
        self.throughput.reset_round();
    }

    pub fn send_view_signature(&mut self, sig: ViewSignature) {
        self.queue.send_message(Message::ElasticSignature(sig));
    }

    pub fn send_extension_handshake(&mut self, added: Vec<u8>, removed: Vec<u8>, extra: Bytes) {
        self.queue
            .send_message(Message::ExtensionHandshake { added, removed, extra });
    }

    pub fn send_extension_message(&mut self, id: u8, payload: Bytes) {
        self.queue.send_message(Message::ExtensionMessage { id, payload });
    }

    // Idempotent: the connection closes once and the coordinator hears about
    // it once, whichever paths get here.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.conn.close() {
                tracing::trace!("close error ignored: {}", e);
            }
        }
        if !self.disconnect_reported {
            self.disconnect_reported = true;
            self.services.peer_disconnected(self.addr);
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        // A dropped session still owes the coordinator its disconnection.
        self.close();
    }
}
