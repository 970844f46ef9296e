use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use bytes::Bytes;
use tokio::{io::Interest, net::TcpStream, sync::Notify, time};
use tracing::Instrument;
use crate::{
    block::BlockDescriptor,
    conn::{Connection, TcpConnection},
    services::PeerServices,
    stats::ThroughputStats,
    storage::{PieceStore, ViewSignature},
    KEEPALIVE_INTERVAL,
};

mod fast;
mod message;
mod queue;
mod session;
mod state;

pub use fast::allowed_fast_set;
pub use message::{Message, MessageCodec, PieceMessage};
pub use queue::OutboundQueue;
pub use session::PeerSession;
pub use state::PeerState;

pub type Result<T> = std::result::Result<T, PeerError>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by remote")]
    ConnectionClosed,

    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),

    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),

    #[error("have-all/have-none past the first message")]
    LateHaveMessage,

    #[error("fast extension message id {0} without negotiation")]
    FastNotNegotiated(u8),

    #[error("block message style does not match the torrent")]
    PieceStyleMismatch,

    #[error("invalid block descriptor {0}")]
    InvalidDescriptor(BlockDescriptor),

    #[error("piece index {0} out of range")]
    PieceOutOfRange(u32),

    #[error("bitfield length does not match piece count")]
    BitfieldSizeMismatch,

    #[error("request for piece {0} which is not present")]
    PieceNotPresent(u32),

    #[error("block does not match any outstanding request")]
    UnrequestedPiece,

    #[error("reject does not match any outstanding request")]
    UnrequestedReject,

    #[error("block references unknown view length {0}")]
    UnknownViewLength(u64),

    #[error("view signature rejected")]
    SignatureRejected,
}

fn lock(session: &Mutex<PeerSession>) -> MutexGuard<'_, PeerSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

// Cloneable handle the coordinator keeps for each connected peer. Every call
// takes the per-peer lock, applies the change and wakes the driver task so
// newly queued bytes reach the wire.
#[derive(Clone)]
pub struct Peer {
    addr: SocketAddr,
    session: Arc<Mutex<PeerSession>>,
    wake: Arc<Notify>,
}

impl Peer {

    // Wrap a handshake-complete socket in a session and start its driver
    // task. Must run inside a tokio runtime.
    pub fn spawn(
        stream: TcpStream,
        remote_id: [u8; 20],
        store: Arc<dyn PieceStore>,
        services: Arc<dyn PeerServices>,
        fast_enabled: bool,
        extension_protocol_enabled: bool,
    ) -> io::Result<Peer> {
        let (conn, ready) = TcpConnection::new(stream)?;
        let addr = conn.remote_addr();
        let session = Arc::new(Mutex::new(PeerSession::new(
            remote_id,
            Box::new(conn),
            store,
            services,
            fast_enabled,
            extension_protocol_enabled,
        )));
        let wake = Arc::new(Notify::new());
        let peer = Peer { addr, session: session.clone(), wake: wake.clone() };
        tokio::spawn(
            drive(session, ready, wake).instrument(tracing::info_span!("peer", addr = %addr)),
        );
        Ok(peer)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut PeerSession) -> T) -> T {
        let out = f(&mut lock(&self.session));
        self.wake.notify_one();
        out
    }

    pub fn set_choking(&self, choking: bool) {
        self.with_session(|session| session.set_we_are_choking(choking));
    }

    pub fn set_interested(&self, interested: bool) {
        self.with_session(|session| session.set_we_are_interested(interested));
    }

    pub fn cancel_requests(&self, descs: &[BlockDescriptor]) {
        self.with_session(|session| session.cancel_requests(descs));
    }

    pub fn reject_piece(&self, piece: u32) {
        self.with_session(|session| session.reject_piece(piece));
    }

    pub fn send_have_piece(&self, piece: u32) {
        self.with_session(|session| session.send_have_piece(piece));
    }

    pub fn send_view_signature(&self, sig: ViewSignature) {
        self.with_session(|session| session.send_view_signature(sig));
    }

    pub fn send_extension_handshake(&self, added: Vec<u8>, removed: Vec<u8>, extra: Bytes) {
        self.with_session(|session| session.send_extension_handshake(added, removed, extra));
    }

    pub fn send_extension_message(&self, id: u8, payload: Bytes) {
        self.with_session(|session| session.send_extension_message(id, payload));
    }

    pub fn close(&self) {
        self.with_session(|session| session.close());
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.session).is_closed()
    }

    pub fn throughput(&self) -> ThroughputStats {
        lock(&self.session).throughput()
    }
}

// Readiness loop for one session: wait on the socket, on keepalive ticks and
// on wakeups from the coordinator-facing handle, and feed the session under
// its lock. Write interest is only registered while the queue has bytes.
async fn drive(session: Arc<Mutex<PeerSession>>, stream: Arc<TcpStream>, wake: Arc<Notify>) {
    let mut keepalive =
        time::interval_at(time::Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);

    loop {
        let (closed, want_write) = {
            let session = lock(&session);
            (session.is_closed(), session.has_pending_output())
        };
        if closed {
            break;
        }
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        tokio::select! {

            ready = stream.ready(interest) => {
                let ready = match ready {
                    Ok(ready) => ready,
                    Err(e) => {
                        tracing::warn!("socket error: {}", e);
                        lock(&session).close();
                        break;
                    }
                };
                let result =
                    lock(&session).connection_ready(ready.is_readable(), ready.is_writable());
                if let Err(e) = result {
                    match e {
                        PeerError::ConnectionClosed => tracing::info!("peer closed connection"),
                        e => tracing::error!("session error: {}", e),
                    }
                    lock(&session).close();
                    break;
                }
            }

            // Coordinator queued messages or closed us; re-evaluate interest.
            _ = wake.notified() => {}

            _ = keepalive.tick() => lock(&session).send_keepalive_or_close(),
        }
    }
}
