// Shared fakes for unit tests: an in-memory piece database, a loopback
// connection that captures written frames, and a scripted coordinator that
// records every call made to it.

use std::{
    collections::{HashMap, VecDeque},
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use crate::{
    block::BlockDescriptor,
    conn::Connection,
    peer::{Message, MessageCodec},
    services::PeerServices,
    storage::{HashChain, PieceStore, PieceStyle, StorageDescriptor, TorrentInfo, ViewSignature},
    Bitfield,
};

pub(crate) fn test_addr() -> SocketAddr {
    "80.4.4.200:6881".parse().unwrap()
}

pub(crate) struct MemoryStore {
    info: TorrentInfo,
    storage: Mutex<StorageDescriptor>,
    present: Mutex<Bitfield>,
    signatures: Mutex<HashMap<u64, ViewSignature>>,
}

impl MemoryStore {

    pub fn new(style: PieceStyle, piece_len: u32, total_len: u64) -> Self {
        let storage = StorageDescriptor::new(piece_len, total_len);
        Self {
            info: TorrentInfo { info_hash: [0xaa; 20], piece_style: style, storage },
            storage: Mutex::new(storage),
            present: Mutex::new(Bitfield::repeat(false, storage.num_pieces() as usize)),
            signatures: Mutex::new(HashMap::new()),
        }
    }

    // A store that already has every piece.
    pub fn seed(style: PieceStyle, piece_len: u32, total_len: u64) -> Self {
        let store = Self::new(style, piece_len, total_len);
        store.present.lock().unwrap().fill(true);
        store
    }

    pub fn set_present(&self, piece: u32) {
        self.present.lock().unwrap().set(piece as usize, true);
    }

    pub fn add_signature(&self, sig: ViewSignature) {
        self.signatures.lock().unwrap().insert(sig.view_length, sig);
    }

    pub fn grow(&self, total_len: u64) {
        let mut storage = self.storage.lock().unwrap();
        storage.total_len = total_len;
        self.present
            .lock()
            .unwrap()
            .resize(storage.num_pieces() as usize, false);
    }
}

impl PieceStore for MemoryStore {

    fn info(&self) -> &TorrentInfo {
        &self.info
    }

    fn storage_descriptor(&self) -> StorageDescriptor {
        *self.storage.lock().unwrap()
    }

    fn have_piece(&self, piece: u32) -> bool {
        self.present
            .lock()
            .unwrap()
            .get(piece as usize)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    fn present_pieces(&self) -> Bitfield {
        self.present.lock().unwrap().clone()
    }

    fn view_signature(&self, view_length: u64) -> Option<ViewSignature> {
        self.signatures.lock().unwrap().get(&view_length).cloned()
    }

    fn hash_chain(&self, piece: u32) -> Option<HashChain> {
        match self.info.piece_style {
            PieceStyle::Base => None,
            _ => Some(HashChain { hashes: vec![[piece as u8; 20]] }),
        }
    }

    fn read_block(&self, desc: &BlockDescriptor) -> io::Result<Bytes> {
        if !self.have_piece(desc.piece) {
            return Err(io::ErrorKind::NotFound.into());
        }
        Ok(Bytes::from(vec![desc.piece as u8; desc.len as usize]))
    }
}

#[derive(Default)]
struct ConnInner {
    inbound: BytesMut,
    outbound: BytesMut,
    accept_budget: Option<usize>,
    eof: bool,
    closed: bool,
}

// Loopback connection: tests feed bytes in with `push_inbound` and inspect
// what the session wrote with `take_outbound`/`take_messages`. Cloning
// shares the buffers, so a clone handed to the session stays observable.
#[derive(Clone)]
pub(crate) struct FakeConnection {
    addr: SocketAddr,
    inner: Arc<Mutex<ConnInner>>,
}

impl FakeConnection {

    pub fn new() -> Self {
        Self::with_addr(test_addr())
    }

    pub fn with_addr(addr: SocketAddr) -> Self {
        Self { addr, inner: Arc::new(Mutex::new(ConnInner::default())) }
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().inbound.extend_from_slice(bytes);
    }

    // Simulate the remote closing its end after any pending bytes.
    pub fn set_eof(&self) {
        self.inner.lock().unwrap().eof = true;
    }

    // Cap how many further bytes `fill` accepts before reporting would-block.
    pub fn set_accept_limit(&self, limit: usize) {
        self.inner.lock().unwrap().accept_budget = Some(limit);
    }

    pub fn take_outbound(&self) -> BytesMut {
        self.inner.lock().unwrap().outbound.split()
    }

    // Decode everything written so far as a fresh message stream.
    pub fn take_messages(&self) -> Vec<Message> {
        let mut wire = self.take_outbound();
        let mut decoder = MessageCodec::new(true);
        let mut messages = Vec::new();
        while let Some(msg) = decoder.decode(&mut wire).unwrap() {
            messages.push(msg);
        }
        assert!(wire.is_empty(), "trailing bytes on the wire");
        messages
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl Connection for FakeConnection {

    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    fn drain(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.inbound.is_empty() {
            if inner.eof {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            return Ok(0);
        }
        let n = buf.len().min(inner.inbound.len());
        buf[..n].copy_from_slice(&inner.inbound.split_to(n));
        Ok(n)
    }

    fn fill(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let n = match inner.accept_budget {
            Some(budget) => buf.len().min(budget),
            None => buf.len(),
        };
        if n == 0 {
            return Ok(0);
        }
        if let Some(budget) = &mut inner.accept_budget {
            *budget -= n;
        }
        inner.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.lock().unwrap().closed = true;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ServiceCall {
    PieceAvailable(u32),
    PiecesAvailable,
    AllowedFast(u32),
    Suggested(u32),
    GetRequests { count: usize, allowed_fast_only: bool },
    BlockReceived {
        desc: BlockDescriptor,
        had_signature: bool,
        had_chain: bool,
        data: Bytes,
    },
    VerifySignature(u64),
    AdjustChoking(bool),
    ExtensionsChanged { added: Vec<u8>, removed: Vec<u8> },
    ExtensionMessage(u8),
    OfferExtensions,
    Disconnected,
}

// Coordinator stand-in. Interest answers and request batches are scripted
// up front; every invocation is recorded for the test to assert on.
pub(crate) struct RecordingServices {
    calls: Mutex<Vec<ServiceCall>>,
    interested: Mutex<bool>,
    requests: Mutex<VecDeque<Vec<BlockDescriptor>>>,
    verify_ok: Mutex<bool>,
}

impl RecordingServices {

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            interested: Mutex::new(false),
            requests: Mutex::new(VecDeque::new()),
            verify_ok: Mutex::new(true),
        })
    }

    pub fn set_interested(&self, interested: bool) {
        *self.interested.lock().unwrap() = interested;
    }

    // Answer for the next `get_requests` call; further calls get nothing.
    pub fn script_requests(&self, batch: Vec<BlockDescriptor>) {
        self.requests.lock().unwrap().push_back(batch);
    }

    pub fn set_verify(&self, ok: bool) {
        *self.verify_ok.lock().unwrap() = ok;
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &ServiceCall) -> usize {
        self.calls().iter().filter(|seen| *seen == call).count()
    }

    fn record(&self, call: ServiceCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl PeerServices for RecordingServices {

    fn piece_available(&self, _peer: SocketAddr, piece: u32) -> bool {
        self.record(ServiceCall::PieceAvailable(piece));
        *self.interested.lock().unwrap()
    }

    fn pieces_available(&self, _peer: SocketAddr) -> bool {
        self.record(ServiceCall::PiecesAvailable);
        *self.interested.lock().unwrap()
    }

    fn piece_allowed_fast(&self, _peer: SocketAddr, piece: u32) {
        self.record(ServiceCall::AllowedFast(piece));
    }

    fn piece_suggested(&self, _peer: SocketAddr, piece: u32) {
        self.record(ServiceCall::Suggested(piece));
    }

    fn get_requests(
        &self,
        _peer: SocketAddr,
        count: usize,
        allowed_fast_only: bool,
    ) -> Vec<BlockDescriptor> {
        self.record(ServiceCall::GetRequests { count, allowed_fast_only });
        self.requests.lock().unwrap().pop_front().unwrap_or_default()
    }

    fn block_received(
        &self,
        _peer: SocketAddr,
        desc: BlockDescriptor,
        view_signature: Option<ViewSignature>,
        hash_chain: Option<HashChain>,
        data: Bytes,
    ) {
        self.record(ServiceCall::BlockReceived {
            desc,
            had_signature: view_signature.is_some(),
            had_chain: hash_chain.is_some(),
            data,
        });
    }

    fn verify_view_signature(&self, sig: &ViewSignature) -> bool {
        self.record(ServiceCall::VerifySignature(sig.view_length));
        *self.verify_ok.lock().unwrap()
    }

    fn adjust_choking(&self, we_are_choking: bool) {
        self.record(ServiceCall::AdjustChoking(we_are_choking));
    }

    fn peer_extensions_changed(
        &self,
        _peer: SocketAddr,
        added: &[u8],
        removed: &[u8],
        _extra: &Bytes,
    ) {
        self.record(ServiceCall::ExtensionsChanged {
            added: added.to_vec(),
            removed: removed.to_vec(),
        });
    }

    fn extension_message(&self, _peer: SocketAddr, id: u8, _data: Bytes) {
        self.record(ServiceCall::ExtensionMessage(id));
    }

    fn offer_extensions(&self, _peer: SocketAddr) {
        self.record(ServiceCall::OfferExtensions);
    }

    fn peer_disconnected(&self, _peer: SocketAddr) {
        self.record(ServiceCall::Disconnected);
    }
}
