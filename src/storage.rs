use std::{fmt, io};
use bytes::Bytes;
use crate::{block::BlockDescriptor, Bitfield};

// How pieces are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStyle {
    // Flat list of per-piece SHA1 hashes carried by the metainfo.
    Base,
    // Single root hash; each piece travels with its sibling path.
    Merkle,
    // Merkle tree whose total length may grow through signed view roots.
    Elastic,
}

impl fmt::Display for PieceStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PieceStyle::Base => write!(f, "base"),
            PieceStyle::Merkle => write!(f, "merkle"),
            PieceStyle::Elastic => write!(f, "elastic"),
        }
    }
}

// Geometry of a torrent's data: a fixed piece size over a total length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageDescriptor {

    pub piece_len: u32,

    pub total_len: u64,

}

impl StorageDescriptor {

    pub fn new(piece_len: u32, total_len: u64) -> Self {
        Self { piece_len, total_len }
    }

    pub fn num_pieces(&self) -> u32 {
        ((self.total_len + self.piece_len as u64 - 1) / self.piece_len as u64) as u32
    }

    // Length of a piece given its index, the last piece may run short.
    // Out-of-range indices report zero.
    pub fn piece_length(&self, piece: u32) -> u32 {
        let start = piece as u64 * self.piece_len as u64;
        if start >= self.total_len {
            return 0;
        }
        (self.total_len - start).min(self.piece_len as u64) as u32
    }
}

// A signature over the root-hash commitment for one total length of an
// elastic torrent. Accepting one widens the torrent to `view_length` bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct ViewSignature {

    pub view_length: u64,

    pub signature: Bytes,

}

impl fmt::Debug for ViewSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewSignature")
            .field("view_length", &self.view_length)
            .field("signature", &hex::encode(&self.signature))
            .finish()
    }
}

// Sibling hashes authenticating one piece against a Merkle root, leaf upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashChain {
    pub hashes: Vec<[u8; 20]>,
}

// Static identity of the torrent, fixed at creation time.
#[derive(Clone)]
pub struct TorrentInfo {

    pub info_hash: [u8; 20],

    pub piece_style: PieceStyle,

    pub storage: StorageDescriptor,

}

impl fmt::Debug for TorrentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorrentInfo")
            .field("info_hash", &hex::encode(self.info_hash))
            .field("piece_style", &self.piece_style)
            .field("storage", &self.storage)
            .finish()
    }
}

// Read-only view of the piece database shared by every peer session.
pub trait PieceStore: Send + Sync {

    fn info(&self) -> &TorrentInfo;

    // Current extent of the torrent; larger than `info()` once an elastic
    // torrent has grown.
    fn storage_descriptor(&self) -> StorageDescriptor;

    fn have_piece(&self, piece: u32) -> bool;

    fn present_pieces(&self) -> Bitfield;

    fn piece_length(&self, piece: u32) -> u32 {
        self.storage_descriptor().piece_length(piece)
    }

    // Signature covering the root hash at the given total length.
    fn view_signature(&self, view_length: u64) -> Option<ViewSignature>;

    // Sibling path for one present piece under the current root.
    fn hash_chain(&self, piece: u32) -> Option<HashChain>;

    fn read_block(&self, desc: &BlockDescriptor) -> io::Result<Bytes>;
}
