use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{
    block::BlockDescriptor,
    storage::{HashChain, PieceStyle, ViewSignature},
    Bitfield, MAX_BLOCK_LEN,
};
use super::PeerError;

// A frame larger than a maximum-size block plus generous header room is
// garbage, whatever its id claims.
const MAX_FRAME_LEN: usize = MAX_BLOCK_LEN as usize + 0x4000;

#[cfg_attr(test, derive(Debug, Clone, PartialEq, Eq))]
pub enum Message {

    // Advises the peer to keep the connection open despite silence.
    KeepAlive,

    // A choke tells the peer that no further requests will be served.
    Choke,

    // Conversely, unchoke signals that requests will now be served.
    Unchoke,

    // We intend to request blocks from the peer.
    Interested,

    // We no longer want anything the peer has.
    NotInterested,

    // The sender completed one piece.
    Have { piece: u32 },

    // Complete piece set of the sender, only valid directly after handshake.
    Bitfield(Bitfield),

    // Ask for one block of a piece.
    Request(BlockDescriptor),

    // One block of piece data, shaped by the torrent's piece style.
    Piece(PieceMessage),

    // Withdraw an earlier request.
    Cancel(BlockDescriptor),

    // The sender thinks we should fetch this piece from it.
    Suggest { piece: u32 },

    // Sender has every piece; replaces a full bitfield.
    HaveAll,

    // Sender has no pieces; replaces an empty bitfield.
    HaveNone,

    // A request the sender refuses to serve.
    Reject(BlockDescriptor),

    // The sender permits requesting this piece even while it chokes us.
    AllowedFast { piece: u32 },

    // Enable and disable extensions on the connection.
    ExtensionHandshake { added: Vec<u8>, removed: Vec<u8>, extra: Bytes },

    // Payload of a negotiated extension, opaque at this layer.
    ExtensionMessage { id: u8, payload: Bytes },

    // A signed root commitment widening an elastic torrent.
    ElasticSignature(ViewSignature),

    // Piece set of an elastic sender; payload framing matches Bitfield.
    ElasticBitfield(Bitfield),

    ResourceDirectory(Bytes),

    ResourceSubscribe(Bytes),

    // Recognised but unsupported id; the payload is discarded.
    Unknown { id: u8 },
}

#[cfg_attr(test, derive(Debug, Clone, PartialEq, Eq))]
pub struct PieceMessage {

    pub style: PieceStyle,

    pub piece: u32,

    pub offset: u32,

    // Total length of the view this block was authenticated under; elastic
    // style only.
    pub view_length: Option<u64>,

    // Sibling path for the piece; Merkle and elastic styles.
    pub hash_chain: Option<HashChain>,

    pub data: Bytes,

}

impl PieceMessage {
    pub fn descriptor(&self) -> BlockDescriptor {
        BlockDescriptor::new(self.piece, self.offset, self.data.len() as u32)
    }
}

// Tokeniser and serialiser for the peer wire. Frames are
// <len: u32><id: u8><payload>; a zero length is a keepalive. The decoder
// tracks whether the next message is the first after handshake so that
// have-all/have-none can be rejected anywhere else, and refuses fast
// extension ids when the extension was not negotiated.
pub struct MessageCodec {
    fast_enabled: bool,
    first: bool,
}

impl MessageCodec {

    pub fn new(fast_enabled: bool) -> Self {
        Self { fast_enabled, first: true }
    }

    fn get_descriptor(payload: &mut BytesMut, what: &'static str) -> Result<BlockDescriptor, PeerError> {
        if payload.remaining() < 12 {
            return Err(PeerError::MalformedPayload(what));
        }
        Ok(BlockDescriptor::new(payload.get_u32(), payload.get_u32(), payload.get_u32()))
    }

    fn get_piece_index(payload: &mut BytesMut, what: &'static str) -> Result<u32, PeerError> {
        if payload.remaining() < 4 {
            return Err(PeerError::MalformedPayload(what));
        }
        Ok(payload.get_u32())
    }

    fn get_hash_chain(payload: &mut BytesMut) -> Result<HashChain, PeerError> {
        if payload.remaining() < 4 {
            return Err(PeerError::MalformedPayload("hash chain"));
        }
        let count = payload.get_u32() as usize;
        if payload.remaining() < count * 20 {
            return Err(PeerError::MalformedPayload("hash chain"));
        }
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            let mut hash = [0; 20];
            payload.copy_to_slice(&mut hash);
            hashes.push(hash);
        }
        Ok(HashChain { hashes })
    }

    fn put_piece(&mut self, piece: PieceMessage, dst: &mut BytesMut) -> Result<(), PeerError> {
        let chain = piece.hash_chain.map(|c| c.hashes).unwrap_or_default();
        match piece.style {

            // piece: <len=0009+X><id=7><index><begin><block>
            PieceStyle::Base => {
                dst.put_u32(9 + piece.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(piece.piece);
                dst.put_u32(piece.offset);
                dst.put_slice(&piece.data);
            }

            // merkle piece: <len=0013+20*N+X><id=22><index><begin><N><chain><block>
            PieceStyle::Merkle => {
                dst.put_u32((13 + chain.len() * 20 + piece.data.len()) as u32);
                dst.put_u8(22);
                dst.put_u32(piece.piece);
                dst.put_u32(piece.offset);
                dst.put_u32(chain.len() as u32);
                for hash in &chain {
                    dst.put_slice(hash);
                }
                dst.put_slice(&piece.data);
            }

            // elastic piece: <len=0021+20*N+X><id=23><index><begin><view len><N><chain><block>
            PieceStyle::Elastic => {
                let view_length = piece
                    .view_length
                    .ok_or(PeerError::MalformedPayload("elastic piece"))?;
                dst.put_u32((21 + chain.len() * 20 + piece.data.len()) as u32);
                dst.put_u8(23);
                dst.put_u32(piece.piece);
                dst.put_u32(piece.offset);
                dst.put_u64(view_length);
                dst.put_u32(chain.len() as u32);
                for hash in &chain {
                    dst.put_slice(hash);
                }
                dst.put_slice(&piece.data);
            }
        }
        Ok(())
    }
}

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // [0, 0, 0, 0]
            Message::KeepAlive => dst.put_u32(0),

            // <len=0001><id=0>
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // <len=0001><id=1>
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // <len=0001><id=2>
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // <len=0001><id=3>
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { piece } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(piece);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bits) => {
                dst.put_u32(1 + bits.as_raw_slice().len() as u32);
                dst.put_u8(5);
                dst.put_slice(bits.as_raw_slice());
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(desc) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(desc.piece);
                dst.put_u32(desc.offset);
                dst.put_u32(desc.len);
            },

            Message::Piece(piece) => self.put_piece(piece, dst)?,

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(desc) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(desc.piece);
                dst.put_u32(desc.offset);
                dst.put_u32(desc.len);
            },

            // suggest: <len=0005><id=13><piece index>
            Message::Suggest { piece } => {
                dst.put_u32(5);
                dst.put_u8(13);
                dst.put_u32(piece);
            },

            // <len=0001><id=14>
            Message::HaveAll => {
                dst.put_u32(1);
                dst.put_u8(14);
            },

            // <len=0001><id=15>
            Message::HaveNone => {
                dst.put_u32(1);
                dst.put_u8(15);
            },

            // reject: <len=0013><id=16><index><begin><length>
            Message::Reject(desc) => {
                dst.put_u32(13);
                dst.put_u8(16);
                dst.put_u32(desc.piece);
                dst.put_u32(desc.offset);
                dst.put_u32(desc.len);
            },

            // allowed fast: <len=0005><id=17><piece index>
            Message::AllowedFast { piece } => {
                dst.put_u32(5);
                dst.put_u8(17);
                dst.put_u32(piece);
            },

            // <len=0003+N+M+X><id=20><N><added><M><removed><extra>
            Message::ExtensionHandshake { added, removed, extra } => {
                debug_assert!(added.len() <= u8::MAX as usize && removed.len() <= u8::MAX as usize);
                dst.put_u32((3 + added.len() + removed.len() + extra.len()) as u32);
                dst.put_u8(20);
                dst.put_u8(added.len() as u8);
                dst.put_slice(&added);
                dst.put_u8(removed.len() as u8);
                dst.put_slice(&removed);
                dst.put_slice(&extra);
            },

            // <len=0002+X><id=21><ext id><data>
            Message::ExtensionMessage { id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(21);
                dst.put_u8(id);
                dst.put_slice(&payload);
            },

            // <len=0009+X><id=24><view length><signature>
            Message::ElasticSignature(sig) => {
                dst.put_u32(9 + sig.signature.len() as u32);
                dst.put_u8(24);
                dst.put_u64(sig.view_length);
                dst.put_slice(&sig.signature);
            },

            // <len=0001+X><id=25><bitfield>
            Message::ElasticBitfield(bits) => {
                dst.put_u32(1 + bits.as_raw_slice().len() as u32);
                dst.put_u8(25);
                dst.put_slice(bits.as_raw_slice());
            },

            // <len=0001+X><id=26><payload>
            Message::ResourceDirectory(payload) => {
                dst.put_u32(1 + payload.len() as u32);
                dst.put_u8(26);
                dst.put_slice(&payload);
            },

            // <len=0001+X><id=27><payload>
            Message::ResourceSubscribe(payload) => {
                dst.put_u32(1 + payload.len() as u32);
                dst.put_u8(27);
                dst.put_slice(&payload);
            },

            // Never ours to send.
            Message::Unknown { .. } => {},
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.remaining() < 4 {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src[..]);
        let frame_len = peeker.get_u32() as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(frame_len));
        }
        if src.remaining() < 4 + frame_len {
            // Whole frame not yet received.
            return Ok(None);
        }
        src.advance(4);

        let first = std::mem::replace(&mut self.first, false);
        if frame_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = src.get_u8();
        let mut payload = src.split_to(frame_len - 1);

        if !self.fast_enabled && (13..=17).contains(&id) {
            return Err(PeerError::FastNotNegotiated(id));
        }
        if (id == 14 || id == 15) && !first {
            return Err(PeerError::LateHaveMessage);
        }

        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have { piece: Self::get_piece_index(&mut payload, "have")? },
            5 => Message::Bitfield(Bitfield::from_vec(payload.to_vec())),
            6 => Message::Request(Self::get_descriptor(&mut payload, "request")?),
            7 => {
                if payload.remaining() < 8 {
                    return Err(PeerError::MalformedPayload("piece"));
                }
                Message::Piece(PieceMessage {
                    style: PieceStyle::Base,
                    piece: payload.get_u32(),
                    offset: payload.get_u32(),
                    view_length: None,
                    hash_chain: None,
                    data: payload.freeze(),
                })
            },
            8 => Message::Cancel(Self::get_descriptor(&mut payload, "cancel")?),
            13 => Message::Suggest { piece: Self::get_piece_index(&mut payload, "suggest")? },
            14 => Message::HaveAll,
            15 => Message::HaveNone,
            16 => Message::Reject(Self::get_descriptor(&mut payload, "reject")?),
            17 => Message::AllowedFast { piece: Self::get_piece_index(&mut payload, "allowed fast")? },
            20 => {
                if payload.remaining() < 1 {
                    return Err(PeerError::MalformedPayload("extension handshake"));
                }
                let added_len = payload.get_u8() as usize;
                if payload.remaining() < added_len + 1 {
                    return Err(PeerError::MalformedPayload("extension handshake"));
                }
                let added = payload.split_to(added_len).to_vec();
                let removed_len = payload.get_u8() as usize;
                if payload.remaining() < removed_len {
                    return Err(PeerError::MalformedPayload("extension handshake"));
                }
                let removed = payload.split_to(removed_len).to_vec();
                Message::ExtensionHandshake { added, removed, extra: payload.freeze() }
            },
            21 => {
                if payload.remaining() < 1 {
                    return Err(PeerError::MalformedPayload("extension message"));
                }
                let ext_id = payload.get_u8();
                Message::ExtensionMessage { id: ext_id, payload: payload.freeze() }
            },
            22 => {
                if payload.remaining() < 8 {
                    return Err(PeerError::MalformedPayload("piece"));
                }
                let piece = payload.get_u32();
                let offset = payload.get_u32();
                let chain = Self::get_hash_chain(&mut payload)?;
                Message::Piece(PieceMessage {
                    style: PieceStyle::Merkle,
                    piece,
                    offset,
                    view_length: None,
                    hash_chain: Some(chain),
                    data: payload.freeze(),
                })
            },
            23 => {
                if payload.remaining() < 16 {
                    return Err(PeerError::MalformedPayload("piece"));
                }
                let piece = payload.get_u32();
                let offset = payload.get_u32();
                let view_length = payload.get_u64();
                let chain = Self::get_hash_chain(&mut payload)?;
                Message::Piece(PieceMessage {
                    style: PieceStyle::Elastic,
                    piece,
                    offset,
                    view_length: Some(view_length),
                    hash_chain: Some(chain),
                    data: payload.freeze(),
                })
            },
            24 => {
                if payload.remaining() < 8 {
                    return Err(PeerError::MalformedPayload("view signature"));
                }
                let view_length = payload.get_u64();
                Message::ElasticSignature(ViewSignature { view_length, signature: payload.freeze() })
            },
            25 => Message::ElasticBitfield(Bitfield::from_vec(payload.to_vec())),
            26 => Message::ResourceDirectory(payload.freeze()),
            27 => Message::ResourceSubscribe(payload.freeze()),
            id => {
                tracing::trace!("ignoring unknown message id: {}", id);
                Message::Unknown { id }
            },
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { piece } => write!(f, "have piece {}", piece),
            Message::Bitfield(bits) => write!(f, "bitfield with {} pieces", bits.count_ones()),
            Message::Request(desc) => write!(f, "request for block {}", desc),
            Message::Piece(piece) => write!(
                f,
                "{} block {{ piece: {}, offset: {}, len: {} }}",
                piece.style,
                piece.piece,
                piece.offset,
                piece.data.len(),
            ),
            Message::Cancel(desc) => write!(f, "cancel for block {}", desc),
            Message::Suggest { piece } => write!(f, "suggest piece {}", piece),
            Message::HaveAll => write!(f, "have all"),
            Message::HaveNone => write!(f, "have none"),
            Message::Reject(desc) => write!(f, "reject for block {}", desc),
            Message::AllowedFast { piece } => write!(f, "allowed fast piece {}", piece),
            Message::ExtensionHandshake { added, removed, .. } => {
                write!(f, "extension handshake +{:?} -{:?}", added, removed)
            },
            Message::ExtensionMessage { id, payload } => {
                write!(f, "extension message id {} of {} bytes", id, payload.len())
            },
            Message::ElasticSignature(sig) => write!(f, "view signature for length {}", sig.view_length),
            Message::ElasticBitfield(bits) => write!(f, "elastic bitfield with {} pieces", bits.count_ones()),
            Message::ResourceDirectory(_) => write!(f, "resource directory"),
            Message::ResourceSubscribe(_) => write!(f, "resource subscribe"),
            Message::Unknown { id } => write!(f, "unknown message id {}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;
    use rand::Rng;

    fn roundtrip(fast: bool, messages: Vec<Message>) {
        let mut encoder = MessageCodec::new(fast);
        let mut decoder = MessageCodec::new(fast);
        let mut wire = BytesMut::new();
        for msg in &messages {
            encoder.encode(msg.clone(), &mut wire).unwrap();
        }
        for msg in messages {
            let decoded = decoder.decode(&mut wire).unwrap().unwrap();
            assert_eq!(decoded, msg);
        }
        assert_eq!(decoder.decode(&mut wire).unwrap(), None);
    }

    #[test]
    fn test_base_message_stream() {
        let mut data = vec![0; 64];
        rand::thread_rng().fill(&mut data[..]);

        roundtrip(false, vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece: 0xb },
            Message::Bitfield(BitVec::<u8, Msb0>::from_slice(&[0x1, 0x2, 0x3])),
            Message::Request(BlockDescriptor::new(0xb, 0x4000, 0x4000)),
            Message::Piece(PieceMessage {
                style: PieceStyle::Base,
                piece: 0xb,
                offset: 0x4000,
                view_length: None,
                hash_chain: None,
                data: Bytes::from(data),
            }),
            Message::Cancel(BlockDescriptor::new(0xb, 0x4000, 0x4000)),
        ]);
    }

    #[test]
    fn test_fast_and_extension_message_stream() {
        roundtrip(true, vec![
            Message::HaveNone,
            Message::Suggest { piece: 3 },
            Message::Reject(BlockDescriptor::new(1, 0, 0x4000)),
            Message::AllowedFast { piece: 2 },
            Message::ExtensionHandshake {
                added: vec![1, 2],
                removed: vec![3],
                extra: Bytes::from_static(b"x"),
            },
            Message::ExtensionMessage { id: 7, payload: Bytes::from_static(b"payload") },
        ]);
    }

    #[test]
    fn test_elastic_message_stream() {
        roundtrip(true, vec![
            Message::HaveNone,
            Message::ElasticSignature(ViewSignature {
                view_length: 1 << 20,
                signature: Bytes::from_static(&[0x5a; 64]),
            }),
            Message::ElasticBitfield(BitVec::<u8, Msb0>::from_slice(&[0xf0])),
            Message::Piece(PieceMessage {
                style: PieceStyle::Elastic,
                piece: 4,
                offset: 0,
                view_length: Some(1 << 20),
                hash_chain: Some(HashChain { hashes: vec![[1; 20], [2; 20]] }),
                data: Bytes::from_static(&[9; 32]),
            }),
            Message::Piece(PieceMessage {
                style: PieceStyle::Merkle,
                piece: 5,
                offset: 0,
                view_length: None,
                hash_chain: Some(HashChain { hashes: vec![[3; 20]] }),
                data: Bytes::from_static(&[7; 16]),
            }),
        ]);
    }

    #[test]
    fn test_decode_chunked() {
        let mut decoder = MessageCodec::new(false);
        let mut wire = BytesMut::new();

        // Half of an interested message.
        wire.extend_from_slice(&[0, 0, 0]);
        assert_eq!(decoder.decode(&mut wire).unwrap(), None);
        // The other half.
        wire.extend_from_slice(&[1, 2]);
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(Message::Interested));

        // A piece message split inside its block data.
        wire.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1]);
        assert_eq!(decoder.decode(&mut wire).unwrap(), None);
        wire.extend_from_slice(&[0x2, 0x3]);
        let decoded = decoder.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, Message::Piece(PieceMessage {
            style: PieceStyle::Base,
            piece: 0xb,
            offset: 0x134000,
            view_length: None,
            hash_chain: None,
            data: Bytes::from_static(&[0x1, 0x2, 0x3]),
        }));
    }

    #[test]
    fn test_decode_unknown_id_ignored() {
        let mut decoder = MessageCodec::new(false);
        let mut wire = BytesMut::from(&[0u8, 0, 0, 3, 99, 1, 2][..]);
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(Message::Unknown { id: 99 }));
        // The payload must have been consumed with the frame.
        assert_eq!(decoder.decode(&mut wire).unwrap(), None);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_decode_fast_without_negotiation() {
        let mut decoder = MessageCodec::new(false);
        let mut wire = BytesMut::from(&[0u8, 0, 0, 1, 14][..]);
        assert!(matches!(decoder.decode(&mut wire), Err(PeerError::FastNotNegotiated(14))));
    }

    #[test]
    fn test_decode_late_have_all() {
        let mut decoder = MessageCodec::new(true);
        let mut wire = BytesMut::new();
        // Have-all is fine as the very first message.
        wire.extend_from_slice(&[0, 0, 0, 1, 14]);
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(Message::HaveAll));
        // But not afterwards.
        wire.extend_from_slice(&[0, 0, 0, 1, 15]);
        assert!(matches!(decoder.decode(&mut wire), Err(PeerError::LateHaveMessage)));
    }

    #[test]
    fn test_decode_oversized_frame() {
        let mut decoder = MessageCodec::new(false);
        let mut wire = BytesMut::from(&[0x7fu8, 0xff, 0xff, 0xff][..]);
        assert!(matches!(decoder.decode(&mut wire), Err(PeerError::FrameTooLarge(_))));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let mut decoder = MessageCodec::new(false);
        // A request frame with only 8 payload bytes instead of 12.
        let mut wire = BytesMut::from(&[0u8, 0, 0, 9, 6, 0, 0, 0, 1, 0, 0, 0, 2][..]);
        assert!(matches!(decoder.decode(&mut wire), Err(PeerError::MalformedPayload("request"))));
    }
}
