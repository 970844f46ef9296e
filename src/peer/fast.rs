use std::net::IpAddr;
use sha1::{Digest, Sha1};

// Derive the Allowed Fast set for a peer: the pieces it may request from us
// even while choked. Both ends compute the same set without negotiation, so
// the derivation is fixed: hash the peer's IPv4 address (last octet zeroed)
// concatenated with the info hash, then walk 4-byte windows of the digest,
// re-hashing until `count` distinct piece indices have been drawn. Insertion
// order is preserved. Peers on other address families get no set.
pub fn allowed_fast_set(addr: &IpAddr, info_hash: &[u8; 20], num_pieces: u32, count: u32) -> Vec<u32> {

    let IpAddr::V4(v4) = addr else {
        return Vec::new();
    };
    if num_pieces == 0 {
        return Vec::new();
    }
    let count = count.min(num_pieces) as usize;

    let octets = v4.octets();
    let mut seed = [0; 24];
    seed[..4].copy_from_slice(&[octets[0], octets[1], octets[2], 0]);
    seed[4..].copy_from_slice(info_hash);

    let mut digest: [u8; 20] = Sha1::digest(seed).into();
    let mut set = Vec::with_capacity(count);
    while set.len() < count {
        for window in digest.chunks_exact(4) {
            if set.len() == count {
                break;
            }
            let value = u32::from_be_bytes([window[0], window[1], window[2], window[3]]);
            let piece = value % num_pieces;
            if !set.contains(&piece) {
                set.push(piece);
            }
        }
        if set.len() < count {
            digest = Sha1::digest(digest).into();
        }
    }
    set
}
