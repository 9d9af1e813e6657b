//! Key derivation: the 4-byte accumulator hash, URI-path resource keys
//! and peer/token transaction identifiers.

use std::sync::OnceLock;

use crate::pdu::{opts, Pdu};
use crate::peer::PeerAddress;

/// 4-byte hash key; resource keys compare byte-wise.
pub type Key = [u8; 4];

/// Engine-local identifier matching responses to outstanding requests.
/// Derived from (peer, token), stable across retransmissions and
/// independent of the wire message id.  Collisions are tolerated: queue
/// removal takes the first occurrence.
pub type TransactionId = u16;

/// Folds `data` into the accumulator `key`.  Deliberately cheap; this is
/// not a cryptographic hash and does not need to be one.
pub fn hash_bytes(data: &[u8], key: &mut Key) {
    for &byte in data {
        let mut j = key.len() - 1;
        while j > 0 {
            key[j] = ((key[j] << 7) | (key[j - 1] >> 1)).wrapping_add(key[j]);
            j -= 1;
        }
        key[0] = (key[0] << 7).wrapping_add(key[0]).wrapping_add(byte);
    }
}

/// Hashes a URI path string segment by segment, producing the same key as
/// hashing the corresponding sequence of Uri-Path option values.
pub fn hash_path(path: &[u8]) -> Key {
    let mut key = Key::default();
    for segment in path.split(|&b| b == b'/') {
        hash_bytes(segment, &mut key);
    }
    key
}

/// Resource key for a request: the hash of its Uri-Path option sequence.
pub fn request_uri_key(pdu: &Pdu) -> Key {
    let mut key = Key::default();
    for (number, value) in pdu.options() {
        if number == opts::URI_PATH {
            hash_bytes(value, &mut key);
        }
    }
    key
}

/// Derives the 16-bit transaction id from the peer address and the PDU's
/// token, folding the 4-byte hash down to 16 bits.
pub fn transaction_id(peer: &PeerAddress, pdu: &Pdu) -> TransactionId {
    let mut key = Key::default();
    peer.hash_into(&mut key);
    if let Some(token) = pdu.token() {
        hash_bytes(token, &mut key);
    }
    (u16::from(key[0]) << 8 | u16::from(key[1])) ^ (u16::from(key[2]) << 8 | u16::from(key[3]))
}

/// Path of the discovery resource.
pub const WELLKNOWN_PATH: &str = ".well-known/core";

/// Process-lifetime key of `.well-known/core`, computed on first use.
pub fn wellknown_key() -> Key {
    static KEY: OnceLock<Key> = OnceLock::new();
    *KEY.get_or_init(|| hash_path(WELLKNOWN_PATH.as_bytes()))
}
