//! HTTP upgrade handshake support.

pub mod headers;
pub(crate) mod server;

use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::{Digest, Sha1};

/// Limit the number of header lines.
pub(crate) const MAX_HEADERS: usize = 124;

/// Limit the total size of the request head.
pub(crate) const MAX_HEAD_BYTES: usize = 64 * 1024;

/// The GUID from RFC 6455 that proves the server understood the upgrade.
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Turns a `Sec-WebSocket-Key` into a `Sec-WebSocket-Accept`.
pub fn derive_accept_key(client_key: &[u8]) -> String {
    // ... field is constructed by concatenating /key/ ...
    // ... with the string "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" (RFC 6455)
    let mut sha1 = Sha1::new();
    sha1.update(client_key);
    sha1.update(WS_GUID);
    STANDARD.encode(sha1.finalize())
}
