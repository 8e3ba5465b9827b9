//! Shared helpers for unit tests.

use base64::Engine;

use crate::content::ByteStream;

pub(crate) use crate::content::sha256_hex;

/// An `Authorization` header value for HTTP Basic credentials.
pub fn basic_auth(user: &str, password: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
    format!("Basic {encoded}")
}

/// An in-memory body stream.
pub fn body(data: &[u8]) -> ByteStream {
    Box::pin(std::io::Cursor::new(data.to_vec()))
}
