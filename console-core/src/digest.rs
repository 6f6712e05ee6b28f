/// Rolling SHA-256 over a firmware image plus hex helpers for the upload header
use sha2::{Digest as _, Sha256};

pub const DIGEST_LEN: usize = 32;

pub type Digest = [u8; DIGEST_LEN];

/// Digest accumulator fed one chunk at a time
#[derive(Clone, Default)]
pub struct ImageHasher {
    inner: Sha256,
    bytes: u64,
}

impl ImageHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> Digest {
        self.inner.finalize().into()
    }
}

pub fn sha256(data: &[u8]) -> Digest {
    Sha256::digest(data).into()
}

/// Parse 64 hex characters, upper or lower case. Surrounding whitespace is
/// tolerated; anything else is rejected.
pub fn parse_hex_digest(text: &str) -> Option<Digest> {
    let text = text.trim().as_bytes();
    if text.len() != DIGEST_LEN * 2 {
        return None;
    }
    let mut out = [0u8; DIGEST_LEN];
    for (byte, pair) in out.iter_mut().zip(text.chunks_exact(2)) {
        *byte = (hex_value(pair[0])? << 4) | hex_value(pair[1])?;
    }
    Some(out)
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

pub fn to_hex(digest: &[u8]) -> String {
    use core::fmt::Write;
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
