//! Versioned binary frames for the provisioning channel and the upload headers
//!
//! Every frame starts with a version byte, read before anything else, so a
//! newer companion app and an older console can tell each other apart. Field
//! widths and order are explicit; nothing depends on in-memory layout.
//!
//! Status frame v1 (read + notify, 4 bytes):
//!   [version][state tag][error code or 0][percent]
//! Credentials frame v1 (write-only):
//!   [version][ssid len][ssid bytes][secret len][secret bytes]
//! Address frame (read + notify, 4 bytes): IPv4 octets in network order

use core::fmt;
use std::net::Ipv4Addr;

use crate::bridge::{Credentials, CredentialsError};
use crate::digest::{parse_hex_digest, Digest};
use crate::error::ErrorCode;
use crate::state::OtaState;

pub const STATUS_FRAME_VERSION: u8 = 1;
pub const STATUS_FRAME_LEN: usize = 4;
pub const CREDENTIALS_FRAME_VERSION: u8 = 1;

/// Upload header carrying the image size in decimal bytes
pub const SIZE_HEADER: &str = "X-Firmware-Size";
/// Upload header carrying the SHA-256 of the image as 64 hex characters
pub const DIGEST_HEADER: &str = "X-Firmware-Sha256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    Empty,
    UnsupportedVersion(u8),
    Truncated { expected: usize, actual: usize },
    UnknownState(u8),
    UnknownError(u8),
    Credentials(CredentialsError),
    MissingHeader(&'static str),
    InvalidSize(String),
    InvalidDigest,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Empty => write!(f, "empty frame"),
            WireError::UnsupportedVersion(v) => write!(f, "unsupported frame version {}", v),
            WireError::Truncated { expected, actual } => {
                write!(f, "frame truncated: need {} bytes, got {}", expected, actual)
            }
            WireError::UnknownState(tag) => write!(f, "unknown state tag {}", tag),
            WireError::UnknownError(code) => write!(f, "unknown error code {}", code),
            WireError::Credentials(e) => write!(f, "invalid credentials: {}", e),
            WireError::MissingHeader(name) => write!(f, "missing header {}", name),
            WireError::InvalidSize(raw) => write!(f, "invalid firmware size '{}'", raw),
            WireError::InvalidDigest => write!(f, "digest header is not 64 hex characters"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<CredentialsError> for WireError {
    fn from(e: CredentialsError) -> Self {
        WireError::Credentials(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPacket {
    pub state: OtaState,
    pub percent: u8,
}

impl StatusPacket {
    pub fn new(state: OtaState, percent: u8) -> Self {
        Self {
            state,
            percent: percent.min(100),
        }
    }

    pub fn encode(&self) -> [u8; STATUS_FRAME_LEN] {
        [
            STATUS_FRAME_VERSION,
            self.state.tag(),
            self.state.error().map(ErrorCode::as_u8).unwrap_or(0),
            self.percent,
        ]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let version = *bytes.first().ok_or(WireError::Empty)?;
        match version {
            STATUS_FRAME_VERSION => {
                if bytes.len() < STATUS_FRAME_LEN {
                    return Err(WireError::Truncated {
                        expected: STATUS_FRAME_LEN,
                        actual: bytes.len(),
                    });
                }
                let error = match bytes[2] {
                    0 => None,
                    raw => Some(ErrorCode::from_u8(raw).ok_or(WireError::UnknownError(raw))?),
                };
                let state =
                    OtaState::from_tag(bytes[1], error).ok_or(WireError::UnknownState(bytes[1]))?;
                Ok(Self::new(state, bytes[3]))
            }
            other => Err(WireError::UnsupportedVersion(other)),
        }
    }
}

pub fn encode_credentials(credentials: &Credentials) -> Vec<u8> {
    let ssid = credentials.ssid();
    let secret = credentials.secret();
    let mut frame = Vec::with_capacity(3 + ssid.len() + secret.len());
    frame.push(CREDENTIALS_FRAME_VERSION);
    frame.push(ssid.len() as u8);
    frame.extend_from_slice(ssid);
    frame.push(secret.len() as u8);
    frame.extend_from_slice(secret);
    frame
}

pub fn decode_credentials(bytes: &[u8]) -> Result<Credentials, WireError> {
    let version = *bytes.first().ok_or(WireError::Empty)?;
    if version != CREDENTIALS_FRAME_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let mut cursor = 1;
    let ssid = take_field(bytes, &mut cursor)?;
    let secret = take_field(bytes, &mut cursor)?;
    Ok(Credentials::new(ssid, secret)?)
}

fn take_field<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<&'a [u8], WireError> {
    let len = *bytes.get(*cursor).ok_or(WireError::Truncated {
        expected: *cursor + 1,
        actual: bytes.len(),
    })? as usize;
    let start = *cursor + 1;
    let end = start + len;
    let field = bytes.get(start..end).ok_or(WireError::Truncated {
        expected: end,
        actual: bytes.len(),
    })?;
    *cursor = end;
    Ok(field)
}

pub fn encode_address(address: Ipv4Addr) -> [u8; 4] {
    address.octets()
}

pub fn decode_address(bytes: &[u8]) -> Result<Ipv4Addr, WireError> {
    let octets: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(WireError::Truncated {
            expected: 4,
            actual: bytes.len(),
        })?;
    Ok(Ipv4Addr::from(octets))
}

/// Parsed `X-Firmware-Size` / `X-Firmware-Sha256` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadHeaders {
    pub size: u32,
    pub digest: Digest,
}

impl UploadHeaders {
    pub fn parse(size: Option<&str>, digest: Option<&str>) -> Result<Self, WireError> {
        let raw_size = size.ok_or(WireError::MissingHeader(SIZE_HEADER))?.trim();
        let size = raw_size
            .parse::<u32>()
            .map_err(|_| WireError::InvalidSize(raw_size.to_string()))?;
        let raw_digest = digest.ok_or(WireError::MissingHeader(DIGEST_HEADER))?;
        let digest = parse_hex_digest(raw_digest).ok_or(WireError::InvalidDigest)?;
        Ok(Self { size, digest })
    }
}
