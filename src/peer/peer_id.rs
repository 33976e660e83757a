use std::fmt::{self, Write as _};

use rand::Rng as _;

use crate::constants::CLIENT_PREFIX;

/// A 20-byte peer identifier in the Azureus convention: `-RS0001-`
/// followed by twelve random bytes.
///
/// `Display` renders the percent-encoded form that announce URLs carry, so
/// tracker code can format the id straight into a query string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        let (tag, noise) = id.split_at_mut(CLIENT_PREFIX.len());
        tag.copy_from_slice(CLIENT_PREFIX.as_bytes());
        rand::rng().fill(noise);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Client code and version digits when the id follows the Azureus
    /// `-XXnnnn-` convention.
    pub fn azureus_style(&self) -> Option<(&str, &str)> {
        if self.0[0] != b'-' || self.0[7] != b'-' {
            return None;
        }
        let code = std::str::from_utf8(&self.0[1..3]).ok()?;
        let version = std::str::from_utf8(&self.0[3..7]).ok()?;
        if !code.bytes().all(|b| b.is_ascii_alphanumeric())
            || !version.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        Some((code, version))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.azureus_style() {
            Some((code, version)) => write!(f, "PeerId({code}/{version})"),
            None => write!(f, "PeerId({:02x?})", &self.0[..8]),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in &self.0 {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
                f.write_char(byte as char)?;
            } else {
                write!(f, "%{byte:02X}")?;
            }
        }
        Ok(())
    }
}
