use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::OsRng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of a Curve25519 key in bytes.
pub const KEY_LEN: usize = 32;

/// A WireGuard Curve25519 key (private or public).
///
/// The all-zero value is never a usable key; it stands for "no key" on the
/// wire and in upstream updates. The canonical text form is standard base64,
/// the same encoding `wg(8)` uses.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// The all-zero "no key" value.
    pub const ZERO: Key = Key([0u8; KEY_LEN]);

    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }

    /// Generates a fresh private key from the OS RNG.
    pub fn generate_private() -> Self {
        Self(StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    /// Derives the public key, treating `self` as a private key.
    pub fn public(&self) -> Self {
        let secret = StaticSecret::from(self.0);
        Self(PublicKey::from(&secret).to_bytes())
    }

    /// Generates a `(private, public)` keypair.
    pub fn generate_keypair() -> (Self, Self) {
        let private = Self::generate_private();
        let public = private.public();
        (private, public)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64.encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", BASE64.encode(self.0))
    }
}

/// Error parsing the base64 text form of a [`Key`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("invalid base64: {0}")]
    InvalidBase64(String),

    #[error("invalid key length {0}, expected {KEY_LEN} bytes")]
    InvalidLength(usize),
}

impl FromStr for Key {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| KeyParseError::InvalidBase64(e.to_string()))?;
        let bytes: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyParseError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
