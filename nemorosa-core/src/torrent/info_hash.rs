use crate::torrent::errors::{Result, TorrentError};
use hex::FromHex;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// Represent the v1 piece hash type of the BitTorrent protocol.
pub type Sha1Hash = [u8; 20];

/// The unique v1 (SHA1) identifier of a torrent's info dictionary.
///
/// Gazelle-family trackers identify torrents exclusively by their v1 hash,
/// so this wrapper doesn't carry a v2 digest.
#[derive(Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Calculate the info hash over the canonical bencoded info dictionary bytes.
    pub fn from_info_bytes<T: AsRef<[u8]>>(bytes: T) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes.as_ref());
        Self(hasher.finalize().into())
    }

    /// Get the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Get the hash as a lowercase hex encoded string.
    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    /// Parse a 40-character hex string, case-insensitive.
    fn from_str(value: &str) -> Result<Self> {
        <[u8; 20]>::from_hex(value.trim())
            .map(Self)
            .map_err(|e| TorrentError::InvalidInfoHash(e.to_string()))
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

impl Debug for InfoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "InfoHash({})", self.as_hex())
    }
}

impl Serialize for InfoHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_hex().as_str())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(InfoHashVisitor)
    }
}

struct InfoHashVisitor;

impl<'de> Visitor<'de> for InfoHashVisitor {
    type Value = InfoHash;

    fn expecting(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "a 40 character hex encoded info hash")
    }

    fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        InfoHash::from_str(v).map_err(serde::de::Error::custom)
    }
}
