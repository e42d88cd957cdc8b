use thiserror::Error;

/// The result type for the torrent package.
pub type Result<T> = std::result::Result<T, TorrentError>;

/// The errors that can occur while working with torrent metainfo.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TorrentError {
    /// Failed to parse the bencoded torrent data.
    #[error("failed to parse torrent data, {0}")]
    Parse(String),
    /// The metadata of the torrent is incomplete or inconsistent.
    #[error("the metadata of the torrent is invalid, {0}")]
    InvalidMetadata(String),
    /// The provided info hash is invalid.
    #[error("the provided info hash is invalid, {0}")]
    InvalidInfoHash(String),
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(error: serde_bencode::Error) -> Self {
        Self::Parse(error.to_string())
    }
}
