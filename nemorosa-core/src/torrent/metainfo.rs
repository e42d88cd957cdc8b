use crate::torrent::errors::{Result, TorrentError};
use crate::torrent::info_hash::{InfoHash, Sha1Hash};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use std::fmt::{Debug, Formatter};
use std::ops::Range;
use std::path::PathBuf;

/// The metainfo key of the info dictionary.
const INFO_KEY: &[u8] = b"info";
/// The metainfo key of the source flag within the info dictionary.
const SOURCE_KEY: &[u8] = b"source";

/// The file info of a single file within a torrent's info dictionary.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TorrentFileInfo {
    /// Length of the file in bytes.
    pub length: u64,
    /// Path of the file, one element for each directory level.
    #[serde(default)]
    pub path: Option<Vec<String>>,
    /// The utf-8 representation path of the file.
    #[serde(rename = "path.utf-8", default)]
    pub path_utf8: Option<Vec<String>>,
}

impl TorrentFileInfo {
    /// Get the path components of the torrent file.
    ///
    /// # Returns
    ///
    /// Returns either the utf8 representation of the path or the normal path.
    pub fn path(&self) -> Vec<String> {
        self.path_utf8
            .clone()
            .or_else(|| self.path.clone())
            .unwrap_or_default()
    }
}

/// The typed projection of a torrent's info dictionary.
#[derive(Clone, Deserialize, PartialEq)]
pub struct TorrentMetadata {
    /// Length of each piece in bytes.
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    /// The concatenated SHA1 piece digests of the torrent.
    #[serde(with = "serde_bytes", default)]
    pub pieces: Vec<u8>,
    /// Name of the torrent file or directory.
    pub name: String,
    /// Name of the torrent in UTF-8 format.
    #[serde(rename = "name.utf-8", default)]
    pub name_utf8: Option<String>,
    /// Flag indicating if the torrent is private, see BEP27.
    #[serde(default)]
    pub private: Option<i64>,
    /// The tracker source flag of the torrent.
    #[serde(default)]
    pub source: Option<String>,
    /// The total length for a single file torrent.
    #[serde(default)]
    pub length: Option<u64>,
    /// The file list for a multi file torrent.
    #[serde(default)]
    pub files: Option<Vec<TorrentFileInfo>>,
}

impl TorrentMetadata {
    /// Get the name of the torrent, preferring the utf8 representation.
    pub fn name(&self) -> String {
        self.name_utf8.clone().unwrap_or_else(|| self.name.clone())
    }

    /// Converts the pieces of the torrent into a vector of SHA1 hashes.
    pub fn sha1_pieces(&self) -> Vec<Sha1Hash> {
        self.pieces
            .as_slice()
            .chunks_exact(20)
            .map(|e| e.try_into().unwrap())
            .collect()
    }
}

impl Debug for TorrentMetadata {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentMetadata")
            .field("piece_length", &self.piece_length)
            .field("pieces", &self.pieces.len())
            .field("name", &self.name)
            .field("name_utf8", &self.name_utf8)
            .field("private", &self.private)
            .field("source", &self.source)
            .field("length", &self.length)
            .field("files", &self.files.as_ref().map(|e| e.len()))
            .finish()
    }
}

/// A file entry of a torrent with its resolved relative path and cumulative offset.
///
/// Single file torrents yield exactly one synthetic entry whose path equals the
/// torrent name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TorrentFileEntry {
    /// The relative path of the file below the torrent root.
    pub path: PathBuf,
    /// The length of the file in bytes.
    pub length: u64,
    /// The cumulative byte offset of the file within the torrent data.
    pub offset: u64,
}

/// The piece coverage of a file, a piece index with the byte range the file
/// occupies within that piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceCoverage {
    /// The index of the piece.
    pub piece: usize,
    /// The byte range within the piece which belongs to the file.
    pub range: Range<u64>,
}

/// The parsed metainfo of a .torrent file.
///
/// The original bencode document is kept as a raw [Value] so that re-emission
/// preserves keys this model doesn't know about, which keeps the recomputed
/// info hash faithful to the original file.
#[derive(Clone, PartialEq)]
pub struct Metainfo {
    /// The raw bencode document of the torrent file.
    root: Value,
    /// The typed projection of the info dictionary.
    info: TorrentMetadata,
    /// The info hash calculated over the canonical encoding of the info dictionary.
    info_hash: InfoHash,
}

impl Metainfo {
    /// Get the info hash of the torrent.
    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    /// Get the typed info dictionary of the torrent.
    pub fn info(&self) -> &TorrentMetadata {
        &self.info
    }

    /// Get the name of the torrent.
    pub fn name(&self) -> String {
        self.info.name()
    }

    /// Get the piece length of the torrent in bytes.
    pub fn piece_length(&self) -> u64 {
        self.info.piece_length
    }

    /// Get the SHA1 piece hashes of the torrent.
    pub fn sha1_pieces(&self) -> Vec<Sha1Hash> {
        self.info.sha1_pieces()
    }

    /// Get the source flag of the torrent if present.
    pub fn source(&self) -> Option<&str> {
        self.info.source.as_deref()
    }

    /// Get the announce url of the torrent if present.
    pub fn announce(&self) -> Option<String> {
        self.root_dict()
            .and_then(|dict| dict.get(b"announce".as_slice()))
            .and_then(|value| match value {
                Value::Bytes(bytes) => String::from_utf8(bytes.clone()).ok(),
                _ => None,
            })
    }

    /// Get all tracker urls of the torrent, the announce url first,
    /// followed by the flattened announce list in declared order.
    pub fn trackers(&self) -> Vec<String> {
        let mut trackers = Vec::new();

        if let Some(announce) = self.announce() {
            trackers.push(announce);
        }
        if let Some(Value::List(tiers)) = self
            .root_dict()
            .and_then(|dict| dict.get(b"announce-list".as_slice()))
        {
            for tier in tiers {
                if let Value::List(urls) = tier {
                    for url in urls {
                        if let Value::Bytes(bytes) = url {
                            if let Ok(url) = String::from_utf8(bytes.clone()) {
                                trackers.push(url);
                            }
                        }
                    }
                }
            }
        }

        trackers.into_iter().unique().collect()
    }

    /// Get the ordered file entries of the torrent with their cumulative offsets.
    ///
    /// # Returns
    ///
    /// Returns the declared files for a multi file torrent, or a single synthetic
    /// entry for a single file torrent.
    pub fn files(&self) -> Vec<TorrentFileEntry> {
        let mut offset = 0u64;

        if let Some(files) = self.info.files.as_ref() {
            files
                .iter()
                .map(|file| {
                    let entry = TorrentFileEntry {
                        path: file.path().iter().collect(),
                        length: file.length,
                        offset,
                    };
                    offset += file.length;
                    entry
                })
                .collect()
        } else {
            vec![TorrentFileEntry {
                path: PathBuf::from(self.info.name()),
                length: self.info.length.unwrap_or_default(),
                offset: 0,
            }]
        }
    }

    /// Get the file entries with their paths rooted below the torrent name.
    ///
    /// Multi file torrents store their data below a directory named after the
    /// torrent, so these are the paths as they appear under the client save path.
    pub fn files_rooted(&self) -> Vec<TorrentFileEntry> {
        let mut files = self.files();

        if self.info.files.is_some() {
            let root = PathBuf::from(self.info.name());
            for file in files.iter_mut() {
                file.path = root.join(file.path.as_path());
            }
        }

        files
    }

    /// Get the total size of the torrent data in bytes.
    pub fn total_size(&self) -> u64 {
        self.files().iter().map(|e| e.length).sum()
    }

    /// Calculate the piece coverage of the file at the given index.
    ///
    /// # Returns
    ///
    /// Returns the pieces the file contributes to, each with the byte range the
    /// file occupies within that piece, or an error when the index is out of bounds.
    pub fn pieces_for_file(&self, index: usize) -> Result<Vec<PieceCoverage>> {
        let files = self.files();
        let file = files.get(index).ok_or_else(|| {
            TorrentError::InvalidMetadata(format!("file index {} is out of bounds", index))
        })?;
        let piece_length = self.info.piece_length;

        if piece_length == 0 {
            return Err(TorrentError::InvalidMetadata(
                "piece length is zero".to_string(),
            ));
        }
        if file.length == 0 {
            return Ok(Vec::new());
        }

        let first_piece = file.offset / piece_length;
        let last_piece = (file.offset + file.length - 1) / piece_length;

        Ok((first_piece..=last_piece)
            .map(|piece| {
                let piece_start = piece * piece_length;
                let start = file.offset.max(piece_start) - piece_start;
                let end = (file.offset + file.length).min(piece_start + piece_length) - piece_start;
                PieceCoverage {
                    piece: piece as usize,
                    range: start..end,
                }
            })
            .collect())
    }

    /// Re-emit the torrent as canonical bencode bytes.
    ///
    /// Dictionaries are emitted with sorted keys and integers in their minimal
    /// encoding, so `parse(emit(m)) == m` and the info hash is reproducible.
    pub fn emit(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(&self.root).map_err(TorrentError::from)
    }

    /// Create a new metainfo with the `source` key of the info dictionary set to
    /// the given flag, replacing any existing value.
    ///
    /// All other info dictionary keys are preserved, which makes the returned
    /// info hash exactly the one the target site expects for a cross-seed.
    pub fn with_source(&self, flag: &str) -> Result<Metainfo> {
        let mut root = self.root.clone();

        match &mut root {
            Value::Dict(dict) => match dict.get_mut(INFO_KEY) {
                Some(Value::Dict(info)) => {
                    info.insert(SOURCE_KEY.to_vec(), Value::Bytes(flag.as_bytes().to_vec()));
                }
                _ => {
                    return Err(TorrentError::InvalidMetadata(
                        "info dictionary is missing".to_string(),
                    ))
                }
            },
            _ => {
                return Err(TorrentError::InvalidMetadata(
                    "expected a bencode dictionary".to_string(),
                ))
            }
        }

        Self::try_from_value(root)
    }

    fn root_dict(&self) -> Option<&std::collections::HashMap<Vec<u8>, Value>> {
        match &self.root {
            Value::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    fn try_from_value(root: Value) -> Result<Self> {
        let info_value = match &root {
            Value::Dict(dict) => dict.get(INFO_KEY).ok_or_else(|| {
                TorrentError::InvalidMetadata("info dictionary is missing".to_string())
            })?,
            _ => {
                return Err(TorrentError::InvalidMetadata(
                    "expected a bencode dictionary".to_string(),
                ))
            }
        };

        // the canonical re-encoding of the info dict determines the info hash
        let info_bytes = serde_bencode::to_bytes(info_value)?;
        let info_hash = InfoHash::from_info_bytes(&info_bytes);
        let info: TorrentMetadata = serde_bencode::from_bytes(&info_bytes)?;

        if !info.pieces.is_empty() && info.pieces.len() % 20 != 0 {
            return Err(TorrentError::InvalidMetadata(
                "pieces is not a multiple of 20 bytes".to_string(),
            ));
        }
        if info.length.is_none() && info.files.is_none() {
            return Err(TorrentError::InvalidMetadata(
                "neither length nor files is present".to_string(),
            ));
        }

        Ok(Self {
            root,
            info,
            info_hash,
        })
    }
}

impl TryFrom<&[u8]> for Metainfo {
    type Error = TorrentError;

    /// Attempts to parse torrent metainfo from the given bencoded bytes.
    fn try_from(value: &[u8]) -> Result<Self> {
        let root: Value = serde_bencode::from_bytes(value)?;
        Self::try_from_value(root)
    }
}

impl Debug for Metainfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metainfo")
            .field("info", &self.info)
            .field("info_hash", &self.info_hash)
            .finish()
    }
}
