use crate::client::{ClientError, TorrentClient};
use crate::normalize::{normalize, NormalizeProfile};
use crate::torrent::{InfoHash, Metainfo, Sha1Hash, TorrentError, TorrentFileEntry};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

/// The result type for all cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// The errors that can occur while maintaining the torrent info cache.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error("client error: {0}")]
    Client(ClientError),
    #[error("torrent error: {0}")]
    Torrent(TorrentError),
}

impl From<ClientError> for CacheError {
    fn from(error: ClientError) -> Self {
        Self::Client(error)
    }
}

impl From<TorrentError> for CacheError {
    fn from(error: TorrentError) -> Self {
        Self::Torrent(error)
    }
}

/// The cached projection of a torrent within the local client.
///
/// Created when the cache discovers the hash, replaced on refresh, removed when
/// the hash disappears from the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalTorrent {
    /// The info hash of the torrent.
    pub info_hash: InfoHash,
    /// The display name of the torrent.
    pub name: String,
    /// The piece length of the torrent in bytes.
    pub piece_length: u64,
    /// The SHA1 piece hashes of the torrent.
    pub pieces: Vec<Sha1Hash>,
    /// The file entries with paths rooted below the torrent name.
    pub files: Vec<TorrentFileEntry>,
    /// The directory the torrent data is stored in.
    pub save_path: PathBuf,
    /// The announce urls of the torrent.
    pub trackers: Vec<String>,
    /// The source flag of the torrent, if present.
    pub source: Option<String>,
    /// The canonical bencoded metainfo, kept for source flag hash derivation.
    #[serde(with = "serde_base64", default)]
    pub metainfo: Vec<u8>,
}

impl LocalTorrent {
    /// Create the projection of the given metainfo as held by the local client.
    pub fn new(
        metainfo: &Metainfo,
        metainfo_bytes: Vec<u8>,
        save_path: PathBuf,
        trackers: Vec<String>,
    ) -> Self {
        Self {
            info_hash: *metainfo.info_hash(),
            name: metainfo.name(),
            piece_length: metainfo.piece_length(),
            pieces: metainfo.sha1_pieces(),
            files: metainfo.files_rooted(),
            save_path,
            trackers,
            source: metainfo.source().map(|e| e.to_string()),
            metainfo: metainfo_bytes,
        }
    }

    /// Calculate the info hash this torrent would have with the given source
    /// flag in its info dictionary.
    ///
    /// # Returns
    ///
    /// Returns [None] when the metainfo bytes are unavailable or unparsable.
    pub fn with_source_hash(&self, flag: &str) -> Option<InfoHash> {
        if self.metainfo.is_empty() {
            return None;
        }

        Metainfo::try_from(self.metainfo.as_slice())
            .and_then(|e| e.with_source(flag))
            .map(|e| *e.info_hash())
            .map_err(|e| {
                warn!(
                    "Failed to derive source flag hash of {}, {}",
                    self.info_hash, e
                )
            })
            .ok()
    }

    /// The total size of the torrent data in bytes.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|e| e.length).sum()
    }

    /// The hosts of the announce urls of this torrent.
    pub fn tracker_hosts(&self) -> Vec<String> {
        self.trackers
            .iter()
            .filter_map(|e| Url::parse(e).ok())
            .filter_map(|e| e.host_str().map(|e| e.to_string()))
            .collect()
    }

    /// Check if this torrent announces to any of the given tracker hosts.
    /// An empty allow list matches every torrent.
    pub fn announces_to(&self, allowed: &[String]) -> bool {
        if allowed.is_empty() {
            return true;
        }

        self.tracker_hosts()
            .iter()
            .any(|host| allowed.iter().any(|e| host == e || host.ends_with(e)))
    }

    /// Check if any file of this torrent is an audio file.
    pub fn has_audio(&self) -> bool {
        self.files
            .iter()
            .any(|e| crate::matcher::is_audio_file(&e.path))
    }

    /// The loose normalized names this torrent is indexed under,
    /// the torrent name itself and the basename of its first file.
    fn index_names(&self) -> Vec<String> {
        let mut names = vec![normalize(self.name.as_str(), NormalizeProfile::Loose)];

        if let Some(first) = self.files.first() {
            let basename = first
                .path
                .file_name()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default();
            let normalized = normalize(basename.as_str(), NormalizeProfile::Loose);
            if !names.contains(&normalized) {
                names.push(normalized);
            }
        }

        names
    }
}

/// The added and removed hashes of a cache refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheDiff {
    pub added: Vec<InfoHash>,
    pub removed: Vec<InfoHash>,
}

#[derive(Debug, Default)]
struct InnerCache {
    /// The cached torrents by info hash.
    entries: HashMap<InfoHash, Arc<LocalTorrent>>,
    /// The auxiliary name index used by announce matching.
    by_name: HashMap<String, Vec<InfoHash>>,
}

impl InnerCache {
    fn insert(&mut self, torrent: LocalTorrent) {
        let torrent = Arc::new(torrent);
        for name in torrent.index_names() {
            let hashes = self.by_name.entry(name).or_default();
            if !hashes.contains(&torrent.info_hash) {
                hashes.push(torrent.info_hash);
            }
        }
        self.entries.insert(torrent.info_hash, torrent);
    }

    fn remove(&mut self, hash: &InfoHash) -> Option<Arc<LocalTorrent>> {
        let torrent = self.entries.remove(hash)?;
        for name in torrent.index_names() {
            if let Some(hashes) = self.by_name.get_mut(&name) {
                hashes.retain(|e| e != hash);
                if hashes.is_empty() {
                    self.by_name.remove(&name);
                }
            }
        }
        Some(torrent)
    }
}

/// The local index of the torrents held by the client.
///
/// Lookups are constant time by hash and by loose normalized name, which is
/// what keeps announce matching within its deadline.
#[derive(Debug, Clone, Default)]
pub struct TorrentInfoCache {
    inner: Arc<RwLock<InnerCache>>,
}

impl TorrentInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a cache from previously persisted entries.
    pub fn from_entries(entries: Vec<LocalTorrent>) -> Self {
        let mut inner = InnerCache::default();
        for entry in entries {
            inner.insert(entry);
        }

        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// Get the cached torrent for the given hash.
    pub async fn get(&self, hash: &InfoHash) -> Option<Arc<LocalTorrent>> {
        self.inner.read().await.entries.get(hash).cloned()
    }

    /// Find a cached torrent by its loose normalized name and total size.
    ///
    /// # Arguments
    ///
    /// * `name` - The name to look up, normalized internally.
    /// * `size` - The expected total size, ignored when [None].
    pub async fn by_name(&self, name: &str, size: Option<u64>) -> Option<Arc<LocalTorrent>> {
        let normalized = normalize(name, NormalizeProfile::Loose);
        let inner = self.inner.read().await;

        inner
            .by_name
            .get(&normalized)?
            .iter()
            .filter_map(|hash| inner.entries.get(hash))
            .find(|torrent| size.map(|e| torrent.total_size() == e).unwrap_or(true))
            .cloned()
    }

    /// Get all cached torrents.
    pub async fn all(&self) -> Vec<Arc<LocalTorrent>> {
        self.inner.read().await.entries.values().cloned().collect()
    }

    /// Get all cached torrents which announce to one of the allowed tracker hosts.
    /// When no allow list is given, every torrent is returned.
    pub async fn all_filtered(&self, allowed: Option<&Vec<String>>) -> Vec<Arc<LocalTorrent>> {
        self.inner
            .read()
            .await
            .entries
            .values()
            .filter(|e| {
                allowed
                    .map(|allowed| e.announces_to(allowed.as_slice()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// The number of cached torrents.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// Insert the given torrent into the cache.
    pub async fn insert(&self, torrent: LocalTorrent) {
        self.inner.write().await.insert(torrent);
    }

    /// Remove the given hash from the cache.
    pub async fn remove(&self, hash: &InfoHash) {
        self.inner.write().await.remove(hash);
    }

    /// Drop every cached entry.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.by_name.clear();
    }

    /// Snapshot the cached entries for persistence.
    pub async fn snapshot(&self) -> Vec<LocalTorrent> {
        self.inner
            .read()
            .await
            .entries
            .values()
            .map(|e| (**e).clone())
            .collect()
    }

    /// Refresh the cache against the current client state.
    ///
    /// Newly appeared hashes are fetched and indexed, disappeared hashes are
    /// dropped. Metainfo is only fetched for added hashes; a torrent whose
    /// metainfo can't be retrieved is skipped with a warning and retried on the
    /// next refresh.
    ///
    /// # Returns
    ///
    /// Returns the added and removed hashes of this refresh.
    pub async fn refresh(&self, client: &dyn TorrentClient) -> Result<CacheDiff> {
        let client_hashes: HashSet<InfoHash> = client.list_hashes().await?.into_iter().collect();
        let cached_hashes: HashSet<InfoHash> = {
            let inner = self.inner.read().await;
            inner.entries.keys().copied().collect()
        };

        let mut diff = CacheDiff::default();

        for hash in cached_hashes.difference(&client_hashes) {
            self.inner.write().await.remove(hash);
            diff.removed.push(*hash);
        }

        for hash in client_hashes.difference(&cached_hashes) {
            match Self::fetch(client, hash).await {
                Ok(torrent) => {
                    self.inner.write().await.insert(torrent);
                    diff.added.push(*hash);
                }
                Err(e) => warn!("Failed to cache torrent {}, {}", hash, e),
            }
        }

        if !diff.added.is_empty() || !diff.removed.is_empty() {
            debug!(
                "Cache refreshed, {} added and {} removed",
                diff.added.len(),
                diff.removed.len()
            );
        }

        Ok(diff)
    }

    async fn fetch(client: &dyn TorrentClient, hash: &InfoHash) -> Result<LocalTorrent> {
        trace!("Fetching metainfo of torrent {}", hash);
        let info = client.get_info(hash).await?;
        let metainfo_bytes = client.get_metainfo(hash).await?;
        let metainfo = Metainfo::try_from(metainfo_bytes.as_slice())?;

        Ok(LocalTorrent::new(
            &metainfo,
            metainfo_bytes,
            info.save_path,
            info.trackers,
        ))
    }
}

mod serde_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(STANDARD.encode(bytes).as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        STANDARD.decode(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockTorrentClient;
    use crate::init_logger;
    use crate::testing::hash_pieces;

    pub fn local_torrent(name: &str, files: &[(&str, u64)]) -> LocalTorrent {
        let piece_length = 32u64;
        let total: u64 = files.iter().map(|(_, len)| len).sum();
        let content = vec![1u8; total as usize];
        let mut offset = 0u64;

        LocalTorrent {
            info_hash: InfoHash::from_info_bytes(name.as_bytes()),
            name: name.to_string(),
            piece_length,
            pieces: hash_pieces(&content, piece_length as usize),
            files: files
                .iter()
                .map(|(path, length)| {
                    let entry = TorrentFileEntry {
                        path: PathBuf::from(path),
                        length: *length,
                        offset,
                    };
                    offset += length;
                    entry
                })
                .collect(),
            save_path: PathBuf::from("/data"),
            trackers: vec!["https://flacsfor.me/abc/announce".to_string()],
            source: None,
            metainfo: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_cache_lookup_by_name() {
        init_logger!();
        let cache = TorrentInfoCache::new();
        let torrent = local_torrent("My\u{200B} Album", &[("My Album/01.flac", 100)]);
        let hash = torrent.info_hash;
        cache.insert(torrent).await;

        // the zero width space is folded away by the loose profile
        let result = cache.by_name("my album", Some(100)).await;
        assert_eq!(Some(hash), result.map(|e| e.info_hash));

        let result = cache.by_name("my album", Some(999)).await;
        assert_eq!(None, result, "expected the size filter to apply");

        let result = cache.by_name("unknown", None).await;
        assert_eq!(None, result);
    }

    #[tokio::test]
    async fn test_cache_all_filtered() {
        init_logger!();
        let cache = TorrentInfoCache::new();
        cache
            .insert(local_torrent("Album A", &[("Album A/01.flac", 10)]))
            .await;
        let mut other = local_torrent("Album B", &[("Album B/01.flac", 10)]);
        other.trackers = vec!["https://other.example.org/announce".to_string()];
        cache.insert(other).await;

        let allowed = vec!["flacsfor.me".to_string()];
        let result = cache.all_filtered(Some(&allowed)).await;

        assert_eq!(1, result.len());
        assert_eq!("Album A", result[0].name);

        assert_eq!(2, cache.all_filtered(None).await.len());
    }

    #[tokio::test]
    async fn test_cache_refresh_diff() {
        init_logger!();
        let existing = local_torrent("Album A", &[("Album A/01.flac", 10)]);
        let existing_hash = existing.info_hash;
        let cache = TorrentInfoCache::from_entries(vec![existing]);

        let added_bytes =
            crate::testing::multi_file_torrent("Album B", 32, &[("01.flac", &[1u8; 64])], None);
        let added_metainfo = Metainfo::try_from(added_bytes.as_slice()).unwrap();
        let added_hash = *added_metainfo.info_hash();

        let mut client = MockTorrentClient::new();
        client
            .expect_list_hashes()
            .returning(move || Ok(vec![added_hash]));
        client.expect_get_info().returning(move |hash| {
            Ok(crate::client::ClientTorrentInfo {
                info_hash: *hash,
                name: "Album B".to_string(),
                save_path: PathBuf::from("/data"),
                trackers: vec![],
                label: None,
            })
        });
        let bytes = added_bytes.clone();
        client
            .expect_get_metainfo()
            .returning(move |_| Ok(bytes.clone()));

        let diff = cache.refresh(&client).await.unwrap();

        assert_eq!(vec![added_hash], diff.added);
        assert_eq!(vec![existing_hash], diff.removed);
        assert!(cache.get(&added_hash).await.is_some());
        assert!(cache.get(&existing_hash).await.is_none());
    }

    #[test]
    fn test_local_torrent_announces_to() {
        let torrent = local_torrent("Album", &[("Album/01.flac", 10)]);

        assert!(torrent.announces_to(&[]));
        assert!(torrent.announces_to(&["flacsfor.me".to_string()]));
        assert!(!torrent.announces_to(&["home.opsfet.ch".to_string()]));
    }
}
