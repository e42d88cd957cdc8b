use crate::client::{
    read_torrents_dir, ClientError, ClientTorrentInfo, ClientUrl, Result, TorrentClient,
    TorrentState, TorrentStatus,
};
use crate::torrent::InfoHash;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, trace};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;
use url::Url;

const SESSION_ID_HEADER: &str = "X-Transmission-Session-Id";
const DEFAULT_RPC_PATH: &str = "/transmission/rpc";

/// The Transmission RPC client adapter.
///
/// Transmission guards its RPC endpoint with a session id which is negotiated
/// through a 409 response and resent on every subsequent request.
#[derive(Debug)]
pub struct TransmissionClient {
    name: String,
    endpoint: Url,
    username: Option<String>,
    password: Option<String>,
    torrents_dir: Option<PathBuf>,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
}

impl TransmissionClient {
    pub fn new(url: &ClientUrl) -> Self {
        let mut endpoint = url.base.clone();
        if endpoint.path() == "/" || endpoint.path().is_empty() {
            endpoint.set_path(DEFAULT_RPC_PATH);
        }

        Self {
            name: format!("transmission@{}", endpoint.host_str().unwrap_or("unknown")),
            endpoint,
            username: url.username.clone(),
            password: url.password.clone(),
            torrents_dir: url.torrents_dir.clone(),
            client: reqwest::Client::new(),
            session_id: Mutex::new(None),
        }
    }

    /// Execute the given RPC method, renegotiating the session id when needed.
    async fn call(&self, method: &str, arguments: Value) -> Result<Value> {
        let body = json!({
            "method": method,
            "arguments": arguments,
        });

        for _ in 0..2 {
            let mut request = self.client.post(self.endpoint.clone()).json(&body);
            if let Some(username) = self.username.as_ref() {
                request = request.basic_auth(username, self.password.as_ref());
            }
            if let Some(session_id) = self.session_id.lock().await.as_ref() {
                request = request.header(SESSION_ID_HEADER, session_id);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ClientError::Connection(e.to_string()))?;

            match response.status().as_u16() {
                409 => {
                    let session_id = response
                        .headers()
                        .get(SESSION_ID_HEADER)
                        .and_then(|e| e.to_str().ok())
                        .map(|e| e.to_string())
                        .ok_or_else(|| {
                            ClientError::Request("missing session id on 409".to_string())
                        })?;
                    trace!("Negotiated transmission session id {}", session_id);
                    *self.session_id.lock().await = Some(session_id);
                }
                401 | 403 => {
                    return Err(ClientError::Auth("credentials rejected".to_string()));
                }
                _ => {
                    let response: Value = response
                        .json()
                        .await
                        .map_err(|e| ClientError::Request(e.to_string()))?;
                    let result = response
                        .get("result")
                        .and_then(|e| e.as_str())
                        .unwrap_or_default();

                    if result != "success" {
                        return Err(ClientError::Request(format!(
                            "rpc method {} failed, {}",
                            method, result
                        )));
                    }

                    return Ok(response.get("arguments").cloned().unwrap_or(Value::Null));
                }
            }
        }

        Err(ClientError::Request(
            "session id negotiation failed".to_string(),
        ))
    }

    /// Get the torrent objects for the given hash with the given fields.
    async fn torrent_get(&self, hash: Option<&InfoHash>, fields: &[&str]) -> Result<Vec<Value>> {
        let mut arguments = json!({ "fields": fields });
        if let Some(hash) = hash {
            arguments["ids"] = json!([hash.as_hex()]);
        }

        let result = self.call("torrent-get", arguments).await?;
        Ok(result
            .get("torrents")
            .and_then(|e| e.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Get the single torrent object for the given hash.
    async fn torrent_get_single(&self, hash: &InfoHash, fields: &[&str]) -> Result<Value> {
        self.torrent_get(Some(hash), fields)
            .await?
            .into_iter()
            .next()
            .ok_or(ClientError::UnknownTorrent(*hash))
    }
}

#[async_trait]
impl TorrentClient for TransmissionClient {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn list_hashes(&self) -> Result<Vec<InfoHash>> {
        let torrents = self.torrent_get(None, &["hashString"]).await?;

        Ok(torrents
            .iter()
            .filter_map(|e| e.get("hashString").and_then(|e| e.as_str()))
            .filter_map(|e| InfoHash::from_str(e).ok())
            .collect())
    }

    async fn get_info(&self, hash: &InfoHash) -> Result<ClientTorrentInfo> {
        let torrent = self
            .torrent_get_single(hash, &["hashString", "name", "downloadDir", "labels", "trackers"])
            .await?;

        Ok(ClientTorrentInfo {
            info_hash: *hash,
            name: torrent
                .get("name")
                .and_then(|e| e.as_str())
                .unwrap_or_default()
                .to_string(),
            save_path: PathBuf::from(
                torrent
                    .get("downloadDir")
                    .and_then(|e| e.as_str())
                    .unwrap_or_default(),
            ),
            trackers: torrent
                .get("trackers")
                .and_then(|e| e.as_array())
                .map(|trackers| {
                    trackers
                        .iter()
                        .filter_map(|e| e.get("announce").and_then(|e| e.as_str()))
                        .map(|e| e.to_string())
                        .collect()
                })
                .unwrap_or_default(),
            label: torrent
                .get("labels")
                .and_then(|e| e.as_array())
                .and_then(|e| e.first())
                .and_then(|e| e.as_str())
                .map(|e| e.to_string()),
        })
    }

    async fn get_metainfo(&self, hash: &InfoHash) -> Result<Vec<u8>> {
        let torrent = self.torrent_get_single(hash, &["torrentFile"]).await?;

        if let Some(path) = torrent.get("torrentFile").and_then(|e| e.as_str()) {
            match tokio::fs::read(path).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => debug!("Failed to read torrent file {}, {}", path, e),
            }
        }

        read_torrents_dir(self.torrents_dir.as_ref(), hash).await
    }

    async fn add_torrent(
        &self,
        metainfo: &[u8],
        save_path: &Path,
        label: &str,
        paused: bool,
    ) -> Result<()> {
        self.call(
            "torrent-add",
            json!({
                "metainfo": BASE64.encode(metainfo),
                "download-dir": save_path.to_string_lossy(),
                "paused": paused,
                "labels": [label],
            }),
        )
        .await?;
        Ok(())
    }

    async fn recheck(&self, hash: &InfoHash) -> Result<()> {
        self.call("torrent-verify", json!({ "ids": [hash.as_hex()] }))
            .await?;
        Ok(())
    }

    async fn status(&self, hash: &InfoHash) -> Result<TorrentStatus> {
        let torrent = self
            .torrent_get_single(hash, &["status", "percentDone", "labels", "errorString"])
            .await?;

        let error = torrent
            .get("errorString")
            .and_then(|e| e.as_str())
            .unwrap_or_default();
        let state = if !error.is_empty() {
            TorrentState::Error(error.to_string())
        } else {
            match torrent.get("status").and_then(|e| e.as_i64()).unwrap_or(0) {
                1 | 2 => TorrentState::Checking,
                3 | 4 => TorrentState::Downloading,
                5 | 6 => TorrentState::Seeding,
                _ => TorrentState::Stopped,
            }
        };

        Ok(TorrentStatus {
            state,
            progress: torrent
                .get("percentDone")
                .and_then(|e| e.as_f64())
                .unwrap_or(0.0),
            label: torrent
                .get("labels")
                .and_then(|e| e.as_array())
                .and_then(|e| e.first())
                .and_then(|e| e.as_str())
                .map(|e| e.to_string()),
        })
    }

    async fn set_label(&self, hash: &InfoHash, label: &str) -> Result<()> {
        self.call(
            "torrent-set",
            json!({ "ids": [hash.as_hex()], "labels": [label] }),
        )
        .await?;
        Ok(())
    }
}
