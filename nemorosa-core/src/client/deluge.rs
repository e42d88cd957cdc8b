use crate::client::{
    read_torrents_dir, ClientError, ClientTorrentInfo, ClientUrl, Result, TorrentClient,
    TorrentState, TorrentStatus,
};
use crate::torrent::InfoHash;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{trace, warn};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;
use url::Url;

const STATUS_KEYS: [&str; 6] = ["name", "save_path", "trackers", "label", "state", "progress"];

/// The Deluge web JSON-RPC client adapter.
///
/// The web interface authenticates with a password only and keeps the session
/// within a cookie. Metainfo export is not available over the api, so the
/// `torrents_dir` of the client url is required for cache building.
#[derive(Debug)]
pub struct DelugeClient {
    name: String,
    endpoint: Url,
    password: Option<String>,
    torrents_dir: Option<PathBuf>,
    client: reqwest::Client,
    request_id: AtomicI64,
    authenticated: Mutex<bool>,
}

impl DelugeClient {
    pub fn new(url: &ClientUrl) -> Self {
        let mut endpoint = url.base.clone();
        if endpoint.path() == "/" || endpoint.path().is_empty() {
            endpoint.set_path("/json");
        }

        Self {
            name: format!("deluge@{}", endpoint.host_str().unwrap_or("unknown")),
            endpoint,
            password: url.password.clone(),
            torrents_dir: url.torrents_dir.clone(),
            client: reqwest::Client::builder()
                .cookie_store(true)
                .build()
                .expect("expected a valid http client"),
            request_id: AtomicI64::new(1),
            authenticated: Mutex::new(false),
        }
    }

    /// Execute the given JSON-RPC method against the web endpoint.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "method": method,
            "params": params,
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        let response: Value = response
            .json()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;

        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            return Err(ClientError::Request(format!(
                "rpc method {} failed, {}",
                method, error
            )));
        }

        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn ensure_login(&self) -> Result<()> {
        let mut authenticated = self.authenticated.lock().await;
        if *authenticated {
            return Ok(());
        }

        let result = self
            .call(
                "auth.login",
                json!([self.password.clone().unwrap_or_default()]),
            )
            .await?;
        if result.as_bool() != Some(true) {
            return Err(ClientError::Auth("password rejected".to_string()));
        }

        trace!("Authenticated against {}", self.name);
        *authenticated = true;
        Ok(())
    }

    async fn torrent_status(&self, hash: &InfoHash) -> Result<Value> {
        self.ensure_login().await?;
        let result = self
            .call(
                "core.get_torrent_status",
                json!([hash.as_hex(), STATUS_KEYS]),
            )
            .await?;

        if result.as_object().map(|e| e.is_empty()).unwrap_or(true) {
            return Err(ClientError::UnknownTorrent(*hash));
        }

        Ok(result)
    }
}

#[async_trait]
impl TorrentClient for DelugeClient {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn list_hashes(&self) -> Result<Vec<InfoHash>> {
        self.ensure_login().await?;
        let result = self.call("core.get_session_state", json!([])).await?;

        Ok(result
            .as_array()
            .map(|hashes| {
                hashes
                    .iter()
                    .filter_map(|e| e.as_str())
                    .filter_map(|e| InfoHash::from_str(e).ok())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_info(&self, hash: &InfoHash) -> Result<ClientTorrentInfo> {
        let status = self.torrent_status(hash).await?;

        Ok(ClientTorrentInfo {
            info_hash: *hash,
            name: status
                .get("name")
                .and_then(|e| e.as_str())
                .unwrap_or_default()
                .to_string(),
            save_path: PathBuf::from(
                status
                    .get("save_path")
                    .and_then(|e| e.as_str())
                    .unwrap_or_default(),
            ),
            trackers: status
                .get("trackers")
                .and_then(|e| e.as_array())
                .map(|trackers| {
                    trackers
                        .iter()
                        .filter_map(|e| e.get("url").and_then(|e| e.as_str()))
                        .map(|e| e.to_string())
                        .collect()
                })
                .unwrap_or_default(),
            label: status
                .get("label")
                .and_then(|e| e.as_str())
                .filter(|e| !e.is_empty())
                .map(|e| e.to_string()),
        })
    }

    async fn get_metainfo(&self, hash: &InfoHash) -> Result<Vec<u8>> {
        read_torrents_dir(self.torrents_dir.as_ref(), hash).await
    }

    async fn add_torrent(
        &self,
        metainfo: &[u8],
        save_path: &Path,
        label: &str,
        paused: bool,
    ) -> Result<()> {
        self.ensure_login().await?;
        let result = self
            .call(
                "core.add_torrent_file",
                json!([
                    "nemorosa.torrent",
                    BASE64.encode(metainfo),
                    {
                        "download_location": save_path.to_string_lossy(),
                        "add_paused": paused,
                    },
                ]),
            )
            .await?;

        // the add call returns the hash of the new torrent, which the label
        // plugin needs, labelling is best effort as the plugin may not be loaded
        if let Some(hash) = result.as_str().and_then(|e| InfoHash::from_str(e).ok()) {
            if let Err(e) = self.set_label(&hash, label).await {
                warn!("Failed to label injected torrent on {}, {}", self.name, e);
            }
        }

        Ok(())
    }

    async fn recheck(&self, hash: &InfoHash) -> Result<()> {
        self.ensure_login().await?;
        self.call("core.force_recheck", json!([[hash.as_hex()]]))
            .await?;
        Ok(())
    }

    async fn status(&self, hash: &InfoHash) -> Result<TorrentStatus> {
        let status = self.torrent_status(hash).await?;

        let state = match status.get("state").and_then(|e| e.as_str()).unwrap_or("") {
            "Checking" | "Allocating" | "Moving" => TorrentState::Checking,
            "Downloading" | "Queued" => TorrentState::Downloading,
            "Seeding" | "Active" => TorrentState::Seeding,
            "Error" => TorrentState::Error("deluge reported an error state".to_string()),
            _ => TorrentState::Stopped,
        };

        Ok(TorrentStatus {
            state,
            progress: status
                .get("progress")
                .and_then(|e| e.as_f64())
                .unwrap_or(0.0)
                / 100.0,
            label: status
                .get("label")
                .and_then(|e| e.as_str())
                .filter(|e| !e.is_empty())
                .map(|e| e.to_string()),
        })
    }

    async fn set_label(&self, hash: &InfoHash, label: &str) -> Result<()> {
        self.ensure_login().await?;
        self.call("label.set_torrent", json!([hash.as_hex(), label]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_logger;
    use httpmock::Method::POST;
    use httpmock::MockServer;

    fn client_for(server: &MockServer) -> DelugeClient {
        let url = ClientUrl::from_str(
            format!("deluge+{}", server.base_url().replace("http://", "http://:secret@")).as_str(),
        )
        .unwrap();
        DelugeClient::new(&url)
    }

    #[tokio::test]
    async fn test_deluge_login_and_list() {
        init_logger!();
        let server = MockServer::start_async().await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST).path("/json").body_includes("auth.login");
                then.status(200)
                    .json_body(serde_json::json!({ "result": true, "error": null, "id": 1 }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/json")
                    .body_includes("core.get_session_state");
                then.status(200).json_body(serde_json::json!({
                    "result": ["eadaf0efea39406914414d359e0ea16416409bd7"],
                    "error": null,
                    "id": 2,
                }));
            })
            .await;
        let client = client_for(&server);

        let result = client.list_hashes().await.unwrap();

        login.assert_async().await;
        assert_eq!(
            vec![InfoHash::from_str("eadaf0efea39406914414d359e0ea16416409bd7").unwrap()],
            result
        );
    }

    #[tokio::test]
    async fn test_deluge_login_rejected() {
        init_logger!();
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/json");
                then.status(200)
                    .json_body(serde_json::json!({ "result": false, "error": null, "id": 1 }));
            })
            .await;
        let client = client_for(&server);

        let result = client.list_hashes().await;

        assert!(
            matches!(result, Err(ClientError::Auth(_))),
            "expected an auth error, got {:?} instead",
            result
        );
    }
}
