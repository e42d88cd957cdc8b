use crate::client::{
    read_torrents_dir, ClientError, ClientTorrentInfo, ClientUrl, Result, TorrentClient,
    TorrentState, TorrentStatus,
};
use crate::torrent::InfoHash;
use async_trait::async_trait;
use log::{debug, trace};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use url::Url;

/// The torrent info object of the qBittorrent WebUI api.
#[derive(Debug, Clone, Deserialize)]
struct QbtTorrentInfo {
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    save_path: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    category: String,
}

/// The tracker object of the qBittorrent WebUI api.
#[derive(Debug, Clone, Deserialize)]
struct QbtTracker {
    url: String,
}

/// The qBittorrent WebUI api client adapter.
///
/// Authentication is cookie based, the session cookie is kept within the
/// underlying http client and renewed when the api responds with a 403.
#[derive(Debug)]
pub struct QBittorrentClient {
    name: String,
    base: Url,
    username: Option<String>,
    password: Option<String>,
    torrents_dir: Option<PathBuf>,
    client: reqwest::Client,
    authenticated: Mutex<bool>,
}

impl QBittorrentClient {
    pub fn new(url: &ClientUrl) -> Self {
        Self {
            name: format!(
                "qbittorrent@{}",
                url.base.host_str().unwrap_or("unknown")
            ),
            base: url.base.clone(),
            username: url.username.clone(),
            password: url.password.clone(),
            torrents_dir: url.torrents_dir.clone(),
            client: reqwest::Client::builder()
                .cookie_store(true)
                .build()
                .expect("expected a valid http client"),
            authenticated: Mutex::new(false),
        }
    }

    fn api_url(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }

    async fn login(&self) -> Result<()> {
        let response = self
            .client
            .post(self.api_url("/api/v2/auth/login"))
            .form(&[
                ("username", self.username.clone().unwrap_or_default()),
                ("password", self.password.clone().unwrap_or_default()),
            ])
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;
        if body.trim() != "Ok." {
            return Err(ClientError::Auth(format!(
                "login rejected with \"{}\"",
                body.trim()
            )));
        }

        trace!("Authenticated against {}", self.name);
        *self.authenticated.lock().await = true;
        Ok(())
    }

    async fn ensure_login(&self) -> Result<()> {
        if !*self.authenticated.lock().await {
            self.login().await?;
        }
        Ok(())
    }

    /// Execute the given request, renewing the session once on a 403.
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        self.ensure_login().await?;

        let response = request
            .try_clone()
            .ok_or_else(|| ClientError::Request("request is not retryable".to_string()))?
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        if response.status().as_u16() == 403 {
            debug!("Session of {} expired, re-authenticating", self.name);
            *self.authenticated.lock().await = false;
            self.ensure_login().await?;
            return request
                .send()
                .await
                .map_err(|e| ClientError::Connection(e.to_string()));
        }

        Ok(response)
    }

    async fn torrent_info(&self, hash: &InfoHash) -> Result<QbtTorrentInfo> {
        let response = self
            .execute(
                self.client
                    .get(self.api_url("/api/v2/torrents/info"))
                    .query(&[("hashes", hash.as_hex())]),
            )
            .await?;
        let torrents: Vec<QbtTorrentInfo> = response
            .json()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;

        torrents
            .into_iter()
            .next()
            .ok_or(ClientError::UnknownTorrent(*hash))
    }
}

/// Build the multipart form of a torrent add request.
fn add_form(
    metainfo: &[u8],
    save_path: &Path,
    label: &str,
    paused: bool,
) -> Result<reqwest::multipart::Form> {
    Ok(reqwest::multipart::Form::new()
        .part(
            "torrents",
            reqwest::multipart::Part::bytes(metainfo.to_vec())
                .file_name("nemorosa.torrent")
                .mime_str("application/x-bittorrent")
                .map_err(|e| ClientError::Request(e.to_string()))?,
        )
        .text("savepath", save_path.to_string_lossy().to_string())
        .text("category", label.to_string())
        .text("stopped", paused.to_string())
        .text("paused", paused.to_string()))
}

#[async_trait]
impl TorrentClient for QBittorrentClient {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn list_hashes(&self) -> Result<Vec<InfoHash>> {
        let response = self
            .execute(self.client.get(self.api_url("/api/v2/torrents/info")))
            .await?;
        let torrents: Vec<QbtTorrentInfo> = response
            .json()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;

        Ok(torrents
            .iter()
            .filter_map(|e| e.hash.parse().ok())
            .collect())
    }

    async fn get_info(&self, hash: &InfoHash) -> Result<ClientTorrentInfo> {
        let info = self.torrent_info(hash).await?;
        let response = self
            .execute(
                self.client
                    .get(self.api_url("/api/v2/torrents/trackers"))
                    .query(&[("hash", hash.as_hex())]),
            )
            .await?;
        let trackers: Vec<QbtTracker> = response
            .json()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;

        Ok(ClientTorrentInfo {
            info_hash: *hash,
            name: info.name,
            save_path: PathBuf::from(info.save_path),
            // the api lists DHT/PeX pseudo entries as "** [DHT] **"
            trackers: trackers
                .into_iter()
                .map(|e| e.url)
                .filter(|e| !e.starts_with("**"))
                .collect(),
            label: Some(info.category).filter(|e| !e.is_empty()),
        })
    }

    async fn get_metainfo(&self, hash: &InfoHash) -> Result<Vec<u8>> {
        let response = self
            .execute(
                self.client
                    .get(self.api_url("/api/v2/torrents/export"))
                    .query(&[("hash", hash.as_hex())]),
            )
            .await?;

        if response.status().is_success() {
            return response
                .bytes()
                .await
                .map(|e| e.to_vec())
                .map_err(|e| ClientError::Request(e.to_string()));
        }

        debug!(
            "Export of torrent {} failed with status {}, falling back to the torrents dir",
            hash,
            response.status()
        );
        read_torrents_dir(self.torrents_dir.as_ref(), hash).await
    }

    async fn add_torrent(
        &self,
        metainfo: &[u8],
        save_path: &Path,
        label: &str,
        paused: bool,
    ) -> Result<()> {
        // multipart bodies can't be cloned for the usual session retry,
        // so the session is renewed explicitly on a 403 and the form rebuilt
        for attempt in 0..2 {
            self.ensure_login().await?;
            let response = self
                .client
                .post(self.api_url("/api/v2/torrents/add"))
                .multipart(add_form(metainfo, save_path, label, paused)?)
                .send()
                .await
                .map_err(|e| ClientError::Connection(e.to_string()))?;

            match response.status().as_u16() {
                403 if attempt == 0 => {
                    debug!("Session of {} expired during add, re-authenticating", self.name);
                    *self.authenticated.lock().await = false;
                }
                status if (200..300).contains(&status) => return Ok(()),
                status => {
                    return Err(ClientError::Request(format!(
                        "add rejected with status {}",
                        status
                    )))
                }
            }
        }

        Err(ClientError::Auth("session renewal failed".to_string()))
    }

    async fn recheck(&self, hash: &InfoHash) -> Result<()> {
        self.execute(
            self.client
                .post(self.api_url("/api/v2/torrents/recheck"))
                .form(&[("hashes", hash.as_hex())]),
        )
        .await?;
        Ok(())
    }

    async fn status(&self, hash: &InfoHash) -> Result<TorrentStatus> {
        let info = self.torrent_info(hash).await?;

        let state = match info.state.as_str() {
            "checkingUP" | "checkingDL" | "checkingResumeData" | "queuedForChecking" => {
                TorrentState::Checking
            }
            "downloading" | "stalledDL" | "metaDL" | "forcedDL" | "queuedDL" | "allocating" => {
                TorrentState::Downloading
            }
            "uploading" | "stalledUP" | "forcedUP" | "queuedUP" => TorrentState::Seeding,
            "error" | "missingFiles" => TorrentState::Error(info.state.clone()),
            _ => TorrentState::Stopped,
        };

        Ok(TorrentStatus {
            state,
            progress: info.progress,
            label: Some(info.category).filter(|e| !e.is_empty()),
        })
    }

    async fn set_label(&self, hash: &InfoHash, label: &str) -> Result<()> {
        self.execute(
            self.client
                .post(self.api_url("/api/v2/torrents/setCategory"))
                .form(&[("hashes", hash.as_hex()), ("category", label.to_string())]),
        )
        .await?;
        Ok(())
    }
}
