use crate::config::TargetSiteSettings;
use crate::torrent::InfoHash;
use crate::trackers::{CandidateOrigin, CandidateRef, Result, TrackerError, TrackerSearcher};
use async_trait::async_trait;
use log::trace;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);

/// The envelope every Gazelle JSON api response is wrapped in.
#[derive(Debug, Deserialize)]
struct GazelleEnvelope<T> {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    response: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct TorrentEnvelope {
    torrent: GazelleTorrent,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GazelleTorrent {
    id: i64,
    #[serde(default)]
    info_hash: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BrowseEnvelope {
    #[serde(default)]
    results: Vec<BrowseGroup>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowseGroup {
    #[serde(default)]
    group_name: String,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    torrents: Vec<BrowseTorrent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowseTorrent {
    torrent_id: i64,
}

/// The authenticated Gazelle JSON api adapter.
///
/// Covers sites exposing `ajax.php` with api key authentication, which is the
/// common surface of the Gazelle family.
#[derive(Debug)]
pub struct GazelleJson {
    site_id: String,
    base: Url,
    tracker_domain: String,
    api_key: String,
    source_flag: Option<String>,
    client: reqwest::Client,
}

impl GazelleJson {
    pub fn new(settings: &TargetSiteSettings, timeout: Duration) -> Result<Self> {
        let base = Url::parse(settings.server.as_str())
            .map_err(|e| TrackerError::Request(e.to_string()))?;

        Ok(Self {
            site_id: settings.site_id(),
            base,
            tracker_domain: settings.tracker.clone(),
            api_key: settings.api_key.clone().unwrap_or_default(),
            source_flag: settings.source.clone(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("expected a valid http client"),
        })
    }

    fn ajax_url(&self, action: &str, params: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        url.set_path("/ajax.php");
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("action", action);
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        url
    }

    async fn get(&self, url: Url) -> Result<Response> {
        trace!("Requesting {}", url);
        let response = self
            .client
            .get(url)
            .header("Authorization", self.api_key.as_str())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        check_status(response)
    }

    async fn get_json<T: DeserializeOwned + Default>(&self, url: Url) -> Result<T> {
        let response = self.get(url).await?;
        let envelope: GazelleEnvelope<T> = response
            .json()
            .await
            .map_err(|e| TrackerError::Parse(e.to_string()))?;

        if envelope.status != "success" {
            let error = envelope.error.unwrap_or_else(|| "unknown error".to_string());
            // an explicit failure on an api key means the credentials are dead
            if error.to_lowercase().contains("api") && error.to_lowercase().contains("key") {
                return Err(TrackerError::Auth(error));
            }
            return Err(TrackerError::Request(error));
        }

        envelope
            .response
            .ok_or_else(|| TrackerError::Parse("response body is missing".to_string()))
    }
}

#[async_trait]
impl TrackerSearcher for GazelleJson {
    fn site_id(&self) -> &str {
        self.site_id.as_str()
    }

    fn tracker_domain(&self) -> &str {
        self.tracker_domain.as_str()
    }

    fn source_flag(&self) -> Option<String> {
        self.source_flag.clone()
    }

    async fn search_by_hash(&self, hash: &InfoHash) -> Result<Vec<CandidateRef>> {
        let url = self.ajax_url("torrent", &[("hash", hash.as_hex().to_uppercase().as_str())]);

        match self.get_json::<TorrentEnvelope>(url).await {
            Ok(envelope) => Ok(vec![CandidateRef {
                site_id: self.site_id.clone(),
                remote_id: envelope.torrent.id.to_string(),
                info_hash: envelope
                    .torrent
                    .info_hash
                    .as_deref()
                    .and_then(|e| e.parse().ok())
                    .or(Some(*hash)),
                name: String::new(),
                origin: CandidateOrigin::Hash,
            }]),
            // an unknown hash is a normal miss, not an error
            Err(TrackerError::Request(_)) => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    async fn search_by_filename(&self, query: &str) -> Result<Vec<CandidateRef>> {
        let url = self.ajax_url("browse", &[("searchstr", query)]);
        let envelope: BrowseEnvelope = self.get_json(url).await?;

        Ok(envelope
            .results
            .into_iter()
            .flat_map(|group| {
                let name = match group.artist.as_ref() {
                    Some(artist) => format!("{} - {}", artist, group.group_name),
                    None => group.group_name.clone(),
                };
                group
                    .torrents
                    .into_iter()
                    .map(move |torrent| CandidateRef {
                        site_id: self.site_id.clone(),
                        remote_id: torrent.torrent_id.to_string(),
                        info_hash: None,
                        name: name.clone(),
                        origin: CandidateOrigin::Name,
                    })
            })
            .collect())
    }

    async fn fetch_torrent(&self, remote_id: &str) -> Result<Vec<u8>> {
        let url = self.ajax_url("download", &[("id", remote_id)]);
        let response = self.get(url).await?;

        response
            .bytes()
            .await
            .map(|e| e.to_vec())
            .map_err(|e| TrackerError::Transient(e.to_string()))
    }
}

/// Translate a transport level error into the tracker error taxonomy.
pub(crate) fn map_reqwest_error(error: reqwest::Error) -> TrackerError {
    if error.is_connect() || error.is_timeout() {
        TrackerError::Transient(error.to_string())
    } else {
        TrackerError::Request(error.to_string())
    }
}

/// Translate a non success status into the tracker error taxonomy.
pub(crate) fn check_status(response: Response) -> Result<Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(TrackerError::Auth(format!("status {}", response.status())))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            let window = response
                .headers()
                .get("Retry-After")
                .and_then(|e| e.to_str().ok())
                .and_then(|e| e.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW);
            Err(TrackerError::RateLimited(window))
        }
        status if status.is_server_error() => {
            Err(TrackerError::Transient(format!("status {}", status)))
        }
        status => Err(TrackerError::Request(format!("status {}", status))),
    }
}
