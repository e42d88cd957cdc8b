use crate::config::TargetSiteSettings;
use crate::torrent::InfoHash;
use crate::trackers::gazelle::{check_status, map_reqwest_error};
use crate::trackers::{CandidateOrigin, CandidateRef, Result, TrackerError, TrackerSearcher};
use async_trait::async_trait;
use log::trace;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

/// The scraped Gazelle HTML adapter.
///
/// Covers sites without a JSON api, authenticated with a session cookie.
/// The HTML interface has no info hash lookup, so the hash ladder is a no-op
/// and candidates are discovered through the filename search only.
#[derive(Debug)]
pub struct GazelleHtml {
    site_id: String,
    base: Url,
    tracker_domain: String,
    cookie: String,
    source_flag: Option<String>,
    client: reqwest::Client,
}

impl GazelleHtml {
    pub fn new(settings: &TargetSiteSettings, timeout: Duration) -> Result<Self> {
        let base = Url::parse(settings.server.as_str())
            .map_err(|e| TrackerError::Request(e.to_string()))?;

        Ok(Self {
            site_id: settings.site_id(),
            base,
            tracker_domain: settings.tracker.clone(),
            cookie: settings.cookie.clone().unwrap_or_default(),
            source_flag: settings.source.clone(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("expected a valid http client"),
        })
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        trace!("Requesting {}", url);
        let response = self
            .client
            .get(url)
            .header("Cookie", self.cookie.as_str())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        // an expired session bounces to the login page instead of failing
        if response.url().path().contains("login") {
            return Err(TrackerError::Auth("redirected to login".to_string()));
        }

        check_status(response)
    }

    /// Extract the torrent rows from a `torrents.php` search result page.
    fn parse_search_results(&self, html: &str) -> Vec<CandidateRef> {
        static TORRENT_ID: OnceLock<Regex> = OnceLock::new();
        let torrent_id = TORRENT_ID
            .get_or_init(|| Regex::new(r"torrentid=(\d+)").expect("expected a valid regex"));

        let document = Html::parse_document(html);
        let anchor = Selector::parse(r#"a[href*="torrentid="]"#)
            .expect("expected a valid selector");
        let mut results = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for element in document.select(&anchor) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let Some(remote_id) = torrent_id
                .captures(href)
                .and_then(|e| e.get(1))
                .map(|e| e.as_str().to_string())
            else {
                continue;
            };
            if !seen.insert(remote_id.clone()) {
                continue;
            }

            let name = element.text().collect::<String>().trim().to_string();
            results.push(CandidateRef {
                site_id: self.site_id.clone(),
                remote_id,
                info_hash: None,
                name,
                origin: CandidateOrigin::Name,
            });
        }

        results
    }
}

#[async_trait]
impl TrackerSearcher for GazelleHtml {
    fn site_id(&self) -> &str {
        self.site_id.as_str()
    }

    fn tracker_domain(&self) -> &str {
        self.tracker_domain.as_str()
    }

    fn source_flag(&self) -> Option<String> {
        self.source_flag.clone()
    }

    async fn search_by_hash(&self, _hash: &InfoHash) -> Result<Vec<CandidateRef>> {
        // the HTML interface can't look torrents up by hash
        Ok(vec![])
    }

    async fn search_by_filename(&self, query: &str) -> Result<Vec<CandidateRef>> {
        let mut url = self.base.clone();
        url.set_path("/torrents.php");
        url.query_pairs_mut().append_pair("searchstr", query);

        let response = self.get(url).await?;
        let html = response
            .text()
            .await
            .map_err(|e| TrackerError::Parse(e.to_string()))?;

        Ok(self.parse_search_results(html.as_str()))
    }

    async fn fetch_torrent(&self, remote_id: &str) -> Result<Vec<u8>> {
        let mut url = self.base.clone();
        url.set_path("/torrents.php");
        url.query_pairs_mut()
            .append_pair("action", "download")
            .append_pair("id", remote_id);

        let response = self.get(url).await?;
        response
            .bytes()
            .await
            .map(|e| e.to_vec())
            .map_err(|e| TrackerError::Transient(e.to_string()))
    }
}
