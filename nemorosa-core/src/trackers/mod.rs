pub use gazelle::*;
pub use gazelle_html::*;

mod gazelle;
mod gazelle_html;

use crate::torrent::InfoHash;
use async_trait::async_trait;
use derive_more::Display;
use log::{debug, trace, warn};
#[cfg(any(test, feature = "testing"))]
use mockall::automock;
use rand::RngExt;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// The number of in-place attempts for a transient site failure.
const TRANSIENT_ATTEMPTS: u32 = 3;
/// The base backoff between transient sub-attempts.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(500);

/// The result type for all tracker site operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// The errors that can occur while talking to a tracker site.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrackerError {
    /// A network level failure which is worth retrying in place.
    #[error("transient network error, {0}")]
    Transient(String),
    /// The site asked to slow down for the given window.
    #[error("rate limited for {0:?}")]
    RateLimited(Duration),
    /// The site rejected the credentials.
    #[error("authentication rejected, {0}")]
    Auth(String),
    /// The site rejected or failed the request.
    #[error("request failed, {0}")]
    Request(String),
    /// The site response couldn't be understood.
    #[error("failed to parse site response, {0}")]
    Parse(String),
    /// The site has been disabled for the remainder of the run.
    #[error("site {0} is disabled")]
    Disabled(String),
}

/// How a candidate was discovered on the site.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum CandidateOrigin {
    /// Found through an info hash lookup, the pairing is trusted.
    #[display("hash")]
    Hash,
    /// Found through a filename search.
    #[display("name")]
    Name,
}

/// A reference to a candidate torrent on a target site.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRef {
    /// The identifier of the site this candidate lives on.
    pub site_id: String,
    /// The torrent identifier on the site.
    pub remote_id: String,
    /// The info hash of the candidate, if the site exposed it.
    pub info_hash: Option<InfoHash>,
    /// The release name, used for ranking name hits.
    pub name: String,
    /// How this candidate was discovered.
    pub origin: CandidateOrigin,
}

/// The search capabilities of a Gazelle-family tracker site.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait TrackerSearcher: Debug + Send + Sync {
    /// The identifier of the site.
    fn site_id(&self) -> &str;

    /// The announce domain of the site's tracker.
    fn tracker_domain(&self) -> &str;

    /// The source flag the site expects within the info dictionary.
    fn source_flag(&self) -> Option<String>;

    /// Search the site for a torrent with the given info hash.
    async fn search_by_hash(&self, hash: &InfoHash) -> Result<Vec<CandidateRef>>;

    /// Search the site with the given release name query.
    async fn search_by_filename(&self, query: &str) -> Result<Vec<CandidateRef>>;

    /// Download the torrent file of the given remote id.
    async fn fetch_torrent(&self, remote_id: &str) -> Result<Vec<u8>>;
}

/// A tracker site wrapped with its request discipline.
///
/// Every request acquires the per-site semaphore, transient failures are
/// retried in place, rate limit windows are honored without consuming retry
/// budget, and an authentication failure disables the site for the rest of
/// the run.
#[derive(Debug)]
pub struct Site {
    searcher: Box<dyn TrackerSearcher>,
    semaphore: Semaphore,
    disabled: AtomicBool,
}

impl Site {
    pub fn new(searcher: Box<dyn TrackerSearcher>, permits: usize) -> Self {
        Self {
            searcher,
            semaphore: Semaphore::new(permits.max(1)),
            disabled: AtomicBool::new(false),
        }
    }

    /// The identifier of the site.
    pub fn id(&self) -> &str {
        self.searcher.site_id()
    }

    /// The announce domain of the site's tracker.
    pub fn tracker_domain(&self) -> &str {
        self.searcher.tracker_domain()
    }

    /// The source flag the site expects within the info dictionary.
    pub fn source_flag(&self) -> Option<String> {
        self.searcher.source_flag()
    }

    /// Check if this site has been disabled for the remainder of the run.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Search the site for a torrent with the given info hash.
    pub async fn search_by_hash(&self, hash: &InfoHash) -> Result<Vec<CandidateRef>> {
        self.request(|| self.searcher.search_by_hash(hash)).await
    }

    /// Search the site with the given release name query.
    pub async fn search_by_filename(&self, query: &str) -> Result<Vec<CandidateRef>> {
        self.request(|| self.searcher.search_by_filename(query))
            .await
    }

    /// Download the torrent file of the given remote id.
    pub async fn fetch_torrent(&self, remote_id: &str) -> Result<Vec<u8>> {
        self.request(|| self.searcher.fetch_torrent(remote_id))
            .await
    }

    async fn request<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0u32;

        loop {
            if self.is_disabled() {
                return Err(TrackerError::Disabled(self.id().to_string()));
            }

            let result = {
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .expect("expected the semaphore to be open");
                operation().await
            };

            match result {
                Err(TrackerError::RateLimited(window)) => {
                    debug!("Site {} rate limited, sleeping {:?}", self.id(), window);
                    tokio::time::sleep(window).await;
                }
                Err(TrackerError::Transient(e)) => {
                    attempts += 1;
                    if attempts >= TRANSIENT_ATTEMPTS {
                        return Err(TrackerError::Transient(e));
                    }

                    let backoff = TRANSIENT_BACKOFF * 2u32.pow(attempts - 1);
                    let jitter = Duration::from_millis(rand::rng().random_range(0..250));
                    trace!(
                        "Site {} transient failure ({}), retrying in {:?}",
                        self.id(),
                        e,
                        backoff + jitter
                    );
                    tokio::time::sleep(backoff + jitter).await;
                }
                Err(TrackerError::Auth(e)) => {
                    warn!(
                        "Site {} rejected the credentials, disabling it for this run",
                        self.id()
                    );
                    self.disabled.store(true, Ordering::Relaxed);
                    return Err(TrackerError::Auth(e));
                }
                other => return other,
            }
        }
    }
}
