use crate::cache::TorrentInfoCache;
use crate::client::TorrentClient;
use crate::ledger::Ledger;
use crate::pipeline::{MatchPipeline, PipelineResult};
use crate::torrent::InfoHash;
use chrono::Utc;
use futures::future;
use log::{debug, info, trace, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

/// The share of vanished hashes above which the cache is considered reset.
const RESET_RATIO: f64 = 0.5;
/// The minimum number of vanished hashes before reset detection applies.
const RESET_MINIMUM: usize = 20;

/// The behavior settings of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// The number of torrents processed in parallel during a scan.
    pub workers: usize,
    /// The tracker hosts a torrent must announce to in order to be scanned.
    pub check_trackers: Option<Vec<String>>,
    /// The deadline of an announce resolution including its pipeline run.
    pub announce_timeout: Duration,
}

/// The counters of one full scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub processed: usize,
    pub matched: usize,
    pub no_match: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ScanSummary {
    fn absorb(&mut self, result: &PipelineResult) {
        self.processed += 1;
        match result {
            PipelineResult::Matched { .. } => self.matched += 1,
            PipelineResult::NoMatch => self.no_match += 1,
            PipelineResult::Skipped(_) => self.skipped += 1,
            PipelineResult::DownloadFailed { .. }
            | PipelineResult::InjectFailed(_)
            | PipelineResult::VerifyFailed => self.failed += 1,
        }
    }
}

/// The outcome of an announce resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnounceOutcome {
    /// The announce resolved to a local torrent and the pipeline completed.
    Completed(PipelineResult),
    /// The announce didn't resolve to any cached torrent.
    UnknownTorrent,
    /// The pipeline didn't complete within the announce deadline.
    Timeout,
}

/// The concurrent driver of the match pipeline.
///
/// Owns the worker pool, the per-hash in-flight set which keeps a hash out of
/// two pipelines at once, the cache refresh discipline and the retry sweep.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    inner: Arc<InnerOrchestrator>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        pipeline: Arc<MatchPipeline>,
        cache: TorrentInfoCache,
        client: Arc<dyn TorrentClient>,
        ledger: Ledger,
    ) -> Self {
        Self {
            inner: Arc::new(InnerOrchestrator {
                workers: Semaphore::new(settings.workers.max(1)),
                settings,
                pipeline,
                cache,
                client,
                ledger,
                in_flight: Mutex::new(HashSet::new()),
                cancellation_token: CancellationToken::new(),
            }),
        }
    }

    /// Refresh the torrent info cache against the client, rebuilding it when a
    /// client reset is detected or the rebuild is forced.
    pub async fn refresh_cache(&self, force_rebuild: bool) -> crate::cache::Result<()> {
        let inner = &self.inner;
        let known = inner.cache.len().await;

        if force_rebuild {
            debug!("Cache rebuild forced");
            inner.cache.clear().await;
        }

        let diff = inner.cache.refresh(inner.client.as_ref()).await?;

        // a large share of vanished hashes points at a client reset,
        // in which case the incremental state is thrown away
        if !force_rebuild
            && known >= RESET_MINIMUM
            && diff.removed.len() as f64 / known as f64 >= RESET_RATIO
        {
            warn!(
                "{} of {} cached torrents vanished, rebuilding the cache",
                diff.removed.len(),
                known
            );
            inner.cache.clear().await;
            inner.cache.refresh(inner.client.as_ref()).await?;
        }

        inner.ledger.save_cache(inner.cache.snapshot().await);
        Ok(())
    }

    /// Run the pipeline over every eligible torrent within the client.
    pub async fn full_scan(&self) -> ScanSummary {
        let inner = &self.inner;
        if let Err(e) = self.refresh_cache(false).await {
            warn!("Cache refresh failed, scanning the stale cache, {}", e);
        }

        let torrents = inner
            .cache
            .all_filtered(inner.settings.check_trackers.as_ref())
            .await;
        info!("Scanning {} torrent(s)", torrents.len());

        let runs = torrents.into_iter().map(|torrent| async move {
            let _permit = inner.workers.acquire().await.expect("expected the worker pool to be open");
            if inner.cancellation_token.is_cancelled() {
                return PipelineResult::Skipped("cancelled".to_string());
            }
            self.run_guarded(torrent.info_hash, false).await
        });
        let results = future::join_all(runs).await;

        let mut summary = ScanSummary::default();
        for result in results.iter() {
            summary.absorb(result);
        }
        info!(
            "Scan finished, {} processed, {} matched, {} without match, {} skipped, {} failed",
            summary.processed, summary.matched, summary.no_match, summary.skipped, summary.failed
        );
        summary
    }

    /// Run the pipeline for a single hash, bypassing the seen gate.
    pub async fn process_single(&self, hash: &InfoHash) -> PipelineResult {
        if self.inner.cache.get(hash).await.is_none() {
            if let Err(e) = self.refresh_cache(false).await {
                warn!("Cache refresh failed, {}", e);
            }
        }
        if self.inner.cache.get(hash).await.is_none() {
            return PipelineResult::Skipped("hash is unknown to the client".to_string());
        }

        self.run_guarded(*hash, true).await
    }

    /// Resolve an announce to a local torrent and run the pipeline within the
    /// announce deadline.
    ///
    /// Resolution tries the info hash first and falls back to the loose
    /// normalized name with an exact size match.
    pub async fn process_announce(
        &self,
        info_hash: Option<InfoHash>,
        name: Option<&str>,
        size: Option<u64>,
    ) -> AnnounceOutcome {
        let resolved = match info_hash {
            Some(hash) => self.inner.cache.get(&hash).await,
            None => None,
        };
        let resolved = match resolved {
            Some(torrent) => Some(torrent),
            None => match name {
                Some(name) => self.inner.cache.by_name(name, size).await,
                None => None,
            },
        };

        let Some(torrent) = resolved else {
            return AnnounceOutcome::UnknownTorrent;
        };
        trace!("Announce resolved to {}", torrent.info_hash);

        match tokio::time::timeout(
            self.inner.settings.announce_timeout,
            self.run_guarded(torrent.info_hash, true),
        )
        .await
        {
            Ok(result) => AnnounceOutcome::Completed(result),
            Err(_) => AnnounceOutcome::Timeout,
        }
    }

    /// Replay every due retry entry, skipping the search phase.
    pub async fn retry_sweep(&self) -> usize {
        let inner = &self.inner;
        let due = inner.ledger.due_retries(Utc::now()).await;
        if due.is_empty() {
            return 0;
        }

        info!("Replaying {} due retry entr(ies)", due.len());
        let runs = due.into_iter().map(|entry| async move {
            let _permit = inner.workers.acquire().await.expect("expected the worker pool to be open");
            let hash = entry.local_info_hash;
            if !inner.claim(hash).await {
                return;
            }
            let result = inner
                .pipeline
                .process_retry(entry, &inner.cancellation_token)
                .await;
            inner.release(&hash).await;
            trace!("Retry of {} finished with {:?}", hash, result);
        });
        let count = runs.len();
        future::join_all(runs).await;
        count
    }

    /// Run full scans and retry sweeps on the given interval until shutdown.
    pub async fn run_scheduled(&self, interval: Duration) {
        info!("Scheduled mode started with an interval of {:?}", interval);
        loop {
            tokio::select! {
                _ = self.inner.cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.retry_sweep().await;
                    self.full_scan().await;
                }
            }
        }
        debug!("Scheduled mode stopped");
    }

    /// Cancel every running pipeline at its next suspension point.
    pub fn shutdown(&self) {
        self.inner.cancellation_token.cancel();
    }

    /// Get the cache fronting the client state.
    pub fn cache(&self) -> &TorrentInfoCache {
        &self.inner.cache
    }

    async fn run_guarded(&self, hash: InfoHash, force: bool) -> PipelineResult {
        let inner = &self.inner;
        if !inner.claim(hash).await {
            debug!("Torrent {} is already being processed", hash);
            return PipelineResult::Skipped("already in flight".to_string());
        }

        let Some(torrent) = inner.cache.get(&hash).await else {
            inner.release(&hash).await;
            return PipelineResult::Skipped("hash is unknown to the client".to_string());
        };

        let result = inner
            .pipeline
            .process(torrent, force, &inner.cancellation_token)
            .await;
        inner.release(&hash).await;
        result
    }
}

#[derive(Debug)]
struct InnerOrchestrator {
    settings: OrchestratorSettings,
    workers: Semaphore,
    pipeline: Arc<MatchPipeline>,
    cache: TorrentInfoCache,
    client: Arc<dyn TorrentClient>,
    ledger: Ledger,
    in_flight: Mutex<HashSet<InfoHash>>,
    cancellation_token: CancellationToken,
}

impl InnerOrchestrator {
    /// Claim the hash for processing.
    ///
    /// # Returns
    ///
    /// Returns `false` when the hash is already in flight.
    async fn claim(&self, hash: InfoHash) -> bool {
        self.in_flight.lock().await.insert(hash)
    }

    async fn release(&self, hash: &InfoHash) {
        self.in_flight.lock().await.remove(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockTorrentClient;
    use crate::config::{RetrySettings, TimeoutSettings};
    use crate::init_logger;
    use crate::matcher::{FileMatcher, MatchPolicy};
    use crate::pipeline::PipelineSettings;
    use crate::reconcile::Reconciler;
    use crate::search::CandidateSearch;
    use crate::testing::multi_file_torrent;
    use crate::torrent::Metainfo;
    use tempfile::TempDir;

    struct Fixture {
        orchestrator: Orchestrator,
        local_hash: InfoHash,
        _temp_dir: TempDir,
    }

    async fn fixture(list_hashes: Vec<InfoHash>) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let bytes = multi_file_torrent("Album", 32, &[("01.flac", &[7u8; 64])], None);
        let metainfo = Metainfo::try_from(bytes.as_slice()).unwrap();
        let local_hash = *metainfo.info_hash();
        let local = crate::cache::LocalTorrent::new(
            &metainfo,
            bytes,
            temp_dir.path().to_path_buf(),
            vec!["https://flacsfor.me/abc/announce".to_string()],
        );
        let cache = TorrentInfoCache::from_entries(vec![local]);
        let ledger = Ledger::open(temp_dir.path().join("nemorosa.json"))
            .await
            .unwrap();

        let mut client = MockTorrentClient::new();
        client
            .expect_list_hashes()
            .returning(move || Ok(list_hashes.clone()));
        let client: Arc<dyn TorrentClient> = Arc::new(client);

        let pipeline = Arc::new(MatchPipeline::new(
            PipelineSettings {
                check_trackers: None,
                check_music_only: true,
                exclude_mp3: false,
                no_download: false,
                auto_start: true,
                label: "nemorosa".to_string(),
                timeouts: TimeoutSettings::default(),
                retry: RetrySettings::default(),
            },
            FileMatcher::new(MatchPolicy::default()),
            CandidateSearch::default(),
            vec![],
            client.clone(),
            Arc::new(Reconciler::new()),
            ledger.clone(),
        ));

        let orchestrator = Orchestrator::new(
            OrchestratorSettings {
                workers: 4,
                check_trackers: None,
                announce_timeout: Duration::from_secs(5),
            },
            pipeline,
            cache,
            client,
            ledger,
        );

        Fixture {
            orchestrator,
            local_hash,
            _temp_dir: temp_dir,
        }
    }

    #[tokio::test]
    async fn test_full_scan_without_sites() {
        init_logger!();
        let fixture = fixture(vec![]).await;
        // the cache refresh drops the vanished hash, so the scan is empty
        let summary = fixture.orchestrator.full_scan().await;

        assert_eq!(0, summary.processed);
    }

    #[tokio::test]
    async fn test_process_single_without_candidates() {
        init_logger!();
        let fixture = fixture(vec![]).await;

        let result = fixture
            .orchestrator
            .process_single(&fixture.local_hash)
            .await;

        // without configured sites the search yields nothing
        assert!(
            matches!(
                result,
                PipelineResult::NoMatch | PipelineResult::Skipped(_)
            ),
            "got {:?}",
            result
        );
    }

    #[tokio::test]
    async fn test_announce_resolution() {
        init_logger!();
        let fixture = fixture(vec![]).await;

        let result = fixture
            .orchestrator
            .process_announce(None, Some("Album"), None)
            .await;
        assert!(
            matches!(result, AnnounceOutcome::Completed(_)),
            "expected the name resolution to complete, got {:?}",
            result
        );

        let result = fixture
            .orchestrator
            .process_announce(None, Some("Unknown Release"), None)
            .await;
        assert_eq!(AnnounceOutcome::UnknownTorrent, result);
    }
}
