use crate::cache::LocalTorrent;
use crate::client::{TorrentClient, TorrentState};
use crate::config::{AppConfig, RetrySettings, TimeoutSettings};
use crate::ledger::{Ledger, OutcomeRecord, OutcomeResult, RetryEntry};
use crate::matcher::{FileMapping, FileMatcher, MappingSummary, Verdict};
use crate::reconcile::Reconciler;
use crate::search::CandidateSearch;
use crate::torrent::{InfoHash, Metainfo};
use crate::trackers::{CandidateRef, Site};
use chrono::Utc;
use derive_more::Display;
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// The interval between verification status polls.
const VERIFY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The states a pipeline execution moves through.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum PipelineState {
    #[display("gated")]
    Gated,
    #[display("searching")]
    Searching,
    #[display("matching")]
    Matching,
    #[display("reconciling")]
    Reconciling,
    #[display("injecting")]
    Injecting,
    #[display("verifying")]
    Verifying,
    #[display("post-processing")]
    PostProcessing,
    #[display("done")]
    Done,
}

/// The terminal result of a pipeline execution.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResult {
    /// A candidate was accepted and, outside dry runs, injected and verified.
    Matched {
        site_id: String,
        candidate: InfoHash,
        summary: MappingSummary,
    },
    /// The torrent didn't pass the eligibility gate.
    Skipped(String),
    /// No candidate was found or every candidate was rejected.
    NoMatch,
    /// A candidate download or injection failed, a retry has been scheduled.
    DownloadFailed { site_id: String },
    /// The reconciliation or an unexpected error failed the torrent fatally.
    InjectFailed(String),
    /// The injected torrent failed or timed out its recheck.
    VerifyFailed,
}

/// The behavior settings of the pipeline, projected from the application config.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub check_trackers: Option<Vec<String>>,
    pub check_music_only: bool,
    pub exclude_mp3: bool,
    pub no_download: bool,
    pub auto_start: bool,
    pub label: String,
    pub timeouts: TimeoutSettings,
    pub retry: RetrySettings,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            check_trackers: config.global.check_trackers.clone(),
            check_music_only: config.global.check_music_only,
            exclude_mp3: config.global.exclude_mp3,
            no_download: config.global.no_download,
            auto_start: config.global.auto_start_torrents,
            label: config
                .downloader
                .as_ref()
                .map(|e| e.label.clone())
                .unwrap_or_else(|| "nemorosa".to_string()),
            timeouts: config.global.timeouts.clone(),
            retry: config.global.retry.clone(),
        }
    }
}

/// The per-torrent match pipeline.
///
/// Drives one local torrent through gate, search, match, reconcile, inject and
/// verify, records the outcome in the ledger and never lets an unexpected
/// error escape a single torrent's processing.
#[derive(Debug)]
pub struct MatchPipeline {
    settings: PipelineSettings,
    matcher: FileMatcher,
    search: CandidateSearch,
    sites: Vec<Arc<Site>>,
    client: Arc<dyn TorrentClient>,
    reconciler: Arc<Reconciler>,
    ledger: Ledger,
}

impl MatchPipeline {
    pub fn new(
        settings: PipelineSettings,
        matcher: FileMatcher,
        search: CandidateSearch,
        sites: Vec<Arc<Site>>,
        client: Arc<dyn TorrentClient>,
        reconciler: Arc<Reconciler>,
        ledger: Ledger,
    ) -> Self {
        Self {
            settings,
            matcher,
            search,
            sites,
            client,
            reconciler,
            ledger,
        }
    }

    /// Process the given local torrent through the full pipeline.
    ///
    /// # Arguments
    ///
    /// * `local` - The local torrent to cross-seed.
    /// * `force` - Process the torrent even when it has been seen before.
    /// * `cancellation` - Cancels the execution at the next suspension point.
    pub async fn process(
        &self,
        local: Arc<LocalTorrent>,
        force: bool,
        cancellation: &CancellationToken,
    ) -> PipelineResult {
        trace!("Pipeline of {} entering {}", local.info_hash, PipelineState::Gated);
        if let Some(reason) = self.gate(&local, force).await {
            debug!("Torrent {} skipped, {}", local.info_hash, reason);
            return PipelineResult::Skipped(reason);
        }

        trace!(
            "Pipeline of {} entering {}",
            local.info_hash,
            PipelineState::Searching
        );
        let candidates = self.search.search(&local, &self.sites).await;
        if candidates.is_empty() {
            self.finish(
                &local,
                String::new(),
                OutcomeResult::NoCandidates,
                None,
                None,
            );
            return PipelineResult::NoMatch;
        }
        if cancellation.is_cancelled() {
            return PipelineResult::Skipped("cancelled".to_string());
        }

        trace!(
            "Pipeline of {} entering {}",
            local.info_hash,
            PipelineState::Matching
        );
        let accepted = match self.evaluate_candidates(&local, candidates, cancellation).await {
            Ok(Some(accepted)) => accepted,
            Ok(None) => {
                self.finish(&local, String::new(), OutcomeResult::AllRejected, None, None);
                return PipelineResult::NoMatch;
            }
            Err(result) => return result,
        };

        self.complete(&local, accepted, cancellation).await
    }

    /// Replay a persisted retry entry, skipping the search phase and reusing
    /// the stored candidate.
    pub async fn process_retry(
        &self,
        entry: RetryEntry,
        cancellation: &CancellationToken,
    ) -> PipelineResult {
        let Some(local) = self.local_for_retry(&entry).await else {
            warn!(
                "Local torrent {} of retry entry is gone, dropping the entry",
                entry.local_info_hash
            );
            self.ledger.remove_retry(&entry.local_info_hash, entry.site_id.as_str());
            return PipelineResult::Skipped("local torrent is gone".to_string());
        };
        let Some(site) = self.site(entry.site_id.as_str()) else {
            warn!("Site {} of retry entry is no longer configured", entry.site_id);
            self.ledger.remove_retry(&entry.local_info_hash, entry.site_id.as_str());
            return PipelineResult::Skipped("site is no longer configured".to_string());
        };

        debug!(
            "Retrying candidate {} of {} on {}",
            entry.remote_id, entry.local_info_hash, entry.site_id
        );
        let candidate = CandidateRef {
            site_id: entry.site_id.clone(),
            remote_id: entry.remote_id.clone(),
            info_hash: None,
            name: entry.candidate_name.clone(),
            origin: crate::trackers::CandidateOrigin::Name,
        };

        match self
            .fetch_and_match(&local, &site, &candidate, entry.mapping.clone())
            .await
        {
            Ok(Some(accepted)) => self.complete(&local, accepted, cancellation).await,
            Ok(None) => {
                // the stored candidate no longer matches, drop the entry
                self.ledger.remove_retry(&entry.local_info_hash, entry.site_id.as_str());
                self.finish(&local, entry.site_id, OutcomeResult::AllRejected, None, None);
                PipelineResult::NoMatch
            }
            Err(e) => {
                debug!(
                    "Retry of {} on {} failed again, {}",
                    entry.local_info_hash, entry.site_id, e
                );
                self.schedule_retry(entry);
                PipelineResult::DownloadFailed {
                    site_id: candidate.site_id.clone(),
                }
            }
        }
    }

    /// Check the eligibility gate.
    ///
    /// # Returns
    ///
    /// Returns the skip reason when the torrent is not eligible.
    async fn gate(&self, local: &LocalTorrent, force: bool) -> Option<String> {
        if let Some(allowed) = self.settings.check_trackers.as_ref() {
            if !local.announces_to(allowed.as_slice()) {
                return Some("tracker is not in the allow list".to_string());
            }
        }
        if self.settings.check_music_only && !local.has_audio() {
            return Some("torrent contains no audio files".to_string());
        }
        if self.settings.exclude_mp3 {
            let has_mp3 = local.files.iter().any(|e| {
                e.path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("mp3"))
                    .unwrap_or(false)
            });
            if has_mp3 {
                return Some("mp3 releases are excluded".to_string());
            }
        }
        if !force && self.ledger.is_seen(&local.info_hash).await {
            return Some("already processed".to_string());
        }

        None
    }

    /// Evaluate the ranked candidates until the first acceptance.
    ///
    /// # Returns
    ///
    /// Returns the accepted candidate, [None] when every candidate was
    /// rejected, or the terminal result when a download failed.
    async fn evaluate_candidates(
        &self,
        local: &LocalTorrent,
        candidates: Vec<CandidateRef>,
        cancellation: &CancellationToken,
    ) -> std::result::Result<Option<AcceptedCandidate>, PipelineResult> {
        let mut download_failure: Option<CandidateRef> = None;

        for candidate in candidates {
            if cancellation.is_cancelled() {
                return Err(PipelineResult::Skipped("cancelled".to_string()));
            }
            let Some(site) = self.site(candidate.site_id.as_str()) else {
                continue;
            };

            match self.fetch_and_match(local, &site, &candidate, None).await {
                Ok(Some(accepted)) => return Ok(Some(accepted)),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Failed to fetch candidate {} on {}, {}",
                        candidate.remote_id, candidate.site_id, e
                    );
                    download_failure.get_or_insert(candidate);
                }
            }
        }

        match download_failure {
            Some(candidate) => {
                let site_id = candidate.site_id.clone();
                self.schedule_retry(RetryEntry {
                    local_info_hash: local.info_hash,
                    site_id: candidate.site_id.clone(),
                    remote_id: candidate.remote_id,
                    candidate_name: candidate.name,
                    mapping: None,
                    retry_count: 0,
                    next_retry_at: Utc::now(),
                    permanently_failed: false,
                });
                self.finish(local, site_id.clone(), OutcomeResult::DownloadFailed, None, None);
                Err(PipelineResult::DownloadFailed { site_id })
            }
            None => Ok(None),
        }
    }

    /// Fetch the candidate torrent and decide whether it is acceptable.
    ///
    /// Hash hits whose fetched info hash equals the local hash, or the local
    /// hash re-flavored with the site's source flag, are trusted with an
    /// identity mapping; everything else goes through the matcher.
    async fn fetch_and_match(
        &self,
        local: &LocalTorrent,
        site: &Arc<Site>,
        candidate: &CandidateRef,
        stored_mapping: Option<FileMapping>,
    ) -> std::result::Result<Option<AcceptedCandidate>, String> {
        let fetch = timeout(
            Duration::from_secs(self.settings.timeouts.fetch_secs),
            site.fetch_torrent(candidate.remote_id.as_str()),
        );
        let bytes = match fetch.await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err("candidate fetch timed out".to_string()),
        };

        let metainfo = match Metainfo::try_from(bytes.as_slice()) {
            Ok(metainfo) => metainfo,
            Err(e) => {
                debug!(
                    "Candidate {} on {} is not a valid torrent, {}",
                    candidate.remote_id, candidate.site_id, e
                );
                return Ok(None);
            }
        };

        let mapping = if let Some(mapping) = stored_mapping {
            mapping
        } else {
            let trusted = *metainfo.info_hash() == local.info_hash
                || site
                    .source_flag()
                    .and_then(|flag| local.with_source_hash(flag.as_str()))
                    .map(|hash| hash == *metainfo.info_hash())
                    .unwrap_or(false);

            if trusted {
                FileMapping::identity(&metainfo.files_rooted())
            } else {
                match self.matcher.match_torrents(local, &metainfo) {
                    Verdict::Accepted(mapping) => mapping,
                    Verdict::Rejected(reason) => {
                        debug!(
                            "Candidate {} on {} rejected, {}",
                            candidate.remote_id, candidate.site_id, reason
                        );
                        return Ok(None);
                    }
                }
            }
        };

        Ok(Some(AcceptedCandidate {
            site_id: candidate.site_id.clone(),
            remote_id: candidate.remote_id.clone(),
            name: candidate.name.clone(),
            metainfo_bytes: bytes,
            metainfo,
            mapping,
        }))
    }

    /// Run the accepted candidate through reconcile, inject, verify and
    /// post-processing.
    async fn complete(
        &self,
        local: &LocalTorrent,
        accepted: AcceptedCandidate,
        cancellation: &CancellationToken,
    ) -> PipelineResult {
        let candidate_hash = *accepted.metainfo.info_hash();
        let summary = accepted.mapping.summary();

        if self.settings.no_download {
            info!(
                "Dry run match of {} on {}: {}",
                local.info_hash, accepted.site_id, summary
            );
            self.finish(
                local,
                accepted.site_id.clone(),
                OutcomeResult::Matched,
                Some(candidate_hash),
                Some(summary.clone()),
            );
            return PipelineResult::Matched {
                site_id: accepted.site_id,
                candidate: candidate_hash,
                summary,
            };
        }

        trace!(
            "Pipeline of {} entering {}",
            local.info_hash,
            PipelineState::Reconciling
        );
        if let Err(e) = self
            .reconciler
            .apply(
                &accepted.mapping,
                local.save_path.as_path(),
                local.save_path.as_path(),
                cancellation,
            )
            .await
        {
            warn!("Reconciliation of {} failed, {}", local.info_hash, e);
            self.finish(
                local,
                accepted.site_id.clone(),
                OutcomeResult::InjectFailed,
                Some(candidate_hash),
                None,
            );
            return PipelineResult::InjectFailed(e.to_string());
        }

        // injection is not cancellable, it must complete or fail
        trace!(
            "Pipeline of {} entering {}",
            local.info_hash,
            PipelineState::Injecting
        );
        let inject = timeout(
            Duration::from_secs(self.settings.timeouts.inject_secs),
            self.client.add_torrent(
                accepted.metainfo_bytes.as_slice(),
                local.save_path.as_path(),
                self.settings.label.as_str(),
                !self.settings.auto_start,
            ),
        );
        let inject_result = match inject.await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err("injection timed out".to_string()),
        };
        if let Err(e) = inject_result {
            warn!("Injection of {} failed, {}", candidate_hash, e);
            self.schedule_retry(RetryEntry {
                local_info_hash: local.info_hash,
                site_id: accepted.site_id.clone(),
                remote_id: accepted.remote_id.clone(),
                candidate_name: accepted.name.clone(),
                mapping: Some(accepted.mapping.clone()),
                retry_count: 0,
                next_retry_at: Utc::now(),
                permanently_failed: false,
            });
            self.finish(
                local,
                accepted.site_id.clone(),
                OutcomeResult::DownloadFailed,
                Some(candidate_hash),
                None,
            );
            return PipelineResult::DownloadFailed {
                site_id: accepted.site_id,
            };
        }

        trace!(
            "Pipeline of {} entering {}",
            local.info_hash,
            PipelineState::Verifying
        );
        if !self.verify(&accepted, &candidate_hash).await {
            self.finish(
                local,
                accepted.site_id.clone(),
                OutcomeResult::VerifyFailed,
                Some(candidate_hash),
                None,
            );
            return PipelineResult::VerifyFailed;
        }

        trace!(
            "Pipeline of {} entering {}",
            local.info_hash,
            PipelineState::PostProcessing
        );
        let source_label = format!("{}.cross-seeded", self.settings.label);
        if let Err(e) = self
            .client
            .set_label(&local.info_hash, source_label.as_str())
            .await
        {
            warn!("Failed to relabel source torrent {}, {}", local.info_hash, e);
        }
        self.ledger
            .remove_retry(&local.info_hash, accepted.site_id.as_str());
        self.finish(
            local,
            accepted.site_id.clone(),
            OutcomeResult::Matched,
            Some(candidate_hash),
            Some(summary.clone()),
        );

        PipelineResult::Matched {
            site_id: accepted.site_id,
            candidate: candidate_hash,
            summary,
        }
    }

    /// Trigger a recheck of the injected torrent and wait for it to pass.
    ///
    /// # Returns
    ///
    /// Returns `true` when the recheck completed with the expected progress
    /// within the verify timeout.
    async fn verify(&self, accepted: &AcceptedCandidate, candidate_hash: &InfoHash) -> bool {
        if let Err(e) = self.client.recheck(candidate_hash).await {
            warn!("Failed to start recheck of {}, {}", candidate_hash, e);
            return false;
        }

        let deadline = Duration::from_secs(self.settings.timeouts.verify_secs);
        let total = accepted.metainfo.total_size().max(1);
        // whole pieces fail when they contain any unsatisfied bytes, so the
        // expectation carries piece sized slack on top of the missing budget
        let slack = accepted.mapping.unsatisfied_bytes() + 2 * accepted.metainfo.piece_length();
        let expected = 1.0 - (slack as f64 / total as f64).min(1.0);

        let poll = async {
            loop {
                match self.client.status(candidate_hash).await {
                    Ok(status) => match status.state {
                        TorrentState::Checking => {}
                        TorrentState::Error(e) => {
                            warn!("Injected torrent {} errored, {}", candidate_hash, e);
                            return false;
                        }
                        _ => return status.progress >= expected,
                    },
                    Err(e) => {
                        trace!("Status of {} unavailable yet, {}", candidate_hash, e);
                    }
                }
                tokio::time::sleep(VERIFY_POLL_INTERVAL).await;
            }
        };

        match timeout(deadline, poll).await {
            Ok(passed) => passed,
            Err(_) => {
                warn!("Verification of {} timed out", candidate_hash);
                false
            }
        }
    }

    /// Record the outcome and mark the torrent as seen.
    fn finish(
        &self,
        local: &LocalTorrent,
        site_id: String,
        result: OutcomeResult,
        candidate: Option<InfoHash>,
        summary: Option<MappingSummary>,
    ) {
        let mut record = OutcomeRecord::new(local.info_hash, site_id, result);
        if let Some(candidate) = candidate {
            record = record.with_candidate(candidate);
        }
        if let Some(summary) = summary {
            record = record.with_mapping(summary);
        }
        self.ledger.record_outcome(record);

        // dry runs stay unseen so a real run can process them later
        if !self.settings.no_download {
            self.ledger.mark_seen(local.info_hash);
        }
    }

    fn schedule_retry(&self, entry: RetryEntry) {
        self.ledger.schedule_retry(
            entry,
            self.settings.retry.max_attempts,
            self.settings.retry.base_delay_secs,
        );
    }

    fn site(&self, site_id: &str) -> Option<Arc<Site>> {
        self.sites.iter().find(|e| e.id() == site_id).cloned()
    }

    async fn local_for_retry(&self, entry: &RetryEntry) -> Option<Arc<LocalTorrent>> {
        // the cache is fronted by the orchestrator, retries resolve through the client
        match self.client.get_info(&entry.local_info_hash).await {
            Ok(info) => {
                let bytes = self.client.get_metainfo(&entry.local_info_hash).await.ok()?;
                let metainfo = Metainfo::try_from(bytes.as_slice()).ok()?;
                Some(Arc::new(LocalTorrent::new(
                    &metainfo,
                    bytes,
                    info.save_path,
                    info.trackers,
                )))
            }
            Err(_) => None,
        }
    }
}

/// A fetched and accepted candidate, alive for one pipeline execution.
#[derive(Debug, Clone)]
struct AcceptedCandidate {
    site_id: String,
    remote_id: String,
    name: String,
    metainfo_bytes: Vec<u8>,
    metainfo: Metainfo,
    mapping: FileMapping,
}
