use log::{debug, info, warn};
use nemorosa_core::cache::TorrentInfoCache;
use nemorosa_core::client::{create_client, ClientUrl, TorrentClient};
use nemorosa_core::config::AppConfig;
use nemorosa_core::ledger::Ledger;
use nemorosa_core::matcher::{FileMatcher, MatchPolicy};
use nemorosa_core::orchestrator::{Orchestrator, OrchestratorSettings};
use nemorosa_core::pipeline::{MatchPipeline, PipelineResult, PipelineSettings};
use nemorosa_core::reconcile::Reconciler;
use nemorosa_core::search::CandidateSearch;
use nemorosa_core::torrent::InfoHash;
use nemorosa_core::trackers::{GazelleHtml, GazelleJson, Site, TrackerSearcher};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The errors that end a nemorosa invocation, mapped onto the exit codes.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// The configuration is unusable, exit code 2.
    #[error("configuration error: {0}")]
    Config(String),
    /// No torrent client could be reached, exit code 3.
    #[error("no client reachable: {0}")]
    ClientUnreachable(String),
    /// A runtime failure, exit code 1.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// The mode a nemorosa invocation runs in.
#[derive(Debug, Clone, PartialEq)]
pub enum RunMode {
    /// Process every eligible torrent within the client once.
    Scan,
    /// Process a single torrent by its info hash.
    Single(InfoHash),
    /// Replay the due retry ledger entries.
    Retry,
    /// Serve the webhook api until interrupted.
    Server { host: String, port: u16 },
}

/// The assembled application.
pub struct App {
    config: AppConfig,
    orchestrator: Orchestrator,
    ledger: Ledger,
}

impl App {
    /// Wire the application from the given configuration.
    ///
    /// # Returns
    ///
    /// Returns the ready application, or the error deciding the exit code.
    pub async fn bootstrap(config: AppConfig) -> Result<Self, AppError> {
        let downloader = config
            .downloader
            .as_ref()
            .ok_or_else(|| AppError::Config("downloader.client must be configured".to_string()))?;
        let client_url = ClientUrl::from_str(downloader.client.as_str())
            .map_err(|e| AppError::Config(e.to_string()))?;
        let client: Arc<dyn TorrentClient> = Arc::from(create_client(&client_url));

        // a client that can't even list its torrents is unreachable
        client
            .list_hashes()
            .await
            .map_err(|e| AppError::ClientUnreachable(e.to_string()))?;
        info!("Connected to {}", client.name());

        let ledger_path = Ledger::default_path();
        debug!("Opening ledger at {:?}", ledger_path);
        let ledger = Ledger::open(&ledger_path)
            .await
            .map_err(|e| AppError::Runtime(e.to_string()))?;
        let cache = TorrentInfoCache::from_entries(ledger.cache_entries().await);

        let sites = Self::build_sites(&config)?;
        if sites.is_empty() {
            warn!("No target sites are configured, searches will never match");
        }

        let matcher = FileMatcher::new(MatchPolicy {
            link_mode: config.global.linking.mode,
            allow_partial_pieces: config.global.linking.allow_partial_pieces,
            max_missing_bytes: config.global.max_missing_bytes,
            rename_in_place: false,
        });
        let pipeline = Arc::new(MatchPipeline::new(
            PipelineSettings::from_config(&config),
            matcher,
            CandidateSearch::default(),
            sites,
            client.clone(),
            Arc::new(Reconciler::new()),
            ledger.clone(),
        ));
        let orchestrator = Orchestrator::new(
            OrchestratorSettings {
                workers: config.global.concurrency.workers,
                check_trackers: config.global.check_trackers.clone(),
                announce_timeout: Duration::from_secs(config.global.timeouts.announce_secs),
            },
            pipeline,
            cache,
            client,
            ledger.clone(),
        );

        Ok(Self {
            config,
            orchestrator,
            ledger,
        })
    }

    /// Build the wrapped site adapters from the configuration.
    fn build_sites(config: &AppConfig) -> Result<Vec<Arc<Site>>, AppError> {
        let timeout = Duration::from_secs(config.global.timeouts.search_secs);
        let permits = config.global.concurrency.per_site;

        config
            .target_site
            .iter()
            .map(|settings| {
                let searcher: Box<dyn TrackerSearcher> = if settings.api_key.is_some() {
                    Box::new(
                        GazelleJson::new(settings, timeout)
                            .map_err(|e| AppError::Config(e.to_string()))?,
                    )
                } else {
                    Box::new(
                        GazelleHtml::new(settings, timeout)
                            .map_err(|e| AppError::Config(e.to_string()))?,
                    )
                };
                debug!("Configured target site {}", settings.site_id());
                Ok(Arc::new(Site::new(searcher, permits)))
            })
            .collect()
    }

    /// Run the application in the given mode.
    pub async fn run(self, mode: RunMode) -> Result<(), AppError> {
        let result = match mode {
            RunMode::Scan => {
                self.orchestrator.full_scan().await;
                Ok(())
            }
            RunMode::Single(hash) => {
                let result = self.orchestrator.process_single(&hash).await;
                info!("Torrent {} finished with {:?}", hash, result);
                match result {
                    PipelineResult::InjectFailed(e) => Err(AppError::Runtime(e)),
                    _ => Ok(()),
                }
            }
            RunMode::Retry => {
                let replayed = self.orchestrator.retry_sweep().await;
                info!("Replayed {} retry entr(ies)", replayed);
                Ok(())
            }
            RunMode::Server { host, port } => {
                // the scheduled sweep runs next to the webhook server when configured
                if let Some(interval) = self.config.server.scan_interval_secs {
                    let orchestrator = self.orchestrator.clone();
                    tokio::spawn(async move {
                        orchestrator
                            .run_scheduled(Duration::from_secs(interval.max(60)))
                            .await;
                    });
                }

                crate::server::serve(
                    host,
                    port,
                    self.config.server.api_key.clone().unwrap_or_default(),
                    self.orchestrator.clone(),
                    self.ledger.clone(),
                )
                .await
            }
        };

        self.orchestrator.shutdown();
        self.ledger.close().await;
        result
    }
}
