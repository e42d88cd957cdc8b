use crate::app::AppError;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info, warn};
use nemorosa_core::ledger::Ledger;
use nemorosa_core::matcher::MappingSummary;
use nemorosa_core::orchestrator::{AnnounceOutcome, Orchestrator};
use nemorosa_core::pipeline::PipelineResult;
use nemorosa_core::torrent::InfoHash;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The state shared by every request handler.
#[derive(Clone)]
struct ServerState {
    orchestrator: Orchestrator,
    ledger: Ledger,
    api_key: String,
}

/// The response body of a webhook invocation.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ProcessResponse {
    /// The high level status, `matched`, `accepted` or `failed`.
    pub status: String,
    /// The pipeline result in machine readable form.
    pub result: String,
    /// The hex hash of the accepted candidate, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    /// The summary of the accepted mapping, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_summary: Option<MappingSummary>,
}

/// One entry of the job log endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub info_hash: String,
    pub site: String,
    pub result: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
}

/// The query parameters of the webhook endpoint.
#[derive(Debug, Deserialize)]
struct WebhookQuery {
    #[serde(rename = "infoHash", default)]
    info_hash: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

/// Serve the webhook api until the process is interrupted.
pub async fn serve(
    host: String,
    port: u16,
    api_key: String,
    orchestrator: Orchestrator,
    ledger: Ledger,
) -> Result<(), AppError> {
    if api_key.is_empty() {
        return Err(AppError::Config(
            "server.api_key must be configured in server mode".to_string(),
        ));
    }

    let router = build_router(ServerState {
        orchestrator,
        ledger,
        api_key,
    });

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .map_err(|e| AppError::Runtime(format!("failed to bind {}:{}, {}", host, port, e)))?;
    info!("Server listening on {}:{}", host, port);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .map_err(|e| AppError::Runtime(e.to_string()))
}

/// Build the router for the given state, exposed for the server tests.
fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/webhook", post(webhook))
        .route("/jobs", get(jobs))
        .with_state(state)
}

async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "nemorosa",
        "version": nemorosa_core::VERSION,
        "endpoints": [
            "POST /api/webhook?infoHash=HEX",
            "GET /jobs",
        ],
    }))
}

async fn webhook(
    State(state): State<ServerState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
) -> (StatusCode, Json<ProcessResponse>) {
    if !authorized(&headers, state.api_key.as_str()) {
        return respond(StatusCode::UNAUTHORIZED, "failed", "unauthorized");
    }

    let info_hash = match query.info_hash.as_deref() {
        Some(value) => match InfoHash::from_str(value) {
            Ok(hash) => Some(hash),
            Err(_) => {
                debug!("Webhook received an invalid info hash \"{}\"", value);
                return respond(StatusCode::NOT_FOUND, "failed", "unknown_hash");
            }
        },
        None => None,
    };

    let outcome = state
        .orchestrator
        .process_announce(info_hash, query.name.as_deref(), query.size)
        .await;

    match outcome {
        AnnounceOutcome::UnknownTorrent => respond(StatusCode::NOT_FOUND, "failed", "unknown_hash"),
        AnnounceOutcome::Timeout => respond(StatusCode::REQUEST_TIMEOUT, "failed", "timeout"),
        AnnounceOutcome::Completed(PipelineResult::Matched {
            candidate, summary, ..
        }) => (
            StatusCode::OK,
            Json(ProcessResponse {
                status: "matched".to_string(),
                result: "matched".to_string(),
                candidate: Some(candidate.as_hex()),
                mapping_summary: Some(summary),
            }),
        ),
        AnnounceOutcome::Completed(PipelineResult::NoMatch) => {
            respond(StatusCode::ACCEPTED, "accepted", "no_match")
        }
        AnnounceOutcome::Completed(PipelineResult::Skipped(reason)) => {
            debug!("Webhook processing skipped, {}", reason);
            respond(StatusCode::ACCEPTED, "accepted", "skipped")
        }
        AnnounceOutcome::Completed(result) => {
            warn!("Webhook processing failed with {:?}", result);
            respond(StatusCode::INTERNAL_SERVER_ERROR, "failed", "internal")
        }
    }
}

async fn jobs(State(state): State<ServerState>) -> Json<Vec<JobResponse>> {
    let outcomes = state.ledger.outcomes(100).await;

    Json(
        outcomes
            .into_iter()
            .map(|record| JobResponse {
                info_hash: record.local_info_hash.as_hex(),
                site: record.site_id,
                result: record.result.to_string(),
                timestamp: record.timestamp.to_rfc3339(),
                candidate: record.candidate_info_hash.map(|e| e.as_hex()),
            })
            .collect(),
    )
}

fn authorized(headers: &HeaderMap, api_key: &str) -> bool {
    headers
        .get("Authorization")
        .and_then(|e| e.to_str().ok())
        .and_then(|e| e.strip_prefix("Bearer "))
        .map(|e| e == api_key)
        .unwrap_or(false)
}

fn respond(status: StatusCode, state: &str, result: &str) -> (StatusCode, Json<ProcessResponse>) {
    (
        status,
        Json(ProcessResponse {
            status: state.to_string(),
            result: result.to_string(),
            candidate: None,
            mapping_summary: None,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nemorosa_core::cache::{LocalTorrent, TorrentInfoCache};
    use nemorosa_core::client::{MockTorrentClient, TorrentClient};
    use nemorosa_core::config::{RetrySettings, TimeoutSettings};
    use nemorosa_core::init_logger;
    use nemorosa_core::matcher::{FileMatcher, MatchPolicy};
    use nemorosa_core::orchestrator::OrchestratorSettings;
    use nemorosa_core::pipeline::{MatchPipeline, PipelineSettings};
    use nemorosa_core::reconcile::Reconciler;
    use nemorosa_core::search::CandidateSearch;
    use nemorosa_core::torrent::Metainfo;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn state() -> (ServerState, InfoHash, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let bytes = nemorosa_core::testing::multi_file_torrent(
            "Album",
            32,
            &[("01.flac", &[7u8; 64])],
            None,
        );
        let metainfo = Metainfo::try_from(bytes.as_slice()).unwrap();
        let hash = *metainfo.info_hash();
        let local = LocalTorrent::new(&metainfo, bytes, temp_dir.path().to_path_buf(), vec![]);
        let cache = TorrentInfoCache::from_entries(vec![local]);
        let ledger = Ledger::open(temp_dir.path().join("nemorosa.json"))
            .await
            .unwrap();

        let client: Arc<dyn TorrentClient> = Arc::new(MockTorrentClient::new());
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
                workers: 2,
                check_trackers: None,
                announce_timeout: Duration::from_secs(5),
            },
            pipeline,
            cache,
            client,
            ledger.clone(),
        );

        (
            ServerState {
                orchestrator,
                ledger,
                api_key: "secret".to_string(),
            },
            hash,
            temp_dir,
        )
    }

    async fn spawn_server(state: ServerState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        format!("http://{}", address)
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_key() {
        init_logger!();
        let (state, hash, _temp_dir) = state().await;
        let base = spawn_server(state).await;

        let response = reqwest::Client::new()
            .post(format!("{}/api/webhook?infoHash={}", base, hash))
            .header("Authorization", "Bearer wrong")
            .send()
            .await
            .unwrap();

        assert_eq!(401, response.status().as_u16());
    }

    #[tokio::test]
    async fn test_webhook_unknown_hash() {
        init_logger!();
        let (state, _hash, _temp_dir) = state().await;
        let base = spawn_server(state).await;

        let response = reqwest::Client::new()
            .post(format!(
                "{}/api/webhook?infoHash={}",
                base, "eadaf0efea39406914414d359e0ea16416409bd7"
            ))
            .header("Authorization", "Bearer secret")
            .send()
            .await
            .unwrap();

        assert_eq!(404, response.status().as_u16());
        let body: ProcessResponse = response.json().await.unwrap();
        assert_eq!("unknown_hash", body.result);
    }

    #[tokio::test]
    async fn test_webhook_known_hash_without_sites() {
        init_logger!();
        let (state, hash, _temp_dir) = state().await;
        let base = spawn_server(state).await;

        let response = reqwest::Client::new()
            .post(format!("{}/api/webhook?infoHash={}", base, hash))
            .header("Authorization", "Bearer secret")
            .send()
            .await
            .unwrap();

        // without sites the pipeline completes with no match
        assert_eq!(202, response.status().as_u16());
        let body: ProcessResponse = response.json().await.unwrap();
        assert_eq!("accepted", body.status);
    }

    #[tokio::test]
    async fn test_jobs_endpoint() {
        init_logger!();
        let (state, hash, _temp_dir) = state().await;
        state.ledger.record_outcome(
            nemorosa_core::ledger::OutcomeRecord::new(
                hash,
                "redacted.sh".to_string(),
                nemorosa_core::ledger::OutcomeResult::Matched,
            ),
        );
        state.ledger.flush().await;
        let base = spawn_server(state).await;

        let response = reqwest::Client::new()
            .get(format!("{}/jobs", base))
            .send()
            .await
            .unwrap();

        assert_eq!(200, response.status().as_u16());
        let body: Vec<JobResponse> = response.json().await.unwrap();
        assert_eq!(1, body.len());
        assert_eq!("matched", body[0].result);
    }
}
