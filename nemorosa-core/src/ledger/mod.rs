pub use model::*;

mod model;

use crate::cache::LocalTorrent;
use crate::torrent::InfoHash;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, trace, warn};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;

/// The current schema version of the persisted ledger document.
const SCHEMA_VERSION: u32 = 1;
/// The filename of the ledger document below the data directory.
const LEDGER_FILENAME: &str = "nemorosa.json";
/// The environment variable overriding the data directory, used by containers.
const DATA_DIR_ENV: &str = "NEMOROSA_DATA_DIR";

/// The result type for all ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// The errors that can occur while loading or persisting the ledger.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    #[error("failed to access ledger file, {0}")]
    Io(String),
    #[error("failed to parse ledger file, {0}")]
    Parse(String),
    #[error("ledger schema version {0} is not supported")]
    UnsupportedVersion(u32),
}

/// The persisted document holding every table of the application state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct LedgerState {
    /// The schema version of the document, migrated linearly on load.
    version: u32,
    /// The hashes which have been processed before.
    #[serde(default)]
    seen: HashSet<InfoHash>,
    /// The append-only outcome log.
    #[serde(default)]
    outcomes: Vec<OutcomeRecord>,
    /// The retryable download failures, keyed by local hash and site.
    #[serde(default)]
    retries: HashMap<String, RetryEntry>,
    /// The persisted torrent info cache entries.
    #[serde(default)]
    cache: Vec<LocalTorrent>,
}

/// The commands processed by the single ledger writer.
#[derive(Debug)]
enum LedgerCommand {
    MarkSeen(InfoHash),
    RecordOutcome(OutcomeRecord),
    UpsertRetry(RetryEntry),
    RemoveRetry(String),
    SaveCache(Vec<LocalTorrent>),
    Flush(oneshot::Sender<()>),
}

/// The persistent ledger of seen hashes, outcomes, retry state and the
/// torrent info cache.
///
/// Reads are snapshots of the in-memory state; every mutation serializes
/// through the command queue onto a single writer task which also persists
/// the document to disk.
#[derive(Debug, Clone)]
pub struct Ledger {
    inner: Arc<InnerLedger>,
}

impl Ledger {
    /// Open the ledger document at the given path, creating it when absent
    /// and migrating older schema versions forward.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = Self::load(&path).await?;
        let (command_sender, command_receiver) = unbounded_channel();

        let inner = Arc::new(InnerLedger {
            path,
            state: RwLock::new(state),
            command_sender,
            cancellation_token: CancellationToken::new(),
        });

        let writer = inner.clone();
        tokio::spawn(async move {
            writer.start(command_receiver).await;
        });

        Ok(Self { inner })
    }

    /// Resolve the default ledger path within the platform user data directory.
    /// Containers override the location through `NEMOROSA_DATA_DIR`.
    pub fn default_path() -> PathBuf {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            return PathBuf::from(dir).join(LEDGER_FILENAME);
        }

        directories::ProjectDirs::from("", "", "nemorosa")
            .map(|dirs| dirs.data_dir().join(LEDGER_FILENAME))
            .unwrap_or_else(|| PathBuf::from(LEDGER_FILENAME))
    }

    /// Check if the given hash has been processed before.
    pub async fn is_seen(&self, hash: &InfoHash) -> bool {
        self.inner.state.read().await.seen.contains(hash)
    }

    /// Mark the given hash as processed.
    pub fn mark_seen(&self, hash: InfoHash) {
        self.send(LedgerCommand::MarkSeen(hash));
    }

    /// Append the given outcome to the log.
    pub fn record_outcome(&self, record: OutcomeRecord) {
        info!(
            "Outcome of {} on {}: {}",
            record.local_info_hash,
            Some(record.site_id.as_str())
                .filter(|e| !e.is_empty())
                .unwrap_or("-"),
            record.result
        );
        self.send(LedgerCommand::RecordOutcome(record));
    }

    /// Get the most recent outcomes, newest first.
    pub async fn outcomes(&self, limit: usize) -> Vec<OutcomeRecord> {
        let state = self.inner.state.read().await;
        state.outcomes.iter().rev().take(limit).cloned().collect()
    }

    /// Store or replace the retry entry for its local hash and site.
    pub fn upsert_retry(&self, entry: RetryEntry) {
        self.send(LedgerCommand::UpsertRetry(entry));
    }

    /// Remove the retry entry of the given local hash and site.
    pub fn remove_retry(&self, local: &InfoHash, site_id: &str) {
        self.send(LedgerCommand::RemoveRetry(retry_key(local, site_id)));
    }

    /// Get the retry entries which are due at the given time.
    pub async fn due_retries(&self, now: DateTime<Utc>) -> Vec<RetryEntry> {
        let state = self.inner.state.read().await;
        state
            .retries
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect()
    }

    /// Get the retry entry of the given local hash and site.
    pub async fn retry(&self, local: &InfoHash, site_id: &str) -> Option<RetryEntry> {
        let state = self.inner.state.read().await;
        state.retries.get(&retry_key(local, site_id)).cloned()
    }

    /// Register a failed attempt on the given entry, scheduling the next try
    /// with exponential backoff and jitter, or marking it permanently failed
    /// once the attempt budget is exhausted.
    pub fn schedule_retry(&self, mut entry: RetryEntry, max_attempts: u32, base_delay_secs: u64) {
        entry.retry_count += 1;

        if entry.retry_count >= max_attempts {
            warn!(
                "Retry budget of {} on {} exhausted after {} attempts",
                entry.local_info_hash, entry.site_id, entry.retry_count
            );
            entry.permanently_failed = true;
        } else {
            let backoff = base_delay_secs.saturating_mul(1u64 << (entry.retry_count - 1).min(16));
            let jitter = rand::rng().random_range(0..=base_delay_secs.max(1) / 2);
            entry.next_retry_at = Utc::now() + Duration::seconds((backoff + jitter) as i64);
            debug!(
                "Retry {} of {} on {} scheduled at {}",
                entry.retry_count, entry.local_info_hash, entry.site_id, entry.next_retry_at
            );
        }

        self.send(LedgerCommand::UpsertRetry(entry));
    }

    /// Persist the given torrent info cache snapshot.
    pub fn save_cache(&self, entries: Vec<LocalTorrent>) {
        self.send(LedgerCommand::SaveCache(entries));
    }

    /// Get the persisted torrent info cache entries.
    pub async fn cache_entries(&self) -> Vec<LocalTorrent> {
        self.inner.state.read().await.cache.clone()
    }

    /// Wait until every queued mutation has been applied and persisted.
    pub async fn flush(&self) {
        let (sender, receiver) = oneshot::channel();
        self.send(LedgerCommand::Flush(sender));
        let _ = receiver.await;
    }

    /// Stop the writer task after flushing the queue.
    pub async fn close(&self) {
        self.flush().await;
        self.inner.cancellation_token.cancel();
    }

    fn send(&self, command: LedgerCommand) {
        if let Err(e) = self.inner.command_sender.send(command) {
            error!("Ledger writer is gone, dropping command {:?}", e.0);
        }
    }

    async fn load(path: &Path) -> Result<LedgerState> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Ledger file {:?} doesn't exist yet, starting empty", path);
                return Ok(LedgerState {
                    version: SCHEMA_VERSION,
                    ..Default::default()
                });
            }
            Err(e) => return Err(LedgerError::Io(e.to_string())),
        };

        let state: LedgerState =
            serde_json::from_str(data.as_str()).map_err(|e| LedgerError::Parse(e.to_string()))?;
        Self::migrate(state)
    }

    /// Apply the linear forward-only migration chain to the loaded document.
    fn migrate(mut state: LedgerState) -> Result<LedgerState> {
        while state.version < SCHEMA_VERSION {
            match state.version {
                // version 0 predates the retry table, serde defaults already
                // filled the new fields, only the version needs bumping
                0 => state.version = 1,
                version => return Err(LedgerError::UnsupportedVersion(version)),
            }
            trace!("Migrated ledger document to version {}", state.version);
        }

        if state.version > SCHEMA_VERSION {
            return Err(LedgerError::UnsupportedVersion(state.version));
        }

        Ok(state)
    }
}

#[derive(Debug)]
struct InnerLedger {
    path: PathBuf,
    state: RwLock<LedgerState>,
    command_sender: UnboundedSender<LedgerCommand>,
    cancellation_token: CancellationToken,
}

impl InnerLedger {
    async fn start(&self, mut command_receiver: UnboundedReceiver<LedgerCommand>) {
        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                command = command_receiver.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }
        debug!("Ledger writer stopped");
    }

    async fn handle_command(&self, command: LedgerCommand) {
        let mut dirty = true;

        {
            let mut state = self.state.write().await;
            match command {
                LedgerCommand::MarkSeen(hash) => {
                    dirty = state.seen.insert(hash);
                }
                LedgerCommand::RecordOutcome(record) => state.outcomes.push(record),
                LedgerCommand::UpsertRetry(entry) => {
                    state.retries.insert(entry.key(), entry);
                }
                LedgerCommand::RemoveRetry(key) => {
                    dirty = state.retries.remove(&key).is_some();
                }
                LedgerCommand::SaveCache(entries) => state.cache = entries,
                LedgerCommand::Flush(ack) => {
                    drop(state);
                    self.persist().await;
                    let _ = ack.send(());
                    return;
                }
            }
        }

        if dirty {
            self.persist().await;
        }
    }

    /// Write the document to disk, atomically through a sibling temp file.
    async fn persist(&self) {
        let data = {
            let state = self.state.read().await;
            match serde_json::to_string_pretty(&*state) {
                Ok(data) => data,
                Err(e) => {
                    error!("Failed to serialize ledger state, {}", e);
                    return;
                }
            }
        };

        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!("Failed to create ledger directory {:?}, {}", parent, e);
                return;
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        if let Err(e) = tokio::fs::write(&temp_path, data.as_bytes()).await {
            error!("Failed to write ledger file {:?}, {}", temp_path, e);
            return;
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            error!("Failed to replace ledger file {:?}, {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_logger;
    use tempfile::tempdir;

    fn hash(seed: &[u8]) -> InfoHash {
        InfoHash::from_info_bytes(seed)
    }

    #[tokio::test]
    async fn test_ledger_seen_round_trip() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nemorosa.json");
        let ledger = Ledger::open(&path).await.unwrap();
        let hash = hash(b"seen");

        assert!(!ledger.is_seen(&hash).await);
        ledger.mark_seen(hash);
        ledger.flush().await;
        assert!(ledger.is_seen(&hash).await);

        // a reopened ledger reads the persisted document
        ledger.close().await;
        let reopened = Ledger::open(&path).await.unwrap();
        assert!(reopened.is_seen(&hash).await, "expected the seen hash to persist");
    }

    #[tokio::test]
    async fn test_ledger_outcomes() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let ledger = Ledger::open(temp_dir.path().join("nemorosa.json"))
            .await
            .unwrap();

        ledger.record_outcome(OutcomeRecord::new(
            hash(b"first"),
            "redacted.sh".to_string(),
            OutcomeResult::NoCandidates,
        ));
        ledger.record_outcome(OutcomeRecord::new(
            hash(b"second"),
            "redacted.sh".to_string(),
            OutcomeResult::Matched,
        ));
        ledger.flush().await;

        let result = ledger.outcomes(1).await;
        assert_eq!(1, result.len());
        assert_eq!(OutcomeResult::Matched, result[0].result, "expected newest first");
    }

    #[tokio::test]
    async fn test_ledger_retry_schedule() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let ledger = Ledger::open(temp_dir.path().join("nemorosa.json"))
            .await
            .unwrap();
        let entry = RetryEntry {
            local_info_hash: hash(b"retry"),
            site_id: "redacted.sh".to_string(),
            remote_id: "42".to_string(),
            candidate_name: "Album".to_string(),
            mapping: None,
            retry_count: 0,
            next_retry_at: Utc::now(),
            permanently_failed: false,
        };

        ledger.schedule_retry(entry.clone(), 5, 300);
        ledger.flush().await;

        let stored = ledger.retry(&entry.local_info_hash, "redacted.sh").await.unwrap();
        assert_eq!(1, stored.retry_count);
        assert!(
            stored.next_retry_at > Utc::now(),
            "expected the next retry to be in the future"
        );
        assert!(
            ledger.due_retries(Utc::now()).await.is_empty(),
            "expected no due retries yet"
        );

        // exhausting the budget marks the entry permanently failed
        let mut exhausted = stored;
        exhausted.retry_count = 4;
        ledger.schedule_retry(exhausted, 5, 300);
        ledger.flush().await;
        let stored = ledger.retry(&entry.local_info_hash, "redacted.sh").await.unwrap();
        assert!(stored.permanently_failed);
        assert!(!stored.is_due(Utc::now() + Duration::days(365)));
    }

    #[tokio::test]
    async fn test_ledger_migrates_version_zero() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nemorosa.json");
        tokio::fs::write(&path, r#"{ "version": 0, "seen": [] }"#)
            .await
            .unwrap();

        let ledger = Ledger::open(&path).await.unwrap();

        assert!(ledger.due_retries(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_ledger_rejects_future_version() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nemorosa.json");
        tokio::fs::write(&path, r#"{ "version": 99 }"#).await.unwrap();

        let result = Ledger::open(&path).await;

        assert!(
            matches!(result, Err(LedgerError::UnsupportedVersion(99))),
            "expected the future version to be rejected"
        );
    }
}
