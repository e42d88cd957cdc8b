use crate::matcher::{FileMapping, MappingSummary};
use crate::torrent::InfoHash;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// The terminal result of one pipeline execution against one site.
#[derive(Debug, Display, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeResult {
    /// A candidate was accepted, injected and verified.
    #[display("matched")]
    Matched,
    /// The search produced no candidates.
    #[display("no_candidates")]
    NoCandidates,
    /// Every candidate was rejected by the matcher.
    #[display("all_rejected")]
    AllRejected,
    /// A candidate download or injection failed, eligible for retry.
    #[display("download_failed")]
    DownloadFailed,
    /// The reconciliation or injection failed fatally.
    #[display("inject_failed")]
    InjectFailed,
    /// The injected torrent failed or timed out its recheck.
    #[display("verify_failed")]
    VerifyFailed,
}

impl OutcomeResult {
    /// Check if the result is eligible for an automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OutcomeResult::DownloadFailed)
    }
}

/// The record of one pipeline execution, append-only except for the retry
/// bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeRecord {
    /// The hash of the local torrent that was processed.
    pub local_info_hash: InfoHash,
    /// The site the outcome applies to, empty when no site was involved.
    pub site_id: String,
    /// The terminal result of the execution.
    pub result: OutcomeResult,
    /// The hash of the accepted candidate, if any.
    #[serde(default)]
    pub candidate_info_hash: Option<InfoHash>,
    /// The summary of the accepted mapping, if any.
    #[serde(default)]
    pub mapping_summary: Option<MappingSummary>,
    /// When the outcome was recorded.
    pub timestamp: DateTime<Utc>,
    /// How often this outcome has been retried.
    #[serde(default)]
    pub retry_count: u32,
    /// When the next retry is due, if any.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl OutcomeRecord {
    pub fn new(local_info_hash: InfoHash, site_id: String, result: OutcomeResult) -> Self {
        Self {
            local_info_hash,
            site_id,
            result,
            candidate_info_hash: None,
            mapping_summary: None,
            timestamp: Utc::now(),
            retry_count: 0,
            next_retry_at: None,
        }
    }

    pub fn with_candidate(mut self, candidate: InfoHash) -> Self {
        self.candidate_info_hash = Some(candidate);
        self
    }

    pub fn with_mapping(mut self, summary: MappingSummary) -> Self {
        self.mapping_summary = Some(summary);
        self
    }
}

/// The persisted context of a failed candidate download, replayed by the
/// retry sweep without re-searching the sites.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryEntry {
    /// The hash of the local torrent the candidate belongs to.
    pub local_info_hash: InfoHash,
    /// The site the candidate lives on.
    pub site_id: String,
    /// The torrent identifier on the site.
    pub remote_id: String,
    /// The release name of the candidate.
    pub candidate_name: String,
    /// The accepted mapping, when the failure happened after matching.
    #[serde(default)]
    pub mapping: Option<FileMapping>,
    /// How often this entry has been retried.
    #[serde(default)]
    pub retry_count: u32,
    /// When the next retry is due.
    pub next_retry_at: DateTime<Utc>,
    /// Set once the retry budget is exhausted.
    #[serde(default)]
    pub permanently_failed: bool,
}

impl RetryEntry {
    /// The unique key of a retry entry within the ledger.
    pub fn key(&self) -> String {
        retry_key(&self.local_info_hash, self.site_id.as_str())
    }

    /// Check if this entry is due at the given time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.permanently_failed && self.next_retry_at <= now
    }
}

/// Build the ledger key of a retry entry.
pub fn retry_key(local: &InfoHash, site_id: &str) -> String {
    format!("{}@{}", local, site_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_outcome_result_retryable() {
        assert!(OutcomeResult::DownloadFailed.is_retryable());
        assert!(!OutcomeResult::Matched.is_retryable());
        assert!(!OutcomeResult::InjectFailed.is_retryable());
        assert!(!OutcomeResult::VerifyFailed.is_retryable());
    }

    #[test]
    fn test_retry_entry_is_due() {
        let now = Utc::now();
        let mut entry = RetryEntry {
            local_info_hash: InfoHash::from_info_bytes(b"d4:name3:fooe"),
            site_id: "redacted.sh".to_string(),
            remote_id: "123".to_string(),
            candidate_name: "Album".to_string(),
            mapping: None,
            retry_count: 1,
            next_retry_at: now - Duration::minutes(1),
            permanently_failed: false,
        };

        assert!(entry.is_due(now));

        entry.next_retry_at = now + Duration::minutes(5);
        assert!(!entry.is_due(now));

        entry.next_retry_at = now - Duration::minutes(1);
        entry.permanently_failed = true;
        assert!(!entry.is_due(now), "expected a dead entry to never be due");
    }

    #[test]
    fn test_outcome_record_serde_round_trip() {
        let record = OutcomeRecord::new(
            InfoHash::from_info_bytes(b"d4:name3:fooe"),
            "redacted.sh".to_string(),
            OutcomeResult::Matched,
        )
        .with_candidate(InfoHash::from_info_bytes(b"d4:name3:bare"));

        let json = serde_json::to_string(&record).unwrap();
        let result: OutcomeRecord = serde_json::from_str(json.as_str()).unwrap();

        assert_eq!(record, result);
    }
}
