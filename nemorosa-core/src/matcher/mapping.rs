use crate::config::LinkMode;
use crate::torrent::TorrentFileEntry;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// A single reconciliation action for one target file.
///
/// Every target file of an accepted mapping is covered by exactly one action,
/// and no local file appears in more than one non-skip action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileAction {
    /// The local file already lives at the path the target expects.
    Identical { local: PathBuf, target: PathBuf },
    /// Same bytes, different relative path, the local file is moved.
    Rename { local: PathBuf, target: PathBuf },
    /// Same bytes, the local file is projected into the target root with a link.
    Link {
        local: PathBuf,
        target: PathBuf,
        mode: LinkMode,
    },
    /// The target declares a file which is deliberately omitted.
    Skip { target: PathBuf, length: u64 },
    /// A required target file has no local counterpart.
    Missing { target: PathBuf, length: u64 },
}

impl FileAction {
    /// Get the target path of the action.
    pub fn target(&self) -> &PathBuf {
        match self {
            FileAction::Identical { target, .. }
            | FileAction::Rename { target, .. }
            | FileAction::Link { target, .. }
            | FileAction::Skip { target, .. }
            | FileAction::Missing { target, .. } => target,
        }
    }

    /// Get the local source path of the action, absent for skip and missing.
    pub fn local(&self) -> Option<&PathBuf> {
        match self {
            FileAction::Identical { local, .. }
            | FileAction::Rename { local, .. }
            | FileAction::Link { local, .. } => Some(local),
            FileAction::Skip { .. } | FileAction::Missing { .. } => None,
        }
    }

    /// The bytes this action leaves unsatisfied within the target layout.
    pub fn unsatisfied_bytes(&self) -> u64 {
        match self {
            FileAction::Skip { length, .. } | FileAction::Missing { length, .. } => *length,
            _ => 0,
        }
    }
}

/// The accepted mapping between a local torrent and a candidate target torrent.
///
/// Actions are ordered by the declared file order of the candidate, which makes
/// the mapping byte-identical across runs for the same inputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMapping {
    actions: Vec<FileAction>,
}

impl FileMapping {
    pub fn new(actions: Vec<FileAction>) -> Self {
        Self { actions }
    }

    /// Create the trusted identity mapping for a candidate whose info hash matched
    /// the local torrent directly, every file is identical in place.
    pub fn identity(files: &[TorrentFileEntry]) -> Self {
        Self {
            actions: files
                .iter()
                .map(|file| FileAction::Identical {
                    local: file.path.clone(),
                    target: file.path.clone(),
                })
                .collect(),
        }
    }

    /// Get the ordered actions of the mapping.
    pub fn actions(&self) -> &[FileAction] {
        &self.actions
    }

    /// The total bytes of target files which stay unsatisfied.
    pub fn unsatisfied_bytes(&self) -> u64 {
        self.actions.iter().map(|e| e.unsatisfied_bytes()).sum()
    }

    /// Check whether every action is an in-place identical file.
    pub fn is_all_identical(&self) -> bool {
        self.actions
            .iter()
            .all(|e| matches!(e, FileAction::Identical { .. }))
    }

    /// Check whether the mapping requires any filesystem mutation.
    pub fn requires_reconcile(&self) -> bool {
        self.actions
            .iter()
            .any(|e| matches!(e, FileAction::Rename { .. } | FileAction::Link { .. }))
    }

    /// Summarize the mapping into per-class counters.
    pub fn summary(&self) -> MappingSummary {
        let mut summary = MappingSummary::default();

        for action in self.actions.iter() {
            match action {
                FileAction::Identical { .. } => summary.identical += 1,
                FileAction::Rename { .. } => summary.renamed += 1,
                FileAction::Link { .. } => summary.linked += 1,
                FileAction::Skip { length, .. } => {
                    summary.skipped += 1;
                    summary.unsatisfied_bytes += length;
                }
                FileAction::Missing { length, .. } => {
                    summary.missing += 1;
                    summary.unsatisfied_bytes += length;
                }
            }
        }

        summary
    }
}

/// The per-class counters of a [FileMapping], persisted with outcome records.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappingSummary {
    pub identical: usize,
    pub renamed: usize,
    pub linked: usize,
    pub skipped: usize,
    pub missing: usize,
    pub unsatisfied_bytes: u64,
}

impl Display for MappingSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} identical, {} renamed, {} linked, {} skipped, {} missing ({} bytes unsatisfied)",
            self.identical,
            self.renamed,
            self.linked,
            self.skipped,
            self.missing,
            self.unsatisfied_bytes
        )
    }
}

/// The reason a candidate was rejected by the matcher.
#[derive(Debug, Display, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// No target file could be paired with a local file by size.
    #[display("size_mismatch")]
    SizeMismatch,
    /// A verifiable piece hash didn't match.
    #[display("piece_mismatch")]
    PieceMismatch,
    /// A local file clashes with a differently sized target file of the same name.
    #[display("conflict")]
    Conflict,
    /// The unsatisfied bytes exceed the configured missing budget.
    #[display("too_much_missing")]
    TooMuchMissing,
    /// The mapping needs links but linking is disabled.
    #[display("linking_required_disabled")]
    LinkingRequiredDisabled,
}

/// The outcome of matching a candidate against a local torrent.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The candidate is acceptable with the contained mapping.
    Accepted(FileMapping),
    /// The candidate was rejected for the contained reason.
    Rejected(RejectReason),
}

impl Verdict {
    /// Get the accepted mapping if this verdict accepted the candidate.
    pub fn mapping(&self) -> Option<&FileMapping> {
        match self {
            Verdict::Accepted(mapping) => Some(mapping),
            Verdict::Rejected(_) => None,
        }
    }
}
