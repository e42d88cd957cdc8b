pub use mapping::*;

mod mapping;

use crate::cache::LocalTorrent;
use crate::config::LinkMode;
use crate::normalize::{normalize, similarity, NormalizeProfile, NAME_SIMILARITY_THRESHOLD};
use crate::torrent::{Metainfo, TorrentFileEntry};
use itertools::Itertools;
use log::{debug, trace};
use std::collections::HashSet;
use std::path::Path;

/// The audio file extensions which are treated as essential release content.
pub const AUDIO_EXTENSIONS: [&str; 14] = [
    "flac", "mp3", "m4a", "aac", "alac", "ogg", "opus", "wav", "ape", "wv", "dsf", "dff", "mpc",
    "aiff",
];

/// Check if the given path refers to an audio file.
pub fn is_audio_file<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// The policy under which candidates are matched against local torrents.
#[derive(Debug, Clone)]
pub struct MatchPolicy {
    /// The linking mode available to the reconciler.
    pub link_mode: LinkMode,
    /// Tolerate mismatching or unverifiable boundary pieces, reflink mode only.
    pub allow_partial_pieces: bool,
    /// The maximum total bytes of target files allowed to stay unsatisfied.
    pub max_missing_bytes: u64,
    /// Replace the local layout in place instead of projecting into a new root.
    /// Only valid when the candidate replaces the source torrent within the client.
    pub rename_in_place: bool,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            link_mode: LinkMode::default(),
            allow_partial_pieces: false,
            max_missing_bytes: 4 * 1024 * 1024,
            rename_in_place: false,
        }
    }
}

/// Matches candidate target torrents against local torrents.
///
/// The matcher is pure, it performs no I/O and is deterministic, matching the
/// same inputs twice yields byte-identical mappings.
#[derive(Debug, Clone, Default)]
pub struct FileMatcher {
    policy: MatchPolicy,
}

impl FileMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    /// Get the policy of this matcher.
    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    /// Decide whether the candidate torrent can be satisfied from the local files.
    ///
    /// # Returns
    ///
    /// Returns the accepted mapping, or the reason the candidate was rejected.
    pub fn match_torrents(&self, local: &LocalTorrent, candidate: &Metainfo) -> Verdict {
        let local_files = local.files.as_slice();
        let candidate_files = candidate.files_rooted();

        let pairs = self.pair_files(local_files, &candidate_files);

        // unpaired local files which clash with a differently sized target of the same name
        let conflicts = self.detect_conflicts(local_files, &candidate_files, &pairs);
        if !conflicts.is_empty() && self.policy.link_mode == LinkMode::None {
            debug!(
                "Torrent {} conflicts with candidate {} on {} file(s)",
                local.info_hash,
                candidate.info_hash(),
                conflicts.len()
            );
            return Verdict::Rejected(RejectReason::Conflict);
        }

        if pairs.iter().all(|e| e.is_none()) {
            return Verdict::Rejected(RejectReason::SizeMismatch);
        }

        if let Some(reason) = self.verify_pieces(local, candidate, &candidate_files, &pairs) {
            return Verdict::Rejected(reason);
        }

        let mut actions = Vec::with_capacity(candidate_files.len());
        for (target_index, target) in candidate_files.iter().enumerate() {
            let action = match pairs[target_index] {
                Some(local_index) => {
                    let local_file = &local_files[local_index];
                    match self.decide_path_action(local_file, target) {
                        Some(action) => action,
                        None => {
                            return Verdict::Rejected(RejectReason::LinkingRequiredDisabled);
                        }
                    }
                }
                None if conflicts.contains(&target_index) => FileAction::Missing {
                    target: target.path.clone(),
                    length: target.length,
                },
                None if is_audio_file(&target.path) => FileAction::Missing {
                    target: target.path.clone(),
                    length: target.length,
                },
                None => FileAction::Skip {
                    target: target.path.clone(),
                    length: target.length,
                },
            };
            actions.push(action);
        }

        let mapping = FileMapping::new(actions);
        if mapping.unsatisfied_bytes() > self.policy.max_missing_bytes {
            debug!(
                "Candidate {} leaves {} bytes unsatisfied, exceeding the budget of {}",
                candidate.info_hash(),
                mapping.unsatisfied_bytes(),
                self.policy.max_missing_bytes
            );
            return Verdict::Rejected(RejectReason::TooMuchMissing);
        }

        trace!(
            "Candidate {} accepted with mapping {}",
            candidate.info_hash(),
            mapping.summary()
        );
        Verdict::Accepted(mapping)
    }

    /// Pair every candidate file with at most one local file, by size first and
    /// loose normalized name similarity second.
    ///
    /// # Returns
    ///
    /// Returns the local file index per candidate file index, in declared order.
    fn pair_files(
        &self,
        local_files: &[TorrentFileEntry],
        candidate_files: &[TorrentFileEntry],
    ) -> Vec<Option<usize>> {
        let mut pairs: Vec<Option<usize>> = vec![None; candidate_files.len()];
        let mut used: Vec<bool> = vec![false; local_files.len()];

        // competing targets are resolved in lexicographic normalized path order
        let order = (0..candidate_files.len())
            .sorted_by_key(|&i| loose_path(&candidate_files[i].path));

        for target_index in order {
            let target = &candidate_files[target_index];
            let same_size: Vec<usize> = local_files
                .iter()
                .enumerate()
                .filter(|(i, file)| !used[*i] && file.length == target.length)
                .map(|(i, _)| i)
                .collect();

            let chosen = match same_size.len() {
                0 => None,
                1 => Some(same_size[0]),
                _ => self.disambiguate(local_files, target, &same_size),
            };

            if let Some(local_index) = chosen {
                used[local_index] = true;
                pairs[target_index] = Some(local_index);
            }
        }

        pairs
    }

    /// Pick the best local partner among several size-equal files by loose
    /// basename similarity, ties broken by path depth and declared order.
    fn disambiguate(
        &self,
        local_files: &[TorrentFileEntry],
        target: &TorrentFileEntry,
        same_size: &[usize],
    ) -> Option<usize> {
        let target_name = loose_basename(&target.path);
        let target_depth = target.path.components().count();

        let mut scored: Vec<(usize, f64, usize)> = same_size
            .iter()
            .filter_map(|&local_index| {
                let ratio = similarity(
                    loose_basename(&local_files[local_index].path).as_str(),
                    target_name.as_str(),
                );
                if ratio >= NAME_SIMILARITY_THRESHOLD {
                    let depth = local_files[local_index].path.components().count();
                    let depth_distance = depth.abs_diff(target_depth);
                    Some((local_index, ratio, depth_distance))
                } else {
                    None
                }
            })
            .collect();

        scored.sort_by(|left, right| {
            right
                .1
                .partial_cmp(&left.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(left.2.cmp(&right.2))
                .then(left.0.cmp(&right.0))
        });

        scored.first().map(|(local_index, _, _)| *local_index)
    }

    /// Detect unpaired local files which share a loose normalized stem with an
    /// unpaired target file of a different length.
    ///
    /// A target that already has a pair is satisfied, a stem clash against it
    /// is no conflict, the clashing local file simply stays untouched.
    ///
    /// # Returns
    ///
    /// Returns the indices of the conflicting target files.
    fn detect_conflicts(
        &self,
        local_files: &[TorrentFileEntry],
        candidate_files: &[TorrentFileEntry],
        pairs: &[Option<usize>],
    ) -> HashSet<usize> {
        let paired_locals: HashSet<usize> = pairs.iter().filter_map(|e| *e).collect();
        let mut conflicts = HashSet::new();

        for (local_index, local_file) in local_files.iter().enumerate() {
            if paired_locals.contains(&local_index) {
                continue;
            }

            let local_stem = loose_stem(&local_file.path);
            for (target_index, target) in candidate_files
                .iter()
                .enumerate()
                .filter(|(target_index, _)| pairs[*target_index].is_none())
            {
                if target.length != local_file.length && loose_stem(&target.path) == local_stem {
                    conflicts.insert(target_index);
                }
            }
        }

        conflicts
    }

    /// Verify the paired files through the piece hashes of both sides.
    ///
    /// Verification requires the piece geometry to align, the same piece length
    /// and every pair at the same cumulative offset. When the geometry doesn't
    /// align, the candidate is only acceptable under the partial piece tolerance.
    ///
    /// # Returns
    ///
    /// Returns the rejection reason when verification fails, or [None] when the
    /// mapping passes or tolerance applies.
    fn verify_pieces(
        &self,
        local: &LocalTorrent,
        candidate: &Metainfo,
        candidate_files: &[TorrentFileEntry],
        pairs: &[Option<usize>],
    ) -> Option<RejectReason> {
        let partial_tolerated =
            self.policy.allow_partial_pieces && self.policy.link_mode == LinkMode::Reflink;
        let candidate_pieces = candidate.sha1_pieces();
        let piece_length = candidate.piece_length();

        let aligned = piece_length == local.piece_length
            && !local.pieces.is_empty()
            && !candidate_pieces.is_empty()
            && pairs.iter().enumerate().all(|(target_index, pair)| {
                pair.map(|local_index| {
                    local.files[local_index].offset == candidate_files[target_index].offset
                })
                .unwrap_or(true)
            });

        if !aligned {
            trace!(
                "Piece geometry of candidate {} doesn't align with {}",
                candidate.info_hash(),
                local.info_hash
            );
            return (!partial_tolerated).then_some(RejectReason::PieceMismatch);
        }

        // the byte ranges every piece draws from, in target file indices
        let total_size: u64 = candidate_files.iter().map(|e| e.length).sum();
        let piece_count = candidate_pieces.len();
        let mut coverage: Vec<Vec<(usize, u64)>> = vec![Vec::new(); piece_count];
        for (target_index, target) in candidate_files.iter().enumerate() {
            if target.length == 0 {
                continue;
            }
            let first = (target.offset / piece_length) as usize;
            let last = ((target.offset + target.length - 1) / piece_length) as usize;
            for piece in first..=last.min(piece_count.saturating_sub(1)) {
                let piece_start = piece as u64 * piece_length;
                let piece_end = (piece_start + piece_length).min(total_size);
                let covered = (target.offset + target.length).min(piece_end)
                    - target.offset.max(piece_start);
                coverage[piece].push((target_index, covered));
            }
        }

        for (piece, contributors) in coverage.iter().enumerate() {
            if contributors.is_empty() {
                continue;
            }
            // only pieces whose every contributing file is paired can be checked
            if !contributors
                .iter()
                .all(|(target_index, _)| pairs[*target_index].is_some())
            {
                continue;
            }
            // a truncated final piece only verifies when both torrents end together
            if piece == piece_count - 1 && local_total_size(local) != total_size {
                continue;
            }
            if local.pieces.len() <= piece {
                return Some(RejectReason::PieceMismatch);
            }

            if local.pieces[piece] != candidate_pieces[piece] {
                let piece_start = piece as u64 * piece_length;
                let piece_size = (piece_start + piece_length).min(total_size) - piece_start;
                let spans_boundary = contributors.len() > 1
                    || contributors
                        .first()
                        .map(|(_, covered)| *covered < piece_size)
                        .unwrap_or(false);

                if spans_boundary && partial_tolerated {
                    debug!(
                        "Tolerating mismatching boundary piece {} of candidate {}",
                        piece,
                        candidate.info_hash()
                    );
                    continue;
                }
                debug!(
                    "Piece {} of candidate {} doesn't match the local data",
                    piece,
                    candidate.info_hash()
                );
                return Some(RejectReason::PieceMismatch);
            }
        }

        None
    }

    /// Decide the action for a paired file based on the target path.
    ///
    /// # Returns
    ///
    /// Returns [None] when a link would be required but linking is disabled.
    fn decide_path_action(
        &self,
        local_file: &TorrentFileEntry,
        target: &TorrentFileEntry,
    ) -> Option<FileAction> {
        let local_path = strict_path(&local_file.path);
        let target_path = strict_path(&target.path);

        if local_path == target_path {
            return Some(FileAction::Identical {
                local: local_file.path.clone(),
                target: target.path.clone(),
            });
        }
        if self.policy.rename_in_place {
            return Some(FileAction::Rename {
                local: local_file.path.clone(),
                target: target.path.clone(),
            });
        }
        if self.policy.link_mode != LinkMode::None {
            return Some(FileAction::Link {
                local: local_file.path.clone(),
                target: target.path.clone(),
                mode: self.policy.link_mode,
            });
        }

        None
    }
}

fn local_total_size(local: &LocalTorrent) -> u64 {
    local.files.iter().map(|e| e.length).sum()
}

fn loose_path(path: &Path) -> String {
    normalize(path.to_string_lossy().as_ref(), NormalizeProfile::Loose)
}

fn strict_path(path: &Path) -> String {
    normalize(path.to_string_lossy().as_ref(), NormalizeProfile::Strict)
}

fn loose_basename(path: &Path) -> String {
    normalize(
        path.file_name()
            .map(|e| e.to_string_lossy())
            .unwrap_or_default()
            .as_ref(),
        NormalizeProfile::Loose,
    )
}

fn loose_stem(path: &Path) -> String {
    normalize(
        path.file_stem()
            .map(|e| e.to_string_lossy())
            .unwrap_or_default()
            .as_ref(),
        NormalizeProfile::Loose,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_logger;
    use crate::testing::multi_file_torrent;
    use crate::torrent::Metainfo;
    use std::path::PathBuf;

    fn local_from(bytes: &[u8]) -> LocalTorrent {
        let metainfo = Metainfo::try_from(bytes).unwrap();
        LocalTorrent::new(&metainfo, bytes.to_vec(), PathBuf::from("/data"), vec![])
    }

    fn candidate_from(bytes: &[u8]) -> Metainfo {
        Metainfo::try_from(bytes).unwrap()
    }

    fn matcher(link_mode: LinkMode) -> FileMatcher {
        FileMatcher::new(MatchPolicy {
            link_mode,
            allow_partial_pieces: false,
            max_missing_bytes: 100,
            rename_in_place: false,
        })
    }

    #[test]
    fn test_match_identical_layout() {
        init_logger!();
        let audio = vec![7u8; 128];
        let local = local_from(&multi_file_torrent(
            "Album",
            32,
            &[("01 - Track.flac", &audio)],
            None,
        ));
        let candidate = candidate_from(&multi_file_torrent(
            "Album",
            32,
            &[("01 - Track.flac", &audio)],
            Some("RED"),
        ));

        let result = matcher(LinkMode::Hard).match_torrents(&local, &candidate);

        let mapping = result.mapping().expect("expected the candidate to be accepted");
        assert!(mapping.is_all_identical());
        assert_eq!(1, mapping.actions().len());
    }

    #[test]
    fn test_match_renamed_root() {
        init_logger!();
        let audio = vec![7u8; 128];
        let local = local_from(&multi_file_torrent(
            "Album",
            32,
            &[("01 - Track.flac", &audio)],
            None,
        ));
        let candidate = candidate_from(&multi_file_torrent(
            "Artist - Album (2020)",
            32,
            &[("01 - Track.flac", &audio)],
            None,
        ));

        // a cross-seed projects into the new root with links
        let result = matcher(LinkMode::Hard).match_torrents(&local, &candidate);
        let mapping = result.mapping().expect("expected the candidate to be accepted");
        assert_eq!(
            &FileAction::Link {
                local: PathBuf::from("Album/01 - Track.flac"),
                target: PathBuf::from("Artist - Album (2020)/01 - Track.flac"),
                mode: LinkMode::Hard,
            },
            &mapping.actions()[0]
        );

        // a replacement within the same client renames in place
        let replace = FileMatcher::new(MatchPolicy {
            rename_in_place: true,
            ..matcher(LinkMode::Hard).policy().clone()
        });
        let result = replace.match_torrents(&local, &candidate);
        let mapping = result.mapping().expect("expected the candidate to be accepted");
        assert!(
            matches!(mapping.actions()[0], FileAction::Rename { .. }),
            "expected a rename action"
        );

        // without linking the projection is impossible
        let result = matcher(LinkMode::None).match_torrents(&local, &candidate);
        assert_eq!(
            Verdict::Rejected(RejectReason::LinkingRequiredDisabled),
            result
        );
    }

    #[test]
    fn test_match_artwork_drift() {
        init_logger!();
        let audio = vec![7u8; 128];
        let local = local_from(&multi_file_torrent(
            "Album",
            32,
            &[("01.flac", &audio), ("cover.jpg", &[1u8; 40])],
            None,
        ));
        let candidate = candidate_from(&multi_file_torrent(
            "Album",
            32,
            &[("01.flac", &audio), ("cover.jpg", &[2u8; 80])],
            None,
        ));

        // with linking the conflicting artwork goes unsatisfied on the target side
        let result = matcher(LinkMode::Hard).match_torrents(&local, &candidate);
        let mapping = result.mapping().expect("expected the candidate to be accepted");
        assert_eq!(
            &FileAction::Identical {
                local: PathBuf::from("Album/01.flac"),
                target: PathBuf::from("Album/01.flac"),
            },
            &mapping.actions()[0]
        );
        assert_eq!(
            &FileAction::Missing {
                target: PathBuf::from("Album/cover.jpg"),
                length: 80,
            },
            &mapping.actions()[1]
        );

        // without linking the clash is a conflict
        let result = matcher(LinkMode::None).match_torrents(&local, &candidate);
        assert_eq!(Verdict::Rejected(RejectReason::Conflict), result);
    }

    #[test]
    fn test_match_conflicting_formats() {
        init_logger!();
        let local = local_from(&multi_file_torrent(
            "Album",
            32,
            &[("01.mp3", &[1u8; 10])],
            None,
        ));
        let candidate = candidate_from(&multi_file_torrent(
            "Album",
            32,
            &[("01.flac", &[2u8; 20])],
            None,
        ));

        let result = matcher(LinkMode::None).match_torrents(&local, &candidate);

        assert_eq!(Verdict::Rejected(RejectReason::Conflict), result);
    }

    #[test]
    fn test_match_sidecar_stem_clash_is_no_conflict() {
        init_logger!();
        let audio = vec![7u8; 100];
        // the cue sidecar shares its stem with the paired audio file but has
        // no counterpart on the candidate side
        let local = local_from(&multi_file_torrent(
            "Album",
            32,
            &[("01 Track.flac", &audio), ("01 Track.cue", &[2u8; 50])],
            None,
        ));
        let candidate = candidate_from(&multi_file_torrent(
            "Album",
            32,
            &[("01 Track.flac", &audio)],
            None,
        ));

        let result = matcher(LinkMode::None).match_torrents(&local, &candidate);

        let mapping = result
            .mapping()
            .expect("expected the satisfied target to not count as a conflict");
        assert!(mapping.is_all_identical());
        assert_eq!(1, mapping.actions().len());
    }

    #[test]
    fn test_match_missing_budget() {
        init_logger!();
        let audio = vec![7u8; 64];
        let local = local_from(&multi_file_torrent("Album", 32, &[("01.flac", &audio)], None));
        let candidate = candidate_from(&multi_file_torrent(
            "Album",
            32,
            &[("01.flac", &audio), ("02.flac", &[3u8; 200])],
            None,
        ));

        let result = matcher(LinkMode::Hard).match_torrents(&local, &candidate);

        assert_eq!(Verdict::Rejected(RejectReason::TooMuchMissing), result);
    }

    #[test]
    fn test_match_skips_small_artwork() {
        init_logger!();
        let audio = vec![7u8; 64];
        let local = local_from(&multi_file_torrent("Album", 32, &[("01.flac", &audio)], None));
        let candidate = candidate_from(&multi_file_torrent(
            "Album",
            32,
            &[("01.flac", &audio), ("folder.jpg", &[3u8; 50])],
            None,
        ));

        let result = matcher(LinkMode::Hard).match_torrents(&local, &candidate);

        let mapping = result.mapping().expect("expected the candidate to be accepted");
        assert_eq!(
            &FileAction::Skip {
                target: PathBuf::from("Album/folder.jpg"),
                length: 50,
            },
            &mapping.actions()[1]
        );
    }

    #[test]
    fn test_match_piece_mismatch() {
        init_logger!();
        let local = local_from(&multi_file_torrent(
            "Album",
            32,
            &[("01.flac", &[1u8; 128])],
            None,
        ));
        let candidate = candidate_from(&multi_file_torrent(
            "Album",
            32,
            &[("01.flac", &[2u8; 128])],
            None,
        ));

        let result = matcher(LinkMode::Hard).match_torrents(&local, &candidate);

        assert_eq!(Verdict::Rejected(RejectReason::PieceMismatch), result);
    }

    #[test]
    fn test_match_piece_length_mismatch() {
        init_logger!();
        let audio = vec![7u8; 128];
        let local = local_from(&multi_file_torrent("Album", 16, &[("01.flac", &audio)], None));
        let candidate =
            candidate_from(&multi_file_torrent("Album", 64, &[("01.flac", &audio)], None));

        // verification is impossible, only the reflink tolerance accepts
        let result = matcher(LinkMode::Hard).match_torrents(&local, &candidate);
        assert_eq!(Verdict::Rejected(RejectReason::PieceMismatch), result);

        let reflink = FileMatcher::new(MatchPolicy {
            link_mode: LinkMode::Reflink,
            allow_partial_pieces: true,
            max_missing_bytes: 100,
            rename_in_place: false,
        });
        let result = reflink.match_torrents(&local, &candidate);
        let mapping = result.mapping().expect("expected the candidate to be accepted");
        assert!(mapping.is_all_identical());
    }

    #[test]
    fn test_match_zero_width_name_drift() {
        init_logger!();
        let track = vec![7u8; 64];
        let other = vec![8u8; 64];
        let local = local_from(&multi_file_torrent(
            "Album",
            32,
            &[
                ("01 - Track\u{200B}.flac", &track),
                ("02 - Other.flac", &other),
            ],
            None,
        ));
        let candidate = candidate_from(&multi_file_torrent(
            "Album",
            32,
            &[("01 - Track.flac", &track), ("02 - Other.flac", &other)],
            None,
        ));

        let result = matcher(LinkMode::Hard).match_torrents(&local, &candidate);

        let mapping = result.mapping().expect("expected the candidate to be accepted");
        // the drifted file ends up below the candidate's spelling
        assert_eq!(
            &FileAction::Link {
                local: PathBuf::from("Album/01 - Track\u{200B}.flac"),
                target: PathBuf::from("Album/01 - Track.flac"),
                mode: LinkMode::Hard,
            },
            &mapping.actions()[0]
        );
        assert!(
            matches!(mapping.actions()[1], FileAction::Identical { .. }),
            "expected the clean file to stay in place"
        );
    }

    #[test]
    fn test_match_no_size_overlap() {
        init_logger!();
        let local = local_from(&multi_file_torrent(
            "Album",
            32,
            &[("01.flac", &[1u8; 10])],
            None,
        ));
        let candidate = candidate_from(&multi_file_torrent(
            "Other",
            32,
            &[("another.flac", &[2u8; 99])],
            None,
        ));

        let result = matcher(LinkMode::Hard).match_torrents(&local, &candidate);

        assert_eq!(Verdict::Rejected(RejectReason::SizeMismatch), result);
    }

    #[test]
    fn test_match_deterministic() {
        init_logger!();
        let track = vec![7u8; 64];
        let other = vec![8u8; 64];
        let local = local_from(&multi_file_torrent(
            "Album",
            32,
            &[("01 - Track.flac", &track), ("02 - Other.flac", &other)],
            None,
        ));
        let candidate = candidate_from(&multi_file_torrent(
            "Artist - Album",
            32,
            &[("01 - Track.flac", &track), ("02 - Other.flac", &other)],
            None,
        ));
        let matcher = matcher(LinkMode::Sym);

        let first = matcher.match_torrents(&local, &candidate);
        let second = matcher.match_torrents(&local, &candidate);

        assert_eq!(first, second, "expected the matcher to be deterministic");
    }
}
