use crate::cache::LocalTorrent;
use crate::normalize::{normalize, similarity, strip_release_tags, NormalizeProfile};
use crate::trackers::{CandidateOrigin, CandidateRef, Site};
use futures::future;
use log::{debug, trace, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// The maximum number of name hits retained per site.
pub const DEFAULT_MAX_CANDIDATES: usize = 25;

/// The candidate search strategy across the configured target sites.
///
/// Every enabled site is searched in parallel through the hash ladder first,
/// where a direct hit short-circuits the name ladder for that site. The merged
/// results are deduplicated and ranked, hash hits before name hits, name hits
/// by their similarity to the local release name.
#[derive(Debug, Clone)]
pub struct CandidateSearch {
    max_candidates: usize,
}

impl Default for CandidateSearch {
    fn default() -> Self {
        Self {
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

impl CandidateSearch {
    pub fn new(max_candidates: usize) -> Self {
        Self {
            max_candidates: max_candidates.max(1),
        }
    }

    /// Derive the site search query from the given local torrent.
    ///
    /// The query is the release name stripped of its bracketed year, codec and
    /// source tags, which is what Gazelle search indexes respond best to.
    pub fn build_query(local: &LocalTorrent) -> String {
        strip_release_tags(local.name.as_str())
    }

    /// Search every given site for candidates of the given local torrent.
    ///
    /// # Returns
    ///
    /// Returns the deduplicated candidates in rank order.
    pub async fn search(&self, local: &LocalTorrent, sites: &[Arc<Site>]) -> Vec<CandidateRef> {
        let searches = sites
            .iter()
            .filter(|site| !site.is_disabled())
            .map(|site| self.search_site(local, site.clone()));
        let results = future::join_all(searches).await;

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut candidates: Vec<CandidateRef> = results
            .into_iter()
            .flatten()
            .filter(|candidate| {
                seen.insert((candidate.site_id.clone(), candidate.remote_id.clone()))
            })
            .collect();

        let local_name = normalize(local.name.as_str(), NormalizeProfile::Loose);
        candidates.sort_by(|left, right| {
            rank_key(left, local_name.as_str())
                .partial_cmp(&rank_key(right, local_name.as_str()))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| left.site_id.cmp(&right.site_id))
                .then_with(|| left.remote_id.cmp(&right.remote_id))
        });

        debug!(
            "Search of {} produced {} candidate(s)",
            local.info_hash,
            candidates.len()
        );
        candidates
    }

    /// Run the search ladder against a single site.
    async fn search_site(&self, local: &LocalTorrent, site: Arc<Site>) -> Vec<CandidateRef> {
        // hash ladder, the local hash itself first
        match site.search_by_hash(&local.info_hash).await {
            Ok(hits) if !hits.is_empty() => {
                trace!("Site {} has a direct hash hit for {}", site.id(), local.info_hash);
                return hits;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Hash search on {} failed, {}", site.id(), e);
                return Vec::new();
            }
        }

        // then the hash this torrent would carry with the site's source flag
        if let Some(flag) = site.source_flag() {
            if local.source.as_deref() != Some(flag.as_str()) {
                if let Some(hash) = local.with_source_hash(flag.as_str()) {
                    match site.search_by_hash(&hash).await {
                        Ok(hits) if !hits.is_empty() => {
                            trace!(
                                "Site {} has a source flag hash hit for {}",
                                site.id(),
                                local.info_hash
                            );
                            return hits;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Source flag hash search on {} failed, {}", site.id(), e);
                            return Vec::new();
                        }
                    }
                }
            }
        }

        // name ladder
        let query = Self::build_query(local);
        if query.is_empty() {
            return Vec::new();
        }

        match site.search_by_filename(query.as_str()).await {
            Ok(mut hits) => {
                hits.truncate(self.max_candidates);
                hits
            }
            Err(e) => {
                warn!("Name search on {} failed, {}", site.id(), e);
                Vec::new()
            }
        }
    }
}

/// The sort key of a candidate, lower ranks first.
fn rank_key(candidate: &CandidateRef, local_name: &str) -> (u8, f64) {
    match candidate.origin {
        CandidateOrigin::Hash => (0, 0.0),
        CandidateOrigin::Name => {
            let name = normalize(candidate.name.as_str(), NormalizeProfile::Loose);
            // negated so higher similarity sorts first
            (1, -similarity(name.as_str(), local_name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_logger;
    use crate::trackers::{MockTrackerSearcher, Result as TrackerResult};

    fn local() -> LocalTorrent {
        let bytes = crate::testing::multi_file_torrent(
            "Artist - Album (2020) [FLAC]",
            32,
            &[("01.flac", &[1u8; 64])],
            None,
        );
        let metainfo = crate::torrent::Metainfo::try_from(bytes.as_slice()).unwrap();
        LocalTorrent::new(
            &metainfo,
            bytes,
            std::path::PathBuf::from("/data"),
            vec![],
        )
    }

    fn candidate(site: &str, remote: &str, name: &str, origin: CandidateOrigin) -> CandidateRef {
        CandidateRef {
            site_id: site.to_string(),
            remote_id: remote.to_string(),
            info_hash: None,
            name: name.to_string(),
            origin,
        }
    }

    fn mock_site<F>(id: &'static str, configure: F) -> Arc<Site>
    where
        F: FnOnce(&mut MockTrackerSearcher),
    {
        let mut searcher = MockTrackerSearcher::new();
        searcher.expect_site_id().return_const(id.to_string());
        searcher
            .expect_tracker_domain()
            .return_const("tracker.example.org".to_string());
        searcher.expect_source_flag().return_const(None);
        configure(&mut searcher);
        Arc::new(Site::new(Box::new(searcher), 4))
    }

    #[test]
    fn test_build_query() {
        init_logger!();
        let result = CandidateSearch::build_query(&local());

        assert_eq!("Artist - Album", result);
    }

    #[tokio::test]
    async fn test_search_hash_hit_short_circuits() {
        init_logger!();
        let site = mock_site("redacted.sh", |searcher| {
            searcher.expect_search_by_hash().returning(|hash| {
                Ok(vec![CandidateRef {
                    site_id: "redacted.sh".to_string(),
                    remote_id: "1".to_string(),
                    info_hash: Some(*hash),
                    name: String::new(),
                    origin: CandidateOrigin::Hash,
                }])
            });
            // the name ladder must not run after a hash hit
            searcher.expect_search_by_filename().never();
        });
        let search = CandidateSearch::default();

        let result = search.search(&local(), &[site]).await;

        assert_eq!(1, result.len());
        assert_eq!(CandidateOrigin::Hash, result[0].origin);
    }

    #[tokio::test]
    async fn test_search_ranks_hash_before_name() {
        init_logger!();
        let hash_site = mock_site("zz-hash.example", |searcher| {
            searcher.expect_search_by_hash().returning(|hash| {
                Ok(vec![CandidateRef {
                    site_id: "zz-hash.example".to_string(),
                    remote_id: "9".to_string(),
                    info_hash: Some(*hash),
                    name: String::new(),
                    origin: CandidateOrigin::Hash,
                }])
            });
        });
        let name_site = mock_site("aa-name.example", |searcher| {
            searcher
                .expect_search_by_hash()
                .returning(|_| TrackerResult::Ok(vec![]));
            searcher.expect_search_by_filename().returning(|_| {
                Ok(vec![
                    candidate(
                        "aa-name.example",
                        "2",
                        "Unrelated Compilation",
                        CandidateOrigin::Name,
                    ),
                    candidate(
                        "aa-name.example",
                        "3",
                        "Artist - Album (2020) [FLAC]",
                        CandidateOrigin::Name,
                    ),
                ])
            });
        });
        let search = CandidateSearch::default();

        let result = search.search(&local(), &[name_site, hash_site]).await;

        assert_eq!(3, result.len());
        assert_eq!(CandidateOrigin::Hash, result[0].origin);
        assert_eq!(
            "3", result[1].remote_id,
            "expected the similar name to rank above the unrelated one"
        );
        assert_eq!("2", result[2].remote_id);
    }

    #[tokio::test]
    async fn test_search_deduplicates() {
        init_logger!();
        let site = mock_site("redacted.sh", |searcher| {
            searcher
                .expect_search_by_hash()
                .returning(|_| TrackerResult::Ok(vec![]));
            searcher.expect_search_by_filename().returning(|_| {
                Ok(vec![
                    candidate("redacted.sh", "7", "Album", CandidateOrigin::Name),
                    candidate("redacted.sh", "7", "Album", CandidateOrigin::Name),
                ])
            });
        });
        let search = CandidateSearch::default();

        let result = search.search(&local(), &[site]).await;

        assert_eq!(1, result.len());
    }

    #[tokio::test]
    async fn test_search_truncates_name_hits() {
        init_logger!();
        let site = mock_site("redacted.sh", |searcher| {
            searcher
                .expect_search_by_hash()
                .returning(|_| TrackerResult::Ok(vec![]));
            searcher.expect_search_by_filename().returning(|_| {
                Ok((0..50)
                    .map(|i| {
                        candidate(
                            "redacted.sh",
                            i.to_string().as_str(),
                            "Album",
                            CandidateOrigin::Name,
                        )
                    })
                    .collect())
            });
        });
        let search = CandidateSearch::new(5);

        let result = search.search(&local(), &[site]).await;

        assert_eq!(5, result.len());
    }

    #[tokio::test]
    async fn test_search_source_flag_ladder() {
        init_logger!();
        let local = local();
        let expected = local.with_source_hash("RED").unwrap();
        let local_hash = local.info_hash;

        let mut searcher = MockTrackerSearcher::new();
        searcher
            .expect_site_id()
            .return_const("redacted.sh".to_string());
        searcher
            .expect_tracker_domain()
            .return_const("flacsfor.me".to_string());
        searcher
            .expect_source_flag()
            .return_const(Some("RED".to_string()));
        searcher
            .expect_search_by_hash()
            .withf(move |hash| *hash == local_hash)
            .returning(|_| Ok(vec![]));
        searcher
            .expect_search_by_hash()
            .withf(move |hash| *hash == expected)
            .returning(|hash| {
                Ok(vec![CandidateRef {
                    site_id: "redacted.sh".to_string(),
                    remote_id: "55".to_string(),
                    info_hash: Some(*hash),
                    name: String::new(),
                    origin: CandidateOrigin::Hash,
                }])
            });
        let site = Arc::new(Site::new(Box::new(searcher), 4));
        let search = CandidateSearch::default();

        let result = search.search(&local, &[site]).await;

        assert_eq!(1, result.len());
        assert_eq!("55", result[0].remote_id);
        assert_eq!(Some(expected), result[0].info_hash);
    }
}
