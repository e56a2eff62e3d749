use crate::cache::{self, HostCache};
use crate::config::Policy;
use crate::order;
use crate::prober::TcpProber;
use crate::scheduler::{Measurements, Scheduler};
use crate::traits::Prober;
use crate::types::{format_latency, Endpoint, RankedList, Repository};
use indicatif::ProgressBar;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one ranking run over one or more repositories.
#[derive(Debug, Default)]
pub struct RankOutcome {
    /// One list per repository, same order as the input
    pub lists: Vec<RankedList>,
    pub measurements: Measurements,
}

/// MirrorRanker: owns the policy and the prober for ranking runs.
///
/// A run loads the host cache, measures every distinct host once across all
/// repositories, reorders each repository's mirrors in place and writes the
/// cache back. Nothing in a run is fatal.
pub struct MirrorRanker {
    policy: Policy,
    prober: Arc<dyn Prober>,
    progress: ProgressBar,
    /// Leave the host cache file alone
    read_only: bool,
}

impl MirrorRanker {
    pub fn new(policy: Policy) -> Self {
        Self::with_prober(policy, Arc::new(TcpProber))
    }

    pub fn with_prober(policy: Policy, prober: Arc<dyn Prober>) -> Self {
        Self {
            policy,
            prober,
            progress: ProgressBar::hidden(),
            read_only: false,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Rank without writing the host cache back.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub async fn rank_repositories(&self, repos: &mut [Repository]) -> RankOutcome {
        let per_repo: Vec<Vec<Endpoint>> = repos
            .iter()
            .map(|r| r.mirrors.iter().map(|u| Endpoint::parse(u)).collect())
            .collect();
        let all: Vec<Endpoint> = per_repo.iter().flatten().cloned().collect();

        if all.is_empty() {
            debug!("No endpoints to rank");
            return RankOutcome {
                lists: vec![RankedList::default(); repos.len()],
                measurements: Measurements::new(),
            };
        }

        // 1. Load cache
        let cache = HostCache::load(&self.policy.hostfilepath, self.policy.maxhostfileage).await;
        debug!("Host cache {:?} with {} hosts", cache.state(), cache.entries().len());

        // 2. Measure every distinct host
        let scheduler = Scheduler::new(self.prober.clone()).with_progress(self.progress.clone());
        let measurements = scheduler.measure(&all, &cache, &self.policy).await;

        // 3. Reorder each repository
        let mut lists = Vec::with_capacity(repos.len());
        for (repo, endpoints) in repos.iter_mut().zip(&per_repo) {
            let ranked = order::order(endpoints, &measurements, &self.policy);

            if ranked.is_empty() && !endpoints.is_empty() {
                warn!("All mirrors of {} were filtered out", repo.id);
            }
            if let Some(best) = ranked.best() {
                if self.policy.always_print_best_host {
                    info!("* {}: {}", repo.id, best.endpoint.host);
                } else {
                    debug!("* {}: {} ({})", repo.id, best.endpoint.host, format_latency(best.latency));
                }
            }

            repo.mirrors = ranked.urls();
            lists.push(ranked);
        }

        // 4. Persist
        if self.read_only {
            debug!("Read-only run, host cache not written");
        } else {
            self.persist(&cache, &measurements).await;
        }

        RankOutcome {
            lists,
            measurements,
        }
    }

    /// Write the cache back when the run learned something new, or when the
    /// file was absent or stale. A run served entirely from a fresh cache
    /// leaves the file and its mtime alone.
    async fn persist(&self, cache: &HostCache, measurements: &Measurements) {
        let fresh_probes = measurements
            .values()
            .any(|m| m.is_persistable() && cache.get(&m.host).is_none());
        if cache.is_fresh() && !fresh_probes {
            debug!("Host cache is up to date");
            return;
        }

        let mut entries: HashMap<String, f64> = if cache.is_fresh() {
            cache.entries().clone()
        } else {
            HashMap::new()
        };
        for m in measurements.values().filter(|m| m.is_persistable()) {
            entries.insert(m.host.clone(), m.latency);
        }

        let path = &self.policy.hostfilepath;
        match cache::save(path, &entries).await {
            Ok(()) => debug!("Wrote {} hosts to {:?}", entries.len(), path),
            Err(e) => warn!("Could not write host cache {:?}: {}", path, e),
        }
    }
}
