use crate::cache::HostCache;
use crate::config::Policy;
use crate::traits::Prober;
use crate::types::{format_latency, is_loopback, Endpoint, Measurement, Origin, DEAD};
use indicatif::ProgressBar;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// host -> measurement for one ranking run
pub type Measurements = HashMap<String, Measurement>;

/// Fans probes out over distinct hosts.
///
/// At most `policy.maxthreads` probes run at once (semaphore-gated tasks).
/// Results come back through one channel, so the collecting loop below is the
/// only writer of the result table. The whole probing phase is bounded by
/// `policy.socket_timeout`; hosts without a result by then are dead.
pub struct Scheduler {
    prober: Arc<dyn Prober>,
    progress: ProgressBar,
}

impl Scheduler {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self {
            prober,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub async fn measure(
        &self,
        endpoints: &[Endpoint],
        cache: &HostCache,
        policy: &Policy,
    ) -> Measurements {
        let mut results = Measurements::new();
        let mut pending: Vec<(String, u16)> = Vec::new();

        // 1. 按主机去重: first usable port of each host, in input order
        let mut hosts: Vec<(&str, Option<u16>)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for endpoint in endpoints {
            let host = endpoint.host.as_str();
            match index.get(host) {
                Some(&i) => {
                    if hosts[i].1.is_none() {
                        hosts[i].1 = endpoint.port;
                    }
                }
                None => {
                    index.insert(host, hosts.len());
                    hosts.push((host, endpoint.port));
                }
            }
        }

        // 2. 先处理不需要测速的主机
        for (host, port) in hosts {
            if policy.prefer.as_deref() == Some(host) {
                results.insert(host.to_string(), Measurement::new(host, 0.0, Origin::Preferred));
            } else if is_loopback(host) {
                results.insert(host.to_string(), Measurement::new(host, 0.0, Origin::Local));
            } else if let (false, Some(port)) = (host.is_empty(), port) {
                match cache.get(host) {
                    Some(latency) if cache.is_fresh() => {
                        results.insert(host.to_string(), Measurement::new(host, latency, Origin::Cache));
                    }
                    _ => pending.push((host.to_string(), port)),
                }
            } else {
                debug!("Cannot probe {:?}, treating it as dead", host);
                results.insert(host.to_string(), Measurement::new(host, DEAD, Origin::Unsupported));
            }
        }

        if pending.is_empty() {
            return results;
        }

        debug!(
            "Probing {} hosts ({} at a time, {}s deadline)",
            pending.len(),
            policy.maxthreads,
            policy.socket_timeout.as_secs()
        );
        self.progress.set_length(pending.len() as u64);

        // 3. 并发测速
        let semaphore = Arc::new(Semaphore::new(policy.maxthreads));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for (host, port) in &pending {
            let semaphore = semaphore.clone();
            let prober = self.prober.clone();
            let tx = tx.clone();
            let host = host.clone();
            let port = *port;
            let timeout = policy.socket_timeout;

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let outcome = prober.probe(&host, port, timeout).await;
                let _ = tx.send((host, outcome));
            });
        }
        // Only the tasks hold senders now; the channel closes once all finish
        drop(tx);

        // 4. 收集结果, 直到全部完成或超时
        let deadline = Instant::now() + policy.socket_timeout;
        let mut received = 0;
        loop {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some((host, outcome))) => {
                    let latency = outcome.latency();
                    debug!("{} {}", host, format_latency(latency));
                    self.progress.inc(1);
                    received += 1;
                    results.insert(host.clone(), Measurement::new(&host, latency, Origin::Probe));
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Probing deadline of {}s reached, {} hosts still pending",
                        policy.socket_timeout.as_secs(),
                        pending.len() - received
                    );
                    break;
                }
            }
        }

        // Abandoned probes are aborted; dropping their futures closes the sockets
        tasks.abort_all();
        self.progress.finish_and_clear();

        for (host, _) in pending {
            results.entry(host.clone()).or_insert_with(|| {
                debug!("{} gave no result, treating it as dead", host);
                Measurement::new(&host, DEAD, Origin::TimedOut)
            });
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::scripted::ScriptedProber;
    use std::time::Duration;

    fn endpoints(urls: &[&str]) -> Vec<Endpoint> {
        urls.iter().map(|u| Endpoint::parse(u)).collect()
    }

    async fn run(prober: Arc<ScriptedProber>, urls: &[&str], cache: &HostCache, policy: &Policy) -> Measurements {
        Scheduler::new(prober).measure(&endpoints(urls), cache, policy).await
    }

    #[tokio::test]
    async fn test_one_probe_per_host() {
        let prober = Arc::new(ScriptedProber::new().alive("a.example", 0.1).alive("b.example", 0.2));
        let results = run(
            prober.clone(),
            &[
                "http://a.example/fedora",
                "https://a.example/other",
                "ftp://a.example/pub",
                "http://b.example/fedora",
            ],
            &HostCache::empty(),
            &Policy::default(),
        )
        .await;

        assert_eq!(prober.calls("a.example"), 1);
        assert_eq!(prober.calls("b.example"), 1);
        assert_eq!(results.len(), 2);
        assert_eq!(results["a.example"].latency, 0.1);
        assert_eq!(results["a.example"].origin, Origin::Probe);
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_probe() {
        let prober = Arc::new(ScriptedProber::new().alive("a.example", 0.1).alive("b.example", 0.2));
        let cache = HostCache::fresh(HashMap::from([("a.example".to_string(), 0.042)]));

        let results = run(
            prober.clone(),
            &["http://a.example/", "http://b.example/"],
            &cache,
            &Policy::default(),
        )
        .await;

        assert_eq!(prober.calls("a.example"), 0);
        assert_eq!(prober.calls("b.example"), 1);
        assert_eq!(results["a.example"].latency, 0.042);
        assert_eq!(results["a.example"].origin, Origin::Cache);
    }

    #[tokio::test]
    async fn test_preferred_and_local_hosts_not_probed() {
        let prober = Arc::new(ScriptedProber::new().alive("local.example", 0.9));
        let policy = Policy {
            prefer: Some("local.example".to_string()),
            ..Default::default()
        };

        let results = run(
            prober.clone(),
            &[
                "http://local.example/repo",
                "http://localhost/repo",
                "http://127.0.0.1:8080/repo",
                "file:///srv/repo",
            ],
            &HostCache::empty(),
            &policy,
        )
        .await;

        assert_eq!(prober.total_calls(), 0);
        assert_eq!(results["local.example"].latency, 0.0);
        assert_eq!(results["local.example"].origin, Origin::Preferred);
        assert_eq!(results["localhost"].origin, Origin::Local);
        assert_eq!(results["127.0.0.1"].latency, 0.0);
    }

    #[tokio::test]
    async fn test_unprobeable_endpoints_are_dead() {
        let prober = Arc::new(ScriptedProber::new());
        let results = run(
            prober.clone(),
            &["not a url", "rsync://mirror.example/pub"],
            &HostCache::empty(),
            &Policy::default(),
        )
        .await;

        assert_eq!(prober.total_calls(), 0);
        assert_eq!(results[""].latency, DEAD);
        assert_eq!(results["mirror.example"].origin, Origin::Unsupported);
    }

    #[tokio::test]
    async fn test_host_measured_when_first_endpoint_has_no_port() {
        let net = Arc::new(ScriptedProber::new().alive("m.example", 0.05));
        let results = run(
            net.clone(),
            &["rsync://m.example/pub", "http://m.example/repo"],
            &HostCache::empty(),
            &Policy::default(),
        )
        .await;

        assert_eq!(net.calls("m.example"), 1);
        assert_eq!(results["m.example"].latency, 0.05);
        assert_eq!(results["m.example"].origin, Origin::Probe);
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let mut prober = ScriptedProber::new().delay(Duration::from_millis(20));
        let urls: Vec<String> = (0..24).map(|i| format!("http://m{}.example/repo", i)).collect();
        for i in 0..24 {
            prober = prober.alive(&format!("m{}.example", i), 0.01 * i as f64);
        }
        let prober = Arc::new(prober);
        let policy = Policy {
            maxthreads: 3,
            ..Default::default()
        };

        let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        let results = run(prober.clone(), &refs, &HostCache::empty(), &policy).await;

        assert_eq!(results.len(), 24);
        assert_eq!(prober.total_calls(), 24);
        assert!(prober.peak_in_flight() <= 3, "peak was {}", prober.peak_in_flight());
        assert!(prober.peak_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_timeout_ceiling() {
        let prober = Arc::new(
            ScriptedProber::new()
                .hang("a.example")
                .hang("b.example")
                .alive("c.example", 0.05),
        );
        let policy = Policy {
            socket_timeout: Duration::from_secs(1),
            ..Default::default()
        };

        let start = std::time::Instant::now();
        let results = run(
            prober,
            &["http://a.example/", "http://b.example/", "http://c.example/"],
            &HostCache::empty(),
            &policy,
        )
        .await;

        assert!(start.elapsed() < Duration::from_millis(1800));
        assert_eq!(results["a.example"].latency, DEAD);
        assert_eq!(results["a.example"].origin, Origin::TimedOut);
        assert_eq!(results["b.example"].latency, DEAD);
        assert_eq!(results["c.example"].latency, 0.05);
    }

    #[tokio::test]
    async fn test_failing_prober_does_not_disturb_others() {
        let prober = Arc::new(
            ScriptedProber::new()
                .panics("bad.example")
                .refused("down.example")
                .alive("good.example", 0.2),
        );

        let results = run(
            prober,
            &["http://bad.example/", "http://down.example/", "http://good.example/"],
            &HostCache::empty(),
            &Policy::default(),
        )
        .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results["bad.example"].latency, DEAD);
        assert_eq!(results["down.example"].latency, DEAD);
        assert_eq!(results["down.example"].origin, Origin::Probe);
        assert_eq!(results["good.example"].latency, 0.2);
    }

    #[tokio::test]
    async fn test_no_endpoints() {
        let prober = Arc::new(ScriptedProber::new());
        let results = run(prober, &[], &HostCache::empty(), &Policy::default()).await;
        assert!(results.is_empty());
    }
}
