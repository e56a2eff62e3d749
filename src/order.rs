use crate::config::Policy;
use crate::scheduler::Measurements;
use crate::types::{Endpoint, RankedEndpoint, RankedList, DEAD};
use regex::Regex;
use tracing::info;

fn matches_any(patterns: &[Regex], host: &str) -> bool {
    patterns.iter().any(|p| p.is_match(host))
}

/// Whether the filters keep this endpoint. `include_only` wins over `exclude`.
pub fn is_allowed(endpoint: &Endpoint, policy: &Policy) -> bool {
    if !policy.include_only.is_empty() {
        return matches_any(&policy.include_only, &endpoint.host);
    }
    !matches_any(&policy.exclude, &endpoint.host)
}

/// Order endpoints fastest first.
///
/// Every input endpoint is kept (duplicates too) unless a filter drops it.
/// Hosts missing from `results` count as dead. The sort is stable, so equal
/// latencies keep their input order. With `downgrade_ftp` every FTP endpoint
/// goes after every non-FTP one.
pub fn order(endpoints: &[Endpoint], results: &Measurements, policy: &Policy) -> RankedList {
    let mut ranked = RankedList::default();

    for endpoint in endpoints {
        if !is_allowed(endpoint, policy) {
            info!("Excluding mirror: {}", endpoint.host);
            ranked.excluded.push(endpoint.clone());
            continue;
        }

        let latency = results
            .get(&endpoint.host)
            .map(|m| m.latency)
            .unwrap_or(DEAD);

        ranked.entries.push(RankedEndpoint {
            endpoint: endpoint.clone(),
            latency,
        });
    }

    let downgrade_ftp = policy.downgrade_ftp;
    ranked.entries.sort_by(|a, b| {
        let ftp_a = downgrade_ftp && a.endpoint.is_ftp();
        let ftp_b = downgrade_ftp && b.endpoint.is_ftp();
        ftp_a.cmp(&ftp_b).then(a.latency.total_cmp(&b.latency))
    });

    ranked
}
