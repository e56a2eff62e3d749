use crate::traits::Prober;
use crate::types::DEAD;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, TcpStream};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadReason {
    Refused,
    Unresolved,
    TimedOut,
    Io,
}

/// 单次测速结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Alive(Duration),
    Dead(DeadReason),
}

impl ProbeOutcome {
    /// Latency in seconds, `DEAD` for failures.
    pub fn latency(&self) -> f64 {
        match self {
            ProbeOutcome::Alive(elapsed) => elapsed.as_secs_f64(),
            ProbeOutcome::Dead(_) => DEAD,
        }
    }
}

/// Measures TCP connect time: from starting name resolution to the stream
/// being established. The stream is dropped (closed) right away.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();

        match tokio::time::timeout(timeout, connect(host, port)).await {
            Ok(Ok(stream)) => {
                let elapsed = start.elapsed();
                drop(stream);
                ProbeOutcome::Alive(elapsed)
            }
            Ok(Err(reason)) => {
                trace!("{}:{} failed: {:?}", host, port, reason);
                ProbeOutcome::Dead(reason)
            }
            // The pending connect future is dropped here, closing its socket
            Err(_) => ProbeOutcome::Dead(DeadReason::TimedOut),
        }
    }
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, DeadReason> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|_| DeadReason::Unresolved)?
        .collect();

    if addrs.is_empty() {
        return Err(DeadReason::Unresolved);
    }

    // Same as std: try every resolved address, report the last failure
    let mut last = DeadReason::Io;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last = classify(&e),
        }
    }
    Err(last)
}

fn classify(e: &io::Error) -> DeadReason {
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => DeadReason::Refused,
        io::ErrorKind::TimedOut => DeadReason::TimedOut,
        _ => DeadReason::Io,
    }
}
