use crate::engine::host;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_icmp_echo::Pinger;

/// What a single probe observed within its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reply(Duration),
    Timeout,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("could not resolve {host:?}")]
    Resolve { host: String },
    #[error("icmp echo failed: {0}")]
    Icmp(String),
}

/// Seam between the sampler and the network. The engine only ever sees this
/// trait, so tests drive the state machine with a scripted implementation.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, host: &str, timeout: Duration) -> Result<ProbeOutcome, ProbeError>;
}

/// ICMP echo over the platform stack via `tokio-icmp-echo`. The raw socket
/// is opened lazily on the first probe so construction stays infallible and
/// permission problems surface through the normal start path.
pub struct IcmpProber {
    pinger: OnceCell<Pinger>,
    ident: u16,
    seq: AtomicU16,
}

impl IcmpProber {
    pub fn new() -> Self {
        Self {
            pinger: OnceCell::new(),
            ident: rand::random(),
            seq: AtomicU16::new(0),
        }
    }

    async fn pinger(&self) -> Result<&Pinger, ProbeError> {
        self.pinger
            .get_or_try_init(|| async {
                Pinger::new().await.map_err(|e| ProbeError::Icmp(e.to_string()))
            })
            .await
    }
}

impl Default for IcmpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, host: &str, timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
        let addr = host::resolve(host).await.ok_or_else(|| ProbeError::Resolve {
            host: host.to_owned(),
        })?;
        let pinger = self.pinger().await?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        match pinger.ping(addr, self.ident, seq, timeout).await {
            Ok(Some(rtt)) => Ok(ProbeOutcome::Reply(rtt)),
            Ok(None) => Ok(ProbeOutcome::Timeout),
            Err(e) => Err(ProbeError::Icmp(e.to_string())),
        }
    }
}
