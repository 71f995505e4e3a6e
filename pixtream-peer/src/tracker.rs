//! Tracker HTTP client: periodic announce (peer list in) and utility reports (counters out).

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use pixtream_core::{AnnounceResponse, PeerId};
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

use crate::peer::Event;

const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TrackerClient {
    http: reqwest::Client,
    base: Url,
    peer_id: PeerId,
    port: u16,
    ip: Option<IpAddr>,
}

impl TrackerClient {
    pub fn new(base: &str, peer_id: PeerId, port: u16, ip: Option<IpAddr>) -> anyhow::Result<Self> {
        let base = Url::parse(base).with_context(|| format!("invalid tracker url {base}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("tracker url {base} cannot take a path"));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base,
            peer_id,
            port,
            ip,
        })
    }

    fn endpoint(&self, name: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(name);
        }
        url
    }

    fn announce_url(&self) -> Url {
        let mut url = self.endpoint("announce");
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("peer_id", &self.peer_id.to_string());
            q.append_pair("port", &self.port.to_string());
            if let Some(ip) = self.ip {
                q.append_pair("ip", &ip.to_string());
            }
        }
        url
    }

    fn utility_url(&self, utility: &[(PeerId, u64)]) -> Url {
        let mut url = self.endpoint("utility");
        {
            let mut q = url.query_pairs_mut();
            for (peer, bytes) in utility {
                q.append_pair(&peer.to_string(), &bytes.to_string());
            }
        }
        url
    }

    pub async fn announce(&self) -> anyhow::Result<AnnounceResponse> {
        self.http
            .get(self.announce_url())
            .send()
            .await
            .context("announce request failed")?
            .error_for_status()?
            .json::<AnnounceResponse>()
            .await
            .context("bad announce response")
    }

    pub async fn report_utility(&self, utility: &[(PeerId, u64)]) -> anyhow::Result<()> {
        if utility.is_empty() {
            return Ok(());
        }
        self.http
            .get(self.utility_url(utility))
            .send()
            .await
            .context("utility report failed")?
            .error_for_status()?;
        Ok(())
    }
}

/// Announce forever, forwarding each peer list to the node. The tracker may change the period.
pub async fn run_announcer(client: TrackerClient, events: mpsc::UnboundedSender<Event>) {
    let mut interval = DEFAULT_ANNOUNCE_INTERVAL;
    loop {
        match client.announce().await {
            Ok(resp) => {
                if let Some(reason) = resp.failure_reason {
                    warn!(%reason, "tracker refused announce");
                } else if events.send(Event::TrackerPeers(resp.peers)).is_err() {
                    return;
                }
                if let Some(secs) = resp.request_interval.filter(|s| *s > 0) {
                    interval = Duration::from_secs(secs);
                }
            }
            Err(e) => warn!(error = %e, "tracker announce failed"),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Push utility snapshots produced by the node.
pub async fn run_reporter(client: TrackerClient, mut rx: mpsc::UnboundedReceiver<Vec<(PeerId, u64)>>) {
    while let Some(utility) = rx.recv().await {
        if let Err(e) = client.report_utility(&utility).await {
            warn!(error = %e, "utility report failed");
        }
    }
}
