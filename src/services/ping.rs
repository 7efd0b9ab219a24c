//! Reachability probes for BMC and OS addresses.
use async_trait::async_trait;
use rand::random;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, ICMP};
use tokio::process::Command;
use tracing::{debug, warn};

/// Values that front ends tend to submit for "no address".
const PLACEHOLDER_ADDRESSES: [&str; 3] = ["string", "null", "none"];

#[async_trait]
pub trait Pinger: Send + Sync {
    async fn is_alive(&self, address: &str) -> bool;
}

pub fn is_probe_target(address: &str) -> bool {
    let address = address.trim();
    !address.is_empty()
        && !PLACEHOLDER_ADDRESSES
            .iter()
            .any(|p| p.eq_ignore_ascii_case(address))
}

/// Single ICMP echo per probe. Falls back to the system `ping` binary when
/// the process may not open ICMP sockets.
#[derive(Debug, Clone)]
pub struct IcmpPinger {
    timeout: Duration,
}

impl IcmpPinger {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn resolve(address: &str) -> Option<IpAddr> {
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Some(ip);
        }
        let target = address.to_string();
        let resolved = tokio::task::spawn_blocking(move || {
            use std::net::ToSocketAddrs;
            format!("{target}:0").to_socket_addrs()
        })
        .await;
        match resolved {
            Ok(Ok(mut addrs)) => addrs.next().map(|a| a.ip()),
            _ => None,
        }
    }

    async fn icmp_echo(&self, ip: IpAddr) -> Result<bool, std::io::Error> {
        let config = match ip {
            IpAddr::V4(_) => Config::default(),
            IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
        };
        let client = Client::new(&config)?;
        let mut pinger = client.pinger(ip, PingIdentifier(random())).await;
        pinger.timeout(self.timeout);
        Ok(pinger.ping(PingSequence(0), &[0; 8]).await.is_ok())
    }

    async fn system_ping(&self, address: &str) -> bool {
        let mut command = Command::new("ping");
        if cfg!(windows) {
            command.args(["-n", "1", "-w", &self.timeout.as_millis().to_string()]);
        } else {
            let secs = self.timeout.as_secs().max(1);
            command.args(["-c", "1", "-W", &secs.to_string()]);
        }
        command
            .arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match command.status().await {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(error = %e, "Failed to run system ping.");
                false
            }
        }
    }
}

#[async_trait]
impl Pinger for IcmpPinger {
    async fn is_alive(&self, address: &str) -> bool {
        if !is_probe_target(address) {
            return false;
        }
        let address = address.trim();
        let Some(ip) = Self::resolve(address).await else {
            debug!(address, "Address did not resolve; treating as offline.");
            return false;
        };

        match self.icmp_echo(ip).await {
            Ok(alive) => alive,
            Err(e) => {
                debug!(error = %e, "ICMP socket unavailable, using system ping.");
                self.system_ping(address).await
            }
        }
    }
}
