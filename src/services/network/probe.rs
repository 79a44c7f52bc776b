//! Read-only inspection of the wireless interface and the uplink.

use super::{
    access_point::HOSTAPD_UNIT,
    parse::{parse_device_status, parse_ipv4_address, parse_ssid},
    reachability::ReachabilityProbe,
    systemd::unit_active,
    types::LinkSnapshot,
};
use crate::{
    command::{CommandRunner, SystemCommand, run_checked},
    error::{NetworkError, NetworkResult},
};
use log::{debug, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::time::Duration;
use tokio::{net::lookup_host, time::timeout};
use trait_variant::make;

const DNS_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait NetworkProbe: Sync {
    /// Current client association, AP service state and interface address.
    async fn snapshot(&self) -> NetworkResult<LinkSnapshot>;

    /// Resolve a well-known name through the configured resolver.
    async fn check_dns(&self) -> NetworkResult<()>;

    /// Confirm internet reachability against the well-known host list.
    async fn check_internet(&self) -> NetworkResult<()>;
}

/// [`NetworkProbe`] built on NetworkManager, iwgetid, iproute2 and systemd.
pub struct SystemProbe<R> {
    runner: R,
    interface: String,
    dns_probe_host: String,
    reachability: ReachabilityProbe,
}

impl<R> SystemProbe<R>
where
    R: CommandRunner,
{
    pub fn new(
        runner: R,
        interface: impl Into<String>,
        dns_probe_host: impl Into<String>,
        reachability: ReachabilityProbe,
    ) -> Self {
        Self {
            runner,
            interface: interface.into(),
            dns_probe_host: dns_probe_host.into(),
            reachability,
        }
    }

    async fn client_ssid(&self) -> NetworkResult<Option<String>> {
        let output = run_checked(
            &self.runner,
            &SystemCommand::new("nmcli").args([
                "-t",
                "-f",
                "DEVICE,TYPE,STATE,CONNECTION",
                "device",
                "status",
            ]),
        )
        .await?;

        let Some(device) = parse_device_status(&output.stdout, &self.interface) else {
            debug!("{} not listed by nmcli", self.interface);
            return Ok(None);
        };

        if !device.is_connected() {
            return Ok(None);
        }

        // the radio's own view is authoritative; the profile name is a fallback
        match self
            .runner
            .run(&SystemCommand::new("iwgetid").args(["-r", self.interface.as_str()]))
            .await
        {
            Ok(output) if output.success() => {
                Ok(parse_ssid(&output.stdout).or(device.connection))
            }
            Ok(_) => Ok(device.connection),
            Err(NetworkError::ToolMissing { .. }) => {
                debug!("iwgetid missing, using connection name as ssid");
                Ok(device.connection)
            }
            Err(e) => Err(e),
        }
    }

    async fn address(&self) -> NetworkResult<Option<std::net::Ipv4Addr>> {
        let output = self
            .runner
            .run(&SystemCommand::new("ip").args([
                "-4",
                "-o",
                "addr",
                "show",
                "dev",
                self.interface.as_str(),
            ]))
            .await?;

        Ok(parse_ipv4_address(&output.stdout))
    }
}

impl<R> NetworkProbe for SystemProbe<R>
where
    R: CommandRunner,
{
    async fn snapshot(&self) -> NetworkResult<LinkSnapshot> {
        let client_ssid = self.client_ssid().await?;
        let access_point_active = unit_active(&self.runner, HOSTAPD_UNIT).await?;
        let ip = self.address().await?;

        let snapshot = LinkSnapshot {
            client_ssid,
            access_point_active,
            ip,
        };

        debug!("snapshot: {snapshot:?}");

        Ok(snapshot)
    }

    async fn check_dns(&self) -> NetworkResult<()> {
        let host = self.dns_probe_host.as_str();
        let failed =
            |reason: String| NetworkError::command_failed(format!("resolve {host}"), reason);

        match timeout(DNS_LOOKUP_TIMEOUT, lookup_host((host, 443))).await {
            Ok(Ok(mut addrs)) => match addrs.next() {
                Some(addr) => {
                    debug!("{host} resolved to {}", addr.ip());
                    Ok(())
                }
                None => Err(failed("no addresses".to_string())),
            },
            Ok(Err(e)) => Err(failed(e.to_string())),
            Err(_) => Err(failed(format!(
                "timed out after {}s",
                DNS_LOOKUP_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn check_internet(&self) -> NetworkResult<()> {
        if self.reachability.check().await {
            Ok(())
        } else {
            warn!("no well-known host reachable");
            Err(NetworkError::command_failed(
                "reachability probe",
                "no well-known host reachable",
            ))
        }
    }
}
