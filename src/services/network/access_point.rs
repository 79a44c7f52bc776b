//! Access point mode driver: hostapd broadcasts, dnsmasq serves DHCP/DNS.

use super::{
    systemd::{start_unit, stop_unit, unit_active},
    types::ApIdentity,
};
use crate::{
    command::{CommandRunner, SystemCommand, run_checked},
    error::{NetworkError, NetworkResult},
};
use ini::{EscapePolicy, Ini, WriteOption};
use log::info;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::{net::Ipv4Addr, path::PathBuf};
use trait_variant::make;

pub const HOSTAPD_UNIT: &str = "hostapd";
pub const DNSMASQ_UNIT: &str = "dnsmasq";

const AP_PREFIX_LEN: u8 = 24;
const DHCP_LEASE_TIME: &str = "24h";

#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait AccessPointDriver: Sync {
    async fn start(&self, identity: &ApIdentity) -> NetworkResult<()>;

    /// Stop broadcasting. Succeeds if the AP is not running.
    async fn stop(&self) -> NetworkResult<()>;
}

#[derive(Clone, Debug)]
pub struct AccessPointSettings {
    pub interface: String,
    pub address: Ipv4Addr,
    pub channel: u8,
    pub hostapd_conf: PathBuf,
    pub dnsmasq_conf: PathBuf,
}

pub struct HostapdDriver<R> {
    runner: R,
    settings: AccessPointSettings,
}

impl<R> HostapdDriver<R>
where
    R: CommandRunner,
{
    pub fn new(runner: R, settings: AccessPointSettings) -> Self {
        Self { runner, settings }
    }

    fn interface(&self) -> &str {
        &self.settings.interface
    }

    fn write_option() -> WriteOption {
        // hostapd and dnsmasq take values literally
        WriteOption {
            escape_policy: EscapePolicy::Nothing,
            ..Default::default()
        }
    }

    fn write_hostapd_config(&self, identity: &ApIdentity) -> NetworkResult<()> {
        let mut ini = Ini::new();

        ini.with_general_section()
            .set("interface", self.interface())
            .set("driver", "nl80211")
            .set("ssid", identity.ssid.as_str())
            .set("hw_mode", "g")
            .set("channel", self.settings.channel.to_string())
            .set("wmm_enabled", "0")
            .set("macaddr_acl", "0")
            .set("auth_algs", "1")
            .set("ignore_broadcast_ssid", "0");

        if let Some(secret) = &identity.secret {
            ini.with_general_section()
                .set("wpa", "2")
                .set("wpa_passphrase", secret.as_str())
                .set("wpa_key_mgmt", "WPA-PSK")
                .set("rsn_pairwise", "CCMP");
        }

        let path = &self.settings.hostapd_conf;
        info!("write access point config to {path:?}");

        ini.write_to_file_opt(path, Self::write_option())
            .map_err(|e| NetworkError::command_failed(format!("write {}", path.display()), e))
    }

    fn write_dnsmasq_config(&self) -> NetworkResult<()> {
        let [a, b, c, _] = self.settings.address.octets();
        let address = self.settings.address.to_string();
        let mut ini = Ini::new();

        ini.with_general_section()
            .set("interface", self.interface())
            .set("listen-address", address.as_str())
            .set(
                "dhcp-range",
                format!("{a}.{b}.{c}.10,{a}.{b}.{c}.100,255.255.255.0,{DHCP_LEASE_TIME}"),
            )
            // answer every name with the device itself for local configuration
            .set("address", format!("/#/{address}"));

        let path = &self.settings.dnsmasq_conf;
        info!("write dhcp config to {path:?}");

        ini.write_to_file_opt(path, Self::write_option())
            .map_err(|e| NetworkError::command_failed(format!("write {}", path.display()), e))
    }

    async fn ip(&self, args: &[&str]) -> NetworkResult<()> {
        run_checked(&self.runner, &SystemCommand::new("ip").args(args.iter().copied()))
            .await
            .map(|_| ())
    }

    async fn set_managed(&self, managed: bool) -> NetworkResult<()> {
        let value = if managed { "yes" } else { "no" };

        run_checked(
            &self.runner,
            &SystemCommand::new("nmcli").args([
                "device",
                "set",
                self.interface(),
                "managed",
                value,
            ]),
        )
        .await
        .map(|_| ())
    }
}

impl<R> AccessPointDriver for HostapdDriver<R>
where
    R: CommandRunner,
{
    async fn start(&self, identity: &ApIdentity) -> NetworkResult<()> {
        info!("start access point {}", identity.ssid);

        let cidr = format!("{}/{AP_PREFIX_LEN}", self.settings.address);

        self.set_managed(false).await?;
        self.ip(&["addr", "flush", "dev", self.interface()]).await?;
        self.ip(&["addr", "add", cidr.as_str(), "dev", self.interface()]).await?;
        self.ip(&["link", "set", self.interface(), "up"]).await?;

        self.write_hostapd_config(identity)?;
        self.write_dnsmasq_config()?;

        start_unit(&self.runner, "restart", HOSTAPD_UNIT).await?;
        start_unit(&self.runner, "restart", DNSMASQ_UNIT).await?;

        if !unit_active(&self.runner, HOSTAPD_UNIT).await? {
            return Err(NetworkError::command_failed(
                format!("systemctl is-active {HOSTAPD_UNIT}"),
                "access point did not come up",
            ));
        }

        info!("access point {} active on {cidr}", identity.ssid);

        Ok(())
    }

    async fn stop(&self) -> NetworkResult<()> {
        stop_unit(&self.runner, HOSTAPD_UNIT).await?;
        stop_unit(&self.runner, DNSMASQ_UNIT).await?;
        self.ip(&["addr", "flush", "dev", self.interface()]).await?;
        self.set_managed(true).await?;

        info!("access point down");

        Ok(())
    }
}
