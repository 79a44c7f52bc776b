//! Client (station) mode driver on top of NetworkManager.

use super::{
    access_point::{DNSMASQ_UNIT, HOSTAPD_UNIT},
    parse::{NM_DEVICE_STATE_ACTIVATED, parse_connection_profiles, parse_general_state},
    systemd::{start_unit, stop_unit},
    types::SavedNetwork,
};
use crate::{
    command::{CommandRunner, SystemCommand, run_checked},
    error::{NetworkError, NetworkResult},
};
use log::{debug, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::{
    fs::{self, File},
    io::Write,
    net::IpAddr,
    path::PathBuf,
    time::Duration,
};
use tokio::time::sleep;
use trait_variant::make;

const NMCLI: &str = "nmcli";
const CONNECTION_MANAGER_UNIT: &str = "NetworkManager";

#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait ClientDriver: Sync {
    /// Join `network` and wait until the interface reports the connection,
    /// giving up after `timeout`.
    async fn join(&self, network: &SavedNetwork, timeout: Duration) -> NetworkResult<()>;

    /// Write the fixed resolver entries.
    async fn configure_dns(&self) -> NetworkResult<()>;

    /// Leave client mode. Succeeds if already disconnected.
    async fn teardown(&self) -> NetworkResult<()>;
}

#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub interface: String,
    pub poll_interval: Duration,
    pub dns_servers: Vec<IpAddr>,
    pub resolv_conf: PathBuf,
    /// Limit the command runner puts on every single command.
    pub command_timeout: Duration,
}

pub struct NmClientDriver<R> {
    runner: R,
    settings: ClientSettings,
}

impl<R> NmClientDriver<R>
where
    R: CommandRunner,
{
    pub fn new(runner: R, settings: ClientSettings) -> Self {
        Self { runner, settings }
    }

    fn interface(&self) -> &str {
        &self.settings.interface
    }

    /// Seconds for `nmcli --wait`, kept below the runner's timeout.
    fn activation_wait(&self, timeout: Duration) -> u64 {
        let limit = self
            .settings
            .command_timeout
            .saturating_sub(Duration::from_secs(1))
            .max(Duration::from_secs(1));

        if timeout > limit {
            debug!(
                "activation wait clamped from {}s to {}s",
                timeout.as_secs(),
                limit.as_secs()
            );
        }

        timeout.min(limit).as_secs().max(1)
    }

    async fn release_radio(&self) -> NetworkResult<()> {
        stop_unit(&self.runner, HOSTAPD_UNIT).await?;
        stop_unit(&self.runner, DNSMASQ_UNIT).await?;
        start_unit(&self.runner, "restart", CONNECTION_MANAGER_UNIT).await?;

        run_checked(
            &self.runner,
            &SystemCommand::new(NMCLI).args(["device", "set", self.interface(), "managed", "yes"]),
        )
        .await?;

        run_checked(
            &self.runner,
            &SystemCommand::new("ip").args(["link", "set", self.interface(), "up"]),
        )
        .await?;

        Ok(())
    }

    async fn recreate_profile(&self, network: &SavedNetwork) -> NetworkResult<()> {
        let output = run_checked(
            &self.runner,
            &SystemCommand::new(NMCLI).args(["-t", "-f", "NAME,TYPE", "connection", "show"]),
        )
        .await?;

        if parse_connection_profiles(&output.stdout)
            .iter()
            .any(|profile| profile.name == network.ssid)
        {
            debug!("deleting stale profile {}", network.ssid);
            run_checked(
                &self.runner,
                &SystemCommand::new(NMCLI).args([
                    "connection",
                    "delete",
                    "id",
                    network.ssid.as_str(),
                ]),
            )
            .await?;
        }

        let mut add = SystemCommand::new(NMCLI).args([
            "connection",
            "add",
            "type",
            "wifi",
            "ifname",
            self.interface(),
            "con-name",
            network.ssid.as_str(),
            "ssid",
            network.ssid.as_str(),
        ]);

        if !network.secret.is_empty() {
            add = add
                .args(["wifi-sec.key-mgmt", "wpa-psk", "wifi-sec.psk"])
                .secret_arg(&network.secret);
        }

        run_checked(&self.runner, &add).await.map(|_| ())
    }

    async fn wait_until_connected(
        &self,
        network: &SavedNetwork,
        timeout: Duration,
    ) -> NetworkResult<()> {
        let polls = (timeout.as_millis() / self.settings.poll_interval.as_millis().max(1)).max(1);
        let command = SystemCommand::new(NMCLI).args([
            "-t",
            "-f",
            "GENERAL.STATE,GENERAL.CONNECTION",
            "device",
            "show",
            self.interface(),
        ]);

        for poll in 1..=polls {
            let output = run_checked(&self.runner, &command).await?;

            match parse_general_state(&output.stdout) {
                (Some(NM_DEVICE_STATE_ACTIVATED), Some(connection))
                    if connection == network.ssid =>
                {
                    debug!("{} activated after {poll} poll(s)", network.ssid);
                    return Ok(());
                }
                state => debug!("poll {poll}/{polls}: {state:?}"),
            }

            if poll < polls {
                sleep(self.settings.poll_interval).await;
            }
        }

        Err(NetworkError::command_failed(
            command,
            format!("{} not activated after {polls} poll(s)", network.ssid),
        ))
    }
}

impl<R> ClientDriver for NmClientDriver<R>
where
    R: CommandRunner,
{
    async fn join(&self, network: &SavedNetwork, timeout: Duration) -> NetworkResult<()> {
        info!("join {}", network.ssid);

        self.release_radio().await?;
        self.recreate_profile(network).await?;

        let wait = self.activation_wait(timeout).to_string();
        run_checked(
            &self.runner,
            &SystemCommand::new(NMCLI).args([
                "--wait",
                wait.as_str(),
                "connection",
                "up",
                "id",
                network.ssid.as_str(),
            ]),
        )
        .await?;

        self.wait_until_connected(network, timeout).await
    }

    async fn configure_dns(&self) -> NetworkResult<()> {
        let path = &self.settings.resolv_conf;
        let contents: String = self
            .settings
            .dns_servers
            .iter()
            .map(|server| format!("nameserver {server}\n"))
            .collect();

        info!("write resolver entries to {path:?}");

        let failed = |e: std::io::Error| {
            NetworkError::command_failed(format!("write {}", path.display()), e)
        };

        let temp_path = path.with_extension("tmp");
        let replaced = (|| -> std::io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, path)
        })();

        if let Err(e) = replaced {
            // bind-mounted resolver files cannot be renamed over
            warn!("failed to replace {path:?} atomically ({e}), writing in place");
            let _ = fs::remove_file(&temp_path);
            fs::write(path, contents).map_err(failed)?;
        }

        Ok(())
    }

    async fn teardown(&self) -> NetworkResult<()> {
        let command = SystemCommand::new(NMCLI).args(["device", "disconnect", self.interface()]);

        match self.runner.run(&command).await? {
            output if output.success() => info!("client mode down"),
            output => debug!(
                "{command} exited with {:?}, assuming already down: {}",
                output.exit_code,
                output.stderr.trim()
            ),
        }

        Ok(())
    }
}
