use crate::services::network::{
    AccessPointSettings, ClientSettings, OrchestratorSettings, ReachabilityProbe, RetryPolicy,
};
use anyhow::{Context, Result, ensure};
use std::{
    env,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// HTTP status and command API
    pub ui: UiConfig,

    /// Wireless interface and command execution
    pub wifi: WifiConfig,

    /// Retry and monitoring schedule of the supervisor
    pub supervisor: SupervisorConfig,

    /// Resolver entries and DNS probe
    pub dns: DnsConfig,

    /// Internet reachability probe
    pub reachability: ReachabilityConfig,

    /// Access point addressing
    pub access_point: AccessPointConfig,

    /// Files read or written at runtime
    pub paths: PathConfig,
}

#[derive(Clone, Debug)]
pub struct UiConfig {
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct WifiConfig {
    pub interface: String,
    pub command_timeout: Duration,
    pub join_poll_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub retry: RetryPolicy,
    pub monitor_interval: Duration,
    pub ap_retry_interval: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct DnsConfig {
    pub servers: Vec<IpAddr>,
    pub probe_host: String,
}

#[derive(Clone, Debug)]
pub struct ReachabilityConfig {
    pub hosts: Vec<IpAddr>,
    pub port: u16,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct AccessPointConfig {
    pub address: Ipv4Addr,
    pub channel: u8,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub credential_store: PathBuf,
    pub resolv_conf: PathBuf,
    pub hostapd_conf: PathBuf,
    pub dnsmasq_conf: PathBuf,
}

/// Source of configuration values, the process environment outside of tests.
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str, default: &str) -> String {
        (self.lookup)(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &str, default: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.string(name, default)
            .trim()
            .parse::<T>()
            .context(format!("failed to parse {name}: invalid format"))
    }

    fn secs(&self, name: &str, default: &str) -> Result<Duration> {
        self.parse::<u64>(name, default).map(Duration::from_secs)
    }

    fn list<T>(&self, name: &str, default: &str) -> Result<Vec<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.string(name, default)
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                item.parse::<T>()
                    .context(format!("failed to parse {name}: invalid entry {item}"))
            })
            .collect()
    }
}

impl AppConfig {
    /// Load and validate the configuration from environment variables.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        Ok(Self {
            ui: UiConfig::load(&vars)?,
            wifi: WifiConfig::load(&vars)?,
            supervisor: SupervisorConfig::load(&vars)?,
            dns: DnsConfig::load(&vars)?,
            reachability: ReachabilityConfig::load(&vars)?,
            access_point: AccessPointConfig::load(&vars)?,
            paths: PathConfig::load(&vars),
        })
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            retry: self.supervisor.retry.clone(),
            monitor_interval: self.supervisor.monitor_interval,
            ap_retry_interval: self.supervisor.ap_retry_interval,
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            interface: self.wifi.interface.clone(),
            poll_interval: self.wifi.join_poll_interval,
            dns_servers: self.dns.servers.clone(),
            resolv_conf: self.paths.resolv_conf.clone(),
            command_timeout: self.wifi.command_timeout,
        }
    }

    pub fn access_point_settings(&self) -> AccessPointSettings {
        AccessPointSettings {
            interface: self.wifi.interface.clone(),
            address: self.access_point.address,
            channel: self.access_point.channel,
            hostapd_conf: self.paths.hostapd_conf.clone(),
            dnsmasq_conf: self.paths.dnsmasq_conf.clone(),
        }
    }

    pub fn reachability_probe(&self) -> ReachabilityProbe {
        ReachabilityProbe::new(
            self.reachability.hosts.clone(),
            self.reachability.port,
            self.reachability.timeout,
        )
    }
}

impl UiConfig {
    fn load<F: Fn(&str) -> Option<String>>(vars: &Vars<F>) -> Result<Self> {
        let port = vars.parse("UI_PORT", "8080")?;

        Ok(Self { port })
    }
}

impl WifiConfig {
    fn load<F: Fn(&str) -> Option<String>>(vars: &Vars<F>) -> Result<Self> {
        let interface = vars.string("WIFI_INTERFACE", "wlan0");
        let command_timeout = vars.secs("COMMAND_TIMEOUT_SECS", "45")?;
        let join_poll_interval = vars.secs("JOIN_POLL_INTERVAL_SECS", "2")?;

        ensure!(
            !interface.trim().is_empty(),
            "failed to load WIFI_INTERFACE: must not be empty"
        );
        ensure!(
            !command_timeout.is_zero(),
            "failed to load COMMAND_TIMEOUT_SECS: must be positive"
        );
        ensure!(
            !join_poll_interval.is_zero(),
            "failed to load JOIN_POLL_INTERVAL_SECS: must be positive"
        );

        Ok(Self {
            interface,
            command_timeout,
            join_poll_interval,
        })
    }
}

impl SupervisorConfig {
    fn load<F: Fn(&str) -> Option<String>>(vars: &Vars<F>) -> Result<Self> {
        let retry = RetryPolicy {
            max_retries: vars.parse("MAX_RETRIES", "10")?,
            short_delay: vars.secs("RETRY_SHORT_DELAY_SECS", "5")?,
            long_delay: vars.secs("RETRY_LONG_DELAY_SECS", "60")?,
            plateau_after: vars.parse("RETRY_PLATEAU_AFTER", "5")?,
        };
        let monitor_interval = vars.secs("MONITOR_INTERVAL_SECS", "30")?;
        let ap_retry_interval = Some(vars.secs("AP_RETRY_INTERVAL_SECS", "900")?)
            .filter(|interval| !interval.is_zero());

        ensure!(
            retry.max_retries > 0,
            "failed to load MAX_RETRIES: must be positive"
        );
        ensure!(
            !monitor_interval.is_zero(),
            "failed to load MONITOR_INTERVAL_SECS: must be positive"
        );

        Ok(Self {
            retry,
            monitor_interval,
            ap_retry_interval,
        })
    }
}

impl DnsConfig {
    fn load<F: Fn(&str) -> Option<String>>(vars: &Vars<F>) -> Result<Self> {
        let servers = vars.list("DNS_SERVERS", "8.8.8.8,1.1.1.1")?;
        let probe_host = vars.string("DNS_PROBE_HOST", "connectivitycheck.gstatic.com");

        ensure!(
            !servers.is_empty(),
            "failed to load DNS_SERVERS: at least one server required"
        );

        Ok(Self {
            servers,
            probe_host,
        })
    }
}

impl ReachabilityConfig {
    fn load<F: Fn(&str) -> Option<String>>(vars: &Vars<F>) -> Result<Self> {
        let hosts = vars.list(
            "REACHABILITY_HOSTS",
            "8.8.8.8,1.1.1.1,9.9.9.9,208.67.222.222",
        )?;
        let port = vars.parse("REACHABILITY_PORT", "53")?;
        let timeout =
            Duration::from_millis(vars.parse("REACHABILITY_TIMEOUT_MILLIS", "3000")?);

        ensure!(
            !hosts.is_empty(),
            "failed to load REACHABILITY_HOSTS: at least one host required"
        );

        Ok(Self {
            hosts,
            port,
            timeout,
        })
    }
}

impl AccessPointConfig {
    fn load<F: Fn(&str) -> Option<String>>(vars: &Vars<F>) -> Result<Self> {
        let address = vars.parse("AP_ADDRESS", "192.168.4.1")?;
        let channel = vars.parse("AP_CHANNEL", "7")?;

        ensure!(
            (1..=14).contains(&channel),
            "failed to load AP_CHANNEL: {channel} is not a 2.4GHz channel"
        );

        Ok(Self { address, channel })
    }
}

impl PathConfig {
    fn load<F: Fn(&str) -> Option<String>>(vars: &Vars<F>) -> Self {
        Self {
            credential_store: vars
                .string("CREDENTIAL_STORE_PATH", "/data/config/wifi.ini")
                .into(),
            resolv_conf: vars.string("RESOLV_CONF_PATH", "/etc/resolv.conf").into(),
            hostapd_conf: vars
                .string("HOSTAPD_CONF_PATH", "/etc/hostapd/hostapd.conf")
                .into(),
            dnsmasq_conf: vars
                .string("DNSMASQ_CONF_PATH", "/etc/dnsmasq.d/wifi-supervisor.conf")
                .into(),
        }
    }
}
