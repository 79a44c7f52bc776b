//! Persistent store of saved Wi-Fi credentials and the AP identity.
//!
//! The store is read by the orchestrator and written by the configuration
//! API. Writes replace the file atomically so readers never observe a
//! partially written store.

use crate::services::network::types::{ApIdentity, SavedNetwork};
use anyhow::{Context, Result, anyhow, bail};
use ini::{EscapePolicy, Ini, Properties, WriteOption};
use log::{debug, info, warn};
use serde_valid::Validate;
use std::{
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

const WIFI_SECTION: &str = "wifi";
const NETWORK_SECTION_PREFIX: &str = "network.";
const CURRENT_VERSION: &str = "2";
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Canonical in-memory form of the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredCredentials {
    /// Priority order: the first entry is tried first.
    pub networks: Vec<SavedNetwork>,
    pub ap_ssid: Option<String>,
    pub ap_secret: Option<String>,
    pub connection_timeout: Duration,
}

impl Default for StoredCredentials {
    fn default() -> Self {
        Self {
            networks: vec![],
            ap_ssid: None,
            ap_secret: None,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }
}

impl StoredCredentials {
    /// Operator configured AP identity, if any.
    pub fn ap_identity(&self) -> Option<ApIdentity> {
        self.ap_ssid.as_ref().map(|ssid| ApIdentity {
            ssid: ssid.clone(),
            secret: self.ap_secret.clone(),
        })
    }
}

/// Layouts the store file has had over time.
#[derive(Debug, PartialEq, Eq)]
enum Shape {
    /// `[wifi]` with repeated `ssid`/`password` pairs.
    Legacy,
    /// `[wifi] version=2` plus one `[network.N]` section per network.
    Sectioned,
}

pub struct CredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and normalize the store. A missing file is an empty store.
    pub fn load(&self) -> Result<StoredCredentials> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("credential store {:?} does not exist yet", self.path);
                return Ok(StoredCredentials::default());
            }
            Err(e) => {
                return Err(e).context(format!(
                    "failed to read credential store {:?}",
                    self.path
                ));
            }
        };

        let ini = Ini::load_from_str(&contents)
            .context(format!("failed to parse credential store {:?}", self.path))?;

        Self::normalize(&ini)
    }

    pub fn saved_networks(&self) -> Result<Vec<SavedNetwork>> {
        Ok(self.load()?.networks)
    }

    /// Replace the whole store.
    pub fn save(&self, credentials: &StoredCredentials) -> Result<()> {
        let _guard = self.lock()?;
        self.write(credentials)
    }

    /// Add a network with lowest priority, or replace the secret of an
    /// existing one in place.
    pub fn add_network(&self, network: SavedNetwork) -> Result<()> {
        network.validate().context("network validation failed")?;

        let _guard = self.lock()?;
        let mut credentials = self.load()?;

        match credentials
            .networks
            .iter_mut()
            .find(|saved| saved.ssid == network.ssid)
        {
            Some(saved) => {
                info!("update saved network {}", network.ssid);
                saved.secret = network.secret;
            }
            None => {
                info!("add saved network {}", network.ssid);
                credentials.networks.push(network);
            }
        }

        self.write(&credentials)
    }

    /// Returns false if no network with `ssid` was saved.
    pub fn remove_network(&self, ssid: &str) -> Result<bool> {
        let _guard = self.lock()?;
        let mut credentials = self.load()?;

        let before = credentials.networks.len();
        credentials.networks.retain(|saved| saved.ssid != ssid);

        if credentials.networks.len() == before {
            return Ok(false);
        }

        info!("remove saved network {ssid}");
        self.write(&credentials)?;

        Ok(true)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow!("failed to lock credential store: poisoned"))
    }

    fn write(&self, credentials: &StoredCredentials) -> Result<()> {
        let mut buffer = vec![];
        Self::to_ini(credentials)
            .write_to_opt(
                &mut buffer,
                WriteOption {
                    escape_policy: EscapePolicy::Nothing,
                    ..Default::default()
                },
            )
            .context("failed to serialize credential store")?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("failed to create credential store directory")?;
        }

        let temp_path = self.path.with_extension("tmp");

        let mut file =
            File::create(&temp_path).context("failed to create temp credential store")?;
        file.write_all(&buffer)
            .context("failed to write temp credential store")?;
        file.sync_all()
            .context("failed to sync temp credential store")?;

        fs::rename(&temp_path, &self.path).context("failed to replace credential store")?;

        debug!(
            "credential store {:?} written with {} network(s)",
            self.path,
            credentials.networks.len()
        );

        Ok(())
    }

    fn detect_shape(ini: &Ini) -> Result<Shape> {
        let wifi = ini.section(Some(WIFI_SECTION));

        match wifi.and_then(|section| section.get("version")) {
            Some(CURRENT_VERSION) => Ok(Shape::Sectioned),
            Some(version) => {
                bail!("failed to load credential store: unsupported version {version}")
            }
            None if wifi.is_some_and(|section| section.contains_key("ssid")) => Ok(Shape::Legacy),
            None => Ok(Shape::Sectioned),
        }
    }

    fn normalize(ini: &Ini) -> Result<StoredCredentials> {
        let shape = Self::detect_shape(ini)?;
        debug!("credential store shape: {shape:?}");

        let empty = Properties::new();
        let wifi = ini.section(Some(WIFI_SECTION)).unwrap_or(&empty);

        let (networks, ap_secret_key) = match shape {
            Shape::Legacy => (Self::legacy_networks(wifi), "ap_password"),
            Shape::Sectioned => (Self::sectioned_networks(ini), "ap_secret"),
        };

        let connection_timeout = match wifi.get("connection_timeout") {
            Some(value) => Duration::from_secs(
                value
                    .trim()
                    .parse()
                    .context(format!("failed to parse connection_timeout: {value}"))?,
            ),
            None => DEFAULT_CONNECTION_TIMEOUT,
        };

        let non_empty = |value: Option<&str>| {
            value.filter(|value| !value.is_empty()).map(String::from)
        };

        Ok(StoredCredentials {
            networks: Self::dedup(networks),
            ap_ssid: non_empty(wifi.get("ap_ssid")),
            ap_secret: non_empty(wifi.get(ap_secret_key)),
            connection_timeout,
        })
    }

    fn legacy_networks(wifi: &Properties) -> Vec<SavedNetwork> {
        let mut passwords = wifi.get_all("password");

        wifi.get_all("ssid")
            .map(|ssid| SavedNetwork::new(ssid, passwords.next().unwrap_or_default()))
            .collect()
    }

    fn sectioned_networks(ini: &Ini) -> Vec<SavedNetwork> {
        let mut indexed: Vec<(u32, SavedNetwork)> = ini
            .iter()
            .filter_map(|(name, section)| {
                let index = name?.strip_prefix(NETWORK_SECTION_PREFIX)?;
                let Ok(index) = index.parse() else {
                    warn!("ignoring credential section with invalid index: {index}");
                    return None;
                };
                let Some(ssid) = section.get("ssid") else {
                    warn!("ignoring credential section {index} without ssid");
                    return None;
                };
                Some((
                    index,
                    SavedNetwork::new(ssid, section.get("secret").unwrap_or_default()),
                ))
            })
            .collect();

        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, network)| network).collect()
    }

    /// Drop empty and duplicate SSIDs, first occurrence wins.
    fn dedup(networks: Vec<SavedNetwork>) -> Vec<SavedNetwork> {
        let mut unique: Vec<SavedNetwork> = Vec::with_capacity(networks.len());

        for network in networks {
            if network.ssid.is_empty() {
                warn!("ignoring saved network with empty ssid");
            } else if unique.iter().any(|saved| saved.ssid == network.ssid) {
                warn!("ignoring duplicate saved network {}", network.ssid);
            } else {
                unique.push(network);
            }
        }

        unique
    }

    fn to_ini(credentials: &StoredCredentials) -> Ini {
        let mut ini = Ini::new();

        ini.with_section(Some(WIFI_SECTION))
            .set("version", CURRENT_VERSION)
            .set(
                "connection_timeout",
                credentials.connection_timeout.as_secs().to_string(),
            );

        if let Some(ssid) = &credentials.ap_ssid {
            ini.with_section(Some(WIFI_SECTION))
                .set("ap_ssid", encode_value(ssid));
        }

        if let Some(secret) = &credentials.ap_secret {
            ini.with_section(Some(WIFI_SECTION))
                .set("ap_secret", encode_value(secret));
        }

        for (index, network) in credentials.networks.iter().enumerate() {
            ini.with_section(Some(format!("{NETWORK_SECTION_PREFIX}{index}")))
                .set("ssid", encode_value(&network.ssid))
                .set("secret", encode_value(&network.secret));
        }

        ini
    }
}

/// Render a value so the INI parser reads back exactly `value`.
///
/// Unquoted values lose surrounding whitespace and opening quotes, and a
/// backslash starts an escape. Anything affected is written double quoted
/// with `\`, `\"` and line breaks escaped.
fn encode_value(value: &str) -> String {
    let plain = value == value.trim()
        && !value.starts_with(['"', '\''])
        && !value.chars().any(|c| c == '\\' || c.is_control());

    if plain {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            '\0' => quoted.push_str("\\0"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');

    quoted
}
