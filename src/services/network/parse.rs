//! Parsers for the fixed-format output of the OS tools.
//!
//! Kept apart from the probe and the drivers so a change in a tool's output
//! format never reaches the state machine.

use std::net::Ipv4Addr;

/// NetworkManager device state meaning "fully activated".
pub const NM_DEVICE_STATE_ACTIVATED: u32 = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceStatus {
    pub device: String,
    pub kind: String,
    pub state: String,
    pub connection: Option<String>,
}

impl DeviceStatus {
    pub fn is_connected(&self) -> bool {
        self.state == "connected"
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub name: String,
    pub kind: String,
}

/// Split a line of `nmcli --terse` output into fields.
///
/// nmcli escapes `:` and `\` inside values with a backslash.
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = vec![];
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);

    fields
}

/// Parse `nmcli -t -f DEVICE,TYPE,STATE,CONNECTION device status` and return
/// the entry of `interface`.
pub fn parse_device_status(output: &str, interface: &str) -> Option<DeviceStatus> {
    output.lines().find_map(|line| {
        let fields = split_terse(line.trim_end());
        let [device, kind, state, connection] = fields.as_slice() else {
            return None;
        };

        (device == interface).then(|| DeviceStatus {
            device: device.clone(),
            kind: kind.clone(),
            state: state.clone(),
            connection: (!connection.is_empty() && connection != "--")
                .then(|| connection.clone()),
        })
    })
}

/// Parse `nmcli -t -f GENERAL.STATE,GENERAL.CONNECTION device show <iface>`.
///
/// Returns the numeric device state and the active connection name, e.g.
/// `GENERAL.STATE:100 (connected)` and `GENERAL.CONNECTION:Home`.
pub fn parse_general_state(output: &str) -> (Option<u32>, Option<String>) {
    let mut state = None;
    let mut connection = None;

    for line in output.lines() {
        let fields = split_terse(line.trim_end());
        let [key, value] = fields.as_slice() else {
            continue;
        };

        match key.as_str() {
            "GENERAL.STATE" => {
                state = value
                    .split_whitespace()
                    .next()
                    .and_then(|code| code.parse().ok());
            }
            "GENERAL.CONNECTION" if !value.is_empty() && value != "--" => {
                connection = Some(value.clone());
            }
            _ => {}
        }
    }

    (state, connection)
}

/// Parse `nmcli -t -f NAME,TYPE connection show`.
pub fn parse_connection_profiles(output: &str) -> Vec<ConnectionProfile> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line.trim_end());
            match fields.as_slice() {
                [name, kind] if !name.is_empty() => Some(ConnectionProfile {
                    name: name.clone(),
                    kind: kind.clone(),
                }),
                _ => None,
            }
        })
        .collect()
}

/// Parse `ip -4 -o addr show dev <iface>` and return the first address.
pub fn parse_ipv4_address(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|token| *token == "inet")?;
        tokens.next()?.split('/').next()?.parse().ok()
    })
}

/// Parse `iwgetid -r <iface>`; prints the SSID or nothing.
pub fn parse_ssid(output: &str) -> Option<String> {
    let ssid = output.trim_end_matches(['\r', '\n']);
    (!ssid.trim().is_empty()).then(|| ssid.to_string())
}

/// Parse `systemctl is-active <unit>`.
pub fn parse_unit_active(output: &str) -> bool {
    output.trim() == "active"
}

/// True if systemctl complained about a unit that is not installed.
pub fn is_missing_unit(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("not found") || stderr.contains("could not be found")
}
