/*!
 # Device descriptors

 A [`Device`] identifies one bulb and how to reach it. Descriptors come from
 discovery (BLE scan or LAN scan) or from static configuration and are not
 modified afterwards.
*/

use std::fmt;
use std::net::IpAddr;

/// How a device is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Bluetooth LE GATT writes
    Ble,
    /// Govee LAN API over UDP
    Lan,
}

/// An addressable bulb
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    address: String,
    name: String,
    kind: TransportKind,
    ip: Option<IpAddr>,
    model: Option<String>,
}

impl Device {
    /// Describes a BLE device by MAC address (or platform peripheral id)
    pub fn ble(address: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let model = model_from_name(&name);
        Self {
            address: address.into(),
            name,
            kind: TransportKind::Ble,
            ip: None,
            model,
        }
    }

    /// Describes a LAN device reachable at `ip`
    pub fn lan(address: impl Into<String>, ip: IpAddr, model: Option<String>) -> Self {
        let address = address.into();
        let name = match &model {
            Some(model) => format!("{model} ({ip})"),
            None => ip.to_string(),
        };
        Self {
            address,
            name,
            kind: TransportKind::Lan,
            ip: Some(ip),
            model,
        }
    }

    /// Overrides the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// LAN address; always `Some` for [`TransportKind::Lan`] devices
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// Model tag such as `H6008`, if known
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.address)
    }
}

/// Extracts a model tag from advertised names like `ihoment_H6008_E33F`
fn model_from_name(name: &str) -> Option<String> {
    name.split(['_', '-', ' '])
        .find(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some('H' | 'h'))
                && part.len() == 5
                && chars.all(|c| c.is_ascii_alphanumeric())
                && part[1..].starts_with(|c: char| c.is_ascii_digit())
        })
        .map(str::to_uppercase)
}
