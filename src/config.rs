/*!
 # Configuration

 Tunables for each transport, the command session and calibration. Every
 struct has a `Default` matching the behavior of stock Govee bulbs.
*/

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use uuid::Uuid;

/// GATT characteristic commands are written to
pub const WRITE_UUID: Uuid = Uuid::from_u128(0x00010203_0405_0607_0809_0a0b0c0d2b11);
/// GATT characteristic the device may notify on
pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x00010203_0405_0607_0809_0a0b0c0d2b10);

/// LAN discovery multicast group
pub const LAN_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
/// Port devices listen on for scan requests
pub const LAN_SCAN_PORT: u16 = 4001;
/// Port scan replies are sent to
pub const LAN_LISTEN_PORT: u16 = 4002;
/// Port devices accept control commands on
pub const LAN_COMMAND_PORT: u16 = 4003;

/// Configuration for the Bluetooth LE transport
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// UUID for write characteristic
    pub write_uuid: Uuid,
    /// UUID for notify characteristic
    pub notify_uuid: Uuid,
    /// Lowercase substrings identifying Govee devices by advertised name
    pub name_patterns: Vec<String>,
    /// How often the peripheral list is polled while scanning
    pub scan_poll_interval: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            write_uuid: WRITE_UUID,
            notify_uuid: NOTIFY_UUID,
            name_patterns: ["govee", "ihoment", "h6", "h7"]
                .into_iter()
                .map(String::from)
                .collect(),
            scan_poll_interval: Duration::from_millis(500),
        }
    }
}

impl BleConfig {
    /// Whether an advertised name looks like a supported device
    pub fn matches_name(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.name_patterns.iter().any(|p| name.contains(p.as_str()))
    }
}

/// Configuration for the LAN UDP transport
#[derive(Debug, Clone)]
pub struct LanConfig {
    /// Destination of the first scan round
    pub multicast_addr: SocketAddr,
    /// Destination of the fallback scan round
    pub broadcast_addr: SocketAddr,
    /// Local port scan replies are received on (0 picks any free port)
    pub listen_port: u16,
    /// Device port for control commands
    pub command_port: u16,
    /// Receive buffer size for a single datagram
    pub max_datagram: usize,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            multicast_addr: SocketAddr::V4(SocketAddrV4::new(LAN_MULTICAST_GROUP, LAN_SCAN_PORT)),
            broadcast_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, LAN_SCAN_PORT)),
            listen_port: LAN_LISTEN_PORT,
            command_port: LAN_COMMAND_PORT,
            max_datagram: 4096,
        }
    }
}

/// Configuration for [`crate::DeviceSession`]
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Delay between consecutive writes; bulbs drop commands sent back to back
    pub pacing: Duration,
    /// Upper bound for a whole `apply` call
    pub deadline: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(500),
            deadline: None,
        }
    }
}

/// Configuration for [`crate::CalibrationProbe`]
#[derive(Debug, Clone, Copy)]
pub struct CalibrationConfig {
    /// How long to wait for an observation after each candidate
    pub observation_window: Duration,
    /// Brightness set before the sweep starts
    pub preamble_brightness: i32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            observation_window: Duration::from_secs(5),
            preamble_brightness: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_matching_is_case_insensitive() {
        let config = BleConfig::default();
        assert!(config.matches_name("ihoment_H6008_E33F"));
        assert!(config.matches_name("Govee_H6159"));
        assert!(!config.matches_name("ELK-BLEDOM"));
    }

    #[test]
    fn default_ports() {
        let config = LanConfig::default();
        assert_eq!(config.multicast_addr.to_string(), "239.255.255.250:4001");
        assert_eq!(config.broadcast_addr.to_string(), "255.255.255.255:4001");
        assert_eq!(config.command_port, 4003);
    }

    #[test]
    fn characteristic_uuids() {
        assert_eq!(WRITE_UUID.to_string(), "00010203-0405-0607-0809-0a0b0c0d2b11");
        assert_eq!(NOTIFY_UUID.to_string(), "00010203-0405-0607-0809-0a0b0c0d2b10");
    }
}
