/*!
 # Govee Smart Bulb Controller Library

 A Rust library for controlling Govee bulbs (H6008 and relatives) either
 locally over Bluetooth LE or over the Govee LAN UDP API.

 ## Features

 * 20-byte framed BLE protocol with XOR checksum
 * Power, brightness, RGB color and color temperature commands
 * Bluetooth LE and LAN transports behind a single [`Transport`] trait
 * Paced command sessions
 * Channel calibration for bulbs whose wire channel order is scrambled

 ## Example

 ```rust,no_run
 use govee_bulb::*;
 use std::time::Duration;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     let devices = LanTransport::discover(&LanConfig::default(), Duration::from_secs(3)).await?;
     let Some(device) = devices.into_iter().next() else {
         return Ok(());
     };

     let mut session = DeviceSession::new(LanTransport::new(device, LanConfig::default()));
     session.open(Duration::from_secs(10)).await?;

     let steps = Intent::new()
         .power(true)
         .brightness(100)
         .color(Rgb::new(0, 255, 0))
         .into_steps();
     session.apply(&steps, ChannelMapping::identity()).await?;

     Ok(())
 }
 ```
*/

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Reasons a transport could not establish a session with a device
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Connecting did not finish before the deadline
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// No Bluetooth adapters found
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    /// The requested device was not seen during scanning
    #[error("Device {0} not found")]
    NotFound(String),

    /// Failed to find the required BLE characteristic
    #[error("Could not find required BLE characteristic: {0}")]
    CharacteristicNotFound(Uuid),

    /// A live session to this device already exists
    #[error("Device {0} is already connected")]
    AlreadyConnected(String),

    /// The device descriptor cannot be used with this transport
    #[error("Device {0} is not reachable over this transport")]
    WrongTransport(String),

    /// BLE stack error while connecting
    #[error("BLE connection error: {0}")]
    Ble(String),
}

/// Custom error types for the Govee bulb library
#[derive(Error, Debug)]
pub enum Error {
    /// Could not establish a session with the device
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A write was rejected by the local transport
    #[error("Send failed: {0}")]
    Send(String),

    /// Frame payload larger than the 17 available bytes
    #[error("Payload of {0} bytes does not fit in a frame (max 17)")]
    PayloadTooLong(usize),

    /// Input to the frame decoder was not exactly 20 bytes
    #[error("Frame must be exactly 20 bytes, got {0}")]
    InvalidLength(usize),

    /// Calibration observations do not determine a unique channel mapping
    #[error("Calibration inconclusive: {0}")]
    CalibrationInconclusive(String),

    /// Optional capability missing on this device or transport
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Operation requires an open session
    #[error("Transport is not connected")]
    NotConnected,

    /// Session or observation deadline expired
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Error from btleplug
    #[error(transparent)]
    BtlePlug(#[from] btleplug::Error),

    /// Socket error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod calibration;
pub mod color;
pub mod command;
pub mod config;
pub mod device;
pub mod mapping;
pub mod packet;
pub mod session;
pub mod transport;

// Re-export key types
pub use calibration::{
    CalibrationProbe, CalibrationReport, Candidate, FirstOf, NotificationFeed, Observation,
    ObservationSource, OperatorFeed, ProbeState,
};
pub use color::{Channel, Rgb};
pub use command::Command;
pub use config::{BleConfig, CalibrationConfig, LanConfig, SessionConfig};
pub use device::{Device, TransportKind};
pub use mapping::ChannelMapping;
pub use packet::{DecodedFrame, Frame};
pub use session::{DeviceSession, Intent, Step};
pub use transport::{ble::BleTransport, lan::LanTransport, Transport};
