/*!
 # Command set

 Pure builders turning high-level intents into `(opcode, payload)` pairs for
 [`crate::packet::encode`].
*/

use std::fmt;

use crate::color::Rgb;
use crate::mapping::ChannelMapping;
use crate::packet::{self, Frame};
use crate::Result;

/// Power on/off
pub const OPCODE_POWER: u8 = 0x01;
/// Brightness percentage
pub const OPCODE_BRIGHTNESS: u8 = 0x04;
/// Color and color temperature
pub const OPCODE_COLOR: u8 = 0x05;
/// Mode selector for manual RGB, always the first byte of a color payload
pub const MODE_MANUAL_RGB: u8 = 0x02;

/// A high-level device command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    PowerOn,
    PowerOff,
    /// Brightness in percent; values outside 0..=100 are clamped when encoded
    Brightness(i32),
    Color(Rgb),
    ColorTemperature(u16),
}

/// Power command payload
pub fn power(on: bool) -> (u8, Vec<u8>) {
    (OPCODE_POWER, vec![u8::from(on)])
}

/// Brightness command payload, clamped to 0..=100
pub fn brightness(percent: i32) -> (u8, Vec<u8>) {
    (OPCODE_BRIGHTNESS, vec![clamp_percent(percent)])
}

/// Color command payload after applying `mapping` to the requested color
pub fn color(rgb: Rgb, mapping: &ChannelMapping) -> (u8, Vec<u8>) {
    let wire = mapping.forward(rgb);
    (OPCODE_COLOR, vec![MODE_MANUAL_RGB, wire.r, wire.g, wire.b])
}

/// Color temperature payload; the range is not checked since devices differ
pub fn color_temperature(kelvin: u16) -> (u8, Vec<u8>) {
    let [high, low] = kelvin.to_be_bytes();
    (
        OPCODE_COLOR,
        vec![MODE_MANUAL_RGB, 0xFF, 0xFF, 0xFF, 0x01, high, low],
    )
}

pub(crate) fn clamp_percent(percent: i32) -> u8 {
    percent.clamp(0, 100) as u8
}

impl Command {
    /// Opcode and payload for this command
    pub fn payload(&self, mapping: &ChannelMapping) -> (u8, Vec<u8>) {
        match *self {
            Command::PowerOn => power(true),
            Command::PowerOff => power(false),
            Command::Brightness(percent) => brightness(percent),
            Command::Color(rgb) => color(rgb, mapping),
            Command::ColorTemperature(kelvin) => color_temperature(kelvin),
        }
    }

    /// Encodes this command as a BLE frame
    pub fn to_frame(&self, mapping: &ChannelMapping) -> Result<Frame> {
        let (opcode, payload) = self.payload(mapping);
        packet::encode(opcode, &payload)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::PowerOn => write!(f, "power on"),
            Command::PowerOff => write!(f, "power off"),
            Command::Brightness(p) => write!(f, "brightness {p}%"),
            Command::Color(rgb) => write!(f, "color {rgb}"),
            Command::ColorTemperature(k) => write!(f, "color temperature {k}K"),
        }
    }
}
