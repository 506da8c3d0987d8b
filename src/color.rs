/*!
 # Color values

 The RGB triple used throughout the crate, plus parsing of the named colors
 and `r,g,b` strings that operators type during calibration.
*/

use std::fmt;
use std::str::FromStr;

/// One of the three color channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Red,
    Green,
    Blue,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Red, Channel::Green, Channel::Blue];

    /// Position of the channel inside an `(r, g, b)` triple
    pub const fn index(self) -> usize {
        match self {
            Channel::Red => 0,
            Channel::Green => 1,
            Channel::Blue => 2,
        }
    }
}

/// An RGB color with 8 bits per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Named colors accepted by [`Rgb::from_name`]
pub const NAMED_COLORS: [(&str, Rgb); 12] = [
    ("red", Rgb::new(255, 0, 0)),
    ("green", Rgb::new(0, 255, 0)),
    ("blue", Rgb::new(0, 0, 255)),
    ("white", Rgb::new(255, 255, 255)),
    ("warm", Rgb::new(255, 180, 80)),
    ("purple", Rgb::new(128, 0, 255)),
    ("cyan", Rgb::new(0, 255, 255)),
    ("yellow", Rgb::new(255, 255, 0)),
    ("orange", Rgb::new(255, 100, 0)),
    ("pink", Rgb::new(255, 50, 150)),
    ("magenta", Rgb::new(255, 0, 255)),
    ("off", Rgb::new(0, 0, 0)),
];

impl Rgb {
    pub const RED: Rgb = Rgb::new(255, 0, 0);
    pub const GREEN: Rgb = Rgb::new(0, 255, 0);
    pub const BLUE: Rgb = Rgb::new(0, 0, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Full-intensity color of a single channel
    pub const fn primary(channel: Channel) -> Self {
        match channel {
            Channel::Red => Self::RED,
            Channel::Green => Self::GREEN,
            Channel::Blue => Self::BLUE,
        }
    }

    pub const fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    pub const fn from_array(values: [u8; 3]) -> Self {
        Self::new(values[0], values[1], values[2])
    }

    pub fn get(self, channel: Channel) -> u8 {
        self.to_array()[channel.index()]
    }

    /// Looks up a named color (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        NAMED_COLORS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, rgb)| *rgb)
    }

    /// Channels reduced to on/off at the midpoint
    pub fn quantized(self) -> [bool; 3] {
        self.to_array().map(|v| v >= 0x80)
    }
}

impl From<(u8, u8, u8)> for Rgb {
    fn from((r, g, b): (u8, u8, u8)) -> Self {
        Self::new(r, g, b)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RGB({}, {}, {})", self.r, self.g, self.b)
    }
}

/// Error returned when a color string is neither a name nor `r,g,b`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unrecognized color '{0}' (use a name like 'red' or 'r,g,b')")]
pub struct ParseColorError(pub String);

impl FromStr for Rgb {
    type Err = ParseColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rgb) = Rgb::from_name(s) {
            return Ok(rgb);
        }

        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if let [r, g, b] = parts.as_slice() {
            if let (Ok(r), Ok(g), Ok(b)) = (r.parse(), g.parse(), b.parse()) {
                return Ok(Rgb::new(r, g, b));
            }
        }

        Err(ParseColorError(s.to_string()))
    }
}
