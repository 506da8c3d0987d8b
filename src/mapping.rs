/*!
 # Channel mapping

 Some bulbs do not interpret the RGB bytes in the order they are written.
 A [`ChannelMapping`] describes that scrambling as a permutation of the three
 channels plus an optional per-channel inversion, and can be undone with
 [`ChannelMapping::inverse`].
*/

use std::fmt;

use crate::color::{Channel, Rgb};

/// Permutation of {R, G, B} with optional inversion of each output channel.
///
/// `targets[i]` is the position that logical channel `i` is delivered to.
/// Inversion is applied after the permutation, at the output position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelMapping {
    targets: [Channel; 3],
    invert: [bool; 3],
}

impl Default for ChannelMapping {
    fn default() -> Self {
        Self::identity()
    }
}

impl ChannelMapping {
    pub const fn identity() -> Self {
        Self {
            targets: Channel::ALL,
            invert: [false; 3],
        }
    }

    /// Builds a mapping from the destinations of red, green and blue.
    ///
    /// Returns `None` if `targets` is not a permutation.
    pub fn from_targets(targets: [Channel; 3]) -> Option<Self> {
        let mut seen = [false; 3];
        for t in targets {
            if std::mem::replace(&mut seen[t.index()], true) {
                return None;
            }
        }
        Some(Self {
            targets,
            invert: [false; 3],
        })
    }

    /// Mapping that exchanges two channels
    pub fn swap(a: Channel, b: Channel) -> Self {
        let mut targets = Channel::ALL;
        targets.swap(a.index(), b.index());
        Self {
            targets,
            invert: [false; 3],
        }
    }

    /// Same permutation with the given output channel inverted
    pub fn with_inverted(mut self, channel: Channel) -> Self {
        self.invert[channel.index()] = true;
        self
    }

    /// Where logical `channel` ends up
    pub fn target(&self, channel: Channel) -> Channel {
        self.targets[channel.index()]
    }

    pub fn is_inverted(&self, channel: Channel) -> bool {
        self.invert[channel.index()]
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    pub fn forward(&self, rgb: Rgb) -> Rgb {
        let input = rgb.to_array();
        let mut out = [0u8; 3];
        for (i, target) in self.targets.iter().enumerate() {
            out[target.index()] = input[i];
        }
        for (value, inverted) in out.iter_mut().zip(self.invert) {
            if inverted {
                *value = 0xFF - *value;
            }
        }
        Rgb::from_array(out)
    }

    /// The mapping that undoes this one: `inverse().forward(forward(c)) == c`
    pub fn inverse(&self) -> Self {
        let mut targets = Channel::ALL;
        let mut invert = [false; 3];
        for (i, target) in self.targets.iter().enumerate() {
            // Inversion happened at output `target`, so it must be undone on
            // input `target` before permuting back to position `i`.
            targets[target.index()] = Channel::ALL[i];
            invert[i] = self.invert[target.index()];
        }
        Self { targets, invert }
    }

    /// Every mapping representable: 6 permutations times 8 inversion masks
    pub fn all() -> impl Iterator<Item = ChannelMapping> {
        const PERMUTATIONS: [[Channel; 3]; 6] = {
            use Channel::*;
            [
                [Red, Green, Blue],
                [Red, Blue, Green],
                [Green, Red, Blue],
                [Green, Blue, Red],
                [Blue, Red, Green],
                [Blue, Green, Red],
            ]
        };
        PERMUTATIONS.into_iter().flat_map(|targets| {
            (0u8..8).map(move |mask| ChannelMapping {
                targets,
                invert: [mask & 1 != 0, mask & 2 != 0, mask & 4 != 0],
            })
        })
    }
}

impl fmt::Display for ChannelMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = |c: Channel| match c {
            Channel::Red => 'R',
            Channel::Green => 'G',
            Channel::Blue => 'B',
        };
        let parts: Vec<String> = Channel::ALL
            .iter()
            .map(|&c| {
                let bang = if self.is_inverted(self.target(c)) { "!" } else { "" };
                format!("{}->{}{}", letter(c), bang, letter(self.target(c)))
            })
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}
