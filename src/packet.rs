/*!
 # Wire frames for the Govee BLE protocol

 Every command travels as a fixed 20-byte frame:

 ```text
 [0x33] [opcode] [payload, zero padded to 17 bytes] [xor of bytes 0..19]
 ```
*/

use std::fmt;

use crate::{Error, Result};

/// Total frame length in bytes
pub const FRAME_LEN: usize = 20;
/// Leading byte of every command frame
pub const MAGIC: u8 = 0x33;
/// Bytes available for the payload
pub const MAX_PAYLOAD: usize = FRAME_LEN - 3;

/// An encoded, checksummed 20-byte frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame([u8; FRAME_LEN]);

/// Result of parsing a frame received from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    /// First byte of the frame (0x33 for command frames)
    pub magic: u8,
    /// Command opcode
    pub opcode: u8,
    /// Zero-padded payload
    pub payload: [u8; MAX_PAYLOAD],
    /// Whether the trailing byte matches the XOR of the preceding bytes
    pub checksum_valid: bool,
}

fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Builds a frame from an opcode and up to 17 payload bytes
pub fn encode(opcode: u8, payload: &[u8]) -> Result<Frame> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::PayloadTooLong(payload.len()));
    }

    let mut buf = [0u8; FRAME_LEN];
    buf[0] = MAGIC;
    buf[1] = opcode;
    buf[2..2 + payload.len()].copy_from_slice(payload);
    buf[FRAME_LEN - 1] = xor_checksum(&buf[..FRAME_LEN - 1]);

    Ok(Frame(buf))
}

/// Parses a 20-byte frame, typically one delivered by a notify characteristic
pub fn decode(bytes: &[u8]) -> Result<DecodedFrame> {
    if bytes.len() != FRAME_LEN {
        return Err(Error::InvalidLength(bytes.len()));
    }

    let mut payload = [0u8; MAX_PAYLOAD];
    payload.copy_from_slice(&bytes[2..FRAME_LEN - 1]);

    Ok(DecodedFrame {
        magic: bytes[0],
        opcode: bytes[1],
        payload,
        checksum_valid: xor_checksum(&bytes[..FRAME_LEN - 1]) == bytes[FRAME_LEN - 1],
    })
}

impl Frame {
    /// Raw frame bytes as written to the characteristic
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    pub fn opcode(&self) -> u8 {
        self.0[1]
    }

    /// Payload region including zero padding
    pub fn payload(&self) -> &[u8] {
        &self.0[2..FRAME_LEN - 1]
    }

    pub fn checksum(&self) -> u8 {
        self.0[FRAME_LEN - 1]
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_on_frame_layout() {
        let frame = encode(0x01, &[0x01]).unwrap();
        let bytes = frame.as_bytes();

        assert_eq!(bytes[0], 0x33);
        assert_eq!(bytes[1], 0x01);
        assert_eq!(bytes[2], 0x01);
        assert!(bytes[3..19].iter().all(|&b| b == 0));
        assert_eq!(bytes[19], 0x33 ^ 0x01 ^ 0x01);
        assert_eq!(frame.to_string(), "3301010000000000000000000000000000000033");
    }

    #[test]
    fn payload_limits() {
        assert!(encode(0x05, &[0xAA; 17]).is_ok());
        assert!(matches!(
            encode(0x05, &[0xAA; 18]),
            Err(Error::PayloadTooLong(18))
        ));
    }

    #[test]
    fn decode_returns_opcode_and_padded_payload() {
        let payloads: [&[u8]; 4] = [&[], &[0x02, 0xFF, 0x00, 0x00], &[0x7F; 17], &[0x00, 0x01]];
        for payload in payloads {
            let frame = encode(0x05, payload).unwrap();
            let decoded = decode(frame.as_bytes()).unwrap();

            let mut expected = [0u8; MAX_PAYLOAD];
            expected[..payload.len()].copy_from_slice(payload);

            assert_eq!(decoded.magic, MAGIC);
            assert_eq!(decoded.opcode, 0x05);
            assert_eq!(decoded.payload, expected);
            assert!(decoded.checksum_valid);
        }
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(matches!(decode(&[0u8; 19]), Err(Error::InvalidLength(19))));
        assert!(matches!(decode(&[0u8; 21]), Err(Error::InvalidLength(21))));
        assert!(matches!(decode(&[]), Err(Error::InvalidLength(0))));
    }

    #[test]
    fn any_single_bit_flip_breaks_checksum() {
        let frame = encode(0x05, &[0x02, 0x12, 0x34, 0x56]).unwrap();
        for byte in 0..FRAME_LEN {
            for bit in 0..8 {
                let mut bytes = *frame.as_bytes();
                bytes[byte] ^= 1 << bit;
                assert!(
                    !decode(&bytes).unwrap().checksum_valid,
                    "flip of byte {byte} bit {bit} went undetected"
                );
            }
        }
    }
}
