//! The Daly wire frame.
//!
//! Every request and every response is exactly 13 bytes:
//!
//! Start Byte | End Byte | Meaning
//! 0          | 0        | Start marker, always `0xA5`
//! 1          | 1        | Address. The host puts its address in the high nibble: `0x80` over Bluetooth, `0x40` over UART
//! 2          | 2        | Command code
//! 3          | 3        | Payload length, always `0x08`
//! 4          | 11       | Payload, multi-byte integers are big-endian
//! 12         | 12       | Checksum: the sum of bytes 0-11, wrapping at 256

use std::fmt;

use crate::error::{BmsError, Result};

pub const FRAME_LEN: usize = 13;
pub const PAYLOAD_LEN: usize = 8;
pub const START_BYTE: u8 = 0xa5;
/// Host address "8" in the high nibble, used for the Bluetooth transport.
pub const BLUETOOTH_ADDRESS: u8 = 0x80;
pub const DATA_LENGTH: u8 = PAYLOAD_LEN as u8;

/// One complete frame. Constructing it does not validate the checksum, see [`Frame::parse`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    /// Build a frame with the given payload and a correct checksum.
    pub fn with_payload(address: u8, command: u8, payload: [u8; PAYLOAD_LEN]) -> Self {
        let mut bytes = [0; FRAME_LEN];
        bytes[0] = START_BYTE;
        bytes[1] = address;
        bytes[2] = command;
        bytes[3] = DATA_LENGTH;
        bytes[4..FRAME_LEN - 1].copy_from_slice(&payload);
        bytes[FRAME_LEN - 1] = checksum(&bytes[..FRAME_LEN - 1]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; FRAME_LEN]) -> Self {
        Self(bytes)
    }

    /// Take a frame out of received bytes, rejecting wrong lengths and bad checksums.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; FRAME_LEN] = bytes.try_into().map_err(|_| BmsError::FrameLength {
            expected: FRAME_LEN,
            actual: bytes.len(),
        })?;
        let frame = Self(bytes);
        frame.verify()?;
        Ok(frame)
    }

    pub fn verify(&self) -> Result<()> {
        let computed = checksum(&self.0[..FRAME_LEN - 1]);
        let received = self.0[FRAME_LEN - 1];
        if computed != received {
            return Err(BmsError::ChecksumMismatch {
                command: self.command(),
                computed,
                received,
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }

    pub fn address(&self) -> u8 {
        self.0[1]
    }

    pub fn command(&self) -> u8 {
        self.0[2]
    }

    pub fn payload(&self) -> &[u8; PAYLOAD_LEN] {
        let [_, _, _, _, payload @ .., _] = &self.0;
        payload
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", hex::encode(self.0))
    }
}

/// The checksum used by the protocol: an unsigned 8 bit sum of every byte.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// A read request for `command`, addressed from a Bluetooth host, with an empty payload.
pub fn encode_command(command: u8) -> Frame {
    Frame::with_payload(BLUETOOTH_ADDRESS, command, [0; PAYLOAD_LEN])
}

pub fn validate(frame: &[u8; FRAME_LEN]) -> bool {
    checksum(&frame[..FRAME_LEN - 1]) == frame[FRAME_LEN - 1]
}

/// Cut a notification buffer into whole frames.
///
/// Returns the frames in buffer order together with the number of trailing bytes
/// that do not make up a whole frame. Those bytes are not kept for the next
/// notification.
pub fn split(buffer: &[u8]) -> (impl Iterator<Item = Frame> + '_, usize) {
    let chunks = buffer.chunks_exact(FRAME_LEN);
    let trailing = chunks.remainder().len();
    let frames = chunks.filter_map(|chunk| chunk.try_into().ok().map(Frame::from_bytes));
    (frames, trailing)
}

#[test]
fn test_encode_cell_status_request() {
    let frame = encode_command(0x95);
    let expected = hex::decode("a58095080000000000000000c2").unwrap();
    assert_eq!(frame.as_ref(), &expected[..]);
}

#[test]
fn test_encode_soc_request() {
    let frame = encode_command(0x90);
    assert_eq!(frame.as_ref(), &hex::decode("a58090080000000000000000bd").unwrap()[..]);
    assert_eq!(frame.command(), 0x90);
    assert_eq!(frame.payload(), &[0; PAYLOAD_LEN]);
}

#[test]
fn test_every_command_byte_encodes_valid_frame() {
    for command in 0..=u8::MAX {
        let frame = encode_command(command);
        assert!(validate(frame.as_bytes()), "command 0x{command:02x}");
        assert_eq!(frame.as_bytes()[0], START_BYTE);
        assert_eq!(frame.as_bytes()[3], DATA_LENGTH);
    }
}

#[test]
fn test_checksum_wraps_and_ignores_order() {
    assert_eq!(checksum(&[]), 0);
    assert_eq!(checksum(&[0xff, 0x02]), 0x01);
    assert_eq!(checksum(&[0x01, 0x02, 0xfe]), checksum(&[0xfe, 0x02, 0x01]));
    let bytes: Vec<u8> = (0..=255).collect();
    let expected = (bytes.iter().map(|b| *b as u32).sum::<u32>() % 256) as u8;
    assert_eq!(checksum(&bytes), expected);
}

#[test]
fn test_parse_rejects_bad_checksum() {
    let mut bytes = *encode_command(0x93).as_bytes();
    bytes[12] = bytes[12].wrapping_add(1);
    assert!(!validate(&bytes));
    assert_eq!(
        Frame::parse(&bytes),
        Err(BmsError::ChecksumMismatch { command: 0x93, computed: bytes[12].wrapping_sub(1), received: bytes[12] })
    );
}

#[test]
fn test_parse_rejects_short_frame() {
    let bytes = hex::decode("a58090080000000000").unwrap();
    assert_eq!(
        Frame::parse(&bytes),
        Err(BmsError::FrameLength { expected: FRAME_LEN, actual: 9 })
    );
}

#[test]
fn test_payload_round_trip() {
    let frame = Frame::with_payload(0x01, 0x94, [4, 3, 1, 0, 0, 0, 5, 0]);
    let parsed = Frame::parse(frame.as_ref()).unwrap();
    assert_eq!(parsed.address(), 0x01);
    assert_eq!(parsed.payload(), &[4, 3, 1, 0, 0, 0, 5, 0]);
}

#[test]
fn test_split_drops_trailing_bytes() {
    let mut buffer = Vec::new();
    buffer.extend_from_slice(encode_command(0x90).as_ref());
    buffer.extend_from_slice(encode_command(0x94).as_ref());
    buffer.extend_from_slice(&[0xa5, 0x80, 0x92]);
    let (frames, trailing) = split(&buffer);
    let commands: Vec<u8> = frames.map(|f| f.command()).collect();
    assert_eq!(commands, vec![0x90, 0x94]);
    assert_eq!(trailing, 3);
}
