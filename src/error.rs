use crate::connection::{LinkEvent, SessionState};

/// Everything that can go wrong between the radio and a decoded telemetry event.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BmsError {
    /// The last byte of a frame does not match the sum of the first twelve.
    #[error("checksum mismatch on command 0x{command:02x}: computed 0x{computed:02x}, received 0x{received:02x}")]
    ChecksumMismatch { command: u8, computed: u8, received: u8 },

    #[error("unknown command 0x{0:02x}")]
    UnknownCommand(u8),

    /// A decoded value is outside its physical range, which means the frame is corrupt or misaligned.
    #[error("{field} out of range: {value}")]
    OutOfRangeValue { field: &'static str, value: f32 },

    #[error("frame must be {expected} bytes, got {actual}")]
    FrameLength { expected: usize, actual: usize },

    #[error("write to the BMS failed: {0}")]
    TransportWrite(String),

    #[error("cannot connect to the BMS: {0}")]
    ConnectFailure(String),

    #[error("BMS disconnected: {0}")]
    UnexpectedDisconnect(String),

    #[error("gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("session is not started, notifications are not subscribed yet")]
    NotStarted,

    #[error("{event:?} is not valid while {state:?}")]
    InvalidTransition { state: SessionState, event: LinkEvent },

    #[error("no telemetry in response to command 0x{0:02x}")]
    EmptyResponse(u8),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

pub type Result<T> = std::result::Result<T, BmsError>;
