//! Typed telemetry decoded from response payloads.
//!
//! Each decodable command has its own record type. Multi-byte integers in a payload
//! are big-endian and signed unless noted.

use std::time::SystemTime;

use crate::command::{Command, TelemetryKind};
use crate::error::{BmsError, Result};
use crate::frame::{Frame, PAYLOAD_LEN};

/// The BMS encodes current with this zero offset, in 0.1 A units.
const CURRENT_OFFSET: i32 = 30000;
/// The BMS adds this bias to temperatures so they fit in a byte.
const TEMPERATURE_OFFSET: i16 = 40;

/// Pack voltage, current and state of charge (command `0x90`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocSample {
    /// Total pack voltage in V
    pub voltage: f32,
    /// Current in A. Negative while charging, positive while discharging
    pub current: f32,
    /// State of charge in %
    pub soc: f32,
}

/// Highest and lowest temperature with the sensors that measured them (command `0x92`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureSample {
    pub highest_temperature: i16,
    pub highest_sensor: i8,
    pub lowest_temperature: i16,
    pub lowest_sensor: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MosfetMode {
    Stationary,
    Charging,
    Discharging,
}

/// Mode, mosfet states and residual capacity (command `0x93`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MosfetStatus {
    pub mode: MosfetMode,
    pub charging_mosfet: u8,
    /// As reported. This does not track the real state of the discharge switch.
    pub discharging_mosfet: u8,
    /// Residual capacity in Ah
    pub capacity_ah: f32,
}

/// Cell and sensor counts, charger/load state and cycle count (command `0x94`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackStatus {
    pub num_cells: i8,
    pub num_temps: i8,
    pub charger_running: bool,
    pub load_running: bool,
    pub num_cycles: i16,
}

/// One decoded response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Telemetry {
    Soc(SocSample),
    Temperature(TemperatureSample),
    MosfetStatus(MosfetStatus),
    PackStatus(PackStatus),
}

impl Telemetry {
    pub fn kind(&self) -> TelemetryKind {
        match self {
            Telemetry::Soc(_) => TelemetryKind::Soc,
            Telemetry::Temperature(_) => TelemetryKind::Temperature,
            Telemetry::MosfetStatus(_) => TelemetryKind::MosfetStatus,
            Telemetry::PackStatus(_) => TelemetryKind::PackStatus,
        }
    }
}

/// A telemetry record together with the command byte of the frame it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub command: u8,
    pub telemetry: Telemetry,
    pub received_at: SystemTime,
}

impl TelemetryEvent {
    pub fn kind(&self) -> TelemetryKind {
        self.telemetry.kind()
    }

    /// Decode a frame whose checksum has already been verified.
    ///
    /// `Ok(None)` means the command is known but has no decoder.
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>> {
        let telemetry = decode(frame.command(), frame.payload())?;
        Ok(telemetry.map(|telemetry| Self {
            command: frame.command(),
            telemetry,
            received_at: SystemTime::now(),
        }))
    }
}

/// Decode the payload of a response to `command`.
pub fn decode(command: u8, payload: &[u8; PAYLOAD_LEN]) -> Result<Option<Telemetry>> {
    let telemetry = match Command::try_from(command)? {
        Command::Soc => Telemetry::Soc(decode_soc(payload)?),
        Command::TemperatureRange => Telemetry::Temperature(decode_temperature(payload)),
        Command::MosfetStatus => Telemetry::MosfetStatus(decode_mosfet_status(payload)),
        Command::PackStatus => Telemetry::PackStatus(decode_pack_status(payload)),
        Command::CellVoltageRange
        | Command::CellStatus
        | Command::BalancingStatus
        | Command::Errors => return Ok(None),
    };
    Ok(Some(telemetry))
}

fn i16_at(payload: &[u8; PAYLOAD_LEN], offset: usize) -> i16 {
    i16::from_be_bytes([payload[offset], payload[offset + 1]])
}

fn i8_at(payload: &[u8; PAYLOAD_LEN], offset: usize) -> i8 {
    payload[offset] as i8
}

fn decode_soc(payload: &[u8; PAYLOAD_LEN]) -> Result<SocSample> {
    let sample = SocSample {
        voltage: i16_at(payload, 0) as f32 / 10.0,
        current: (i16_at(payload, 4) as i32 - CURRENT_OFFSET) as f32 / 10.0,
        soc: i16_at(payload, 6) as f32 / 10.0,
    };
    if !(0.0..=100.0).contains(&sample.soc) {
        return Err(BmsError::OutOfRangeValue { field: "soc", value: sample.soc });
    }
    Ok(sample)
}

fn decode_temperature(payload: &[u8; PAYLOAD_LEN]) -> TemperatureSample {
    TemperatureSample {
        highest_temperature: i8_at(payload, 0) as i16 - TEMPERATURE_OFFSET,
        highest_sensor: i8_at(payload, 1),
        lowest_temperature: i8_at(payload, 2) as i16 - TEMPERATURE_OFFSET,
        lowest_sensor: i8_at(payload, 3),
    }
}

fn decode_mosfet_status(payload: &[u8; PAYLOAD_LEN]) -> MosfetStatus {
    let mode = match i8_at(payload, 0) {
        0 => MosfetMode::Stationary,
        1 => MosfetMode::Charging,
        _ => MosfetMode::Discharging,
    };
    let capacity_mah = i32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    MosfetStatus {
        mode,
        charging_mosfet: payload[1],
        discharging_mosfet: payload[2],
        capacity_ah: capacity_mah as f32 / 1000.0,
    }
}

// Byte 4 carries another cycle counter which is unstable, the one at 5..7 is used instead.
fn decode_pack_status(payload: &[u8; PAYLOAD_LEN]) -> PackStatus {
    PackStatus {
        num_cells: i8_at(payload, 0),
        num_temps: i8_at(payload, 1),
        charger_running: i8_at(payload, 2) != 0,
        load_running: i8_at(payload, 3) != 0,
        num_cycles: i16_at(payload, 5),
    }
}

#[cfg(test)]
fn payload(hex: &str) -> [u8; PAYLOAD_LEN] {
    hex::decode(hex).unwrap().try_into().unwrap()
}

#[test]
fn test_decode_soc() {
    // 52.8 V, 29980 raw current = 2 A charging, 76.5 %
    let result = decode(0x90, &payload("02100000751c02fd")).unwrap();
    assert_eq!(
        result,
        Some(Telemetry::Soc(SocSample { voltage: 52.8, current: -2.0, soc: 76.5 }))
    );
}

#[test]
fn test_decode_soc_discharging() {
    // 30125 raw current = 12.5 A discharging
    let result = decode(0x90, &payload("0208000075ad03e8")).unwrap();
    assert_eq!(
        result,
        Some(Telemetry::Soc(SocSample { voltage: 52.0, current: 12.5, soc: 100.0 }))
    );
}

#[test]
fn test_decode_soc_out_of_range() {
    let result = decode(0x90, &payload("02100000753005dc"));
    assert_eq!(result, Err(BmsError::OutOfRangeValue { field: "soc", value: 150.0 }));
}

#[test]
fn test_decode_soc_negative_is_out_of_range() {
    let result = decode(0x90, &payload("021000007530fff6"));
    assert_eq!(result, Err(BmsError::OutOfRangeValue { field: "soc", value: -1.0 }));
}

#[test]
fn test_decode_temperature() {
    let result = decode(0x92, &payload("3e022a0100000000")).unwrap();
    assert_eq!(
        result,
        Some(Telemetry::Temperature(TemperatureSample {
            highest_temperature: 22,
            highest_sensor: 2,
            lowest_temperature: 2,
            lowest_sensor: 1,
        }))
    );
}

#[test]
fn test_decode_temperature_below_zero() {
    let result = decode(0x92, &payload("1e01000200000000")).unwrap();
    assert_eq!(
        result,
        Some(Telemetry::Temperature(TemperatureSample {
            highest_temperature: -10,
            highest_sensor: 1,
            lowest_temperature: -40,
            lowest_sensor: 2,
        }))
    );
}

#[test]
fn test_decode_mosfet_status() {
    let result = decode(0x93, &payload("0101011200030d40")).unwrap();
    assert_eq!(
        result,
        Some(Telemetry::MosfetStatus(MosfetStatus {
            mode: MosfetMode::Charging,
            charging_mosfet: 1,
            discharging_mosfet: 1,
            capacity_ah: 200.0,
        }))
    );
}

#[test]
fn test_decode_mosfet_mode() {
    let mode = |byte: &str| match decode(0x93, &payload(&format!("{byte}00000000000000"))) {
        Ok(Some(Telemetry::MosfetStatus(status))) => status.mode,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(mode("00"), MosfetMode::Stationary);
    assert_eq!(mode("01"), MosfetMode::Charging);
    assert_eq!(mode("02"), MosfetMode::Discharging);
    assert_eq!(mode("ff"), MosfetMode::Discharging);
}

#[test]
fn test_decode_pack_status() {
    let result = decode(0x94, &[0x04, 0x03, 0x01, 0x00, 0x00, 0x00, 0x05, 0x00]).unwrap();
    assert_eq!(
        result,
        Some(Telemetry::PackStatus(PackStatus {
            num_cells: 4,
            num_temps: 3,
            charger_running: true,
            load_running: false,
            num_cycles: 5,
        }))
    );
}

#[test]
fn test_decode_pack_status_ignores_byte_four() {
    let a = decode(0x94, &payload("1001000109000100")).unwrap();
    let b = decode(0x94, &payload("10010001ff000100")).unwrap();
    assert_eq!(a, b);
    match a {
        Some(Telemetry::PackStatus(status)) => {
            assert_eq!(status.num_cells, 16);
            assert!(status.load_running);
            assert!(!status.charger_running);
            assert_eq!(status.num_cycles, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_undecoded_commands_yield_nothing() {
    for command in [0x91, 0x95, 0x96, 0x97] {
        assert_eq!(decode(command, &[0; PAYLOAD_LEN]), Ok(None));
    }
}

#[test]
fn test_unknown_command_is_an_error() {
    assert_eq!(decode(0x20, &[0; PAYLOAD_LEN]), Err(BmsError::UnknownCommand(0x20)));
}
