use crate::error::BmsError;

/// The command codes understood by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Pack voltage, current and state of charge
    Soc = 0x90,
    CellVoltageRange = 0x91,
    TemperatureRange = 0x92,
    /// Charge/discharge mode, mosfet states and residual capacity
    MosfetStatus = 0x93,
    /// Cell and sensor counts, charger/load state and cycle count
    PackStatus = 0x94,
    CellStatus = 0x95,
    BalancingStatus = 0x96,
    Errors = 0x97,
}

impl Command {
    /// The commands issued on every polling tick, in order.
    pub const POLL_CYCLE: [Command; 4] = [
        Command::Soc,
        Command::MosfetStatus,
        Command::PackStatus,
        Command::TemperatureRange,
    ];

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// The kind of event a response to this command is published as, if it is decoded at all.
    pub fn kind(self) -> Option<TelemetryKind> {
        match self {
            Command::Soc => Some(TelemetryKind::Soc),
            Command::TemperatureRange => Some(TelemetryKind::Temperature),
            Command::MosfetStatus => Some(TelemetryKind::MosfetStatus),
            Command::PackStatus => Some(TelemetryKind::PackStatus),
            Command::CellVoltageRange
            | Command::CellStatus
            | Command::BalancingStatus
            | Command::Errors => None,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = BmsError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x90 => Ok(Command::Soc),
            0x91 => Ok(Command::CellVoltageRange),
            0x92 => Ok(Command::TemperatureRange),
            0x93 => Ok(Command::MosfetStatus),
            0x94 => Ok(Command::PackStatus),
            0x95 => Ok(Command::CellStatus),
            0x96 => Ok(Command::BalancingStatus),
            0x97 => Ok(Command::Errors),
            other => Err(BmsError::UnknownCommand(other)),
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command.code()
    }
}

/// What subscribers register for. One kind per decodable command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryKind {
    Soc,
    Temperature,
    MosfetStatus,
    PackStatus,
}

impl TelemetryKind {
    pub const ALL: [TelemetryKind; 4] = [
        TelemetryKind::Soc,
        TelemetryKind::Temperature,
        TelemetryKind::MosfetStatus,
        TelemetryKind::PackStatus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TelemetryKind::Soc => "soc",
            TelemetryKind::Temperature => "max_min_temperature",
            TelemetryKind::MosfetStatus => "mosfet_status",
            TelemetryKind::PackStatus => "status",
        }
    }
}

impl std::fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[test]
fn test_command_codes_round_trip() {
    for code in 0x90..=0x97u8 {
        let command = Command::try_from(code).unwrap();
        assert_eq!(u8::from(command), code);
    }
}

#[test]
fn test_unknown_command() {
    assert_eq!(Command::try_from(0x42), Err(BmsError::UnknownCommand(0x42)));
    assert_eq!(Command::try_from(0x98), Err(BmsError::UnknownCommand(0x98)));
}

#[test]
fn test_only_four_commands_are_decoded() {
    let decoded: Vec<Command> = (0x90..=0x97u8)
        .filter_map(|code| Command::try_from(code).ok())
        .filter(|command| command.kind().is_some())
        .collect();
    assert_eq!(
        decoded,
        vec![Command::Soc, Command::TemperatureRange, Command::MosfetStatus, Command::PackStatus]
    );
}
