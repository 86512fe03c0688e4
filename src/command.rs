//! HID report framing for the relay board.
//!
//! The board takes a single 8-byte SET_REPORT payload: command byte,
//! channel byte, six bytes of padding.

pub const PAYLOAD_LEN: usize = 8;

/// HID class SET_REPORT request.
pub const SET_REPORT: u8 = 0x09;

/// wValue for the first transfer attempt (output report, id 0).
pub const REPORT_VALUE_PRIMARY: u16 = 0x0200;

/// wValue retried once when the primary transfer fails. Some board
/// revisions expose the report under a different report type.
pub const REPORT_VALUE_FALLBACK: u16 = 0x0300;

const CMD_ON: u8 = 0xFF;
const CMD_OFF: u8 = 0xFD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    On,
    Off,
}

impl RelayCommand {
    pub fn from_state(on: bool) -> Self {
        if on { RelayCommand::On } else { RelayCommand::Off }
    }

    pub const fn byte(self) -> u8 {
        match self {
            RelayCommand::On => CMD_ON,
            RelayCommand::Off => CMD_OFF,
        }
    }

    pub fn payload(self, channel: u8) -> [u8; PAYLOAD_LEN] {
        [self.byte(), channel, 0, 0, 0, 0, 0, 0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_bytes() {
        assert_eq!(RelayCommand::On.byte(), 0xFF);
        assert_eq!(RelayCommand::Off.byte(), 0xFD);
    }

    #[test]
    fn test_from_state() {
        assert_eq!(RelayCommand::from_state(true), RelayCommand::On);
        assert_eq!(RelayCommand::from_state(false), RelayCommand::Off);
    }

    #[test]
    fn test_payload_layout() {
        for channel in crate::ALL_CHANNELS {
            assert_eq!(
                RelayCommand::On.payload(channel),
                [0xFF, channel, 0, 0, 0, 0, 0, 0]
            );
            assert_eq!(
                RelayCommand::Off.payload(channel),
                [0xFD, channel, 0, 0, 0, 0, 0, 0]
            );
        }
    }
}
