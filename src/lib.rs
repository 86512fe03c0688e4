use std::ops::RangeInclusive;

pub mod command;
pub mod state;
pub mod usb_device;

pub const RELAY_VID: u16 = 0x16C0;
pub const RELAY_PID: u16 = 0x05DF;

/// Channel numbers any supported board can expose. A concrete device may
/// have fewer, see [`usb_device::DeviceInfo`].
pub const ALL_CHANNELS: RangeInclusive<u8> = 1u8..=8;
