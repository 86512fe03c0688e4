use std::io::Error;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nusb;
use nusb::transfer::{Control, ControlType, Recipient, TransferError};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::command::{
    PAYLOAD_LEN, REPORT_VALUE_FALLBACK, REPORT_VALUE_PRIMARY, RelayCommand, SET_REPORT,
};

const USB_TIMEOUT: Duration = Duration::from_secs(1);
const HID_INTERFACE: u8 = 0;

/// Product string assumed when the descriptor carries none.
pub const FALLBACK_PRODUCT: &str = "USBRelay8";
pub const DEFAULT_RELAY_COUNT: u8 = 8;

/// Delay after the normalizing OFF before the pulse raises the channel.
pub const PULSE_SETTLE: Duration = Duration::from_millis(100);
/// How long the channel is held ON during a pulse.
pub const PULSE_HOLD: Duration = Duration::from_millis(1000);

// Overlapping transfers against the same endpoint are undefined on this
// hardware, so every command (and every full pulse) runs under one lock.
static COMMAND_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("no USB relay was found")]
    DeviceNotFound,

    #[error("USB error: {0}")]
    Usb(#[from] Error),

    #[error("relay refused command on both report types: {0}")]
    TransferFailed(TransferError),

    #[error("channel {channel} out of range 1..={relays}")]
    InvalidChannel { channel: u8, relays: u8 },
}

pub fn list() -> Result<impl Iterator<Item = DeviceInfo>, Error> {
    let devices = nusb::list_devices()?;
    Ok(devices
        .filter(|di| di.vendor_id() == crate::RELAY_VID && di.product_id() == crate::RELAY_PID)
        .map(DeviceInfo::new))
}

/// First matching relay board, or `None` when nothing is attached.
pub fn discover() -> Result<Option<DeviceInfo>, Error> {
    Ok(list()?.next())
}

/// Discover and open in one step. There is no persistent session: each
/// command path re-acquires the device through here.
pub fn open() -> Result<Device, RelayError> {
    match discover()? {
        Some(di) => di.open(),
        None => Err(RelayError::DeviceNotFound),
    }
}

/// Best-guess relay count from the free-text product string. Unmatched
/// strings fall back to the documented default of 8.
pub fn relay_count_from_product(product: &str) -> u8 {
    for (needle, count) in [("Relay1", 1), ("Relay2", 2), ("Relay4", 4), ("Relay8", 8)] {
        if product.contains(needle) {
            return count;
        }
    }

    warn!("unrecognized product string {product:?}, assuming {DEFAULT_RELAY_COUNT} relays");
    DEFAULT_RELAY_COUNT
}

#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    pub vid: u16,
    pub pid: u16,
    pub product: String,
    pub relays: u8,

    #[serde(skip)]
    usb: nusb::DeviceInfo,
}

impl DeviceInfo {
    fn new(di: nusb::DeviceInfo) -> Self {
        let product = di
            .product_string()
            .unwrap_or(FALLBACK_PRODUCT)
            .to_string();

        DeviceInfo {
            vid: di.vendor_id(),
            pid: di.product_id(),
            relays: relay_count_from_product(&product),
            product,
            usb: di,
        }
    }

    pub fn open(&self) -> Result<Device, RelayError> {
        let usb = self.usb.open()?;

        // Best-effort: a bound hidraw driver blocks our transfers on
        // some hosts, but failing to detach must never abort the open.
        if let Err(e) = usb.detach_kernel_driver(HID_INTERFACE) {
            debug!("could not detach kernel driver from interface {HID_INTERFACE}: {e}");
        }

        Ok(Device {
            usb,
            relays: self.relays,
        })
    }
}

pub struct Device {
    usb: nusb::Device,
    relays: u8,
}

impl Device {
    pub fn relays(&self) -> u8 {
        self.relays
    }

    /// Set one channel to the requested state. A failed transfer on
    /// wValue 0x0200 is retried once on 0x0300; nothing beyond that.
    pub fn send_command(&self, channel: u8, on: bool) -> Result<(), RelayError> {
        self.check_channel(channel)?;

        let _guard = COMMAND_LOCK.lock().unwrap();
        send_with(&self.usb, channel, RelayCommand::from_state(on))
    }

    /// Momentary contact closure: OFF to normalize, ON, hold, OFF.
    ///
    /// A failure while raising the channel abandons the pulse with no
    /// compensating OFF, so the relay may be left ON. Callers must not
    /// assume the channel is low after an error.
    pub fn pulse(&self, channel: u8, settle: Duration, hold: Duration) -> Result<(), RelayError> {
        self.check_channel(channel)?;

        let _guard = COMMAND_LOCK.lock().unwrap();
        pulse_with(&self.usb, channel, settle, hold)
    }

    fn check_channel(&self, channel: u8) -> Result<(), RelayError> {
        if channel == 0 || channel > self.relays {
            return Err(RelayError::InvalidChannel {
                channel,
                relays: self.relays,
            });
        }

        Ok(())
    }
}

trait ControlTransport {
    fn set_report(&self, value: u16, payload: &[u8; PAYLOAD_LEN]) -> Result<(), TransferError>;
}

impl ControlTransport for nusb::Device {
    fn set_report(&self, value: u16, payload: &[u8; PAYLOAD_LEN]) -> Result<(), TransferError> {
        self.control_out_blocking(
            Control {
                control_type: ControlType::Class,
                recipient: Recipient::Interface,
                request: SET_REPORT,
                value,
                index: HID_INTERFACE as u16,
            },
            payload,
            USB_TIMEOUT,
        )?;

        Ok(())
    }
}

fn send_with<T: ControlTransport>(t: &T, channel: u8, cmd: RelayCommand) -> Result<(), RelayError> {
    let payload = cmd.payload(channel);

    match t.set_report(REPORT_VALUE_PRIMARY, &payload) {
        Ok(()) => Ok(()),
        Err(first) => {
            debug!("transfer with wValue {REPORT_VALUE_PRIMARY:#06x} failed ({first}), retrying");
            t.set_report(REPORT_VALUE_FALLBACK, &payload)
                .map_err(RelayError::TransferFailed)
        }
    }
}

fn pulse_with<T: ControlTransport>(
    t: &T,
    channel: u8,
    settle: Duration,
    hold: Duration,
) -> Result<(), RelayError> {
    // Normalize in case the channel was already high. Non-fatal.
    if let Err(e) = send_with(t, channel, RelayCommand::Off) {
        warn!("pre-pulse off failed on channel {channel}: {e}");
    }
    thread::sleep(settle);

    send_with(t, channel, RelayCommand::On)?;
    thread::sleep(hold);
    send_with(t, channel, RelayCommand::Off)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::time::Instant;

    use super::*;

    struct MockTransport {
        // (wValue, payload, when) per attempted transfer
        calls: RefCell<Vec<(u16, [u8; PAYLOAD_LEN], Instant)>>,
        // indices (0-based) of attempts that should fail
        failures: Vec<usize>,
    }

    impl MockTransport {
        fn new(failures: &[usize]) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                failures: failures.to_vec(),
            }
        }

        fn calls(&self) -> Vec<(u16, [u8; PAYLOAD_LEN])> {
            self.calls
                .borrow()
                .iter()
                .map(|(v, p, _)| (*v, *p))
                .collect()
        }
    }

    impl ControlTransport for MockTransport {
        fn set_report(
            &self,
            value: u16,
            payload: &[u8; PAYLOAD_LEN],
        ) -> Result<(), TransferError> {
            let mut calls = self.calls.borrow_mut();
            let n = calls.len();
            calls.push((value, *payload, Instant::now()));

            if self.failures.contains(&n) {
                Err(TransferError::Stall)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_send_first_attempt_succeeds() {
        let t = MockTransport::new(&[]);
        send_with(&t, 3, RelayCommand::On).unwrap();

        assert_eq!(t.calls(), vec![(0x0200, [0xFF, 3, 0, 0, 0, 0, 0, 0])]);
    }

    #[test]
    fn test_send_falls_back_to_alternate_report() {
        let t = MockTransport::new(&[0]);
        send_with(&t, 1, RelayCommand::Off).unwrap();

        assert_eq!(
            t.calls(),
            vec![
                (0x0200, [0xFD, 1, 0, 0, 0, 0, 0, 0]),
                (0x0300, [0xFD, 1, 0, 0, 0, 0, 0, 0]),
            ]
        );
    }

    #[test]
    fn test_send_fails_when_both_attempts_fail() {
        let t = MockTransport::new(&[0, 1]);
        let err = send_with(&t, 2, RelayCommand::On).unwrap_err();

        assert!(matches!(err, RelayError::TransferFailed(_)));
        assert_eq!(t.calls().len(), 2);
    }

    #[test]
    fn test_pulse_sequence_off_on_off() {
        let t = MockTransport::new(&[]);
        let settle = Duration::from_millis(30);
        let hold = Duration::from_millis(50);
        pulse_with(&t, 4, settle, hold).unwrap();

        let calls = t.calls();
        assert_eq!(
            calls,
            vec![
                (0x0200, [0xFD, 4, 0, 0, 0, 0, 0, 0]),
                (0x0200, [0xFF, 4, 0, 0, 0, 0, 0, 0]),
                (0x0200, [0xFD, 4, 0, 0, 0, 0, 0, 0]),
            ]
        );

        let times: Vec<Instant> = t.calls.borrow().iter().map(|(_, _, at)| *at).collect();
        assert!(times[1] - times[0] >= settle);
        assert!(times[2] - times[1] >= hold);
    }

    #[test]
    fn test_pulse_ignores_failed_normalizing_off() {
        // Both wValue attempts of the leading OFF fail; pulse continues.
        let t = MockTransport::new(&[0, 1]);
        pulse_with(&t, 1, Duration::ZERO, Duration::ZERO).unwrap();

        let commands: Vec<u8> = t.calls().iter().map(|(_, p)| p[0]).collect();
        assert_eq!(commands, vec![0xFD, 0xFD, 0xFF, 0xFD]);
    }

    #[test]
    fn test_pulse_abandoned_when_on_fails() {
        // Leading OFF succeeds (attempt 0), ON fails on both report
        // types (attempts 1 and 2). No trailing OFF must be sent.
        let t = MockTransport::new(&[1, 2]);
        let err = pulse_with(&t, 2, Duration::ZERO, Duration::ZERO).unwrap_err();

        assert!(matches!(err, RelayError::TransferFailed(_)));
        let commands: Vec<u8> = t.calls().iter().map(|(_, p)| p[0]).collect();
        assert_eq!(commands, vec![0xFD, 0xFF, 0xFF]);
    }

    #[test]
    fn test_relay_count_from_product() {
        assert_eq!(relay_count_from_product("USBRelay1"), 1);
        assert_eq!(relay_count_from_product("USBRelay2"), 2);
        assert_eq!(relay_count_from_product("ACME Relay4 Board"), 4);
        assert_eq!(relay_count_from_product("USBRelay8"), 8);
        assert_eq!(relay_count_from_product("mystery widget"), 8);
        assert_eq!(relay_count_from_product(""), 8);
    }
}
