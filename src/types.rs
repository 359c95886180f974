use std::fmt;

use uuid::Uuid;

use crate::mode::{ModeCommand, OperatingMode};
use crate::plot::PlotFlush;
use crate::protocol::{MIC_DATA_CHARACTERISTIC, ROLE_CHARACTERISTIC, ROLE_MASTER, ROLE_SLAVE};

/// Opaque, stable identity of a shio device.
///
/// Built from the platform BLE identifier:
/// • macOS / Windows: a UUID string
/// • Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
///
/// The simulator uses synthetic names such as `"sim-1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Master/slave role of a device.  Every device starts as a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    Master,
    #[default]
    Slave,
}

impl Role {
    /// The single byte written to [`ROLE_CHARACTERISTIC`] for this role.
    pub fn as_byte(self) -> u8 {
        match self {
            Role::Master => ROLE_MASTER,
            Role::Slave => ROLE_SLAVE,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            ROLE_MASTER => Some(Role::Master),
            ROLE_SLAVE => Some(Role::Slave),
            _ => None,
        }
    }
}

/// Which GATT characteristic a notification arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicKind {
    /// [`MIC_DATA_CHARACTERISTIC`]: packed i16 LE samples.
    MicData,
    /// [`ROLE_CHARACTERISTIC`] read-back.
    Role,
    /// Any other characteristic; logged and ignored.
    Other(Uuid),
}

impl CharacteristicKind {
    pub fn from_uuid(uuid: Uuid) -> Self {
        if uuid == MIC_DATA_CHARACTERISTIC {
            CharacteristicKind::MicData
        } else if uuid == ROLE_CHARACTERISTIC {
            CharacteristicKind::Role
        } else {
            CharacteristicKind::Other(uuid)
        }
    }
}

/// Events delivered by the wireless transport (or the simulator) into the
/// session.
///
/// Packets from different devices may interleave arbitrarily; only the order
/// of packets from one device is preserved.
#[derive(Debug, Clone)]
pub enum ShioEvent {
    /// A shio device was seen during a scan.  Repeated sightings are allowed.
    Discovered(DeviceId),
    /// The BLE link to a device is up.
    Connected(DeviceId),
    /// The BLE link to a device was lost.  The device keeps its channel.
    Disconnected(DeviceId),
    /// One notification payload.
    Packet {
        device: DeviceId,
        kind: CharacteristicKind,
        data: Vec<u8>,
    },
    /// A role byte could not be written.
    RoleWriteFailed { device: DeviceId, reason: String },
}

/// Requests the session sends back out to the wireless transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Write one role byte to the device's [`ROLE_CHARACTERISTIC`].
    WriteRole { device: DeviceId, byte: u8 },
    /// Subscribe to the device's notify characteristics.
    Subscribe(DeviceId),
    /// Stop notifications from the device.
    Unsubscribe(DeviceId),
}

/// Commands issued by the UI collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Mode(ModeCommand),
    SetRole { channel: usize, role: Role },
}

/// Updates emitted by the session for the UI collaborator.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// A device received its channel number.
    DeviceDiscovered { channel: usize, device: DeviceId },
    Connected { channel: usize },
    Disconnected { channel: usize },
    /// The active mode changed (including automatic reverts to Idle).
    ModeChanged(OperatingMode),
    /// A plot window flushed; carries the full display window.
    Plot(PlotFlush),
    /// One inference cycle completed and its output was written.
    InferenceCompleted { output: Vec<i32> },
    /// An inference call failed or timed out; the session is back in Idle.
    InferenceFailed(String),
    /// A role byte could not be delivered.
    RoleWriteFailed { channel: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_byte_round_trips() {
        assert_eq!(Role::Master.as_byte(), 0x6D);
        assert_eq!(Role::Slave.as_byte(), 0x73);
        assert_eq!(Role::from_byte(0x6D), Some(Role::Master));
        assert_eq!(Role::from_byte(0x00), None);
    }

    #[test]
    fn default_role_is_slave() {
        assert_eq!(Role::default(), Role::Slave);
    }

    #[test]
    fn characteristic_kind_from_uuid() {
        assert_eq!(
            CharacteristicKind::from_uuid(MIC_DATA_CHARACTERISTIC),
            CharacteristicKind::MicData
        );
        let other = Uuid::from_u128(1);
        assert_eq!(
            CharacteristicKind::from_uuid(other),
            CharacteristicKind::Other(other)
        );
    }
}
