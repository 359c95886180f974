//! Channel assignment for discovered devices.
//!
//! Devices are kept in an ordered arena; a device's channel is its arena
//! position plus one.  An identity → index map makes lookups O(1).  Entries
//! are never removed or reordered while a session lives, so channel numbers
//! are stable across disconnects and reconnects.

use std::collections::HashMap;

use log::{info, warn};

use crate::error::{Result, ShioError};
use crate::types::{DeviceId, Role};

/// One registered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// 1-based channel number in discovery order.
    pub channel: usize,
    pub id: DeviceId,
    pub role: Role,
}

/// A role byte that has to be delivered to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleWrite {
    pub device: DeviceId,
    pub byte: u8,
}

/// Every device seen in this session, in discovery order.
///
/// Channel `n` is `devices[n - 1]`; unknown identities and channels are
/// reported as [`ShioError::UnknownDevice`] / [`ShioError::UnknownChannel`].
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    index: HashMap<DeviceId, usize>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the channel for `id`, registering it as a slave on first sight.
    pub fn discover(&mut self, id: &DeviceId) -> usize {
        if let Some(&idx) = self.index.get(id) {
            return self.devices[idx].channel;
        }
        let channel = self.devices.len() + 1;
        self.index.insert(id.clone(), self.devices.len());
        self.devices.push(Device {
            channel,
            id: id.clone(),
            role: Role::Slave,
        });
        info!("discovered {id} as channel {channel}");
        channel
    }

    pub fn lookup(&self, id: &DeviceId) -> Result<usize> {
        self.index
            .get(id)
            .map(|&idx| self.devices[idx].channel)
            .ok_or_else(|| ShioError::UnknownDevice(id.clone()))
    }

    /// Change the role of one channel and return the byte to send to it.
    ///
    /// More than one master is accepted.
    pub fn set_role(&mut self, channel: usize, role: Role) -> Result<RoleWrite> {
        if role == Role::Master {
            let others = self
                .devices
                .iter()
                .filter(|d| d.role == Role::Master && d.channel != channel)
                .count();
            if others > 0 {
                warn!("channel {channel} becomes master while {others} other master(s) exist");
            }
        }
        let device = self
            .device_mut(channel)
            .ok_or(ShioError::UnknownChannel(channel))?;
        device.role = role;
        Ok(RoleWrite {
            device: device.id.clone(),
            byte: role.as_byte(),
        })
    }

    pub fn role(&self, channel: usize) -> Option<Role> {
        self.device(channel).map(|d| d.role)
    }

    pub fn identity(&self, channel: usize) -> Option<&DeviceId> {
        self.device(channel).map(|d| &d.id)
    }

    pub fn device(&self, channel: usize) -> Option<&Device> {
        channel.checked_sub(1).and_then(|i| self.devices.get(i))
    }

    fn device_mut(&mut self, channel: usize) -> Option<&mut Device> {
        channel.checked_sub(1).and_then(|i| self.devices.get_mut(i))
    }

    /// All devices in channel order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn channels(&self) -> impl Iterator<Item = usize> + '_ {
        self.devices.iter().map(|d| d.channel)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Forget every device.  Only used when the whole session restarts.
    pub fn reset(&mut self) {
        self.devices.clear();
        self.index.clear();
    }
}
