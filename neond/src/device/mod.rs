//! Device and the singleton Global.

pub mod channel;

use std::time::Duration;

use neon_proto::{GpuFamily, PolicyKind, SupportedDevice};

pub use channel::{Channel, ChannelState};

use crate::policy::DeviceScheduler;

/// One probed GPU device: its channel array and the static layout its
/// (vendor, device, subsystem) triple implied.
pub struct Device {
    pub name: &'static str,
    pub family: GpuFamily,
    pub channels: Vec<Channel>,
    pub register_base: u64,
    pub register_stride: u64,
    pub bar1_based: bool,
    /// Base address of whichever BAR the channel-register range lives in.
    pub bar_base: u64,
    /// The active scheduling policy's per-device runtime state.
    pub scheduler: DeviceScheduler,
}

impl Device {
    pub fn from_supported(
        def: &SupportedDevice,
        bar0_addr: u64,
        bar1_addr: u64,
        policy: PolicyKind,
        timeslice_t: Duration,
        sampling_t: Duration,
        sampling_x: u32,
    ) -> Self {
        let bar_base = if def.bar1_based { bar1_addr } else { bar0_addr };
        Self {
            name: def.name,
            family: def.family,
            channels: (0..def.num_channels).map(Channel::new).collect(),
            register_base: def.register_base,
            register_stride: def.register_stride,
            bar1_based: def.bar1_based,
            bar_base,
            scheduler: DeviceScheduler::new(policy, timeslice_t, sampling_t, sampling_x),
        }
    }

    pub fn index_register_addr(&self, channel: usize) -> u64 {
        self.bar_base
            + self.register_base
            + (channel as u64) * self.register_stride
            + neon_proto::INDEX_REGISTER_OFFSET
    }

    /// Identify which channel, if any, a map offset corresponds to
    /// (fault step 6: "offset hashing into a device's
    /// channel-register range").
    pub fn channel_for_offset(&self, offset: u64) -> Option<usize> {
        let base = self.register_base;
        let top = base + (self.channels.len() as u64) * self.register_stride;
        if offset < base || offset >= top {
            return None;
        }
        let rel = offset - base;
        if rel % self.register_stride != 0 {
            return None;
        }
        Some((rel / self.register_stride) as usize)
    }

    /// Iterate the channels currently holding an unfinished request
    /// ("live-channel bitmap").
    pub fn live_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.is_live())
    }
}

/// The module-load-time singleton owning every probed device (`Global`).
pub struct Global {
    pub devices: Vec<Device>,
}

impl Global {
    pub fn new() -> Self {
        Self { devices: Vec::new() }
    }

    pub fn add_device(&mut self, device: Device) -> usize {
        self.devices.push(device);
        self.devices.len() - 1
    }
}

impl Default for Global {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neon_proto::SUPPORTED_DEVICES;

    fn test_device(def: &SupportedDevice, bar0: u64, bar1: u64) -> Device {
        Device::from_supported(
            def,
            bar0,
            bar1,
            PolicyKind::Fcfs,
            Duration::from_millis(30),
            Duration::from_millis(5),
            5,
        )
    }

    #[test]
    fn channel_for_offset_maps_back_to_index() {
        let def = &SUPPORTED_DEVICES[2]; // Kepler GTX670, BAR1-based
        let dev = test_device(def, 0, 0x1000_0000);
        let off = def.register_base + 5 * def.register_stride;
        assert_eq!(dev.channel_for_offset(off), Some(5));
        assert_eq!(dev.channel_for_offset(off + 1), None);
        assert_eq!(dev.channel_for_offset(def.register_base - 1), None);
    }

    #[test]
    fn index_register_addr_uses_correct_bar() {
        let def = &SUPPORTED_DEVICES[2];
        let dev = test_device(def, 0xAAAA_0000, 0xBBBB_0000);
        assert_eq!(
            dev.index_register_addr(0),
            0xBBBB_0000 + def.register_base + neon_proto::INDEX_REGISTER_OFFSET
        );
    }
}
