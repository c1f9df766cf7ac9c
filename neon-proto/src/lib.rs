//! Wire-level types shared between `neond` and `neon-cli`.
//!
//! This crate carries no logic beyond decoding fixed byte layouts — the
//! ring-buffer entry format a channel's index register points into, the
//! seven 64-bit words a device probe hands back, and the knob values
//! exchanged over the control surface. Everything here is `Copy` and
//! `bytemuck`-decodable so it can be read directly out of a mapped
//! region without an intermediate parser.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// One ring-buffer entry: `(gpu_command_address, command_size)` packed into
/// two 32-bit words, as found at `entry_index * 8` bytes into a ring buffer.
///
/// Layout mirrors the hardware's own packing: the low word is the bottom
/// 32 bits of the GPU-view command address; the high word's low byte
/// extends the address to 40 bits and the remaining 24 bits hold the size.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RingEntryRaw {
    pub bottom: u32,
    pub top: u32,
}

impl RingEntryRaw {
    /// Decode `(command_address, command_size)` in GPU-view address space.
    pub fn decode(&self) -> (u64, u64) {
        let addr = (self.bottom as u64) | (((self.top as u64) & 0xff) << 32);
        let size = (self.top as u64) >> 8;
        (addr, size)
    }
}

/// The two register layouts NEON understands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuFamily {
    Tesla,
    Kepler,
}

/// One PCI (vendor, device, subsystem) triple NEON recognizes, plus the
/// static layout that triple implies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SupportedDevice {
    pub name: &'static str,
    pub vendor_id: u32,
    pub device_id: u32,
    pub subsystem_id: u32,
    pub family: GpuFamily,
    pub num_channels: usize,
    /// Whether the channel register range is carved out of BAR0 or BAR1.
    pub bar1_based: bool,
    pub register_base: u64,
    pub register_stride: u64,
}

/// Offset of a channel's index register from its register-range base.
pub const INDEX_REGISTER_OFFSET: u64 = 0x8c;

pub const SUPPORTED_DEVICES: &[SupportedDevice] = &[
    SupportedDevice {
        name: "Tesla GTX275",
        vendor_id: 0x10de,
        device_id: 0x05e6,
        subsystem_id: 0x1171, // EVGA
        family: GpuFamily::Tesla,
        num_channels: 40,
        bar1_based: false,
        register_base: 0xc0_0000,
        register_stride: 0x2000,
    },
    SupportedDevice {
        name: "Tesla NVS295",
        vendor_id: 0x10de,
        device_id: 0x06fd,
        subsystem_id: 0x062e, // NVIDIA reference board
        family: GpuFamily::Tesla,
        num_channels: 32,
        bar1_based: false,
        register_base: 0xc0_0000,
        register_stride: 0x2000,
    },
    SupportedDevice {
        name: "Kepler GTX670",
        vendor_id: 0x10de,
        device_id: 0x1189,
        subsystem_id: 0x1265, // Zotac
        family: GpuFamily::Kepler,
        num_channels: 96,
        bar1_based: true,
        register_base: 0x7d6_0000,
        register_stride: 0x200,
    },
];

impl SupportedDevice {
    /// The CPU-view address of channel `index`'s index register, given the
    /// device's chosen BAR base address.
    pub fn index_register_addr(&self, bar_base: u64, channel_index: usize) -> u64 {
        bar_base
            + self.register_base
            + (channel_index as u64) * self.register_stride
            + INDEX_REGISTER_OFFSET
    }
}

/// The seven 64-bit words a device probe hands back.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct DeviceProbeWords {
    pub bar0_addr: u64,
    pub bar0_size: u64,
    pub bar1_addr: u64,
    pub bar1_size: u64,
    pub vendor_id: u64,
    pub device_id: u64,
    pub subsystem_id: u64,
}

impl DeviceProbeWords {
    /// Find the supported device table entry matching this probe's ids, if any.
    pub fn lookup(&self) -> Option<&'static SupportedDevice> {
        SUPPORTED_DEVICES.iter().find(|d| {
            d.vendor_id as u64 == self.vendor_id
                && d.device_id as u64 == self.device_id
                && d.subsystem_id as u64 == self.subsystem_id
        })
    }
}

/// The scheduling discipline knob (`policy`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Fcfs,
    Timeslice,
    Sampling,
}

impl Default for PolicyKind {
    fn default() -> Self {
        PolicyKind::Fcfs
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fcfs" => Ok(PolicyKind::Fcfs),
            "timeslice" => Ok(PolicyKind::Timeslice),
            "sampling" => Ok(PolicyKind::Sampling),
            other => Err(format!("unknown policy {other:?}, expected fcfs|timeslice|sampling")),
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PolicyKind::Fcfs => "fcfs",
            PolicyKind::Timeslice => "timeslice",
            PolicyKind::Sampling => "sampling",
        };
        f.write_str(s)
    }
}

/// Rolled-up daemon counters, as exposed by `neond::metrics::Metrics::snapshot`
/// and embedded in [`StatusSnapshot`] for `neon-cli status` to read back
/// without linking against `neond` itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub submit_total: u64,
    pub issue_total: u64,
    pub complete_total: u64,
    pub poll_ticks_total: u64,
    pub malicious_kills_total: u64,
    pub avg_poll_tick_micros: u64,
    pub uptime_seconds: u64,
}

/// One device's diagnostic status, as written by `neond::status::build`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub name: String,
    pub policy: String,
    pub channel_count: usize,
    pub live_channels: usize,
    pub task_count: usize,
    pub holder: Option<i32>,
    pub season: Option<String>,
    pub device_vtime_ms: Option<u64>,
}

/// The full status snapshot `neond` writes to `runtime.status_path` and
/// `neon-cli status` reads back (diagnosis dump).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub pid: u32,
    pub devices: Vec<DeviceStatus>,
    pub metrics: MetricsSnapshot,
}

/// A single knob value as exchanged over the control surface.
/// Named knobs are read/written as strings over the CLI boundary and
/// parsed on the `neond` side into the typed `KnobSet`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "value", rename_all = "snake_case")]
pub enum KnobUpdate {
    PollingT(u32),
    MaliciousT(u32),
    Policy(PolicyKind),
    TimesliceT(u32),
    Disengage(bool),
    SamplingT(u32),
    SamplingX(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bottom_top_into_address_and_size() {
        let raw = RingEntryRaw {
            bottom: 0x1000_0000,
            top: (7 << 8) | 0x01,
        };
        let (addr, size) = raw.decode();
        assert_eq!(addr, 0x1_1000_0000);
        assert_eq!(size, 7);
    }

    #[test]
    fn probe_lookup_matches_known_triple() {
        let probe = DeviceProbeWords {
            bar0_addr: 0,
            bar0_size: 0,
            bar1_addr: 0,
            bar1_size: 0,
            vendor_id: 0x10de,
            device_id: 0x1189,
            subsystem_id: 0x1265,
        };
        let dev = probe.lookup().expect("kepler device recognized");
        assert_eq!(dev.name, "Kepler GTX670");
        assert_eq!(dev.num_channels, 96);
    }

    #[test]
    fn probe_lookup_rejects_unknown_triple() {
        let probe = DeviceProbeWords {
            vendor_id: 0xdead,
            device_id: 0xbeef,
            subsystem_id: 0,
            ..Default::default()
        };
        assert!(probe.lookup().is_none());
    }

    #[test]
    fn policy_kind_round_trips_through_str() {
        for (text, kind) in [
            ("fcfs", PolicyKind::Fcfs),
            ("timeslice", PolicyKind::Timeslice),
            ("sampling", PolicyKind::Sampling),
        ] {
            assert_eq!(text.parse::<PolicyKind>().unwrap(), kind);
            assert_eq!(kind.to_string(), text);
        }
        assert!("bogus".parse::<PolicyKind>().is_err());
    }

    #[test]
    fn index_register_addr_matches_base_plus_stride() {
        let dev = &SUPPORTED_DEVICES[0];
        assert_eq!(
            dev.index_register_addr(0x1000_0000, 2),
            0x1000_0000 + 0xc0_0000 + 2 * 0x2000 + 0x8c
        );
    }
}
