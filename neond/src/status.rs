//! Diagnostic status surface.
//!
//! The knob channel and the diagnosis dump are external collaborators in
//! principle, but something has to carry them between this
//! process and `neon-cli`; a small JSON file, written atomically after every
//! few polling ticks, is the simplest thing that works without pulling in a
//! socket or HTTP stack neither binary otherwise needs.

use std::io;
use std::path::Path;

pub use neon_proto::{DeviceStatus, StatusSnapshot};

use crate::device::Global;

/// Build a status snapshot from the live device table and metrics.
pub fn build(global: &Global, metrics: &crate::metrics::Metrics) -> StatusSnapshot {
    let devices = global
        .devices
        .iter()
        .map(|dev| DeviceStatus {
            name: dev.name.to_string(),
            policy: dev.scheduler.policy_kind().to_string(),
            channel_count: dev.channels.len(),
            live_channels: dev.live_channels().count(),
            task_count: dev.scheduler.task_count(),
            holder: dev.scheduler.holder(),
            season: dev.scheduler.season().map(str::to_string),
            device_vtime_ms: dev.scheduler.device_vtime_ms(),
        })
        .collect();
    StatusSnapshot { pid: std::process::id(), devices, metrics: metrics.snapshot() }
}

/// Write the snapshot to `path`, via a temporary file in the same directory
/// renamed into place, so a concurrent reader never observes a half-written
/// file.
pub fn write_atomic(path: &Path, snapshot: &StatusSnapshot) -> io::Result<()> {
    let body = serde_json::to_vec_pretty(snapshot)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".{}.tmp", path.file_name().and_then(|n| n.to_str()).unwrap_or("status")));
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a previously written snapshot back, for `neon-cli status`.
pub fn read(path: &Path) -> io::Result<StatusSnapshot> {
    let body = std::fs::read(path)?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use tempfile::tempdir;

    #[test]
    fn snapshot_round_trips_through_the_status_file() {
        let global = Global::new();
        let metrics = Metrics::new();
        metrics.inc_submit();
        let snapshot = build(&global, &metrics);

        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        write_atomic(&path, &snapshot).unwrap();
        let read_back = read(&path).unwrap();
        assert_eq!(read_back.pid, snapshot.pid);
        assert_eq!(read_back.metrics.submit_total, 1);
    }

    #[test]
    fn build_reports_one_entry_per_device() {
        use neon_proto::PolicyKind;
        use std::time::Duration;

        let mut global = Global::new();
        global.add_device(crate::device::Device::from_supported(
            &neon_proto::SUPPORTED_DEVICES[0],
            0,
            0,
            PolicyKind::Fcfs,
            Duration::from_millis(30),
            Duration::from_millis(5),
            5,
        ));
        let metrics = Metrics::new();
        let snapshot = build(&global, &metrics);
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.devices[0].policy, "fcfs");
        assert_eq!(snapshot.devices[0].live_channels, 0);
    }
}
