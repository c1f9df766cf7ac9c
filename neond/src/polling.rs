//! ChannelTable & PollingLoop.
//!
//! A single worker wakes on a periodic timer, reads every live channel's
//! completion counter, declares completion when it reaches target, and
//! tracks how long a channel has been stuck for liveness-based killing.
//! Reading the counter and delivering a kill are both out-of-process
//! effects the kernel module owned directly; here they're traits so the
//! tick logic is testable without a real mapping or a real process table.

use std::time::Instant;

use crate::device::Global;
use crate::metrics::Metrics;
use crate::model::{ChannelIndex, Pid};
use crate::registry::TaskRegistry;

/// Reads a completion counter through its kernel-mapped virtual address.
pub trait CounterReader {
    fn read_counter(&self, kvaddr: u64) -> u64;
}

/// Delivers a process-group kill to a pid identified as likely malicious.
pub trait ProcessKiller {
    fn kill_group(&self, pid: Pid);
}

/// Run one polling tick across every device (steps 1-5).
/// `malicious_ticks` is `malicious_T / polling_T`; zero disables detection.
pub fn tick<CR: CounterReader, PK: ProcessKiller>(
    global: &Global,
    registry: &TaskRegistry,
    malicious_ticks: u64,
    counters: &CR,
    killer: &PK,
    metrics: &Metrics,
) {
    let started = Instant::now();
    for dev in &global.devices {
        let mut malicious_pid: Option<Pid> = None;

        for channel in dev.live_channels() {
            let Some(mut state) = channel.try_lock() else { continue };
            let Some(addr) = state.counter_addr else { continue };
            let target = state.target;
            let value = counters.read_counter(addr);
            let complete = value >= target;

            if !complete && malicious_ticks > 0 && state.pdt > 0 {
                state.pdt += 1;
                if state.pdt > malicious_ticks {
                    malicious_pid = state.owner;
                }
            }
            let owner = state.owner;
            drop(state);

            if complete {
                channel.set_live(false);
                if let Some(pid) = owner {
                    dev.scheduler.complete(ChannelIndex(channel.index), pid);
                    metrics.inc_complete();
                }
                let mut state = channel.lock();
                state.counter_addr = None;
                state.target = 0;
                state.pdt = 0;
            }
        }

        if let Some(pid) = malicious_pid {
            // Give everyone else a second chance once one pid is flagged.
            for channel in &dev.channels {
                let mut state = channel.lock();
                if state.owner != Some(pid) {
                    state.pdt = 1;
                }
            }
            if registry.mark_malicious(pid) {
                killer.kill_group(pid);
                metrics.inc_malicious_kill();
            }
        }

        dev.scheduler.event();
    }
    metrics.record_poll_tick(started.elapsed());
}

/// Submission path helper ("live-channel bitmap... set on
/// submit"): record the new owner/target on a channel and mark it live.
/// Called by the shim once `WorkInference::update` and
/// `DeviceScheduler::submit` have both succeeded.
pub fn channel_submitted(global: &Global, device: crate::model::DeviceIndex, channel: ChannelIndex, pid: Pid, counter_kvaddr: u64, target: u64) {
    let Some(dev) = global.devices.get(device.0) else { return };
    let Some(ch) = dev.channels.get(channel.0) else { return };
    {
        let mut state = ch.lock();
        state.owner = Some(pid);
        state.counter_addr = Some(counter_kvaddr);
        state.target = target;
        state.pdt = 1;
    }
    ch.set_live(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use neon_proto::PolicyKind;
    use std::cell::RefCell;
    use std::time::Duration;

    struct FixedCounter(u64);
    impl CounterReader for FixedCounter {
        fn read_counter(&self, _kvaddr: u64) -> u64 {
            self.0
        }
    }

    struct RecordingKiller(RefCell<Vec<Pid>>);
    impl ProcessKiller for RecordingKiller {
        fn kill_group(&self, pid: Pid) {
            self.0.borrow_mut().push(pid);
        }
    }

    fn test_global() -> Global {
        let mut g = Global::new();
        let def = &neon_proto::SUPPORTED_DEVICES[0];
        g.add_device(crate::device::Device::from_supported(
            def,
            0,
            0,
            PolicyKind::Fcfs,
            Duration::from_millis(30),
            Duration::from_millis(5),
            5,
        ));
        g
    }

    #[test]
    fn counter_at_target_completes_and_clears_liveness() {
        let global = test_global();
        let registry = TaskRegistry::new();
        registry.open_context(7, crate::model::ContextKey(1));
        let dev = &global.devices[0];
        dev.scheduler.start(ChannelIndex(0), 7);
        channel_submitted(&global, crate::model::DeviceIndex(0), ChannelIndex(0), 7, 0x1234, 5);
        dev.scheduler.submit(ChannelIndex(0), 7, false);
        dev.scheduler.issue(ChannelIndex(0), 7, false);

        let counters = FixedCounter(5);
        let killer = RecordingKiller(RefCell::new(Vec::new()));
        let metrics = Metrics::new();
        tick(&global, &registry, 0, &counters, &killer, &metrics);

        assert!(!dev.channels[0].is_live());
        assert!(killer.0.borrow().is_empty());
        assert_eq!(metrics.snapshot().complete_total, 1);
    }

    #[test]
    fn stuck_channel_past_malicious_threshold_kills_once() {
        let global = test_global();
        let registry = TaskRegistry::new();
        registry.open_context(7, crate::model::ContextKey(1));
        let dev = &global.devices[0];
        dev.scheduler.start(ChannelIndex(0), 7);
        channel_submitted(&global, crate::model::DeviceIndex(0), ChannelIndex(0), 7, 0x1234, 100);
        dev.scheduler.submit(ChannelIndex(0), 7, false);
        dev.scheduler.issue(ChannelIndex(0), 7, false);

        let counters = FixedCounter(0); // never reaches target
        let killer = RecordingKiller(RefCell::new(Vec::new()));
        let metrics = Metrics::new();
        for _ in 0..5 {
            tick(&global, &registry, 2, &counters, &killer, &metrics);
        }
        assert_eq!(killer.0.borrow().len(), 1, "killed exactly once");
        tick(&global, &registry, 2, &counters, &killer, &metrics);
        assert_eq!(killer.0.borrow().len(), 1, "double-kill gate holds");
        assert_eq!(metrics.snapshot().malicious_kills_total, 1);
    }
}
