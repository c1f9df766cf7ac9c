//! External entry points.
//!
//! `NeonCore` is the facade a real kernel-module shim (or, here, a
//! userspace stand-in driven by tests/the daemon) calls into. It owns the
//! probed device table, the task registry, and the knob store, and turns
//! each ioctl/fault/lifecycle hook into the right registry call plus the
//! `ctx_live` 0↔1 checkpoint bookkeeping.

use crate::device::Global;
use crate::knobs::{KnobStore, Knobs};
use crate::metrics::Metrics;
use crate::model::{ChannelId, ContextKey, DeviceIndex, MapId, MapRole, Pid};
use crate::policy::SubmitAction;
use crate::registry::TaskRegistry;
use crate::track::{FaultOutcome, PageTable, TrapOutcome};

pub struct NeonCore {
    pub global: Global,
    pub registry: TaskRegistry,
    pub knobs: KnobStore,
    pub metrics: Metrics,
}

impl NeonCore {
    pub fn new(global: Global, knobs: Knobs) -> Self {
        Self { global, registry: TaskRegistry::new(), knobs: KnobStore::new(knobs), metrics: Metrics::new() }
    }

    /// The only place a `ctx_live` 0↔1 edge is acted on: commit any
    /// pending knob changes and, in a real shim, (de)register
    /// the trap notifier and reset the active policy.
    fn on_ctx_live_edge(&self) {
        let knobs = self.knobs.commit();
        log::debug!("ctx_live edge: committed knobs, policy={}", knobs.policy);
    }

    /// `ioctl`: the context-create path of the dispatch table.
    /// Other ioctl methods (mapin/mmap/gpuview) are handled by the
    /// `map_pages`/`pin_pages` entry points below, matching the original's
    /// split between "pre" and "post" calls.
    pub fn open_context(&self, pid: Pid, key: ContextKey) -> i32 {
        if self.registry.open_context(pid, key) {
            self.on_ctx_live_edge();
        }
        0
    }

    pub fn close_context<PT: PageTable>(&self, pid: Pid, key: ContextKey, pt: &PT) -> i32 {
        match self.registry.close_context(pid, key, &self.global, pt) {
            Ok(true) => {
                self.on_ctx_live_edge();
                0
            }
            Ok(false) => 0,
            Err(e) => {
                log::warn!("close_context: {e}");
                1
            }
        }
    }

    pub fn pre_map(&self, pid: Pid, key: ContextKey, device: DeviceIndex, role: MapRole) -> Option<MapId> {
        self.registry.pre_map(pid, key, device, role).map_err(|e| log::warn!("pre_map: {e}")).ok()
    }

    pub fn post_map(&self, pid: Pid, key: ContextKey, map_id: MapId, offset: u64, gpu_view: u64, size: usize, cpu_addr: u64) -> i32 {
        match self.registry.post_map(pid, key, map_id, offset, gpu_view, size, cpu_addr) {
            Ok(()) => 0,
            Err(e) => {
                log::warn!("post_map: {e}");
                1
            }
        }
    }

    /// `map_pages`.
    pub fn map_pages<PT: PageTable>(&self, pid: Pid, key: ContextKey, map_id: MapId, pt: &PT) -> i32 {
        match self.registry.map_pages(pid, key, map_id, &self.global, pt) {
            Ok(_) => 0,
            Err(e) => {
                log::warn!("map_pages: {e}");
                1
            }
        }
    }

    /// `pin_pages`.
    pub fn pin_pages<PT: PageTable>(&self, pid: Pid, key: ContextKey, map_id: MapId, sub_offset: u64, pt: &PT) -> i32 {
        match self.registry.pin_pages(pid, key, map_id, sub_offset, pt) {
            Ok(()) => 0,
            Err(e) => {
                log::warn!("pin_pages: {e}");
                1
            }
        }
    }

    /// `unpin_pages` / `unmap_vma`.
    pub fn destroy_map<PT: PageTable>(&self, pid: Pid, key: ContextKey, map_id: MapId, pt: &PT) -> i32 {
        match self.registry.destroy_map(pid, key, map_id, &self.global, pt) {
            Ok(()) => 0,
            Err(e) => {
                log::warn!("destroy_map: {e}");
                1
            }
        }
    }

    /// `fault_handler`: 0 handled, 1 not ours.
    pub fn fault_handler<PT: PageTable>(&self, pid: Pid, key: ContextKey, addr: u64, ip: u64, pt: &PT) -> i32 {
        match self.registry.fault(pid, key, addr, ip, &self.global, pt) {
            Ok(FaultOutcome::NotOurs) => 1,
            Ok(FaultOutcome::Handled { .. }) => 0,
            Err(e) => {
                log::error!("fault_handler: {e}");
                1
            }
        }
    }

    /// The single-step trap completion hook (trap handler).
    pub fn trap_handler<PT: PageTable>(&self, pid: Pid, key: ContextKey, pt: &PT) -> TrapOutcome {
        self.registry.trap(pid, key, &self.global, pt)
    }

    /// Once the shim has decoded an index-register write via
    /// `fault_handler` and fed it through `work::update`, it calls this to
    /// run the rest of the submit/issue pipeline: policy `submit` must
    /// terminate by calling `issue`.
    pub fn submit_channel(&self, device: DeviceIndex, channel: ChannelId, pid: Pid, part_of_call: bool) {
        let Some(dev) = self.global.devices.get(device.0) else { return };
        self.metrics.inc_submit();
        match dev.scheduler.submit(channel.channel, pid, part_of_call) {
            SubmitAction::IssueNow => dev.scheduler.issue(channel.channel, pid, false),
            SubmitAction::Block(sem) => {
                sem.down();
                dev.scheduler.issue(channel.channel, pid, true);
            }
        }
        self.metrics.inc_issue();
    }

    /// `copy_task`.
    pub fn copy_task(&self, pid: Pid) -> i32 {
        self.registry.copy_task(pid);
        0
    }

    /// `exit_task`.
    pub fn exit_task<PT: PageTable>(&self, pid: Pid, pt: &PT) {
        match self.registry.exit_task(pid, &self.global, pt) {
            Ok(Some(ctx_live)) if ctx_live == 0 => self.on_ctx_live_edge(),
            Ok(_) => {}
            Err(e) => log::warn!("exit_task: {e}"),
        }
    }

    /// `tweet`: a trace breadcrumb.
    pub fn tweet(&self, msg: &str) {
        log::trace!(target: "neon::tweet", "{msg}");
    }
}
