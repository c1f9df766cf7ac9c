//! TaskRegistry: owns the per-process Task/Context/Map/Work
//! tree and is the single place that wires PageTracker, WorkInference and
//! PolicyRuntime together on behalf of the shim's entry points.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::device::Global;
use crate::error::{NeonError, NeonResult};
use crate::model::{ChannelId, ContextKey, DeviceIndex, Map, MapId, MapRole, Pid, Task, WorkId};
use crate::track::{self, FaultOutcome, PageTable, TrapOutcome};
use crate::work;

pub struct TaskRegistry {
    tasks: RwLock<HashMap<Pid, Task>>,
    /// Global count of live contexts across every task; the 0↔1 edges gate
    /// the trap notifier and a policy reset, and are the only point at
    /// which pending knob changes are allowed to take effect.
    ctx_live: AtomicU32,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self { tasks: RwLock::new(HashMap::new()), ctx_live: AtomicU32::new(0) }
    }

    pub fn ctx_live(&self) -> u32 {
        self.ctx_live.load(Ordering::SeqCst)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// "Context create": attach a Task if none exists yet,
    /// insert a new Context, and bump `ctx_live`. Returns true if this call
    /// carried the 0→1 edge.
    pub fn open_context(&self, pid: Pid, key: ContextKey) -> bool {
        let mut tasks = self.tasks.write();
        let task = tasks.entry(pid).or_insert_with(|| Task::new(pid));
        task.contexts.entry(key).or_insert_with(|| crate::model::Context::new(key));
        self.ctx_live.fetch_add(1, Ordering::SeqCst) == 0
    }

    /// Explicit context teardown (as opposed to riding along with task
    /// exit): stop and free every map still attached, drop the context,
    /// and report whether `ctx_live` reached zero.
    pub fn close_context<PT: PageTable>(
        &self,
        pid: Pid,
        key: ContextKey,
        global: &Global,
        pt: &PT,
    ) -> NeonResult<bool> {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(&pid) else {
            return Err(NeonError::NotOurs);
        };
        let Some(mut ctx) = task.contexts.remove(&key) else {
            return Err(NeonError::NotOurs);
        };
        let map_ids: Vec<MapId> = ctx.maps.iter().map(|(id, _)| id).collect();
        for map_id in map_ids {
            teardown_map(pid, &mut ctx, map_id, global, pt)?;
        }
        Ok(self.ctx_live.fetch_sub(1, Ordering::SeqCst) == 1)
    }

    /// "Pre/post map-in and mmap" pre half: allocate and
    /// attach a blank Map; `post_map` fills in offset/gpu-view once known.
    pub fn pre_map(&self, pid: Pid, key: ContextKey, device: DeviceIndex, role: MapRole) -> NeonResult<MapId> {
        let mut tasks = self.tasks.write();
        let ctx = context_mut(&mut tasks, pid, key)?;
        Ok(ctx.maps.insert(Map {
            role,
            device,
            size: 0,
            offset: 0,
            cpu_addr: 0,
            gpu_view: 0,
            pinned: false,
            pages: Vec::new(),
            pending_fault: None,
        }))
    }

    pub fn post_map(
        &self,
        pid: Pid,
        key: ContextKey,
        map_id: MapId,
        offset: u64,
        gpu_view: u64,
        size: usize,
        cpu_addr: u64,
    ) -> NeonResult<()> {
        let mut tasks = self.tasks.write();
        let ctx = context_mut(&mut tasks, pid, key)?;
        let map = ctx.maps.get_mut(map_id).ok_or(NeonError::NotOurs)?;
        map.offset = offset;
        map.gpu_view = gpu_view;
        map.size = size;
        map.cpu_addr = cpu_addr;
        Ok(())
    }

    /// "Map pages": if this map is an index register, build
    /// its Work, start page tracking, and notify the policy this task has
    /// started using a channel. Returns true if a Work was created.
    pub fn map_pages<PT: PageTable>(
        &self,
        pid: Pid,
        key: ContextKey,
        map_id: MapId,
        global: &Global,
        pt: &PT,
    ) -> NeonResult<bool> {
        let mut tasks = self.tasks.write();
        let ctx = context_mut(&mut tasks, pid, key)?;
        let role = ctx.maps.get(map_id).ok_or(NeonError::NotOurs)?.role;
        if role != MapRole::IndexRegister {
            return Ok(false);
        }
        let (device, offset) = {
            let m = ctx.maps.get(map_id).unwrap();
            (m.device, m.offset)
        };
        let dev = global.devices.get(device.0).ok_or(NeonError::NotOurs)?;
        let channel = dev
            .channel_for_offset(offset)
            .ok_or_else(|| NeonError::UnexpectedState("index-register map offset matches no channel".into()))?;
        let channel_id = ChannelId { device, channel: crate::model::ChannelIndex(channel) };

        let Some(work) = work::init_work(ctx, map_id, channel_id) else {
            // Ring buffer not mapped yet; the ioctl sequence is still in
            // progress, not an error.
            return Ok(false);
        };
        let work_id = ctx.works.insert(work);
        let map = ctx.maps.get_mut(map_id).unwrap();
        track::init(map);
        track::start(map, pt);
        dev.scheduler.start(crate::model::ChannelIndex(channel), pid);
        let _ = work_id;
        Ok(true)
    }

    /// "Pin pages": skip tracking for any sub-mapping past
    /// the first (observed to carry only zero-valued accesses).
    pub fn pin_pages<PT: PageTable>(
        &self,
        pid: Pid,
        key: ContextKey,
        map_id: MapId,
        sub_offset: u64,
        pt: &PT,
    ) -> NeonResult<()> {
        let mut tasks = self.tasks.write();
        let ctx = context_mut(&mut tasks, pid, key)?;
        let map = ctx.maps.get_mut(map_id).ok_or(NeonError::NotOurs)?;
        map.pinned = true;
        if sub_offset == 0 {
            track::init(map);
            track::start(map, pt);
        }
        Ok(())
    }

    /// "Unmap vma / Unpin pages": stop tracking, destroy any
    /// Works referencing the map, and drop it from the context.
    pub fn destroy_map<PT: PageTable>(
        &self,
        pid: Pid,
        key: ContextKey,
        map_id: MapId,
        global: &Global,
        pt: &PT,
    ) -> NeonResult<()> {
        let mut tasks = self.tasks.write();
        let ctx = context_mut(&mut tasks, pid, key)?;
        teardown_map(pid, ctx, map_id, global, pt)?;
        Ok(())
    }

    /// "Copy task" (`CLONE_VM`): another thread now shares
    /// this pid's Task.
    pub fn copy_task(&self, pid: Pid) {
        let mut tasks = self.tasks.write();
        if let Some(task) = tasks.get_mut(&pid) {
            task.sharers += 1;
        }
    }

    /// "Exit task": only the last exiting thread tears the
    /// task down. Returns the new `ctx_live` value if this call performed
    /// the teardown (so the caller can act on a 0-edge), else `None`.
    pub fn exit_task<PT: PageTable>(&self, pid: Pid, global: &Global, pt: &PT) -> NeonResult<Option<u32>> {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(&pid) else { return Ok(None) };
        task.sharers = task.sharers.saturating_sub(1);
        if task.sharers > 0 {
            return Ok(None);
        }
        let mut task = tasks.remove(&pid).unwrap();
        let nctx = task.nctx() as u32;
        for (_, ctx) in task.contexts.iter_mut() {
            let map_ids: Vec<MapId> = ctx.maps.iter().map(|(id, _)| id).collect();
            for map_id in map_ids {
                if let Err(e) = teardown_map(pid, ctx, map_id, global, pt) {
                    log::warn!("registry: error tearing down map at task exit: {e}");
                }
            }
        }
        let prev = self.ctx_live.fetch_sub(nctx, Ordering::SeqCst);
        Ok(Some(prev.saturating_sub(nctx)))
    }

    pub fn mark_malicious(&self, pid: Pid) -> bool {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(&pid) else { return false };
        if task.malicious {
            return false; // already killed once
        }
        task.malicious = true;
        true
    }

    /// fault→trap protocol steps 1-2 and 6-8, tying together
    /// the step-3/4/5/7 logic in `track::handle_fault`.
    pub fn fault<PT: PageTable>(
        &self,
        pid: Pid,
        key: ContextKey,
        fault_addr: u64,
        fault_ip: u64,
        global: &Global,
        pt: &PT,
    ) -> NeonResult<FaultOutcome> {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(&pid) else { return Ok(FaultOutcome::NotOurs) };
        let Some(ctx) = task.contexts.get_mut(&key) else { return Ok(FaultOutcome::NotOurs) };
        let Some(map_id) = ctx.find_map_covering_cpu(fault_addr) else { return Ok(FaultOutcome::NotOurs) };

        let (device, offset, cpu_addr) = {
            let m = ctx.maps.get(map_id).unwrap();
            (m.device, m.offset, m.cpu_addr)
        };
        let dev = global.devices.get(device.0).ok_or(NeonError::NotOurs)?;
        let channel = dev.channel_for_offset(offset);
        let page = ((fault_addr - cpu_addr) as usize) / track::PAGE_SIZE;

        let map = ctx.maps.get_mut(map_id).unwrap();
        let had_pending = map.pending_fault.is_some();
        let outcome = track::handle_fault(map, page, fault_ip, fault_addr, channel.is_some(), pt)?;
        // A fresh fault record (as opposed to the re-fault/cross-page
        // branches, which reuse or annotate the existing one) queues this
        // map for the trap handler to consume in order, step 1.
        if !had_pending && ctx.maps.get(map_id).map(|m| m.pending_fault.is_some()).unwrap_or(false) {
            ctx.fault_queue.push_back(map_id);
        }
        Ok(outcome)
        // step 8: on an index-register write the shim still
        // owns the ring-buffer/command-buffer reads `work::update` needs,
        // so it looks the work up with `find_work_for_channel`, runs
        // `work::update`, and only then calls `DeviceScheduler::submit`.
    }

    /// fault step 6/8: given the write value the shim decoded
    /// and fed through `work::update`, find the channel's live Work and
    /// report it so the caller can drive `WorkInference::update` and then
    /// `DeviceScheduler::submit`.
    pub fn find_work_for_channel(&self, pid: Pid, key: ContextKey, channel: ChannelId) -> NeonResult<WorkId> {
        let mut tasks = self.tasks.write();
        let ctx = context_mut(&mut tasks, pid, key)?;
        ctx.works
            .iter()
            .find(|(_, w)| w.channel == channel)
            .map(|(id, _)| id)
            .ok_or(NeonError::NotOurs)
    }

    /// trap handler steps 1-4.
    pub fn trap<PT: PageTable>(&self, pid: Pid, key: ContextKey, global: &Global, pt: &PT) -> TrapOutcome {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(&pid) else { return TrapOutcome::NotOurs };
        let Some(ctx) = task.contexts.get_mut(&key) else { return TrapOutcome::NotOurs };
        let Some(map_id) = ctx.fault_queue.pop_front() else { return TrapOutcome::NotOurs };
        let Some(map) = ctx.maps.get_mut(map_id) else { return TrapOutcome::NotOurs };

        let device = map.device;
        let offset = map.offset;
        let should_rearm = match global.devices.get(device.0).and_then(|d| d.channel_for_offset(offset)) {
            Some(_) => global.devices[device.0].scheduler.reengage(pid),
            None => true,
        };
        track::handle_trap(map, should_rearm, pt)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn context_mut<'a>(
    tasks: &'a mut HashMap<Pid, Task>,
    pid: Pid,
    key: ContextKey,
) -> NeonResult<&'a mut crate::model::Context> {
    tasks
        .get_mut(&pid)
        .ok_or(NeonError::NotOurs)?
        .contexts
        .get_mut(&key)
        .ok_or(NeonError::NotOurs)
}

fn teardown_map<PT: PageTable>(
    pid: Pid,
    ctx: &mut crate::model::Context,
    map_id: MapId,
    global: &Global,
    pt: &PT,
) -> NeonResult<()> {
    let referencing: Vec<WorkId> = ctx.find_work_referencing(map_id);
    for work_id in referencing {
        if let Some(work) = ctx.works.get(work_id) {
            let channel = work.channel;
            if let Err(e) = work::fini(work) {
                log::warn!("registry: work teardown reported: {e}");
            }
            if let Some(dev) = global.devices.get(channel.device.0) {
                dev.scheduler.stop(channel.channel, pid);
            }
        }
        ctx.works.remove(work_id);
    }
    if let Some(map) = ctx.maps.get_mut(map_id) {
        track::stop(map, pt);
        track::fini(map);
    }
    ctx.maps.remove(map_id);
    Ok(())
}
