//! PolicyRuntime, the shared scheduler frontend.
//!
//! Every policy implements the same lifecycle; dispatch is table-driven
//! (a tagged enum, matched once per call) rather than dynamic dispatch,
//! since the policy is selected once per epoch and hot-path indirection
//! isn't worth paying for. The frontend owns all
//! cross-cutting bookkeeping — per-work/per-task counters and timestamps,
//! list membership, bitmap updates — so the three policies below stay small.

pub mod fcfs;
pub mod sampling;
pub mod timeslice;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use neon_proto::PolicyKind;

use crate::model::{ChannelIndex, Pid};
use crate::sem::CountingSemaphore;

/// Per-channel scheduler bookkeeping for one task.
#[derive(Debug, Default)]
pub struct SchedWork {
    pub requests: u64,
    pub submit_ts: Option<Instant>,
    pub issue_ts: Option<Instant>,
    pub exe_total: Duration,
    pub wait_total: Duration,
    pub part_of_call: bool,
}

/// The scheduler's view of one process on one device.
pub struct SchedTask {
    pub pid: Pid,
    pub works: HashMap<ChannelIndex, SchedWork>,
    /// Channels with a live (`start`ed, not yet `stop`ped) work.
    pub start2stop: HashSet<ChannelIndex>,
    /// Channels currently between `issue` and `complete`.
    pub issue2comp: HashSet<ChannelIndex>,
    pub requests_total: u64,
    pub exe_total: Duration,
    pub wait_total: Duration,
    pub sem: Arc<CountingSemaphore>,

    // Timeslice-only.
    pub overuse: Duration,

    // Sampling-only.
    pub vtime: Duration,
    pub nrqst_sampled: u64,
    pub ncall_sampled: u64,
    pub exe_dt_sampled: Duration,
    pub held_back: bool,
    pub occupied_channels: u32,
    pub managed_channels: u32,
}

impl SchedTask {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            works: HashMap::new(),
            start2stop: HashSet::new(),
            issue2comp: HashSet::new(),
            requests_total: 0,
            exe_total: Duration::ZERO,
            wait_total: Duration::ZERO,
            sem: Arc::new(CountingSemaphore::new()),
            overuse: Duration::ZERO,
            vtime: Duration::ZERO,
            nrqst_sampled: 0,
            ncall_sampled: 0,
            exe_dt_sampled: Duration::ZERO,
            held_back: false,
            occupied_channels: 0,
            managed_channels: 0,
        }
    }
}

/// Per-device mutable state for whichever policy is active.
pub enum PolicyState {
    Fcfs,
    Timeslice(timeslice::TimesliceState),
    Sampling(sampling::SamplingState),
}

impl PolicyState {
    pub fn new(kind: PolicyKind, timeslice_t: Duration, sampling_t: Duration, sampling_x: u32) -> Self {
        match kind {
            PolicyKind::Fcfs => PolicyState::Fcfs,
            PolicyKind::Timeslice => PolicyState::Timeslice(timeslice::TimesliceState::new(timeslice_t)),
            PolicyKind::Sampling => PolicyState::Sampling(sampling::SamplingState::new(sampling_t, sampling_x)),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            PolicyState::Fcfs => PolicyKind::Fcfs,
            PolicyState::Timeslice(_) => PolicyKind::Timeslice,
            PolicyState::Sampling(_) => PolicyKind::Sampling,
        }
    }
}

/// What `submit` decided to do: issue immediately, or block the caller on
/// a task semaphore and issue once released.
pub enum SubmitAction {
    IssueNow,
    Block(Arc<CountingSemaphore>),
}

struct Inner {
    tasks: HashMap<Pid, SchedTask>,
    /// Round-robin order of tasks with at least one live work, used by
    /// timeslice and sampling. FCFS never reads this.
    task_order: Vec<Pid>,
    policy: PolicyState,
}

/// One device's scheduler frontend. `inner` is the device
/// read-write lock: held for write around start/stop/submit/complete,
/// for read around pid lookups.
pub struct DeviceScheduler {
    inner: parking_lot::RwLock<Inner>,
}

impl DeviceScheduler {
    pub fn new(kind: PolicyKind, timeslice_t: Duration, sampling_t: Duration, sampling_x: u32) -> Self {
        Self {
            inner: parking_lot::RwLock::new(Inner {
                tasks: HashMap::new(),
                task_order: Vec::new(),
                policy: PolicyState::new(kind, timeslice_t, sampling_t, sampling_x),
            }),
        }
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.inner.read().policy.kind()
    }

    /// `start`.
    pub fn start(&self, channel: ChannelIndex, pid: Pid) {
        let mut inner = self.inner.write();
        let is_new_task = !inner.tasks.contains_key(&pid);
        if is_new_task {
            inner.tasks.insert(pid, SchedTask::new(pid));
        }
        let was_idle = inner.tasks.get(&pid).unwrap().start2stop.is_empty();
        {
            let task = inner.tasks.get_mut(&pid).unwrap();
            task.works.insert(channel, SchedWork::default());
        }
        if was_idle {
            inner.task_order.push(pid);
        }
        let Inner { tasks, task_order, policy } = &mut *inner;
        match policy {
            PolicyState::Fcfs => fcfs::start(),
            PolicyState::Timeslice(st) => timeslice::start(st, tasks, task_order, pid, was_idle),
            PolicyState::Sampling(st) => sampling::start(st, tasks, pid),
        }
        inner.tasks.get_mut(&pid).unwrap().start2stop.insert(channel);
    }

    /// `stop`.
    pub fn stop(&self, channel: ChannelIndex, pid: Pid) {
        let mut inner = self.inner.write();
        let is_last = {
            let task = inner.tasks.get_mut(&pid).expect("stop without start");
            task.start2stop.remove(&channel);
            task.start2stop.is_empty()
        };
        if is_last {
            inner.task_order.retain(|p| *p != pid);
        }
        let Inner { tasks, task_order, policy } = &mut *inner;
        match policy {
            PolicyState::Fcfs => fcfs::stop(),
            PolicyState::Timeslice(st) => timeslice::stop(st, tasks, task_order, pid, is_last),
            PolicyState::Sampling(st) => sampling::stop(st, tasks, pid, is_last),
        }
        if let Some(task) = inner.tasks.get_mut(&pid) {
            task.works.remove(&channel);
        }
        if is_last {
            inner.tasks.remove(&pid);
        }
    }

    /// Returns the decided action; the caller
    /// (registry/shim) performs the actual blocking *outside* this call so
    /// the write lock above is released while parked.
    pub fn submit(&self, channel: ChannelIndex, pid: Pid, part_of_call: bool) -> SubmitAction {
        let now = Instant::now();
        let mut inner = self.inner.write();
        {
            let task = inner.tasks.get_mut(&pid).expect("submit without start");
            let already_issued = task.issue2comp.contains(&channel);
            let work = task.works.get_mut(&channel).expect("submit without start");
            if already_issued {
                if let Some(issue_ts) = work.issue_ts {
                    let exe = now.saturating_duration_since(issue_ts);
                    work.exe_total += exe;
                    task.exe_total += exe;
                }
            }
            work.requests += 1;
            task.requests_total += 1;
            work.submit_ts = Some(now);
            work.part_of_call = part_of_call;
        }
        let Inner { tasks, task_order, policy } = &mut *inner;
        match policy {
            PolicyState::Fcfs => fcfs::submit(),
            PolicyState::Timeslice(st) => timeslice::submit(st, tasks, task_order, pid, channel),
            PolicyState::Sampling(st) => sampling::submit(st, tasks, task_order, pid, channel),
        }
    }

    /// `issue`. `had_blocked` is true when the caller just
    /// resumed from a `SubmitAction::Block`.
    pub fn issue(&self, channel: ChannelIndex, pid: Pid, had_blocked: bool) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let part_of_call = {
            let task = inner.tasks.get_mut(&pid).expect("issue without start");
            let work = task.works.get_mut(&channel).expect("issue without start");
            if had_blocked {
                task.issue2comp.insert(channel);
                if let Some(submit_ts) = work.submit_ts {
                    let wait = now.saturating_duration_since(submit_ts);
                    work.wait_total += wait;
                    task.wait_total += wait;
                }
                work.issue_ts = Some(now);
            } else {
                work.issue_ts = work.submit_ts;
            }
            work.part_of_call
        };
        let Inner { tasks, task_order, policy } = &mut *inner;
        match policy {
            PolicyState::Fcfs => fcfs::issue(),
            PolicyState::Timeslice(st) => timeslice::issue(st, tasks, pid),
            PolicyState::Sampling(st) => sampling::issue(st, tasks, task_order, pid, part_of_call),
        }
        inner.tasks.get_mut(&pid).unwrap().issue2comp.insert(channel);
    }

    /// `complete`. Idempotent: a second call with the bit
    /// already clear is a no-op.
    pub fn complete(&self, channel: ChannelIndex, pid: Pid) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let had_bit = {
            let Some(task) = inner.tasks.get_mut(&pid) else { return };
            if !task.issue2comp.remove(&channel) {
                false
            } else {
                if let Some(work) = task.works.get_mut(&channel) {
                    if let Some(issue_ts) = work.issue_ts {
                        let exe = now.saturating_duration_since(issue_ts);
                        work.exe_total += exe;
                        task.exe_total += exe;
                    }
                }
                true
            }
        };
        if !had_bit {
            return;
        }
        let Inner { tasks, task_order, policy } = &mut *inner;
        match policy {
            PolicyState::Fcfs => fcfs::complete(),
            PolicyState::Timeslice(st) => timeslice::complete(st, tasks, task_order, pid),
            PolicyState::Sampling(st) => sampling::complete(st, tasks, task_order, pid),
        }
    }

    /// Invoked once per polling tick so timer-driven policies can react.
    pub fn event(&self) {
        let mut inner = self.inner.write();
        let Inner { tasks, task_order, policy } = &mut *inner;
        match policy {
            PolicyState::Fcfs => {}
            PolicyState::Timeslice(st) => timeslice::event(st, tasks, task_order),
            PolicyState::Sampling(st) => sampling::event(st, tasks, task_order),
        }
    }

    /// Should an index-register write be rearmed for this pid right now?
    pub fn reengage(&self, pid: Pid) -> bool {
        let inner = self.inner.read();
        match &inner.policy {
            PolicyState::Fcfs => fcfs::reengage(),
            PolicyState::Timeslice(st) => timeslice::reengage(st, pid),
            PolicyState::Sampling(st) => sampling::reengage(st, pid),
        }
    }

    pub fn task_count(&self) -> usize {
        self.inner.read().tasks.len()
    }

    pub fn is_holder(&self, pid: Pid) -> bool {
        match &self.inner.read().policy {
            PolicyState::Timeslice(st) => st.holder == Some(pid),
            _ => false,
        }
    }

    /// Current token holder, for diagnostics; `None` outside
    /// the timeslice policy or when no task has been promoted yet.
    pub fn holder(&self) -> Option<Pid> {
        match &self.inner.read().policy {
            PolicyState::Timeslice(st) => st.holder,
            _ => None,
        }
    }

    /// Device virtual time in milliseconds, for diagnostics; `None` outside
    /// the sampling policy.
    pub fn device_vtime_ms(&self) -> Option<u64> {
        match &self.inner.read().policy {
            PolicyState::Sampling(st) => Some(st.device_vtime.as_millis() as u64),
            _ => None,
        }
    }

    /// Current season name, for diagnostics; `None` outside the sampling policy.
    pub fn season(&self) -> Option<&'static str> {
        match &self.inner.read().policy {
            PolicyState::Sampling(st) => Some(match st.season() {
                sampling::Season::Barrier => "barrier",
                sampling::Season::Draining => "draining",
                sampling::Season::Sampling => "sampling",
                sampling::Season::Freerun => "freerun",
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fcfs_submit_never_blocks() {
        let sched = DeviceScheduler::new(PolicyKind::Fcfs, Duration::from_millis(30), Duration::from_millis(5), 5);
        sched.start(ChannelIndex(0), 100);
        let action = sched.submit(ChannelIndex(0), 100, false);
        assert!(matches!(action, SubmitAction::IssueNow));
        sched.issue(ChannelIndex(0), 100, false);
        sched.complete(ChannelIndex(0), 100);
        sched.complete(ChannelIndex(0), 100); // idempotent, must not panic
    }

    #[test]
    fn stop_removes_idle_task() {
        let sched = DeviceScheduler::new(PolicyKind::Fcfs, Duration::from_millis(30), Duration::from_millis(5), 5);
        sched.start(ChannelIndex(0), 100);
        assert_eq!(sched.task_count(), 1);
        sched.stop(ChannelIndex(0), 100);
        assert_eq!(sched.task_count(), 0);
    }
}
