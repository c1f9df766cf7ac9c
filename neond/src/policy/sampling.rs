//! PolicySampling.
//!
//! A device cycles through four seasons. BARRIER holds every submission
//! back until no work is in flight. DRAINING waits out whatever was
//! already in flight when the barrier closed. SAMPLING then gives each
//! task, in turn, exclusive unintercepted access for up to `sampling_t`
//! (or until it crosses a critical mass of sampled requests), recording
//! how much execution time it got per request. FREERUN opens the gate for
//! everyone except tasks that are already ahead on virtual time, for
//! `sampling_x` times the total sampling season length, before the device
//! re-barriers and a new epoch's virtual times are computed from the
//! samples just collected.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::model::{ChannelIndex, Pid};
use crate::policy::{SchedTask, SubmitAction};

/// A sampled task crossing this many requests in one turn
/// ends its turn early rather than waiting out the rest of `sampling_t`.
const NEON_SAMPLING_CRITICAL_MASS: u64 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Season {
    Barrier,
    Draining,
    Sampling,
    Freerun,
}

impl std::fmt::Display for Season {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Season::Barrier => "barrier",
            Season::Draining => "draining",
            Season::Sampling => "sampling",
            Season::Freerun => "freerun",
        };
        f.write_str(s)
    }
}

pub struct SamplingState {
    season: Season,
    sampling_t: Duration,
    sampling_x: u32,
    draining_countdown: u32,
    tour_index: usize,
    sampled_task: Option<Pid>,
    sample_started_at: Option<Instant>,
    sample_started_exe: Duration,
    awaiting_drain: bool,
    total_sampling_dt: Duration,
    freerun_started_at: Option<Instant>,
    held_back: HashSet<Pid>,
    pub device_vtime: Duration,
}

impl SamplingState {
    pub fn season(&self) -> Season {
        self.season
    }

    pub fn new(sampling_t: Duration, sampling_x: u32) -> Self {
        Self {
            season: Season::Barrier,
            sampling_t,
            sampling_x: sampling_x.max(1),
            draining_countdown: 0,
            tour_index: 0,
            sampled_task: None,
            sample_started_at: None,
            sample_started_exe: Duration::ZERO,
            awaiting_drain: false,
            total_sampling_dt: Duration::ZERO,
            freerun_started_at: None,
            held_back: HashSet::new(),
            device_vtime: Duration::ZERO,
        }
    }
}

pub fn start(_state: &mut SamplingState, _tasks: &mut HashMap<Pid, SchedTask>, _pid: Pid) {}

/// `stop`: an exiting sampled task's turn ends immediately;
/// its semaphore is drained so its last thread isn't left stuck.
pub fn stop(state: &mut SamplingState, tasks: &mut HashMap<Pid, SchedTask>, pid: Pid, is_last: bool) {
    if !is_last {
        return;
    }
    if let Some(t) = tasks.get(&pid) {
        t.sem.drain();
    }
    state.held_back.remove(&pid);
    if state.sampled_task == Some(pid) {
        state.sampled_task = None;
        state.awaiting_drain = false;
    }
}

fn block(tasks: &mut HashMap<Pid, SchedTask>, pid: Pid, channel: ChannelIndex) -> SubmitAction {
    if let Some(t) = tasks.get_mut(&pid) {
        t.issue2comp.remove(&channel);
        return SubmitAction::Block(t.sem.clone());
    }
    SubmitAction::IssueNow
}

fn in_flight_count(tasks: &HashMap<Pid, SchedTask>) -> usize {
    tasks.values().map(|t| t.issue2comp.len()).sum()
}

fn enter_sampling(state: &mut SamplingState, tasks: &HashMap<Pid, SchedTask>, task_order: &[Pid]) {
    state.season = Season::Sampling;
    state.tour_index = 0;
    state.awaiting_drain = false;
    match task_order.first().copied() {
        Some(pid) => {
            state.sampled_task = Some(pid);
            state.sample_started_at = Some(Instant::now());
            state.sample_started_exe = tasks.get(&pid).map(|t| t.exe_total).unwrap_or_default();
            if let Some(t) = tasks.get(&pid) {
                t.sem.up();
            }
        }
        None => {
            state.sampled_task = None;
            enter_freerun(state, tasks, task_order);
        }
    }
}

fn enter_freerun(state: &mut SamplingState, tasks: &HashMap<Pid, SchedTask>, task_order: &[Pid]) {
    state.season = Season::Freerun;
    state.freerun_started_at = Some(Instant::now());
    for pid in task_order {
        if !state.held_back.contains(pid) {
            if let Some(t) = tasks.get(pid) {
                t.sem.up();
            }
        }
    }
}

fn finish_epoch(state: &mut SamplingState, tasks: &mut HashMap<Pid, SchedTask>, task_order: &[Pid]) {
    let epoch_dt = state.total_sampling_dt * state.sampling_x;
    let mut avgs: HashMap<Pid, Duration> = HashMap::new();
    let mut total_avg = Duration::ZERO;
    for pid in task_order {
        let Some(t) = tasks.get(pid) else { continue };
        if t.nrqst_sampled == 0 {
            continue;
        }
        let per_rqst = t.exe_dt_sampled / t.nrqst_sampled as u32;
        let rqst_per_call =
            if t.ncall_sampled > 0 { t.nrqst_sampled.div_ceil(t.ncall_sampled) } else { 1 };
        let avg = per_rqst * rqst_per_call as u32;
        avgs.insert(*pid, avg);
        total_avg += avg;
    }

    if !total_avg.is_zero() {
        for (pid, avg) in &avgs {
            let share = avg.as_secs_f64() * epoch_dt.as_secs_f64() / total_avg.as_secs_f64();
            if let Some(t) = tasks.get_mut(pid) {
                t.vtime += Duration::from_secs_f64(share.max(0.0));
            }
        }
    }

    let device_vtime = avgs
        .keys()
        .filter_map(|pid| tasks.get(pid).map(|t| t.vtime))
        .min()
        .unwrap_or(Duration::ZERO);
    state.device_vtime = device_vtime;
    state.held_back.clear();
    for pid in avgs.keys() {
        if let Some(t) = tasks.get_mut(pid) {
            if t.vtime < device_vtime {
                t.vtime = device_vtime;
            }
            t.held_back = t.vtime > device_vtime + epoch_dt;
            if t.held_back {
                state.held_back.insert(*pid);
            }
        }
    }

    for pid in task_order {
        if let Some(t) = tasks.get_mut(pid) {
            t.nrqst_sampled = 0;
            t.ncall_sampled = 0;
            t.exe_dt_sampled = Duration::ZERO;
        }
    }
    state.total_sampling_dt = Duration::ZERO;
    state.season = Season::Barrier;
    state.sampled_task = None;
}

fn advance_tour(state: &mut SamplingState, tasks: &mut HashMap<Pid, SchedTask>, task_order: &[Pid]) {
    if let (Some(pid), Some(started)) = (state.sampled_task, state.sample_started_at) {
        let dt = Instant::now().saturating_duration_since(started);
        state.total_sampling_dt += dt;
        if let Some(t) = tasks.get_mut(&pid) {
            let exe_dt = t.exe_total.saturating_sub(state.sample_started_exe);
            t.exe_dt_sampled += exe_dt;
        }
    }
    state.awaiting_drain = false;
    state.tour_index += 1;
    if state.tour_index >= task_order.len() {
        enter_freerun(state, tasks, task_order);
        return;
    }
    let next = task_order[state.tour_index];
    state.sampled_task = Some(next);
    state.sample_started_at = Some(Instant::now());
    state.sample_started_exe = tasks.get(&next).map(|t| t.exe_total).unwrap_or_default();
    if let Some(t) = tasks.get(&next) {
        t.sem.up();
    }
}

/// `submit`.
pub fn submit(
    state: &mut SamplingState,
    tasks: &mut HashMap<Pid, SchedTask>,
    task_order: &mut [Pid],
    pid: Pid,
    channel: ChannelIndex,
) -> SubmitAction {
    if state.season == Season::Barrier {
        if in_flight_count(tasks) == 0 {
            enter_sampling(state, tasks, task_order);
        } else {
            state.season = Season::Draining;
            state.draining_countdown = in_flight_count(tasks) as u32;
        }
    }
    match state.season {
        Season::Barrier | Season::Draining => block(tasks, pid, channel),
        Season::Sampling => {
            if state.sampled_task == Some(pid) {
                SubmitAction::IssueNow
            } else {
                block(tasks, pid, channel)
            }
        }
        Season::Freerun => {
            if state.held_back.contains(&pid) {
                block(tasks, pid, channel)
            } else {
                SubmitAction::IssueNow
            }
        }
    }
}

/// `ncall_sampled` counts whole kernel calls, not individual
/// submissions — a request flagged `part_of_call` (Kepler's "second of
/// three") belongs to the call already counted, so it's skipped here.
pub fn issue(
    state: &mut SamplingState,
    tasks: &mut HashMap<Pid, SchedTask>,
    _task_order: &mut [Pid],
    pid: Pid,
    part_of_call: bool,
) {
    if state.season != Season::Sampling || state.sampled_task != Some(pid) {
        return;
    }
    if let Some(t) = tasks.get_mut(&pid) {
        t.nrqst_sampled += 1;
        if !part_of_call {
            t.ncall_sampled += 1;
        }
    }
}

/// `complete`.
pub fn complete(
    state: &mut SamplingState,
    tasks: &mut HashMap<Pid, SchedTask>,
    task_order: &mut [Pid],
    pid: Pid,
) {
    match state.season {
        Season::Draining => {
            if state.draining_countdown > 0 {
                state.draining_countdown -= 1;
            }
            if state.draining_countdown == 0 {
                enter_sampling(state, tasks, task_order);
            }
        }
        Season::Sampling => {
            if state.awaiting_drain
                && state.sampled_task == Some(pid)
                && tasks.get(&pid).map(|t| t.issue2comp.is_empty()).unwrap_or(true)
            {
                advance_tour(state, tasks, task_order);
            }
        }
        _ => {}
    }
}

/// `event`: timer-driven tour/epoch advance.
pub fn event(state: &mut SamplingState, tasks: &mut HashMap<Pid, SchedTask>, task_order: &mut [Pid]) {
    let now = Instant::now();
    match state.season {
        Season::Sampling => {
            let elapsed = state
                .sample_started_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default();
            let critical_mass = state
                .sampled_task
                .and_then(|pid| tasks.get(&pid))
                .map(|t| t.nrqst_sampled >= NEON_SAMPLING_CRITICAL_MASS)
                .unwrap_or(false);
            if elapsed < state.sampling_t && !critical_mass {
                return;
            }
            let still_running = state
                .sampled_task
                .and_then(|pid| tasks.get(&pid))
                .map(|t| !t.issue2comp.is_empty())
                .unwrap_or(false);
            if still_running {
                state.awaiting_drain = true;
                return;
            }
            advance_tour(state, tasks, task_order);
        }
        Season::Freerun => {
            let elapsed = state
                .freerun_started_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default();
            let freerun_dt = state.total_sampling_dt * state.sampling_x;
            if elapsed >= freerun_dt {
                finish_epoch(state, tasks, task_order);
            }
        }
        _ => {}
    }
}

/// `reengage_map`: only the currently sampled task (SAMPLING)
/// or a non-held-back task (FREERUN) runs unintercepted; BARRIER/DRAINING
/// intercept everyone.
pub fn reengage(state: &SamplingState, pid: Pid) -> bool {
    match state.season {
        Season::Barrier | Season::Draining => true,
        Season::Sampling => state.sampled_task != Some(pid),
        Season::Freerun => state.held_back.contains(&pid),
    }
}
