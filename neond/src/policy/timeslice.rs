//! PolicyTimeslice.
//!
//! A single token circulates round-robin across the device's tasks. The
//! token holder's index-register writes are never intercepted; everyone
//! else's are, so their next write faults and blocks on their semaphore.
//! A task that overruns its slice (tracked via `SchedTask::overuse`) gets
//! skipped once, paying down the debt instead of taking the token again.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::model::{ChannelIndex, Pid};
use crate::policy::{SchedTask, SubmitAction};

pub struct TimesliceState {
    pub holder: Option<Pid>,
    pub timeslice_t: Duration,
    next_fire: Instant,
    /// Set while the current holder has overrun the slice and we're
    /// waiting for its in-flight work to drain before handing the token off.
    update_pending: bool,
    update_ts: Option<Instant>,
}

impl TimesliceState {
    pub fn new(timeslice_t: Duration) -> Self {
        Self {
            holder: None,
            timeslice_t,
            next_fire: Instant::now() + timeslice_t,
            update_pending: false,
            update_ts: None,
        }
    }
}

/// Round-robin the token to the next eligible candidate after `state.holder`,
/// skipping (and debiting) anyone still over budget from their last turn.
fn update_token_holder(
    state: &mut TimesliceState,
    tasks: &mut HashMap<Pid, SchedTask>,
    task_order: &[Pid],
) {
    if task_order.is_empty() {
        state.holder = None;
        return;
    }
    if task_order.len() == 1 {
        let pid = task_order[0];
        if let Some(t) = tasks.get_mut(&pid) {
            t.overuse = Duration::ZERO;
        }
        set_holder(state, tasks, Some(pid));
        return;
    }

    let start_idx = state
        .holder
        .and_then(|h| task_order.iter().position(|p| *p == h))
        .map(|i| (i + 1) % task_order.len())
        .unwrap_or(0);

    let mut idx = start_idx;
    loop {
        let pid = task_order[idx];
        let overuse = tasks.get(&pid).map(|t| t.overuse).unwrap_or_default();
        if overuse > state.timeslice_t {
            if let Some(t) = tasks.get_mut(&pid) {
                t.overuse -= state.timeslice_t;
            }
            idx = (idx + 1) % task_order.len();
            if idx == start_idx {
                // Everyone is in debt; forgive this one and take it anyway.
                if let Some(t) = tasks.get_mut(&task_order[idx]) {
                    t.overuse = Duration::ZERO;
                }
                break;
            }
            continue;
        }
        break;
    }
    set_holder(state, tasks, Some(task_order[idx]));
}

fn set_holder(state: &mut TimesliceState, tasks: &HashMap<Pid, SchedTask>, new: Option<Pid>) {
    if let Some(pid) = new {
        if let Some(t) = tasks.get(&pid) {
            t.sem.up();
        }
    }
    state.holder = new;
}

/// `start`: a task gaining its first channel on an otherwise
/// tokenless device is immediately promoted.
pub fn start(
    state: &mut TimesliceState,
    tasks: &mut HashMap<Pid, SchedTask>,
    task_order: &mut [Pid],
    _pid: Pid,
    was_idle: bool,
) {
    if was_idle && state.holder.is_none() {
        update_token_holder(state, tasks, task_order);
        state.next_fire = Instant::now() + state.timeslice_t;
    }
}

/// `stop`: if the exiting task held the token, wake any
/// thread still parked on its semaphore and hand the token to whoever's
/// left, then force the periodic timer to fire on the next tick.
pub fn stop(
    state: &mut TimesliceState,
    tasks: &mut HashMap<Pid, SchedTask>,
    task_order: &mut [Pid],
    pid: Pid,
    is_last: bool,
) {
    if !is_last || state.holder != Some(pid) {
        return;
    }
    if let Some(t) = tasks.get(&pid) {
        t.sem.drain();
    }
    state.holder = None;
    state.update_pending = false;
    state.update_ts = None;
    update_token_holder(state, tasks, task_order);
    state.next_fire = Instant::now();
}

/// `submit`: the holder never blocks; everyone else parks.
pub fn submit(
    state: &mut TimesliceState,
    tasks: &mut HashMap<Pid, SchedTask>,
    _task_order: &mut [Pid],
    pid: Pid,
    channel: ChannelIndex,
) -> SubmitAction {
    if state.holder == Some(pid) && !state.update_pending {
        return SubmitAction::IssueNow;
    }
    let Some(task) = tasks.get_mut(&pid) else {
        return SubmitAction::IssueNow;
    };
    task.issue2comp.remove(&channel);
    SubmitAction::Block(task.sem.clone())
}

pub fn issue(_state: &mut TimesliceState, _tasks: &mut HashMap<Pid, SchedTask>, _pid: Pid) {}

/// `complete`: if an overuse-triggered token hand-off was
/// waiting on this task's in-flight work to drain, finish it now.
pub fn complete(
    state: &mut TimesliceState,
    tasks: &mut HashMap<Pid, SchedTask>,
    task_order: &mut [Pid],
    pid: Pid,
) {
    if !state.update_pending || state.holder != Some(pid) {
        return;
    }
    let drained = tasks.get(&pid).map(|t| t.issue2comp.is_empty()).unwrap_or(true);
    if !drained {
        return;
    }
    if let Some(update_ts) = state.update_ts.take() {
        let overuse = Instant::now().saturating_duration_since(update_ts);
        if let Some(t) = tasks.get_mut(&pid) {
            t.overuse += overuse;
        }
    }
    state.update_pending = false;
    update_token_holder(state, tasks, task_order);
    state.next_fire = Instant::now() + state.timeslice_t;
}

/// `event`: fired once per polling tick; only acts once the
/// slice's own period has actually elapsed.
pub fn event(state: &mut TimesliceState, tasks: &mut HashMap<Pid, SchedTask>, task_order: &mut [Pid]) {
    let now = Instant::now();
    if now < state.next_fire {
        return;
    }
    if let Some(holder) = state.holder {
        let still_running = tasks.get(&holder).map(|t| !t.issue2comp.is_empty()).unwrap_or(false);
        if still_running {
            state.update_pending = true;
            state.update_ts = Some(now);
            return;
        }
    }
    update_token_holder(state, tasks, task_order);
    state.next_fire = now + state.timeslice_t;
}

/// `reengage_map`: the holder's pages stay disengaged (not
/// rearmed) so it runs unintercepted; an overuse hand-off in progress
/// force-disengages the holder too, since its slice is over.
pub fn reengage(state: &TimesliceState, pid: Pid) -> bool {
    if state.update_pending && state.holder == Some(pid) {
        return true;
    }
    state.holder != Some(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SchedTask;
    use std::time::Duration;

    fn task(pid: Pid) -> (Pid, SchedTask) {
        (pid, SchedTask::new(pid))
    }

    #[test]
    fn start_promotes_first_task_and_token_is_unique() {
        let mut st = TimesliceState::new(Duration::from_millis(30));
        let mut tasks = HashMap::new();
        let (p, t) = task(1);
        tasks.insert(p, t);
        let mut order = vec![1];
        start(&mut st, &mut tasks, &mut order, 1, true);
        assert_eq!(st.holder, Some(1));
        assert!(reengage(&st, 1) == false);
        assert!(reengage(&st, 2));
    }

    #[test]
    fn round_robin_skips_overused_candidate_and_debits_it() {
        let mut st = TimesliceState::new(Duration::from_millis(10));
        let mut tasks = HashMap::new();
        tasks.insert(1, SchedTask::new(1));
        tasks.insert(2, SchedTask::new(2));
        tasks.insert(3, SchedTask::new(3));
        tasks.get_mut(&2).unwrap().overuse = Duration::from_millis(50);
        let mut order = vec![1, 2, 3];
        st.holder = Some(1);
        update_token_holder(&mut st, &mut tasks, &mut order);
        assert_eq!(st.holder, Some(3), "task 2 must be skipped while over budget");
        assert_eq!(tasks[&2].overuse, Duration::from_millis(40), "debited by one slice");
    }

    #[test]
    fn stop_hands_off_token_and_drains_exiting_semaphore() {
        let mut st = TimesliceState::new(Duration::from_millis(10));
        let mut tasks = HashMap::new();
        tasks.insert(1, SchedTask::new(1));
        tasks.insert(2, SchedTask::new(2));
        st.holder = Some(1);
        let mut order = vec![2]; // frontend already removed pid 1 before calling stop
        stop(&mut st, &mut tasks, &mut order, 1, true);
        assert_eq!(st.holder, Some(2));
    }
}
