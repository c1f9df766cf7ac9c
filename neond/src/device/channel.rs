//! Per-channel state: `Channel`, the device's hardware queue table.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::model::Pid;

/// Fields guarded by the channel's spinlock: the owning pid, the
/// currently-outstanding work's counter address/target, and the
/// liveness tick counter used for malicious-process detection.
#[derive(Debug, Default, Clone)]
pub struct ChannelState {
    pub owner: Option<Pid>,
    pub counter_addr: Option<u64>,
    pub target: u64,
    /// Elapsed polling ticks this channel has been observed stuck. Zero
    /// means "not currently being timed"; `None` tracking is expressed as 0.
    pub pdt: u64,
}

/// One GPU hardware queue slot. The live bit is kept outside the lock
/// (set on submit, cleared atomically on complete) so the
/// polling loop's bitmap scan doesn't need to take every channel's lock
/// just to know which channels are worth locking.
pub struct Channel {
    pub index: usize,
    live: AtomicBool,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub fn new(index: usize) -> Self {
        Self { index, live: AtomicBool::new(false), state: Mutex::new(ChannelState::default()) }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    /// Try to take the per-channel lock; `None` means contended — skip
    /// this tick, try again next tick.
    pub fn try_lock(&self) -> Option<parking_lot::MutexGuard<'_, ChannelState>> {
        self.state.try_lock()
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, ChannelState> {
        self.state.lock()
    }
}
