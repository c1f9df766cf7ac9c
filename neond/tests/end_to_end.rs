//! End-to-end scenarios driving `NeonCore`/`DeviceScheduler` against
//! in-memory fakes of the kernel-only traits, one per scenario.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use neon_proto::PolicyKind;
use neond::device::{Device, Global};
use neond::knobs::Knobs;
use neond::model::{AccessOp, ChannelIndex, ContextKey, DeviceIndex, MapRole};
use neond::polling::{self, CounterReader, ProcessKiller};
use neond::shim::NeonCore;
use neond::track::PageTable;

fn global_with_policy(policy: PolicyKind, timeslice_t_ms: u64, sampling_t_ms: u64, sampling_x: u32) -> Global {
    let mut g = Global::new();
    let def = &neon_proto::SUPPORTED_DEVICES[0];
    g.add_device(Device::from_supported(
        def,
        0,
        0,
        policy,
        Duration::from_millis(timeslice_t_ms),
        Duration::from_millis(sampling_t_ms),
        sampling_x,
    ));
    g
}

struct NoopPt;
impl PageTable for NoopPt {
    fn clear_present(&self, _addr: u64) -> bool {
        true
    }
    fn set_present(&self, _addr: u64, _prev: bool) {}
    fn decode_access(&self, _ip: u64, _addr: u64) -> AccessOp {
        AccessOp::Unknown
    }
}

/// Tracks present bits and lets a test script a single decoded access.
struct FakePageTable {
    present: RefCell<HashMap<u64, bool>>,
    next_decode: RefCell<AccessOp>,
}

impl FakePageTable {
    fn new() -> Self {
        Self { present: RefCell::new(HashMap::new()), next_decode: RefCell::new(AccessOp::Unknown) }
    }
}

impl PageTable for FakePageTable {
    fn clear_present(&self, addr: u64) -> bool {
        self.present.borrow_mut().insert(addr, false).unwrap_or(true)
    }
    fn set_present(&self, addr: u64, prev: bool) {
        self.present.borrow_mut().insert(addr, prev);
    }
    fn decode_access(&self, _ip: u64, _addr: u64) -> AccessOp {
        *self.next_decode.borrow()
    }
}

struct FixedCounter(u64);
impl CounterReader for FixedCounter {
    fn read_counter(&self, _kvaddr: u64) -> u64 {
        self.0
    }
}

struct RecordingKiller(RefCell<Vec<i32>>);
impl ProcessKiller for RecordingKiller {
    fn kill_group(&self, pid: i32) {
        self.0.borrow_mut().push(pid);
    }
}

/// Scenario: single task, FCFS. Every submit issues immediately and the
/// pipeline drains without ever parking the caller.
#[test]
fn single_task_fcfs_never_blocks() {
    let core = NeonCore::new(global_with_policy(PolicyKind::Fcfs, 30, 5, 5), Knobs::default());
    let dev = &core.global.devices[0];
    dev.scheduler.start(ChannelIndex(0), 1);

    for _ in 0..5 {
        core.submit_channel(DeviceIndex(0), neond::model::ChannelId { device: DeviceIndex(0), channel: ChannelIndex(0) }, 1, false);
        dev.scheduler.complete(ChannelIndex(0), 1);
    }

    let snap = core.metrics.snapshot();
    assert_eq!(snap.submit_total, 5);
    assert_eq!(snap.issue_total, 5);
}

/// Scenario: two tasks under the timeslice policy. The second task's
/// submission parks until the first yields the token.
#[test]
fn two_tasks_timeslice_hands_off_the_token() {
    let core = NeonCore::new(global_with_policy(PolicyKind::Timeslice, 30, 5, 5), Knobs::default());
    let dev = &core.global.devices[0];
    dev.scheduler.start(ChannelIndex(0), 1);
    assert_eq!(dev.scheduler.holder(), Some(1), "first task to start is promoted");

    dev.scheduler.start(ChannelIndex(1), 2);
    assert_eq!(dev.scheduler.holder(), Some(1), "token stays with the incumbent");

    use neond::policy::SubmitAction;
    match dev.scheduler.submit(ChannelIndex(0), 1, false) {
        SubmitAction::IssueNow => {}
        SubmitAction::Block(_) => panic!("holder must never block"),
    }
    dev.scheduler.issue(ChannelIndex(0), 1, false);

    match dev.scheduler.submit(ChannelIndex(1), 2, false) {
        SubmitAction::Block(_) => {}
        SubmitAction::IssueNow => panic!("non-holder must park"),
    }

    dev.scheduler.complete(ChannelIndex(0), 1);
    std::thread::sleep(Duration::from_millis(40));
    dev.scheduler.event();
    assert_eq!(dev.scheduler.holder(), Some(2), "slice elapsed and pid 1 is idle, so the token rotates");
}

/// Scenario: a holder that overruns its slice is skipped on its next turn
/// and debited, rather than taking the token back immediately.
#[test]
fn overuse_penalty_skips_the_offender_on_its_next_turn() {
    let core = NeonCore::new(global_with_policy(PolicyKind::Timeslice, 5, 5, 5), Knobs::default());
    let dev = &core.global.devices[0];

    dev.scheduler.start(ChannelIndex(0), 1); // promoted holder
    dev.scheduler.start(ChannelIndex(1), 2);
    dev.scheduler.start(ChannelIndex(2), 3);

    dev.scheduler.submit(ChannelIndex(0), 1, false);
    dev.scheduler.issue(ChannelIndex(0), 1, false); // pid 1 holds the channel open

    // Let the slice badly overrun while pid 1 is still mid-flight.
    std::thread::sleep(Duration::from_millis(20));
    dev.scheduler.event(); // still running: marks the pending hand-off
    std::thread::sleep(Duration::from_millis(20));
    dev.scheduler.complete(ChannelIndex(0), 1); // finishes the hand-off, debits the overuse
    assert_eq!(dev.scheduler.holder(), Some(2), "token moves past the offender to the next task");

    dev.scheduler.submit(ChannelIndex(1), 2, false);
    dev.scheduler.issue(ChannelIndex(1), 2, false);
    dev.scheduler.complete(ChannelIndex(1), 2);
    std::thread::sleep(Duration::from_millis(20));
    dev.scheduler.event();
    assert_eq!(dev.scheduler.holder(), Some(3));

    dev.scheduler.submit(ChannelIndex(2), 3, false);
    dev.scheduler.issue(ChannelIndex(2), 3, false);
    dev.scheduler.complete(ChannelIndex(2), 3);
    std::thread::sleep(Duration::from_millis(20));
    dev.scheduler.event();
    assert_eq!(
        dev.scheduler.holder(),
        Some(2),
        "pid 1 is still in debt and gets skipped; the token passes through to pid 2"
    );
}

/// Scenario: sampling with two equal-weight tasks takes each in turn, then
/// opens into freerun.
#[test]
fn sampling_with_two_equal_weight_tasks_tours_then_freeruns() {
    let core = NeonCore::new(global_with_policy(PolicyKind::Sampling, 30, 5, 2), Knobs::default());
    let dev = &core.global.devices[0];

    dev.scheduler.start(ChannelIndex(0), 1);
    dev.scheduler.start(ChannelIndex(1), 2);

    use neond::policy::SubmitAction;
    match dev.scheduler.submit(ChannelIndex(0), 1, false) {
        SubmitAction::IssueNow => {}
        SubmitAction::Block(_) => panic!("first submitter with nothing in flight enters sampling directly"),
    }
    assert_eq!(dev.scheduler.season(), Some("sampling"));
    dev.scheduler.issue(ChannelIndex(0), 1, false);

    match dev.scheduler.submit(ChannelIndex(1), 2, false) {
        SubmitAction::Block(_) => {}
        SubmitAction::IssueNow => panic!("pid 2 is not this turn's sampled task"),
    }

    dev.scheduler.complete(ChannelIndex(0), 1);
    std::thread::sleep(Duration::from_millis(10));
    dev.scheduler.event(); // pid 1's turn elapsed and it's idle: tour advances
    assert_eq!(dev.scheduler.season(), Some("sampling"));

    match dev.scheduler.submit(ChannelIndex(1), 2, false) {
        SubmitAction::IssueNow => {}
        SubmitAction::Block(_) => panic!("pid 2's turn has started"),
    }
    dev.scheduler.issue(ChannelIndex(1), 2, false);
    dev.scheduler.complete(ChannelIndex(1), 2);
    std::thread::sleep(Duration::from_millis(10));
    dev.scheduler.event(); // both tasks toured: opens freerun
    assert_eq!(dev.scheduler.season(), Some("freerun"));

    // freerun runs for sampling_x * (the sampling season's total duration),
    // which was itself set by the two 10ms sleeps above; sleep well past
    // that so the epoch is guaranteed to finish on this one event() call.
    std::thread::sleep(Duration::from_millis(150));
    dev.scheduler.event(); // freerun window elapsed: epoch finishes, re-barriers
    assert_eq!(dev.scheduler.season(), Some("barrier"));
    assert!(dev.scheduler.device_vtime_ms().is_some());
}

/// Scenario: a single index-register write faults, is decoded, and the
/// matching trap rearms the page.
#[test]
fn fault_then_trap_round_trip_rearms_the_page() {
    let core = NeonCore::new(global_with_policy(PolicyKind::Fcfs, 30, 5, 5), Knobs::default());
    core.open_context(1, ContextKey(1));

    let dev = &core.global.devices[0];
    let offset = dev.register_base; // channel 0's index register
    let map_id = core.pre_map(1, ContextKey(1), DeviceIndex(0), MapRole::IndexRegister).unwrap();
    let cpu_addr = 0x4000_0000u64;
    core.post_map(1, ContextKey(1), map_id, offset, 0, neond::track::PAGE_SIZE, cpu_addr);

    let pt = FakePageTable::new();
    assert_eq!(core.pin_pages(1, ContextKey(1), map_id, 0, &pt), 0);

    *pt.next_decode.borrow_mut() = AccessOp::Write(42);
    assert_eq!(core.fault_handler(1, ContextKey(1), cpu_addr, 0x1000, &pt), 0, "handled, not a miss");

    // Between fault and trap the page must be present so the single-step
    // retry doesn't re-fault.
    assert_eq!(pt.present.borrow()[&cpu_addr], true, "page present during the single-step retry");

    let trap = core.trap_handler(1, ContextKey(1), &pt);
    assert_eq!(trap, neond::track::TrapOutcome::Handled);
    assert_eq!(pt.present.borrow()[&cpu_addr], false, "page re-armed (present cleared again) to track the next access");
}

/// Scenario: clean exit under load. A task exits mid-flight; its maps and
/// works tear down without leaking or panicking, and the device goes back
/// to idle.
#[test]
fn clean_exit_under_load_tears_down_without_leaking() {
    let core = NeonCore::new(global_with_policy(PolicyKind::Fcfs, 30, 5, 5), Knobs::default());
    core.open_context(7, ContextKey(1));
    let dev = &core.global.devices[0];
    dev.scheduler.start(ChannelIndex(0), 7);

    let map_id = core.pre_map(7, ContextKey(1), DeviceIndex(0), MapRole::IndexRegister).unwrap();
    let offset = dev.register_base;
    core.post_map(7, ContextKey(1), map_id, offset, 0, neond::track::PAGE_SIZE, 0x5000_0000);
    let pt = NoopPt;
    core.pin_pages(7, ContextKey(1), map_id, 0, &pt);

    core.submit_channel(DeviceIndex(0), neond::model::ChannelId { device: DeviceIndex(0), channel: ChannelIndex(0) }, 7, false);
    // pid 7 exits with its submission still outstanding (no matching complete).
    core.exit_task(7, &pt);

    assert_eq!(core.registry.task_count(), 0, "task torn down on exit");
    assert_eq!(core.registry.ctx_live(), 0, "the only context closed, so ctx_live returns to zero");

    // A fresh task can now open a context and get promoted without any
    // state left over from the dead one.
    dev.scheduler.stop(ChannelIndex(0), 7); // mirrors the registry's real teardown path for a Work's channel
    assert_eq!(dev.scheduler.task_count(), 0, "scheduler state torn down alongside the registry");
}

/// Scenario: the polling worker kills a stuck channel's owner exactly once
/// and the surrounding channels get a second chance.
#[test]
fn malicious_channel_is_killed_once_via_the_polling_worker() {
    let core = NeonCore::new(global_with_policy(PolicyKind::Fcfs, 30, 5, 5), Knobs::default());
    core.open_context(9, ContextKey(1));
    let dev = &core.global.devices[0];
    dev.scheduler.start(ChannelIndex(0), 9);
    polling::channel_submitted(&core.global, DeviceIndex(0), ChannelIndex(0), 9, 0xbeef, 100);
    dev.scheduler.submit(ChannelIndex(0), 9, false);
    dev.scheduler.issue(ChannelIndex(0), 9, false);

    let counters = FixedCounter(0); // never reaches target
    let killer = RecordingKiller(RefCell::new(Vec::new()));
    for _ in 0..5 {
        polling::tick(&core.global, &core.registry, 2, &counters, &killer, &core.metrics);
    }
    assert_eq!(killer.0.borrow().as_slice(), &[9]);
    polling::tick(&core.global, &core.registry, 2, &counters, &killer, &core.metrics);
    assert_eq!(killer.0.borrow().len(), 1, "second offense does not double-kill");
}
