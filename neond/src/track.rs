//! Page-fault based access tracking.
//!
//! Turns CPU accesses to selected pages of a map into page faults by
//! clearing the present bit, and rearms by restoring it after a
//! single-step. The actual PTE write and TLB shootout are architecture
//! primitives we don't have in userspace; they're modeled behind
//! [`PageTable`] so the arm/disarm/fault/trap state machine can be built
//! and tested without a running kernel.

use crate::error::{NeonError, NeonResult};
use crate::model::{AccessOp, FaultRecord, Map, PageTrackState};

pub const PAGE_SIZE: usize = 4096;

/// Architecture-level page table access. One real implementation would
/// wrap `set_pte`/`flush_tlb_one`; tests use an in-memory fake.
pub trait PageTable {
    /// Clear the present bit for `page_addr`, returning the bit's prior
    /// value, and flush that single TLB entry.
    fn clear_present(&self, page_addr: u64) -> bool;
    /// Restore the present bit to `prev` and flush that TLB entry.
    fn set_present(&self, page_addr: u64, prev: bool);
    /// Decode the instruction at `ip` touching `addr` into its access kind.
    /// A real implementation disassembles the faulting instruction; tests
    /// inject a fixed decode.
    fn decode_access(&self, ip: u64, addr: u64) -> AccessOp;
}

/// Allocate the per-page tracker array and clear the fault slot. No
/// hardware effect (`init`).
pub fn init(map: &mut Map) {
    let n = map.num_pages(PAGE_SIZE);
    map.pages = vec![PageTrackState::default(); n];
    map.pending_fault = None;
}

fn page_addr(map: &Map, page: usize) -> u64 {
    map.cpu_addr + (page * PAGE_SIZE) as u64
}

/// Arm a single page: atomically clear the present bit, saving its prior
/// value. Idempotent on an already-armed page ("warn, no change").
pub fn arm<PT: PageTable>(map: &mut Map, page: usize, pt: &PT) {
    let addr = page_addr(map, page);
    let Some(state) = map.pages.get_mut(page) else { return };
    if state.armed {
        log::warn!("track: page {page} of map at {addr:#x} armed twice, ignoring");
        return;
    }
    let prior = pt.clear_present(addr);
    state.saved_present = prior;
    state.armed = true;
}

/// Disarm a single page: restore the saved present bit. Idempotent on an
/// already-disarmed page.
pub fn disarm<PT: PageTable>(map: &mut Map, page: usize, pt: &PT) {
    let addr = page_addr(map, page);
    let Some(state) = map.pages.get_mut(page) else { return };
    if !state.armed {
        log::warn!("track: page {page} of map at {addr:#x} disarmed twice, ignoring");
        return;
    }
    pt.set_present(addr, state.saved_present);
    state.armed = false;
}

/// Resolve and arm every page of the map (`start`).
pub fn start<PT: PageTable>(map: &mut Map, pt: &PT) {
    for page in 0..map.pages.len() {
        arm(map, page, pt);
    }
}

/// Arm or disarm every page in bulk (`restart`).
pub fn restart<PT: PageTable>(map: &mut Map, pt: &PT, arm_flag: bool) {
    for page in 0..map.pages.len() {
        if arm_flag {
            arm(map, page, pt);
        } else {
            disarm(map, page, pt);
        }
    }
}

/// Disarm every page; if a fault record is still live, report (it means a
/// fault was left unconsumed across teardown) and clear it (`stop`).
pub fn stop<PT: PageTable>(map: &mut Map, pt: &PT) {
    for page in 0..map.pages.len() {
        disarm(map, page, pt);
    }
    if let Some(rec) = map.pending_fault.take() {
        log::warn!(
            "track: map stopped with an outstanding fault record at {:#x} (page {})",
            rec.addr, rec.page_num
        );
    }
}

/// Free per-page array and fault record (`fini`).
pub fn fini(map: &mut Map) {
    map.pages.clear();
    map.pending_fault = None;
}

/// Outcome of the fault hook, `fault_handler` contract.
#[derive(Debug)]
pub enum FaultOutcome {
    /// Not a NEON-tracked address; caller should fall through to the
    /// kernel's default fault handler.
    NotOurs,
    /// Handled; the instruction should be retried after single-step.
    /// Carries the decoded write value when the access was a write to an
    /// index register, for the caller to hand to `WorkInference::update`.
    Handled { index_write: Option<u64> },
}

/// Steps 3-7 of the fault protocol, operating on one map
/// already identified as covering the faulting address (steps 1-2 are the
/// caller's job: walking contexts/maps via the current task, which needs
/// the registry). `is_index_register` tells us whether this map's offset
/// hashes into a device's channel-register range (step 6).
pub fn handle_fault<PT: PageTable>(
    map: &mut Map,
    page: usize,
    fault_ip: u64,
    fault_addr: u64,
    is_index_register: bool,
    pt: &PT,
) -> NeonResult<FaultOutcome> {
    if let Some(existing) = &map.pending_fault {
        if existing.addr == fault_addr {
            // Step 3: a second fault at the same address before the trap
            // fired means the original access was itself faulty.
            return Err(NeonError::UnexpectedState(format!(
                "re-fault at already-pending address {fault_addr:#x}"
            )));
        }
        // Step 4: cross-page-boundary double fault. Disarm the current
        // page and remember it as the "siamese" page to rearm once the
        // original fault's trap fires.
        disarm(map, page, pt);
        if let Some(rec) = &mut map.pending_fault {
            rec.siamese_page = Some(page);
        }
        return Ok(FaultOutcome::Handled { index_write: None });
    }

    // Step 5: decode the access and stash a fault record.
    let op = pt.decode_access(fault_ip, fault_addr);
    map.pending_fault = Some(FaultRecord {
        page_num: page,
        op,
        faulting_ip: fault_ip,
        addr: fault_addr,
        saved_flags: 0,
        siamese_page: None,
    });

    // Step 7: disarm the target page so the instruction can retry under
    // single-step. The stepping/interrupt-flag manipulation is pure CPU
    // register state the real handler owns; out of scope here.
    disarm(map, page, pt);

    let index_write = match op {
        AccessOp::Write(value) if is_index_register => Some(value),
        _ => None,
    };
    Ok(FaultOutcome::Handled { index_write })
}

/// Outcome of the single-step trap hook (trap handler).
#[derive(Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    NotOurs,
    Handled,
}

/// Consume the map's pending fault record and rearm (trap
/// handler steps 2-4). `should_rearm` lets the policy veto rearming an
/// index-register write (e.g. the timeslice policy disengaging a
/// non-holder); any non-index-register write is always rearmed.
pub fn handle_trap<PT: PageTable>(map: &mut Map, should_rearm: bool, pt: &PT) -> TrapOutcome {
    let Some(rec) = map.pending_fault.take() else {
        return TrapOutcome::NotOurs;
    };
    if should_rearm {
        arm(map, rec.page_num, pt);
    }
    if let Some(siamese) = rec.siamese_page {
        arm(map, siamese, pt);
    }
    TrapOutcome::Handled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceIndex, MapRole};
    use std::cell::RefCell;
    use std::collections::HashMap;

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

    fn test_map() -> Map {
        Map {
            role: MapRole::IndexRegister,
            device: DeviceIndex(0),
            size: PAGE_SIZE * 2,
            offset: 0x8c,
            cpu_addr: 0x1000_0000,
            gpu_view: 0,
            pinned: false,
            pages: Vec::new(),
            pending_fault: None,
        }
    }

    #[test]
    fn arm_then_disarm_restores_original_present_bit() {
        let mut map = test_map();
        init(&mut map);
        let pt = FakePageTable::new();
        pt.present.borrow_mut().insert(map.cpu_addr, true);

        arm(&mut map, 0, &pt);
        assert!(map.pages[0].armed);
        assert_eq!(pt.present.borrow()[&map.cpu_addr], false);

        disarm(&mut map, 0, &pt);
        assert!(!map.pages[0].armed);
        assert_eq!(pt.present.borrow()[&map.cpu_addr], true);
    }

    #[test]
    fn double_arm_is_idempotent() {
        let mut map = test_map();
        init(&mut map);
        let pt = FakePageTable::new();
        arm(&mut map, 0, &pt);
        let saved = map.pages[0].saved_present;
        arm(&mut map, 0, &pt); // no-op, warns
        assert_eq!(map.pages[0].saved_present, saved);
    }

    #[test]
    fn fault_then_trap_round_trip_ends_armed() {
        let mut map = test_map();
        init(&mut map);
        let pt = FakePageTable::new();
        start(&mut map, &pt);
        assert!(map.pages[0].armed);

        *pt.next_decode.borrow_mut() = AccessOp::Write(5);
        let outcome = handle_fault(&mut map, 0, 0x4000, map.cpu_addr, true, &pt).unwrap();
        match outcome {
            FaultOutcome::Handled { index_write } => assert_eq!(index_write, Some(5)),
            _ => panic!("expected Handled"),
        }
        assert!(!map.pages[0].armed, "page must be disarmed so the retry can proceed");
        assert!(map.pending_fault.is_some());

        let trap = handle_trap(&mut map, true, &pt);
        assert_eq!(trap, TrapOutcome::Handled);
        assert!(map.pages[0].armed, "page rearmed after trap");
        assert!(map.pending_fault.is_none());
    }

    #[test]
    fn re_fault_at_pending_address_is_fatal() {
        let mut map = test_map();
        init(&mut map);
        let pt = FakePageTable::new();
        handle_fault(&mut map, 0, 0x4000, map.cpu_addr, false, &pt).unwrap();
        let second = handle_fault(&mut map, 0, 0x4000, map.cpu_addr, false, &pt);
        assert!(second.is_err());
    }

    #[test]
    fn cross_page_double_fault_marks_siamese_and_rearms_both() {
        let mut map = test_map();
        init(&mut map);
        let pt = FakePageTable::new();
        start(&mut map, &pt);
        handle_fault(&mut map, 0, 0x4000, map.cpu_addr, false, &pt).unwrap();
        // A fault on page 1 arrives before the page-0 trap fires.
        let outcome = handle_fault(&mut map, 1, 0x4100, page_addr(&map, 1), false, &pt).unwrap();
        assert!(matches!(outcome, FaultOutcome::Handled { index_write: None }));
        assert!(!map.pages[1].armed);
        assert_eq!(map.pending_fault.as_ref().unwrap().siamese_page, Some(1));

        handle_trap(&mut map, true, &pt);
        assert!(map.pages[0].armed);
        assert!(map.pages[1].armed, "siamese page rearmed alongside the original");
    }

    #[test]
    fn veto_rearm_leaves_page_disarmed() {
        let mut map = test_map();
        init(&mut map);
        let pt = FakePageTable::new();
        start(&mut map, &pt);
        handle_fault(&mut map, 0, 0x4000, map.cpu_addr, true, &pt).unwrap();
        handle_trap(&mut map, false, &pt);
        assert!(!map.pages[0].armed, "policy vetoed rearm (e.g. current token holder)");
    }
}
