//! Core data model.
//!
//! Per the design notes on avoiding intrusive lists, lists here are arenas indexed by
//! small integer ids rather than intrusive linked structures, and the
//! reverse pointers a `Work` needs (into its owning `Context`'s maps) are
//! id-based lookups rather than raw references — a map can be torn down
//! out from under a `Work` and the work simply finds its reference stale
//! instead of dereferencing freed memory.

use std::collections::{HashMap, VecDeque};

pub type Pid = i32;

/// Opaque key handed to us by the shimmed ioctl surface identifying a
/// logical GPU context. We don't interpret it, only use it as a map key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContextKey(pub u64);

/// Index of a device in the global device table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIndex(pub usize);

/// Index of a channel within one device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelIndex(pub usize);

/// `(device, channel)` pair identifying one hardware queue slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub device: DeviceIndex,
    pub channel: ChannelIndex,
}

/// A small slab allocator: stable integer ids, O(1) insert/remove, no
/// shifting on removal. An arena per entity kind so iteration becomes a
/// bitmap/index scan instead of walking an intrusive list.
#[derive(Debug, Default)]
pub struct Slab<T> {
    items: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Slab<T> {
    pub fn new() -> Self {
        Self { items: Vec::new(), free: Vec::new() }
    }

    pub fn insert(&mut self, value: T) -> u32 {
        if let Some(id) = self.free.pop() {
            self.items[id as usize] = Some(value);
            id
        } else {
            self.items.push(Some(value));
            (self.items.len() - 1) as u32
        }
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        let slot = self.items.get_mut(id as usize)?;
        let value = slot.take();
        if value.is_some() {
            self.free.push(id);
        }
        value
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.items.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.items.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i as u32, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.items
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|v| (i as u32, v)))
    }

    pub fn len(&self) -> usize {
        self.items.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type MapId = u32;
pub type WorkId = u32;

/// What kind of region a `Map` backs, used to decide whether writes to it
/// should be tracked as submit events at all.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MapRole {
    IndexRegister,
    RingBuffer,
    CommandBuffer,
    ReferenceCounter,
    Other,
}

/// The kind of GPU workload a `Work` represents, set once WorkInference
/// decodes the command tail.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    Graphics,
    Compute,
    Unknown,
}

/// Per-page tracking state: whether the present bit is
/// currently cleared, and its saved prior value so disarm can restore it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PageTrackState {
    pub armed: bool,
    pub saved_present: bool,
}

/// CPU access kind decoded at the faulting instruction (`PagedFault`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessOp {
    Read,
    Write(u64),
    Unknown,
}

/// One pending fault→trap record (`PagedFault`). A map holds at
/// most one of these at a time.
#[derive(Clone, Debug)]
pub struct FaultRecord {
    pub page_num: usize,
    pub op: AccessOp,
    pub faulting_ip: u64,
    pub addr: u64,
    pub saved_flags: u64,
    /// A second page disarmed due to a cross-page-boundary double fault,
    /// rearmed once this record's trap is handled (step 4).
    pub siamese_page: Option<usize>,
}

/// A pinned or mmapped virtual memory region (`Map`).
pub struct Map {
    pub role: MapRole,
    pub device: DeviceIndex,
    /// Size in bytes; the page array below has `ceil(size / PAGE_SIZE)` entries.
    pub size: usize,
    /// Offset used to identify the map against a device's channel-register range.
    pub offset: u64,
    /// CPU-visible base address of the mapping.
    pub cpu_addr: u64,
    /// GPU-view base address, filled in on the ioctl's "post" call.
    pub gpu_view: u64,
    /// Whether this map backs pinned user pages rather than a kernel mmap.
    pub pinned: bool,
    /// Per-page armed/disarmed bookkeeping, pre-allocated at `track_init`
    /// (the fault handler runs in interrupt context and must not allocate).
    pub pages: Vec<PageTrackState>,
    /// At most one live fault record for this map (invariant).
    pub pending_fault: Option<FaultRecord>,
}

impl Map {
    pub fn covers_gpu_addr(&self, addr: u64) -> bool {
        addr >= self.gpu_view && addr < self.gpu_view + self.size as u64
    }

    pub fn covers_cpu_addr(&self, addr: u64) -> bool {
        addr >= self.cpu_addr && addr < self.cpu_addr + self.size as u64
    }

    pub fn gpu_to_cpu(&self, gpu_addr: u64) -> u64 {
        self.cpu_addr + (gpu_addr - self.gpu_view)
    }

    pub fn num_pages(&self, page_size: usize) -> usize {
        self.size.div_ceil(page_size)
    }
}

/// The scheduler's representation of one (channel, register-trio) ensemble
/// for one task (`Work`, GLOSSARY).
pub struct Work {
    pub channel: ChannelId,
    pub index_register_map: MapId,
    pub ring_buffer_map: MapId,
    pub command_buffer_map: Option<MapId>,
    pub reference_counter_map: Option<MapId>,
    /// Kernel-mapped address of the reference counter, once resolved.
    pub refc_kvaddr: Option<u64>,
    pub refc_target: u64,
    pub workload_kind: WorkloadKind,
    /// True when this submission is the second of a three-part kernel call
    /// (Kepler graphics path only); see `neon_kernel_call_counting`.
    pub part_of_call: bool,
}

impl Work {
    /// `fini`: a work may only be torn down with no
    /// outstanding target.
    pub fn check_fini(&self) -> Result<(), crate::error::NeonError> {
        if self.refc_target != 0 {
            return Err(crate::error::NeonError::LeakAtFini(format!(
                "work on {:?} torn down with outstanding target {}",
                self.channel, self.refc_target
            )));
        }
        Ok(())
    }
}

/// A GPU logical context (`Context`).
pub struct Context {
    pub key: ContextKey,
    pub maps: Slab<Map>,
    pub works: Slab<Work>,
    /// FIFO of maps with a live pending-fault record, consumed by the trap
    /// handler in order (trap protocol step 1).
    pub fault_queue: VecDeque<MapId>,
}

impl Context {
    pub fn new(key: ContextKey) -> Self {
        Self { key, maps: Slab::new(), works: Slab::new(), fault_queue: VecDeque::new() }
    }

    pub fn find_map_covering(&self, gpu_addr: u64) -> Option<MapId> {
        self.maps.iter().find(|(_, m)| m.covers_gpu_addr(gpu_addr)).map(|(id, _)| id)
    }

    pub fn find_map_by_offset(&self, offset: u64) -> Option<MapId> {
        self.maps.iter().find(|(_, m)| m.offset == offset).map(|(id, _)| id)
    }

    pub fn find_map_covering_cpu(&self, addr: u64) -> Option<MapId> {
        self.maps.iter().find(|(_, m)| m.covers_cpu_addr(addr)).map(|(id, _)| id)
    }

    /// Find the live work whose index-register, ring-buffer, command-buffer
    /// or reference-counter map is `map_id` ("destroy any Works
    /// referencing it").
    pub fn find_work_referencing(&self, map_id: MapId) -> Vec<WorkId> {
        self.works
            .iter()
            .filter(|(_, w)| {
                w.index_register_map == map_id
                    || w.ring_buffer_map == map_id
                    || w.command_buffer_map == Some(map_id)
                    || w.reference_counter_map == Some(map_id)
            })
            .map(|(id, _)| id)
            .collect()
    }
}

/// A process as seen by the scheduler (`Task`).
pub struct Task {
    pub pid: Pid,
    pub contexts: HashMap<ContextKey, Context>,
    /// Number of thread views currently pointing at this task
    /// (`copy_task` increments, `exit_task` decrements).
    pub sharers: u32,
    /// Gate preventing a double SIGKILL delivery.
    pub malicious: bool,
}

impl Task {
    pub fn new(pid: Pid) -> Self {
        Self { pid, contexts: HashMap::new(), sharers: 1, malicious: false }
    }

    pub fn nctx(&self) -> usize {
        self.contexts.len()
    }
}
