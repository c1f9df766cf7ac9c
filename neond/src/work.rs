//! WorkInference.
//!
//! From a write to a channel's index register, recovers the address of
//! the just-submitted command's completion counter and its target value,
//! by walking ring buffer → command buffer → reference counter, each hop
//! translated from GPU-view to CPU-view through the owning `Context`'s maps.

use neon_proto::{GpuFamily, RingEntryRaw};

use crate::error::{NeonError, NeonResult};
use crate::model::{Context, MapId, MapRole, Work, WorkloadKind};

/// A known ring-buffer size in entries, used to disambiguate which map in
/// a context is the ring buffer paired with a given index register
/// (`init`: "size matches a known graphics or compute ring
/// buffer size"). Each ring entry is 8 bytes (two 32-bit words).
const RING_BUFFER_SIZES_BYTES: &[usize] = &[128 * 1024, 512 * 1024];

/// Bytes examined from the command tail; same constant used to bound the
/// device parsers below ("never reads beyond the provided size").
const TRAILER_SIZE: u64 = 64;

/// `init`: resolve the device/channel from the index-register
/// map's offset, find the most recently mapped ring buffer of a known
/// size in the same context, and build a `Work`. Returns `None` (not an
/// error) if no matching ring buffer exists yet — the ioctl sequence may
/// still be in progress.
pub fn init_work(
    context: &Context,
    index_register_map: MapId,
    channel: crate::model::ChannelId,
) -> Option<Work> {
    let ring_buffer_map = context
        .maps
        .iter()
        .filter(|(_, m)| m.role == MapRole::RingBuffer && RING_BUFFER_SIZES_BYTES.contains(&m.size))
        .max_by_key(|(id, _)| *id) // "most recent" - slab ids only grow
        .map(|(id, _)| id)?;

    Some(Work {
        channel,
        index_register_map,
        ring_buffer_map,
        command_buffer_map: None,
        reference_counter_map: None,
        refc_kvaddr: None,
        refc_target: 0,
        workload_kind: WorkloadKind::Unknown,
        part_of_call: false,
    })
}

/// The `(counter_gpu_addr, counter_target)` a device-specific parser
/// extracts from a command tail, plus whether this submission is the
/// second of a three-part kernel call (Kepler graphics path only).
struct ParsedTail {
    counter_gpu_addr: u64,
    counter_target: u64,
    part_of_call: bool,
}

/// Known opcode constants the parsers recognize at fixed offsets from the
/// command tail. Any deviation is a parse error, never a guess.
mod opcodes {
    pub const TESLA_REFC_OP: u32 = 0x104310;
    pub const TESLA_REFC_OP_ALT: u32 = 0x100010;
    pub const KEPLER_REFC_OP: u32 = 0x200426c0;
    pub const KEPLER_REFC_OP_SEMA_A: u32 = 0x20018090;
    pub const KEPLER_REFC_OP_SEMA_B: u32 = 0x200180c0;
    pub const KEPLER_REFC_OP_SEMA_C: u32 = 0x200406c0;
}

fn sentinel_for(family: GpuFamily) -> NeonError {
    let sentinel = match family {
        GpuFamily::Tesla => 0x0B16_0B00_B1E5_u64,
        GpuFamily::Kepler => 0xDEAD_C0DE_u64,
    };
    NeonError::InvariantBroken { sentinel }
}

/// `command_tail` is the fixed-size window of 32-bit words ending at
/// `command_start + command_size`; never read beyond it.
fn parse_tesla(command_tail: &[u32]) -> NeonResult<ParsedTail> {
    if command_tail.len() < 4 {
        return Err(sentinel_for(GpuFamily::Tesla));
    }
    let n = command_tail.len();
    let opcode = command_tail[n - 4];
    if opcode != opcodes::TESLA_REFC_OP && opcode != opcodes::TESLA_REFC_OP_ALT {
        return Err(sentinel_for(GpuFamily::Tesla));
    }
    // A single word, not a 64-bit pair: the counter address sits at
    // opcode+2*sizeof(int), the target at opcode+3*sizeof(int).
    let counter_gpu_addr = command_tail[n - 2] as u64;
    let counter_target = command_tail[n - 1] as u64;
    Ok(ParsedTail { counter_gpu_addr, counter_target, part_of_call: false })
}

/// The word immediately preceding a 4-word-tier opcode, checked against the
/// "second of three" kernel-call invariant. Gated behind a Cargo feature;
/// absence is a no-op, not an error.
fn is_part_of_call(command_tail: &[u32], opcode_idx: usize) -> bool {
    #[cfg(feature = "neon_kernel_call_counting")]
    {
        opcode_idx > 0 && command_tail[opcode_idx - 1] == 3
    }
    #[cfg(not(feature = "neon_kernel_call_counting"))]
    {
        let _ = (command_tail, opcode_idx);
        false
    }
}

/// Three opcode-dependent tiers, each read relative to the end of the
/// command tail:
///
/// - `KEPLER_REFC_OP` (compute) and `KEPLER_REFC_OP_SEMA_C` (graphics): a
///   4-word tier, opcode followed directly by top/bottom/target.
/// - `KEPLER_REFC_OP_SEMA_A`: a 7-word tier with gapped reads at
///   opcode+1/+3/+5.
/// - `KEPLER_REFC_OP_SEMA_B`: a 13-word tier with the same gapped pattern,
///   further back in the tail.
///
/// Any opcode not matching one of these at its expected offset is a parse
/// failure; we never fall back to guessing a different tier.
fn parse_kepler(command_tail: &[u32]) -> NeonResult<ParsedTail> {
    let n = command_tail.len();

    if n >= 4 {
        let idx = n - 4;
        let opcode = command_tail[idx];
        if opcode == opcodes::KEPLER_REFC_OP || opcode == opcodes::KEPLER_REFC_OP_SEMA_C {
            let top = command_tail[idx + 1] as u64;
            let bottom = command_tail[idx + 2] as u64;
            let target = command_tail[idx + 3] as u64;
            return Ok(ParsedTail {
                counter_gpu_addr: bottom | (top << 32),
                counter_target: target,
                part_of_call: is_part_of_call(command_tail, idx),
            });
        }
    }

    if n >= 7 {
        let idx = n - 7;
        if command_tail[idx] == opcodes::KEPLER_REFC_OP_SEMA_A {
            let top = command_tail[idx + 1] as u64;
            let bottom = command_tail[idx + 3] as u64;
            let target = command_tail[idx + 5] as u64;
            return Ok(ParsedTail {
                counter_gpu_addr: bottom | (top << 32),
                counter_target: target,
                part_of_call: false,
            });
        }
    }

    if n >= 13 {
        let idx = n - 13;
        if command_tail[idx] == opcodes::KEPLER_REFC_OP_SEMA_B {
            let top = command_tail[idx + 1] as u64;
            let bottom = command_tail[idx + 3] as u64;
            let target = command_tail[idx + 5] as u64;
            return Ok(ParsedTail {
                counter_gpu_addr: bottom | (top << 32),
                counter_target: target,
                part_of_call: false,
            });
        }
    }

    Err(sentinel_for(GpuFamily::Kepler))
}

fn parse_command_tail(family: GpuFamily, command_tail: &[u32]) -> NeonResult<ParsedTail> {
    match family {
        GpuFamily::Tesla => parse_tesla(command_tail),
        GpuFamily::Kepler => parse_kepler(command_tail),
    }
}

/// `update`, steps 1-7. `new_index_value` is the value just
/// written to the channel's index register. `ring_last_entry` implements
/// "the last entry" for a value of zero (ring size / 2 words - 1).
/// `read_ring_entry` reads the raw two-word ring-buffer slot at entry
/// `idx`. `read_command_tail` returns up to `TRAILER_SIZE` bytes (as
/// `u32`s) ending at `command_start + command_size` in CPU-view, given
/// the command-buffer map it resolved against. `resolve_cpu_map` finds
/// (and caches) the map in `context` covering a GPU-view address, of a
/// given role, returning its `MapId` and gpu->cpu translation.
pub struct UpdateInputs<'a> {
    pub context: &'a Context,
    pub family: GpuFamily,
    pub ring_last_entry: u64,
    pub read_ring_entry: &'a dyn Fn(u64) -> RingEntryRaw,
    pub read_command_tail: &'a dyn Fn(u64, u64) -> Vec<u32>,
}

pub fn update(work: &mut Work, new_index_value: u64, inputs: &UpdateInputs) -> NeonResult<()> {
    let idx = if new_index_value == 0 { inputs.ring_last_entry } else { new_index_value - 1 };
    let entry = (inputs.read_ring_entry)(idx);
    let (command_gpu_addr, command_size) = entry.decode();

    // Step 3-4: resolve the command buffer map covering this GPU address.
    let cb_map_id = work
        .command_buffer_map
        .filter(|id| inputs.context.maps.get(*id).is_some_and(|m| m.covers_gpu_addr(command_gpu_addr)))
        .or_else(|| inputs.context.find_map_covering(command_gpu_addr))
        .ok_or(NeonError::UnexpectedState("no map covers command buffer address".into()))?;
    work.command_buffer_map = Some(cb_map_id);
    let cb_map = inputs.context.maps.get(cb_map_id).expect("looked up above");

    let command_start_cpu = cb_map.gpu_to_cpu(command_gpu_addr);
    let command_tail_start = command_start_cpu + command_size.saturating_sub(TRAILER_SIZE);
    let tail = (inputs.read_command_tail)(command_tail_start, TRAILER_SIZE);

    let parsed = parse_command_tail(inputs.family, &tail)?;

    // Step 6: resolve the counter's containing map the same way.
    let refc_map_id = work
        .reference_counter_map
        .filter(|id| inputs.context.maps.get(*id).is_some_and(|m| m.covers_gpu_addr(parsed.counter_gpu_addr)))
        .or_else(|| inputs.context.find_map_covering(parsed.counter_gpu_addr))
        .ok_or(NeonError::UnexpectedState("no map covers reference counter address".into()))?;
    work.reference_counter_map = Some(refc_map_id);
    let refc_map = inputs.context.maps.get(refc_map_id).expect("looked up above");

    work.refc_kvaddr = Some(refc_map.gpu_to_cpu(parsed.counter_gpu_addr));
    work.refc_target = parsed.counter_target;
    work.part_of_call = parsed.part_of_call;
    work.workload_kind = match inputs.family {
        GpuFamily::Tesla => WorkloadKind::Graphics,
        GpuFamily::Kepler => WorkloadKind::Compute,
    };
    Ok(())
}

/// `fini`: a work may only be torn down with no outstanding
/// target.
pub fn fini(work: &Work) -> NeonResult<()> {
    work.check_fini()
}
