//! Cross-process half of the knob surface.
//!
//! The knob channel is nominally an external collaborator:
//! in the original module it was a sysctl tree any process with
//! permission could write. Here `neond` and `neon-cli` are separate
//! processes, so something has to carry a write from one to the other.
//! Following `status.rs`'s lead, that something is a small JSON file
//! rather than a socket: `neon-cli set` appends an update to it, and
//! `neond` drains it once per polling tick into `KnobStore`'s pending
//! slot. The pending→active commit still only happens at a `ctx_live`
//! 0↔1 edge (`NeonCore::on_ctx_live_edge`); this module only ever feeds
//! `KnobStore::set_pending`, matching the source's `_polling_T_` write
//! path.

use std::io;
use std::path::Path;

use neon_proto::KnobUpdate;

use crate::knobs::KnobStore;

/// Read the on-disk inbox `neon-cli set` appends to: a flat JSON array of
/// [`KnobUpdate`]s not yet drained by `neond`. The wire shape is a bare
/// `Vec<KnobUpdate>` (no wrapper type) so both binaries can read/write it
/// with nothing beyond `neon-proto`.
fn read_inbox(path: &Path) -> io::Result<Vec<KnobUpdate>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn write_inbox(path: &Path, updates: &[KnobUpdate]) -> io::Result<()> {
    let body = serde_json::to_vec(updates)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".{}.tmp", path.file_name().and_then(|n| n.to_str()).unwrap_or("control")));
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Append one update to the control file (`neon-cli`'s side), via a
/// temp-file rename so a concurrent drain never observes a half-written
/// file (same discipline as `status::write_atomic`).
pub fn enqueue(path: &Path, update: KnobUpdate) -> io::Result<()> {
    let mut updates = read_inbox(path)?;
    updates.push(update);
    write_inbox(path, &updates)
}

/// Drain every queued update into `store`'s pending slot (`neond`'s
/// side), then empty the file. Bad individual entries are logged and
/// skipped rather than aborting the whole drain — a single malformed
/// knob write shouldn't wedge the others.
pub fn drain_into(path: &Path, store: &KnobStore) -> io::Result<usize> {
    let updates = read_inbox(path)?;
    if updates.is_empty() {
        return Ok(0);
    }
    let mut applied = 0;
    for update in &updates {
        match store.set_pending(update.clone()) {
            Ok(()) => applied += 1,
            Err(e) => log::warn!("control: rejected queued knob update {update:?}: {e}"),
        }
    }
    write_inbox(path, &[])?;
    Ok(applied)
}
