//! Error kinds.
//!
//! Core paths never panic on user-triggered inputs: they return one of
//! these, log at the severity the kind calls for, and leave state safe.
//! `NotOurs` is deliberately not logged — it fires on every page fault
//! and ioctl that doesn't belong to us, which is the common case.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NeonError {
    /// A fault/ioctl/vma does not belong to a NEON-tracked process.
    /// Callers translate this into "use the default handler" and do not log it.
    #[error("not a NEON-tracked access")]
    NotOurs,

    /// A parsed command tail did not match any known byte pattern. Carries
    /// the sentinel surfaced in place of a guess.
    #[error("invariant broken while parsing command tail: sentinel {sentinel:#x}")]
    InvariantBroken { sentinel: u64 },

    /// A channel spinlock was contended during polling; retry next tick.
    #[error("channel busy, retry next poll")]
    TransientBusy,

    /// A work/map/task was torn down with a nonzero live counter or
    /// nonempty outstanding list. Teardown still proceeds.
    #[error("leak at teardown: {0}")]
    LeakAtFini(String),

    /// Allocation failure during an init path.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// A state machine transition that should not be reachable, but some
    /// instances of which are known to be legitimately reachable (see
    /// call sites for the specific reasoning).
    #[error("unexpected state: {0}")]
    UnexpectedState(String),
}

pub type NeonResult<T> = Result<T, NeonError>;
