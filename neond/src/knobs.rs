//! Runtime knob surface.
//!
//! Every knob has a pending and an active value (mirroring the original
//! driver's `_polling_T_`/`polling_T` pair): a write lands in the pending
//! slot immediately and is only copied into the active slot at a safe
//! checkpoint — a `ctx_live` 0↔1 edge — so an in-flight scheduling
//! decision never sees a setting change out from under it.

use std::time::Duration;

use neon_proto::PolicyKind;
use parking_lot::Mutex;

use crate::error::{NeonError, NeonResult};

#[derive(Debug, Clone, Copy)]
pub struct Knobs {
    pub polling_t: Duration,
    pub malicious_t: Duration,
    pub policy: PolicyKind,
    pub timeslice_t: Duration,
    pub disengage: bool,
    pub sampling_t: Duration,
    pub sampling_x: u32,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            polling_t: Duration::from_millis(1),
            malicious_t: Duration::from_millis(60_000),
            policy: PolicyKind::Fcfs,
            timeslice_t: Duration::from_millis(30),
            disengage: true,
            sampling_t: Duration::from_millis(5),
            sampling_x: 5,
        }
    }
}

impl Knobs {
    /// `malicious_T / polling_T`, the polling tick count past which a
    /// stuck channel is declared malicious; zero disables detection.
    pub fn malicious_ticks(&self) -> u64 {
        if self.malicious_t.is_zero() {
            return 0;
        }
        (self.malicious_t.as_millis() / self.polling_t.as_millis().max(1)) as u64
    }
}

fn clamp_ms(name: &str, ms: u64, lo: u64, hi: u64) -> NeonResult<Duration> {
    if ms < lo || ms > hi {
        return Err(NeonError::UnexpectedState(format!(
            "{name} must be in [{lo}, {hi}] ms, got {ms}"
        )));
    }
    Ok(Duration::from_millis(ms))
}

pub struct KnobStore {
    active: Mutex<Knobs>,
    pending: Mutex<Knobs>,
}

impl KnobStore {
    pub fn new(initial: Knobs) -> Self {
        Self { active: Mutex::new(initial), pending: Mutex::new(initial) }
    }

    pub fn active(&self) -> Knobs {
        *self.active.lock()
    }

    /// Apply a single knob update to the pending set, validating its range
    /// (knob table). Does not affect the active set.
    pub fn set_pending(&self, update: neon_proto::KnobUpdate) -> NeonResult<()> {
        let mut pending = self.pending.lock();
        match update {
            neon_proto::KnobUpdate::PollingT(ms) => pending.polling_t = clamp_ms("polling_T", ms as u64, 1, 1000)?,
            neon_proto::KnobUpdate::MaliciousT(ms) => {
                pending.malicious_t = if ms == 0 {
                    Duration::ZERO
                } else if (ms as u128) <= pending.polling_t.as_millis() {
                    return Err(NeonError::UnexpectedState(
                        "malicious_T must be 0 or greater than polling_T".into(),
                    ));
                } else {
                    Duration::from_millis(ms as u64)
                };
            }
            neon_proto::KnobUpdate::Policy(kind) => pending.policy = kind,
            neon_proto::KnobUpdate::TimesliceT(ms) => {
                pending.timeslice_t = clamp_ms("timeslice_T", ms as u64, 1, 1000)?
            }
            neon_proto::KnobUpdate::Disengage(flag) => pending.disengage = flag,
            neon_proto::KnobUpdate::SamplingT(ms) => {
                let lo = pending.polling_t.as_millis().max(1) as u64;
                pending.sampling_t = clamp_ms("sampling_T", ms as u64, lo, 1000)?
            }
            neon_proto::KnobUpdate::SamplingX(x) => {
                if x < 1 {
                    return Err(NeonError::UnexpectedState("sampling_X must be >= 1".into()));
                }
                pending.sampling_x = x;
            }
        }
        Ok(())
    }

    /// Copy pending into active ("applied only at safe
    /// checkpoints — when `ctx_live` transitions 0↔1"). Returns the newly
    /// active set.
    pub fn commit(&self) -> Knobs {
        let pending = *self.pending.lock();
        *self.active.lock() = pending;
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_update_does_not_affect_active_until_commit() {
        let store = KnobStore::new(Knobs::default());
        store.set_pending(neon_proto::KnobUpdate::PollingT(10)).unwrap();
        assert_eq!(store.active().polling_t, Duration::from_millis(1));
        let active = store.commit();
        assert_eq!(active.polling_t, Duration::from_millis(10));
        assert_eq!(store.active().polling_t, Duration::from_millis(10));
    }

    #[test]
    fn out_of_range_polling_t_is_rejected() {
        let store = KnobStore::new(Knobs::default());
        assert!(store.set_pending(neon_proto::KnobUpdate::PollingT(0)).is_err());
        assert!(store.set_pending(neon_proto::KnobUpdate::PollingT(5000)).is_err());
    }

    #[test]
    fn malicious_ticks_is_zero_when_disabled() {
        let mut k = Knobs::default();
        k.malicious_t = Duration::ZERO;
        assert_eq!(k.malicious_ticks(), 0);
    }
}
