//! PolicyFCFS. Stateless pass-through: every submission
//! issues immediately, nothing is ever blocked, and reengage always
//! rearms (there is no hand-off to disengage pages for).

use super::SubmitAction;

pub fn start() {}
pub fn stop() {}

pub fn submit() -> SubmitAction {
    SubmitAction::IssueNow
}

pub fn issue() {}
pub fn complete() {}

pub fn reengage() -> bool {
    true
}
