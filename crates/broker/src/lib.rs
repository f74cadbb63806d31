//! Permission broker — matches tool invocations against the allow/ask/deny
//! policy and suspends runs awaiting a human decision.
//!
//! The policy side is pure and synchronous ([`PolicyEngine`]); the ask flow
//! is a pending-request store resolved through oneshot channels
//! ([`PermissionBroker`]). Event emission stays with the caller so this
//! crate has no knowledge of channels or the event log.

mod pending;
mod policy;

pub use pending::{PendingPermission, PermissionBroker, PermissionInfo};
pub use policy::{Decision, PolicyEngine};
