//! Access policy: allow-listed subjects and bypass tokens.
//!
//! The policy is read from a line-oriented text file at startup and
//! re-read on a fixed delay. See [`AccessSnapshot::parse`] for the format.

mod snapshot;
mod store;

pub use snapshot::AccessSnapshot;
pub use store::{AccessError, AccessStore, DEFAULT_RELOAD_INTERVAL, ReloadOutcome};
