//! Deterministic simulation of a lossy BLE link.
//!
//! [`SimScheduler`] replaces wall-clock timers with a virtual clock that only
//! moves when the test (or the `link-sim` binary) advances it, and
//! [`LossyLink`] stands in for the radio. Together they make NACK and retry
//! timing reproducible to the millisecond.

mod link;
mod pair;
mod scheduler;

pub use link::{LinkCounters, LinkFaults, LossyLink};
pub use pair::{SimEndpoint, SimPair};
pub use scheduler::SimScheduler;
