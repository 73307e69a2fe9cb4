pub mod guards;

pub use guards::{GuardDecision, GuardViolation, MarginGuard, OrderGuards, VolumeGuard};
