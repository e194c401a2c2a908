//! spot-guard controller library.
//!
//! Keeps single-replica workloads available while the spot nodes under them
//! are reclaimed: when a node hosting a protected workload is cordoned, the
//! workload is scaled up so a replacement pod can start elsewhere. The planned
//! scale-down is persisted and carried out once the interruption has passed.
//!
//! This crate primarily ships the `spotguard` binary, but exposes a library
//! surface so the control loop can be driven in integration tests against
//! in-memory cluster and store implementations.

pub mod clock;
pub mod cluster;
pub mod config;
pub mod error;
pub mod observer;
pub mod reconciler;
pub mod schedule;
pub mod selector;
pub mod worker;
