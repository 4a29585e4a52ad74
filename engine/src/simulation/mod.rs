//! Deterministic simulation testing.
//!
//! - In-memory streams with seeded fault injection
//! - Random operation sequences checked against `std::collections` models
//! - Structural invariant checks over the whole tree
//!
//! # Usage
//!
//! ```ignore
//! use crate::simulation::simulator::{ManagerKind, Simulator, SimulatorConfig};
//!
//! let config = SimulatorConfig::new(12345)
//!     .with_manager(ManagerKind::Disk)
//!     .with_duplicate_keys();
//!
//! let result = Simulator::new(config).run(1000);
//! assert!(result.passed());
//! ```

mod invariants;
mod simulator;
