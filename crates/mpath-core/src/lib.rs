//! Multipath control-plane core
//!
//! Turns a fluctuating set of block-device paths leading to the same
//! storage volume into a single logical multipath map with grouped paths,
//! failover policy, and queue-vs-fail behaviour when every path is lost.
//!
//! # Architecture
//!
//! - **Bindings store**: crash-safe alias ↔ WWID file with base-26 alias
//!   allocation and atomic conflict repair
//! - **Registries**: reference-counted checker and prioritizer classes
//!   behind plugin traits
//! - **Grouping engine**: policy-driven partition of paths into ordered
//!   path groups, marginal paths segregated on request
//! - **Map state machine**: adoption, kernel sync, recovery mode with
//!   bounded retry accounting
//! - **Reservation coordinator**: persistent-reservation fan-out with a
//!   durable key store
//!
//! The kernel is never touched directly: the device-mapper control channel
//! and sysfs are collaborator traits (`dm` module) the daemon wires up.

pub mod alias;
pub mod checker;
pub mod config;
pub mod dm;
pub mod error;
pub mod mapstate;
pub mod pgpolicy;
pub mod platform;
pub mod pr;
pub mod prio;
pub mod prkeys;
pub mod structs;

// Re-export key types for convenience
pub use alias::BindingsFile;
pub use checker::{Checker, CheckerRegistry, PathState};
pub use config::Config;
pub use dm::{DmChannel, MemoryDm, MemorySysfs, SysfsSource};
pub use error::{CoreError, CoreResult};
pub use pgpolicy::PgPolicy;
pub use prio::{Prio, PrioRegistry};
pub use prkeys::PrKeysFile;
pub use structs::{Multipath, Path, PathGroup, PathRef, Vecs};
