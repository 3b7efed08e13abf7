//! Hybrid memory manager for a dynamic language runtime
//!
//! Objects are freed deterministically by reference counting the moment the
//! last reference goes away. Garbage cycles, which refcounting cannot free,
//! are found by a generational trial-deletion collector. Underneath both sits
//! a segmented slab allocator (arenas of pools of same-sized blocks).
//!
//! The host runtime describes its object layouts through [ObjectType]: the
//! collector only ever asks an object which references it owns.
//!
//! Everything goes through one [MemoryManager]. It is single-mutator and
//! never shared between threads.

pub mod allocator;
pub mod config;
pub mod error;
pub mod gc;
pub mod intern;
pub mod manager;
pub mod object;
pub mod types;
pub mod util;
pub mod weak;

pub use allocator::HeapStats;
pub use config::{Config, Thresholds};
pub use error::{MemError, MemResult, Violation};
pub use gc::{CollectorState, GcStats, Generation};
pub use intern::{Admission, InternPolicy, InternValue, PolicyKey};
pub use manager::{MemoryManager, ShutdownReport};
pub use object::{ObjectHandle, ObjectType, ObjectView, TypeTag, HEADER_SZ, REF_SLOT_SZ};
pub use weak::{WeakCallback, WeakHandle};

#[cfg(test)]
mod test_scenarios;
