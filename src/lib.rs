//! Lifecycle management for GPU ray-tracing acceleration structures and the
//! shader binding table that routes hits to shading programs.
//!
//! The crate coordinates a two-level scene hierarchy (bottom-level
//! [`GeometryAccelerationStructure`]s over triangle meshes or custom
//! primitives, top-level [`InstanceAccelerationStructure`]s over placed
//! instances) together with the [`Scene`]-wide SBT record layout and the
//! [`Pipeline`]-side record assembly consumed at kernel launch.
//!
//! There is no internal scheduler: every operation either mutates CPU-side
//! state synchronously or enqueues work on a caller-supplied [`Stream`].
//! The only blocking call is the compaction-size readback in
//! `prepare_for_compact`. Cross-stream hazards and buffer lifetimes are the
//! caller's responsibility; the crate detects and reports staleness where it
//! can (readiness predicates, SBT layout generation state, launch-time
//! validation) but never synchronizes streams on the caller's behalf.
//!
//! Device-memory allocation, program compilation and context initialization
//! stay outside the crate; they appear only as the [`device::DeviceBackend`]
//! boundary.
//!
//! Object state is shared behind per-object mutexes. Operations that touch
//! several objects acquire locks in the fixed order Pipeline, Scene, IAS,
//! Instance, GAS, GeometryInstance, Material.
//!
//! [`Stream`]: device::Stream

pub mod acceleration_structures;
mod context;
pub mod device;
pub mod error;
mod geometry;
mod instance;
mod material;
mod pipeline;
mod scene;
pub mod sbt;

pub use acceleration_structures::{
    geometry_accel::GeometryAccelerationStructure, instance_accel::InstanceAccelerationStructure,
};
pub use context::Context;
pub use device::{
    BufferPlacement, BuildInput, DeviceBackend, DeviceBuffer, DevicePtr, GeometryFlags,
    MemoryRequirements, Stream, TraversableHandle,
};
pub use error::{Error, Result};
pub use geometry::{GeometryInstance, GeometryKind};
pub use instance::Instance;
pub use material::Material;
pub use pipeline::{Pipeline, ProgramGroup};
pub use scene::Scene;

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity for objects that participate in keyed lookups
/// (SBT offsets, hit-group bindings).
pub(crate) fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}
