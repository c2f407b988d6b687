//! The boundary to the native GPU API.
//!
//! Everything this crate needs from the device layer (buffer addresses,
//! stream submission, acceleration-structure builds, record-header packing,
//! kernel launch) goes through [`DeviceBackend`]. Buffer allocation and
//! program compilation stay on the caller's side of the boundary; the crate
//! only ever sees a device address and a byte size.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::error::BackendError;

/// A raw 64-bit device memory address. Zero is never a valid address.
pub type DevicePtr = u64;

/// An opaque native stream handle. The crate never interprets the value; it
/// is passed through to the backend with every enqueued operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Stream(pub u64);

/// An opaque native event handle, created and interpreted by the backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EventHandle(pub u64);

/// A compiled native program group, supplied by the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProgramGroupHandle(pub u64);

/// A linked native pipeline, supplied by the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PipelineHandle(pub u64);

/// Opaque reference to a built acceleration structure, usable inside a device
/// kernel launch. Zero means "no structure".
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TraversableHandle(pub u64);

impl TraversableHandle {
    pub const NULL: TraversableHandle = TraversableHandle(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Caller-supplied device memory: a device address plus a byte size. The
/// crate snapshots both into a [`BufferView`] at the call that receives the
/// buffer; keeping the underlying allocation alive for as long as the device
/// may read it is the caller's obligation.
pub trait DeviceBuffer {
    fn device_ptr(&self) -> DevicePtr;
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owned snapshot of a [`DeviceBuffer`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferView {
    pub ptr: DevicePtr,
    pub size: u64,
}

impl BufferView {
    pub fn of(buffer: &dyn DeviceBuffer) -> Self {
        Self {
            ptr: buffer.device_ptr(),
            size: buffer.len(),
        }
    }
}

/// Where the backend should place an internal allocation. Chosen once at
/// [`Context`] construction and threaded to every internal allocation.
///
/// [`Context`]: crate::context::Context
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BufferPlacement {
    #[default]
    Device,
    HostVisible,
}

/// Device memory footprint of a pending acceleration-structure build,
/// consumed by the caller to allocate the accel and scratch buffers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Size of the final acceleration-structure buffer.
    pub accel_size: u64,
    /// Scratch needed while a full build runs.
    pub scratch_size: u64,
    /// Scratch needed while an in-place update runs.
    pub update_scratch_size: u64,
}

/// Whether a submitted build is a full build or an in-place refresh.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildOperation {
    Build,
    Update,
}

/// Options attached to every acceleration-structure build submission.
#[derive(Copy, Clone, Debug)]
pub struct AccelBuildOptions {
    pub prefer_fast_trace: bool,
    pub allow_update: bool,
    pub allow_compaction: bool,
    pub operation: BuildOperation,
}

bitflags! {
    /// Per-SBT-record geometry behavior flags, one set per record a geometry
    /// instance contributes to its acceleration structure.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct GeometryFlags: u32 {
        const NONE = 0;
        const DISABLE_ANYHIT = 1 << 0;
        const REQUIRE_SINGLE_ANYHIT_CALL = 1 << 1;
    }
}

/// One input to an acceleration-structure build, selected at geometry
/// construction and never reinterpreted across variants.
#[derive(Clone, Debug)]
pub enum BuildInput {
    TriangleMesh {
        vertex_buffer: BufferView,
        vertex_stride: u32,
        vertex_count: u32,
        /// Triple-of-u32 index buffer; `None` for non-indexed soup.
        index_buffer: Option<BufferView>,
        primitive_count: u32,
        /// Offset added to the primitive index reported to device programs.
        primitive_index_offset: u32,
        /// One flag set per SBT record this input contributes.
        flags_per_record: Vec<GeometryFlags>,
        /// Per-primitive material index offsets; required when more than one
        /// record is contributed.
        material_index_buffer: Option<BufferView>,
        /// Optional device-resident 3x4 row-major pre-transform.
        pre_transform: Option<DevicePtr>,
    },
    CustomPrimitives {
        aabb_buffer: BufferView,
        primitive_count: u32,
        primitive_index_offset: u32,
        flags_per_record: Vec<GeometryFlags>,
        material_index_buffer: Option<BufferView>,
    },
    Instances {
        buffer: BufferView,
        count: u32,
    },
}

impl BuildInput {
    /// Number of SBT records this input contributes per ray type.
    pub fn record_count(&self) -> u32 {
        match self {
            BuildInput::TriangleMesh {
                flags_per_record, ..
            }
            | BuildInput::CustomPrimitives {
                flags_per_record, ..
            } => flags_per_record.len() as u32,
            BuildInput::Instances { .. } => 0,
        }
    }
}

/// The native per-instance record consumed by a top-level build. Matches the
/// device ABI byte for byte: 80 bytes, 8-byte aligned.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceDescriptor {
    /// Row-major 3x4 affine object-to-world transform.
    pub transform: [f32; 12],
    pub instance_id: u32,
    pub sbt_offset: u32,
    pub visibility_mask: u32,
    pub flags: u32,
    pub traversable: TraversableHandle,
    pub _pad: [u32; 2],
}

/// One category region of an assembled shader binding table.
#[derive(Copy, Clone, Debug, Default)]
pub struct SbtRegion {
    pub base: DevicePtr,
    pub stride: u32,
    pub count: u32,
}

/// The full shader binding table handed to a launch: one ray-generation
/// record, at most one exception record, and strided miss/hit/callable
/// record arrays.
#[derive(Clone, Debug, Default)]
pub struct ShaderBindingTableView {
    pub ray_generation: SbtRegion,
    pub exception: SbtRegion,
    pub miss: SbtRegion,
    pub hit_group: SbtRegion,
    pub callable: SbtRegion,
}

/// The native API surface this crate drives.
///
/// Every method is an enqueue on the given stream unless documented as
/// blocking; the crate never synchronizes streams against each other.
/// Implementations report failures as [`BackendError`] naming the native
/// call, which the crate re-surfaces as [`Error::Device`].
///
/// [`Error::Device`]: crate::error::Error::Device
pub trait DeviceBackend: Send + Sync {
    /// Allocate backend-owned memory for the crate's internal use (record
    /// buffers, compacted-size readback slots).
    fn allocate(
        &self,
        size: u64,
        placement: BufferPlacement,
        label: &str,
    ) -> Result<BufferView, BackendError>;

    /// Release memory obtained from [`allocate`](Self::allocate).
    fn deallocate(&self, view: BufferView);

    /// Enqueue a host-to-device copy into caller- or backend-owned memory.
    fn upload(&self, stream: Stream, dst: DevicePtr, bytes: &[u8]) -> Result<(), BackendError>;

    /// Read a device-resident `u64`. Only called after the event guarding the
    /// write has been waited on; the read itself is host-synchronous.
    fn read_device_u64(&self, src: DevicePtr) -> Result<u64, BackendError>;

    fn create_event(&self) -> Result<EventHandle, BackendError>;
    fn destroy_event(&self, event: EventHandle);
    fn record_event(&self, stream: Stream, event: EventHandle) -> Result<(), BackendError>;
    /// Block the calling thread until the event fires. The single blocking
    /// point in the crate (compaction-size readback).
    fn wait_event(&self, event: EventHandle) -> Result<(), BackendError>;

    /// Query the memory footprint a build of `inputs` would need.
    fn compute_accel_memory_usage(
        &self,
        options: &AccelBuildOptions,
        inputs: &[BuildInput],
    ) -> Result<MemoryRequirements, BackendError>;

    /// Enqueue an acceleration-structure build (or in-place update) writing
    /// into `dest`, using `scratch`. When `compacted_size_out` is set the
    /// build additionally emits the compacted footprint to that address.
    fn build_accel(
        &self,
        stream: Stream,
        options: &AccelBuildOptions,
        inputs: &[BuildInput],
        dest: BufferView,
        scratch: BufferView,
        compacted_size_out: Option<DevicePtr>,
    ) -> Result<TraversableHandle, BackendError>;

    /// Enqueue the compaction copy of `source` into `dest`.
    fn compact_accel(
        &self,
        stream: Stream,
        source: TraversableHandle,
        dest: BufferView,
    ) -> Result<TraversableHandle, BackendError>;

    /// Write the opaque record header for a program group into `header`
    /// (exactly [`RECORD_HEADER_SIZE`] bytes).
    ///
    /// [`RECORD_HEADER_SIZE`]: crate::sbt::RECORD_HEADER_SIZE
    fn pack_record_header(
        &self,
        program_group: ProgramGroupHandle,
        header: &mut [u8],
    ) -> Result<(), BackendError>;

    /// Enqueue a kernel launch over an `x * y * z` grid of work items,
    /// reading launch parameters from `params`.
    fn launch(
        &self,
        stream: Stream,
        pipeline: PipelineHandle,
        sbt: &ShaderBindingTableView,
        params: DevicePtr,
        dimensions: [u32; 3],
    ) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn instance_descriptor_matches_native_layout() {
        assert_eq!(mem::size_of::<InstanceDescriptor>(), 80);
        assert_eq!(mem::align_of::<InstanceDescriptor>(), 8);
        assert_eq!(memoffset(|d: &InstanceDescriptor| &d.instance_id), 48);
        assert_eq!(memoffset(|d: &InstanceDescriptor| &d.traversable), 64);
    }

    fn memoffset<T, F: Pod>(field: impl Fn(&T) -> &F) -> usize {
        let probe = unsafe { mem::zeroed::<T>() };
        let base = &probe as *const T as usize;
        let member = field(&probe) as *const F as usize;
        member - base
    }

    #[test]
    fn null_handle_is_zero() {
        assert!(TraversableHandle::NULL.is_null());
        assert!(!TraversableHandle(7).is_null());
        assert_eq!(TraversableHandle::default(), TraversableHandle::NULL);
    }
}
