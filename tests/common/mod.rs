//! In-process device backend for exercising lifecycle and SBT logic without
//! a GPU. Allocations are simulated as a bump pointer, uploads are retained
//! for inspection and the compacted size emitted by a build is a fixed 60%
//! of the destination buffer.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use rtstage::device::{
    AccelBuildOptions, BufferPlacement, BufferView, BuildInput, BuildOperation, DeviceBackend,
    DeviceBuffer, DevicePtr, EventHandle, MemoryRequirements, PipelineHandle, ProgramGroupHandle,
    ShaderBindingTableView, Stream, TraversableHandle,
};
use rtstage::error::BackendError;
use rtstage::{Context, GeometryInstance, GeometryKind, Scene};

pub const STREAM: Stream = Stream(0);

#[derive(Clone)]
pub struct LaunchRecord {
    pub pipeline: PipelineHandle,
    pub sbt: ShaderBindingTableView,
    pub params: DevicePtr,
    pub dimensions: [u32; 3],
}

#[derive(Default)]
struct Inner {
    next_ptr: u64,
    next_handle: u64,
    next_event: u64,
    allocations: HashMap<DevicePtr, u64>,
    uploads: HashMap<DevicePtr, Vec<u8>>,
    u64_slots: HashMap<DevicePtr, u64>,
    live_events: HashSet<u64>,
    recorded_events: HashSet<u64>,
    builds: u32,
    updates: u32,
    compactions: u32,
    launches: Vec<LaunchRecord>,
}

pub struct FakeBackend {
    inner: Mutex<Inner>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                next_ptr: 0x1000,
                next_handle: 1,
                ..Inner::default()
            }),
        })
    }

    /// Reserve a unique device address range for a caller-side buffer.
    pub fn reserve(&self, size: u64) -> DevicePtr {
        self.inner.lock().reserve(size)
    }

    pub fn uploaded(&self, ptr: DevicePtr) -> Option<Vec<u8>> {
        self.inner.lock().uploads.get(&ptr).cloned()
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.inner.lock().launches.clone()
    }

    pub fn build_count(&self) -> u32 {
        self.inner.lock().builds
    }

    pub fn update_count(&self) -> u32 {
        self.inner.lock().updates
    }

    pub fn compaction_count(&self) -> u32 {
        self.inner.lock().compactions
    }

    pub fn live_event_count(&self) -> usize {
        self.inner.lock().live_events.len()
    }

    pub fn live_allocation_count(&self) -> usize {
        self.inner.lock().allocations.len()
    }
}

impl Inner {
    fn reserve(&mut self, size: u64) -> DevicePtr {
        let ptr = self.next_ptr;
        self.next_ptr += size.max(1).next_multiple_of(256);
        ptr
    }
}

impl DeviceBackend for FakeBackend {
    fn allocate(
        &self,
        size: u64,
        _placement: BufferPlacement,
        _label: &str,
    ) -> Result<BufferView, BackendError> {
        let mut inner = self.inner.lock();
        let ptr = inner.reserve(size);
        inner.allocations.insert(ptr, size);
        Ok(BufferView { ptr, size })
    }

    fn deallocate(&self, view: BufferView) {
        self.inner.lock().allocations.remove(&view.ptr);
    }

    fn upload(&self, _stream: Stream, dst: DevicePtr, bytes: &[u8]) -> Result<(), BackendError> {
        self.inner.lock().uploads.insert(dst, bytes.to_vec());
        Ok(())
    }

    fn read_device_u64(&self, src: DevicePtr) -> Result<u64, BackendError> {
        self.inner
            .lock()
            .u64_slots
            .get(&src)
            .copied()
            .ok_or_else(|| BackendError::new("cuMemcpyDtoH", "no value written at address"))
    }

    fn create_event(&self) -> Result<EventHandle, BackendError> {
        let mut inner = self.inner.lock();
        inner.next_event += 1;
        let event = inner.next_event;
        inner.live_events.insert(event);
        Ok(EventHandle(event))
    }

    fn destroy_event(&self, event: EventHandle) {
        let mut inner = self.inner.lock();
        inner.live_events.remove(&event.0);
        inner.recorded_events.remove(&event.0);
    }

    fn record_event(&self, _stream: Stream, event: EventHandle) -> Result<(), BackendError> {
        self.inner.lock().recorded_events.insert(event.0);
        Ok(())
    }

    fn wait_event(&self, event: EventHandle) -> Result<(), BackendError> {
        if self.inner.lock().recorded_events.contains(&event.0) {
            Ok(())
        } else {
            Err(BackendError::new(
                "cuEventSynchronize",
                "event was never recorded",
            ))
        }
    }

    fn compute_accel_memory_usage(
        &self,
        _options: &AccelBuildOptions,
        inputs: &[BuildInput],
    ) -> Result<MemoryRequirements, BackendError> {
        let primitives: u64 = inputs
            .iter()
            .map(|input| match input {
                BuildInput::TriangleMesh {
                    primitive_count, ..
                }
                | BuildInput::CustomPrimitives {
                    primitive_count, ..
                } => *primitive_count as u64,
                BuildInput::Instances { count, .. } => *count as u64,
            })
            .sum();
        let accel_size = 1024 + 128 * primitives;
        Ok(MemoryRequirements {
            accel_size,
            scratch_size: accel_size / 2,
            update_scratch_size: accel_size / 4,
        })
    }

    fn build_accel(
        &self,
        _stream: Stream,
        options: &AccelBuildOptions,
        _inputs: &[BuildInput],
        dest: BufferView,
        _scratch: BufferView,
        compacted_size_out: Option<DevicePtr>,
    ) -> Result<TraversableHandle, BackendError> {
        let mut inner = self.inner.lock();
        match options.operation {
            BuildOperation::Build => inner.builds += 1,
            BuildOperation::Update => inner.updates += 1,
        }
        if let Some(slot) = compacted_size_out {
            inner.u64_slots.insert(slot, dest.size * 6 / 10);
        }
        inner.next_handle += 1;
        Ok(TraversableHandle(inner.next_handle))
    }

    fn compact_accel(
        &self,
        _stream: Stream,
        _source: TraversableHandle,
        _dest: BufferView,
    ) -> Result<TraversableHandle, BackendError> {
        let mut inner = self.inner.lock();
        inner.compactions += 1;
        inner.next_handle += 1;
        Ok(TraversableHandle(inner.next_handle))
    }

    fn pack_record_header(
        &self,
        program_group: ProgramGroupHandle,
        header: &mut [u8],
    ) -> Result<(), BackendError> {
        header.fill(0);
        header[..8].copy_from_slice(&program_group.0.to_le_bytes());
        Ok(())
    }

    fn launch(
        &self,
        _stream: Stream,
        pipeline: PipelineHandle,
        sbt: &ShaderBindingTableView,
        params: DevicePtr,
        dimensions: [u32; 3],
    ) -> Result<(), BackendError> {
        self.inner.lock().launches.push(LaunchRecord {
            pipeline,
            sbt: sbt.clone(),
            params,
            dimensions,
        });
        Ok(())
    }
}

/// A caller buffer: just an address range reserved on the fake backend.
pub struct FakeBuffer {
    ptr: DevicePtr,
    size: u64,
}

impl FakeBuffer {
    pub fn alloc(backend: &FakeBackend, size: u64) -> Self {
        Self {
            ptr: backend.reserve(size),
            size,
        }
    }
}

impl DeviceBuffer for FakeBuffer {
    fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    fn len(&self) -> u64 {
        self.size
    }
}

pub fn context() -> (Arc<FakeBackend>, Context) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = FakeBackend::new();
    let context = Context::new(backend.clone(), BufferPlacement::Device);
    (backend, context)
}

/// A triangle-mesh geometry instance over 4 vertices and 2 indexed
/// triangles, with the default single material slot.
pub fn quad_geometry(scene: &Scene, backend: &FakeBackend) -> GeometryInstance {
    let geometry = scene.create_geometry_instance(GeometryKind::Triangles);
    let vertices = FakeBuffer::alloc(backend, 4 * 12);
    let indices = FakeBuffer::alloc(backend, 2 * 12);
    geometry.set_vertex_buffer(&vertices, 12, 4).unwrap();
    geometry.set_triangle_buffer(&indices, 2).unwrap();
    geometry
}
