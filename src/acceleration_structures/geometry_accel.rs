use std::sync::Arc;

use parking_lot::Mutex;

use super::AccelState;
use crate::{
    device::{
        BufferPlacement, BufferView, BuildInput, DeviceBackend, DeviceBuffer, DevicePtr,
        MemoryRequirements, Stream, TraversableHandle,
    },
    error::{Error, Result},
    geometry::GeometryInstance,
    next_object_id,
    scene::LayoutTracker,
};

struct GasChild {
    geometry: GeometryInstance,
    pre_transform: Option<DevicePtr>,
}

/// Bottom-level acceleration structure over a set of geometry instances.
///
/// All geometry instances of one GAS must share a primitive representation
/// (all triangle meshes or all custom primitives). Every structural mutation
/// invalidates the previously computed memory requirement and the owning
/// scene's SBT layout; only `prepare_for_build` followed by `rebuild` makes
/// the structure ready again.
///
/// Rebuilding into a buffer that an in-flight launch still traverses is a
/// cross-stream hazard the caller must avoid; keeping the old and new builds
/// in separate buffers (multi-buffering) is a caller strategy, not a crate
/// mechanism.
#[derive(Clone)]
pub struct GeometryAccelerationStructure {
    state: Arc<Mutex<GasState>>,
    layout: Arc<LayoutTracker>,
    id: u64,
}

struct GasState {
    accel: AccelState,
    /// One entry per material set.
    num_ray_types: Vec<u32>,
    children: Vec<GasChild>,
    /// Build inputs captured by the last `prepare_for_build`, reused by
    /// `rebuild` and re-snapshotted by `update`.
    cached_inputs: Option<Vec<BuildInput>>,
}

impl GeometryAccelerationStructure {
    pub(crate) fn new(
        backend: Arc<dyn DeviceBackend>,
        placement: BufferPlacement,
        layout: Arc<LayoutTracker>,
    ) -> Result<Self> {
        let accel = AccelState::new(backend, placement, "GAS compacted size")?;
        Ok(Self {
            state: Arc::new(Mutex::new(GasState {
                accel,
                // a new GAS exposes one material set with one ray type
                num_ray_types: vec![1],
                children: Vec::new(),
                cached_inputs: None,
            })),
            layout,
            id: next_object_id(),
        })
    }

    /// Build policy. Pure metadata: nothing already built is invalidated,
    /// but the flags decide which later transitions are legal.
    pub fn set_configuration(
        &self,
        prefer_fast_trace: bool,
        allow_update: bool,
        allow_compaction: bool,
    ) {
        self.state
            .lock()
            .accel
            .set_configuration(prefer_fast_trace, allow_update, allow_compaction);
    }

    /// Declare how many alternative material sets instances of this GAS can
    /// select. Existing per-set ray-type counts are preserved; new sets
    /// start with one ray type.
    pub fn set_num_material_sets(&self, count: u32) {
        self.state.lock().num_ray_types.resize(count as usize, 1);
        self.layout.mark_stale();
    }

    pub fn set_num_ray_types(&self, material_set: u32, count: u32) -> Result<()> {
        let mut state = self.state.lock();
        let num_sets = state.num_ray_types.len();
        match state.num_ray_types.get_mut(material_set as usize) {
            Some(slot) => {
                *slot = count;
                self.layout.mark_stale();
                Ok(())
            }
            None => Err(Error::precondition(format!(
                "material set {material_set} out of range ({num_sets} sets declared)"
            ))),
        }
    }

    /// Add a geometry instance, optionally with a device-resident 3x4
    /// row-major pre-transform applied at build time.
    pub fn add_child(
        &self,
        geometry: &GeometryInstance,
        pre_transform: Option<DevicePtr>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(first) = state.children.first() {
            if first.geometry.kind() != geometry.kind() {
                return Err(Error::precondition(
                    "triangle-mesh and custom-primitive geometry cannot share one acceleration structure",
                ));
            }
        }
        state.children.push(GasChild {
            geometry: geometry.clone(),
            pre_transform,
        });
        self.mark_dirty(&mut state);
        Ok(())
    }

    pub fn remove_child(&self, geometry: &GeometryInstance) -> Result<()> {
        let mut state = self.state.lock();
        let position = state
            .children
            .iter()
            .position(|child| child.geometry.id() == geometry.id())
            .ok_or_else(|| {
                Error::precondition("the geometry instance is not a child of this structure")
            })?;
        state.children.remove(position);
        self.mark_dirty(&mut state);
        Ok(())
    }

    /// A structural change: memory requirements are void, readiness is lost
    /// and the scene layout may have changed shape.
    fn mark_dirty(&self, state: &mut GasState) {
        state.accel.mark_structural_change();
        state.cached_inputs = None;
        self.layout.mark_stale();
    }

    /// Capture build-input descriptors from the current children and query
    /// the native build-size estimate. Touches no GPU memory.
    pub fn prepare_for_build(&self) -> Result<MemoryRequirements> {
        let mut state = self.state.lock();
        if state.children.is_empty() {
            return Err(Error::precondition(
                "the acceleration structure has no children",
            ));
        }
        let inputs = state
            .children
            .iter()
            .map(|child| child.geometry.build_input(child.pre_transform))
            .collect::<Result<Vec<_>>>()?;
        let requirements = state.accel.query_memory_usage(&inputs)?;
        state.cached_inputs = Some(inputs);
        Ok(requirements)
    }

    /// Enqueue a full build into `accel_buffer`, sized per the last
    /// `prepare_for_build`. The compacted footprint is emitted alongside
    /// every build so the caller may compact afterwards.
    pub fn rebuild(
        &self,
        stream: Stream,
        accel_buffer: &dyn DeviceBuffer,
        scratch_buffer: &dyn DeviceBuffer,
    ) -> Result<TraversableHandle> {
        let mut state = self.state.lock();
        let inputs = state.cached_inputs.take().ok_or_else(|| {
            Error::precondition("prepare_for_build has not been called since the last change")
        })?;
        let result = state.accel.rebuild(
            stream,
            &inputs,
            BufferView::of(accel_buffer),
            BufferView::of(scratch_buffer),
        );
        state.cached_inputs = Some(inputs);
        result
    }

    /// Block until the last build or update completes, then return the
    /// compacted footprint read back from the device.
    pub fn prepare_for_compact(&self) -> Result<u64> {
        self.state.lock().accel.prepare_for_compact()
    }

    /// Enqueue the compaction copy. From here `get_handle` prefers the
    /// compacted handle.
    pub fn compact(
        &self,
        stream: Stream,
        compacted_buffer: &dyn DeviceBuffer,
    ) -> Result<TraversableHandle> {
        self.state
            .lock()
            .accel
            .compact(stream, BufferView::of(compacted_buffer))
    }

    /// Give up the pre-compaction buffer and handle. The caller must not
    /// free that buffer before the compaction copy has completed.
    pub fn remove_uncompacted(&self) -> Result<()> {
        self.state.lock().accel.remove_uncompacted()
    }

    /// Enqueue an in-place refresh reusing the existing accel buffer.
    /// Geometry buffer addresses are re-snapshotted from the children, so
    /// both single- and multi-buffer vertex refresh work; element counts and
    /// formats must be unchanged.
    pub fn update(
        &self,
        stream: Stream,
        scratch_buffer: &dyn DeviceBuffer,
    ) -> Result<TraversableHandle> {
        let mut state = self.state.lock();
        let cached = state.cached_inputs.take().ok_or_else(|| {
            Error::precondition("update requires a completed build with no structural change since")
        })?;
        let fresh = state
            .children
            .iter()
            .map(|child| child.geometry.build_input(child.pre_transform))
            .collect::<Result<Vec<_>>>();
        let fresh = match fresh {
            Ok(fresh) => fresh,
            Err(e) => {
                state.cached_inputs = Some(cached);
                return Err(e);
            }
        };
        if !same_build_shape(&cached, &fresh) {
            state.cached_inputs = Some(cached);
            return Err(Error::precondition(
                "geometry count or format changed since the last build; rebuild instead",
            ));
        }
        let result = state
            .accel
            .update(stream, &fresh, BufferView::of(scratch_buffer));
        state.cached_inputs = Some(if result.is_ok() { fresh } else { cached });
        result
    }

    /// True once a full build (or its compacted copy) is available.
    pub fn is_ready(&self) -> bool {
        self.state.lock().accel.is_ready()
    }

    /// The traversable handle to reference in launches, preferring the
    /// compacted one.
    pub fn get_handle(&self) -> Result<TraversableHandle> {
        self.state.lock().accel.handle()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn num_material_sets(&self) -> u32 {
        self.state.lock().num_ray_types.len() as u32
    }

    /// SBT records the given material set needs: per child, records per
    /// geometry instance times the set's ray types.
    pub(crate) fn record_count_for_set(&self, material_set: u32) -> u32 {
        let state = self.state.lock();
        let Some(&ray_types) = state.num_ray_types.get(material_set as usize) else {
            return 0;
        };
        state
            .children
            .iter()
            .map(|child| child.geometry.record_count() * ray_types)
            .sum()
    }

    /// Append this GAS's hit-group records for one material set, in child
    /// order, and return how many were written.
    pub(crate) fn fill_hit_group_records(
        &self,
        pipeline_id: u64,
        material_set: u32,
        records: &mut Vec<u8>,
    ) -> Result<u32> {
        let state = self.state.lock();
        let num_sets = state.num_ray_types.len();
        let Some(&ray_types) = state.num_ray_types.get(material_set as usize) else {
            return Err(Error::precondition(format!(
                "material set {material_set} out of range ({num_sets} sets declared)"
            )));
        };
        let mut written = 0;
        for child in &state.children {
            written +=
                child
                    .geometry
                    .fill_hit_group_records(pipeline_id, material_set, ray_types, records)?;
        }
        Ok(written)
    }
}

/// Whether an update may reuse the structure built from `cached`: same input
/// count, same variants, same element counts and record counts. Buffer
/// addresses are allowed to differ (multi-buffer refresh).
fn same_build_shape(cached: &[BuildInput], fresh: &[BuildInput]) -> bool {
    cached.len() == fresh.len()
        && cached.iter().zip(fresh).all(|(a, b)| match (a, b) {
            (
                BuildInput::TriangleMesh {
                    vertex_count: vc_a,
                    primitive_count: pc_a,
                    flags_per_record: f_a,
                    ..
                },
                BuildInput::TriangleMesh {
                    vertex_count: vc_b,
                    primitive_count: pc_b,
                    flags_per_record: f_b,
                    ..
                },
            ) => vc_a == vc_b && pc_a == pc_b && f_a.len() == f_b.len(),
            (
                BuildInput::CustomPrimitives {
                    primitive_count: pc_a,
                    flags_per_record: f_a,
                    ..
                },
                BuildInput::CustomPrimitives {
                    primitive_count: pc_b,
                    flags_per_record: f_b,
                    ..
                },
            ) => pc_a == pc_b && f_a.len() == f_b.len(),
            _ => false,
        })
}
