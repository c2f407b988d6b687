use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::AccelState;
use crate::{
    device::{
        BufferPlacement, BufferView, BuildInput, DeviceBackend, DeviceBuffer, InstanceDescriptor,
        MemoryRequirements, Stream, TraversableHandle,
    },
    error::{Error, Result},
    instance::{Instance, InstanceTarget},
    next_object_id,
    scene::{LayoutTracker, SceneState},
};

/// Top-level acceleration structure over placed instances of bottom-level
/// structures.
///
/// The caller learns the required instance count and buffer size from
/// `prepare_for_build`, supplies the instance buffer to `rebuild`, and the
/// crate serializes one native instance record per child into it before
/// enqueuing the build. The update path rewrites that buffer from the copy
/// retained at the last rebuild, so the instance buffer must stay alive and
/// unmodified alongside the accel (or compacted) buffer; updating after it
/// was freed or overwritten is undefined.
#[derive(Clone)]
pub struct InstanceAccelerationStructure {
    state: Arc<Mutex<IasState>>,
    scene: Weak<Mutex<SceneState>>,
    layout: Arc<LayoutTracker>,
    id: u64,
}

struct IasState {
    accel: AccelState,
    children: Vec<Instance>,
    instance_buffer: Option<BufferView>,
    /// Host copy of the records written at the last rebuild; the update path
    /// rewrites only their transform fields.
    host_instances: Vec<InstanceDescriptor>,
}

impl InstanceAccelerationStructure {
    pub(crate) fn new(
        backend: Arc<dyn DeviceBackend>,
        placement: BufferPlacement,
        scene: Weak<Mutex<SceneState>>,
        layout: Arc<LayoutTracker>,
    ) -> Result<Self> {
        let accel = AccelState::new(backend, placement, "IAS compacted size")?;
        Ok(Self {
            state: Arc::new(Mutex::new(IasState {
                accel,
                children: Vec::new(),
                instance_buffer: None,
                host_instances: Vec::new(),
            })),
            scene,
            layout,
            id: next_object_id(),
        })
    }

    /// Build policy; see
    /// [`GeometryAccelerationStructure::set_configuration`].
    ///
    /// [`GeometryAccelerationStructure::set_configuration`]: super::geometry_accel::GeometryAccelerationStructure::set_configuration
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

    pub fn add_child(&self, instance: &Instance) {
        let mut state = self.state.lock();
        state.children.push(instance.clone());
        mark_dirty(&mut state);
    }

    pub fn remove_child(&self, instance: &Instance) -> Result<()> {
        let mut state = self.state.lock();
        let position = state
            .children
            .iter()
            .position(|child| child.id() == instance.id())
            .ok_or_else(|| Error::precondition("the instance is not a child of this structure"))?;
        state.children.remove(position);
        mark_dirty(&mut state);
        Ok(())
    }

    /// Query the build footprint and the number of instance records the
    /// caller must provide room for (at
    /// `size_of::<InstanceDescriptor>()` bytes each).
    pub fn prepare_for_build(&self) -> Result<(MemoryRequirements, u32)> {
        let mut state = self.state.lock();
        let count = state.children.len() as u32;
        let inputs = [BuildInput::Instances {
            buffer: BufferView::default(),
            count,
        }];
        let requirements = state.accel.query_memory_usage(&inputs)?;
        Ok((requirements, count))
    }

    /// Serialize the instance records into `instance_buffer` on `stream`,
    /// then enqueue the build. SBT offsets are drawn from the owning scene's
    /// layout, which must be current.
    pub fn rebuild(
        &self,
        stream: Stream,
        instance_buffer: &dyn DeviceBuffer,
        accel_buffer: &dyn DeviceBuffer,
        scratch_buffer: &dyn DeviceBuffer,
    ) -> Result<TraversableHandle> {
        let scene = self.scene.upgrade().ok_or_else(|| {
            Error::precondition("the scene owning this acceleration structure no longer exists")
        })?;
        let scene_state = scene.lock();
        let mut state = self.state.lock();

        if !state.children.is_empty() && !self.layout.is_current() {
            return Err(Error::precondition(
                "the SBT layout is stale; call generate_shader_binding_table_layout first",
            ));
        }

        let mut descriptors = Vec::with_capacity(state.children.len());
        for child in &state.children {
            descriptors.push(serialize_instance(child, &scene_state)?);
        }

        let instance_view = BufferView::of(instance_buffer);
        let required = descriptors.len() as u64 * std::mem::size_of::<InstanceDescriptor>() as u64;
        if instance_view.size < required {
            return Err(Error::BufferTooSmall {
                what: "instance buffer",
                size: instance_view.size,
                required,
            });
        }
        if !descriptors.is_empty() {
            state.accel.backend().clone().upload(
                stream,
                instance_view.ptr,
                bytemuck::cast_slice(&descriptors),
            )?;
        }

        let inputs = [BuildInput::Instances {
            buffer: instance_view,
            count: descriptors.len() as u32,
        }];
        let handle = state.accel.rebuild(
            stream,
            &inputs,
            BufferView::of(accel_buffer),
            BufferView::of(scratch_buffer),
        )?;
        state.instance_buffer = Some(instance_view);
        state.host_instances = descriptors;
        Ok(handle)
    }

    /// See [`GeometryAccelerationStructure::prepare_for_compact`].
    ///
    /// [`GeometryAccelerationStructure::prepare_for_compact`]: super::geometry_accel::GeometryAccelerationStructure::prepare_for_compact
    pub fn prepare_for_compact(&self) -> Result<u64> {
        self.state.lock().accel.prepare_for_compact()
    }

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

    pub fn remove_uncompacted(&self) -> Result<()> {
        self.state.lock().accel.remove_uncompacted()
    }

    /// In-place refresh for transform-only changes. Rewrites the transform
    /// fields of the records written at the last rebuild and re-uploads them
    /// before enqueueing the update build. Needs no new `prepare_for_build`.
    pub fn update(
        &self,
        stream: Stream,
        scratch_buffer: &dyn DeviceBuffer,
    ) -> Result<TraversableHandle> {
        let mut state = self.state.lock();
        let instance_view = state.instance_buffer.ok_or_else(|| {
            Error::precondition("update requires a completed rebuild with no structural change since")
        })?;
        debug_assert_eq!(state.children.len(), state.host_instances.len());

        let children = std::mem::take(&mut state.children);
        for (child, descriptor) in children.iter().zip(&mut state.host_instances) {
            descriptor.transform = child.state().lock().transform;
        }
        state.children = children;

        if !state.host_instances.is_empty() {
            state.accel.backend().clone().upload(
                stream,
                instance_view.ptr,
                bytemuck::cast_slice(&state.host_instances),
            )?;
        }
        let inputs = [BuildInput::Instances {
            buffer: instance_view,
            count: state.host_instances.len() as u32,
        }];
        state
            .accel
            .update(stream, &inputs, BufferView::of(scratch_buffer))
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().accel.is_ready()
    }

    pub fn get_handle(&self) -> Result<TraversableHandle> {
        self.state.lock().accel.handle()
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

/// A structural change: the records retained for the update path no longer
/// match the child set, so they go too.
fn mark_dirty(state: &mut IasState) {
    state.accel.mark_structural_change();
    state.instance_buffer = None;
    state.host_instances.clear();
}

fn serialize_instance(instance: &Instance, scene: &SceneState) -> Result<InstanceDescriptor> {
    let state = instance.state().lock();
    let Some(InstanceTarget::Gas { gas, material_set }) = &state.target else {
        return Err(Error::precondition(
            "an instance without a GAS cannot be built into a top-level structure",
        ));
    };
    let traversable = gas.get_handle()?;
    let sbt_offset = scene
        .sbt_offsets
        .get(&(gas.id(), *material_set))
        .copied()
        .ok_or(Error::UnknownSbtEntry {
            mat_set: *material_set,
        })?;
    Ok(InstanceDescriptor {
        transform: state.transform,
        instance_id: state.instance_id,
        sbt_offset,
        visibility_mask: state.visibility_mask as u32,
        flags: 0,
        traversable,
        _pad: [0; 2],
    })
}
