use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    acceleration_structures::{
        geometry_accel::GeometryAccelerationStructure,
        instance_accel::InstanceAccelerationStructure,
    },
    device::{BufferPlacement, DeviceBackend},
    error::{Error, Result},
    geometry::{GeometryInstance, GeometryKind},
    instance::Instance,
    next_object_id,
    sbt::HIT_GROUP_RECORD_STRIDE,
};

/// Staleness flag for a scene's SBT layout, shared with every object whose
/// mutation can change record counts. Kept outside the scene mutex so a GAS
/// or geometry instance can mark it without taking the scene lock.
pub(crate) struct LayoutTracker {
    stale: AtomicBool,
}

impl LayoutTracker {
    fn new() -> Self {
        Self {
            stale: AtomicBool::new(true),
        }
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    fn mark_current(&self) {
        self.stale.store(false, Ordering::Release);
    }

    pub(crate) fn is_current(&self) -> bool {
        !self.stale.load(Ordering::Acquire)
    }
}

pub(crate) struct SceneState {
    /// Registration order; the SBT layout is assigned in this order.
    pub(crate) gases: Vec<GeometryAccelerationStructure>,
    pub(crate) iases: Vec<InstanceAccelerationStructure>,
    /// (GAS id, material set index) -> first SBT record of the block.
    pub(crate) sbt_offsets: HashMap<(u64, u32), u32>,
    pub(crate) record_count: u32,
}

/// Registry of the acceleration structures belonging to one rendering
/// context, and owner of the global SBT record layout.
///
/// The layout assigns every (GAS, material set) pair a contiguous block of
/// hit-group records, in GAS registration order, material-set order within a
/// GAS. Any mutation that can change a record count (registering or removing
/// a GAS, changing material-set or ray-type counts, changing a geometry
/// instance's material count) marks the layout stale; it must then be
/// regenerated before SBT offsets are consumed again.
#[derive(Clone)]
pub struct Scene {
    state: Arc<Mutex<SceneState>>,
    layout: Arc<LayoutTracker>,
    backend: Arc<dyn DeviceBackend>,
    placement: BufferPlacement,
    id: u64,
}

impl Scene {
    pub(crate) fn new(backend: Arc<dyn DeviceBackend>, placement: BufferPlacement) -> Self {
        Self {
            state: Arc::new(Mutex::new(SceneState {
                gases: Vec::new(),
                iases: Vec::new(),
                sbt_offsets: HashMap::new(),
                record_count: 0,
            })),
            layout: Arc::new(LayoutTracker::new()),
            backend,
            placement,
            id: next_object_id(),
        }
    }

    pub fn create_geometry_instance(&self, kind: GeometryKind) -> GeometryInstance {
        GeometryInstance::new(kind, self.layout.clone())
    }

    pub fn create_geometry_acceleration_structure(
        &self,
    ) -> Result<GeometryAccelerationStructure> {
        let gas = GeometryAccelerationStructure::new(
            self.backend.clone(),
            self.placement,
            self.layout.clone(),
        )?;
        self.state.lock().gases.push(gas.clone());
        // a new GAS contributes records once its layout block is assigned
        self.layout.mark_stale();
        Ok(gas)
    }

    pub fn create_instance(&self) -> Instance {
        Instance::new()
    }

    pub fn create_instance_acceleration_structure(
        &self,
    ) -> Result<InstanceAccelerationStructure> {
        let ias = InstanceAccelerationStructure::new(
            self.backend.clone(),
            self.placement,
            Arc::downgrade(&self.state),
            self.layout.clone(),
        )?;
        self.state.lock().iases.push(ias.clone());
        Ok(ias)
    }

    /// Unregister a GAS. Its layout block disappears, so the layout becomes
    /// stale.
    pub fn remove_geometry_acceleration_structure(
        &self,
        gas: &GeometryAccelerationStructure,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let before = state.gases.len();
        state.gases.retain(|g| g.id() != gas.id());
        if state.gases.len() == before {
            return Err(Error::precondition(
                "the acceleration structure is not registered to this scene",
            ));
        }
        self.layout.mark_stale();
        Ok(())
    }

    pub fn remove_instance_acceleration_structure(
        &self,
        ias: &InstanceAccelerationStructure,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let before = state.iases.len();
        state.iases.retain(|i| i.id() != ias.id());
        if state.iases.len() == before {
            return Err(Error::precondition(
                "the acceleration structure is not registered to this scene",
            ));
        }
        Ok(())
    }

    /// Assign every (GAS, material set) pair its contiguous block of SBT
    /// records and return the total table size in bytes. Idempotent while no
    /// structural change happens in between.
    pub fn generate_shader_binding_table_layout(&self) -> u64 {
        let mut state = self.state.lock();
        let mut offsets = HashMap::new();
        let mut next_record = 0u32;
        for gas in &state.gases {
            for material_set in 0..gas.num_material_sets() {
                offsets.insert((gas.id(), material_set), next_record);
                next_record += gas.record_count_for_set(material_set);
            }
        }
        state.sbt_offsets = offsets;
        state.record_count = next_record;
        self.layout.mark_current();
        next_record as u64 * HIT_GROUP_RECORD_STRIDE as u64
    }

    /// Whether the SBT layout is current. Callers populating instance
    /// buffers or hit-group records must check this first.
    pub fn sbt_layout_generation_done(&self) -> bool {
        self.layout.is_current()
    }

    /// First SBT record of the block assigned to `(gas, material_set)`.
    pub fn get_sbt_offset(
        &self,
        gas: &GeometryAccelerationStructure,
        material_set: u32,
    ) -> Result<u32> {
        if !self.layout.is_current() {
            return Err(Error::precondition(
                "the SBT layout is stale; call generate_shader_binding_table_layout first",
            ));
        }
        self.state
            .lock()
            .sbt_offsets
            .get(&(gas.id(), material_set))
            .copied()
            .ok_or(Error::UnknownSbtEntry {
                mat_set: material_set,
            })
    }

    /// True only when the layout is current and every registered structure
    /// has a completed build.
    pub fn is_ready(&self) -> bool {
        if !self.layout.is_current() {
            return false;
        }
        let state = self.state.lock();
        state.gases.iter().all(|gas| gas.is_ready())
            && state.iases.iter().all(|ias| ias.is_ready())
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> &Arc<Mutex<SceneState>> {
        &self.state
    }

    pub(crate) fn layout(&self) -> &Arc<LayoutTracker> {
        &self.layout
    }
}
