use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::pipeline::ProgramGroup;

/// A reusable binding from (pipeline, ray type) to a hit program group, plus
/// a 32-bit user tag written into every hit-group SBT record the material
/// appears in.
///
/// Materials carry no GPU-visible state of their own; they are lookup tables
/// consulted when a [`Pipeline`] assembles hit-group records. The user tag is
/// meant to index a caller-managed material-data array, so changing material
/// parameters happens entirely in caller memory. Changing the tag itself
/// after records were written requires the caller to refresh the SBT
/// (see [`Pipeline::mark_hit_group_sbt_dirty`]).
///
/// [`Pipeline`]: crate::pipeline::Pipeline
/// [`Pipeline::mark_hit_group_sbt_dirty`]: crate::pipeline::Pipeline::mark_hit_group_sbt_dirty
#[derive(Clone)]
pub struct Material {
    state: Arc<Mutex<MaterialState>>,
}

struct MaterialState {
    user_data: u32,
    hit_groups: HashMap<(u64, u32), ProgramGroup>,
}

impl Material {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MaterialState {
                user_data: 0,
                hit_groups: HashMap::new(),
            })),
        }
    }

    /// Insert or overwrite the hit program binding for `ray_type` on the
    /// program group's owning pipeline.
    pub fn set_hit_group(&self, ray_type: u32, hit_group: &ProgramGroup) {
        self.state
            .lock()
            .hit_groups
            .insert((hit_group.pipeline_id(), ray_type), hit_group.clone());
    }

    /// Set the 32-bit tag written into this material's SBT records.
    pub fn set_user_data(&self, data: u32) {
        self.state.lock().user_data = data;
    }

    pub(crate) fn user_data(&self) -> u32 {
        self.state.lock().user_data
    }

    pub(crate) fn hit_group(&self, pipeline_id: u64, ray_type: u32) -> Option<ProgramGroup> {
        self.state
            .lock()
            .hit_groups
            .get(&(pipeline_id, ray_type))
            .cloned()
    }
}
