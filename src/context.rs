use std::sync::Arc;

use crate::{
    device::{BufferPlacement, DeviceBackend},
    material::Material,
    pipeline::Pipeline,
    scene::Scene,
};

/// Entry point tying every object to one device backend and one buffer
/// placement policy.
///
/// The placement applies only to the small internal allocations the crate
/// makes through the backend (record-category buffers, compacted-size
/// readback slots); all bulk memory is caller-supplied.
#[derive(Clone)]
pub struct Context {
    backend: Arc<dyn DeviceBackend>,
    placement: BufferPlacement,
}

impl Context {
    pub fn new(backend: Arc<dyn DeviceBackend>, placement: BufferPlacement) -> Self {
        Self { backend, placement }
    }

    pub fn create_material(&self) -> Material {
        Material::new()
    }

    pub fn create_scene(&self) -> Scene {
        Scene::new(self.backend.clone(), self.placement)
    }

    pub fn create_pipeline(&self) -> Pipeline {
        Pipeline::new(self.backend.clone(), self.placement)
    }
}
