use std::sync::Arc;

use glam::Mat4;
use parking_lot::Mutex;

use crate::{
    acceleration_structures::geometry_accel::GeometryAccelerationStructure, next_object_id,
};

const IDENTITY_TRANSFORM: [f32; 12] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0,
];

/// What an [`Instance`] places in the top-level structure. A tagged variant
/// so future transform-node targets never alias the GAS fields.
pub(crate) enum InstanceTarget {
    Gas {
        gas: GeometryAccelerationStructure,
        material_set: u32,
    },
}

/// A placement of one GAS with a row-major 3x4 affine transform, contributed
/// to an [`InstanceAccelerationStructure`].
///
/// [`InstanceAccelerationStructure`]: crate::acceleration_structures::instance_accel::InstanceAccelerationStructure
#[derive(Clone)]
pub struct Instance {
    state: Arc<Mutex<InstanceState>>,
    id: u64,
}

pub(crate) struct InstanceState {
    pub(crate) target: Option<InstanceTarget>,
    pub(crate) transform: [f32; 12],
    pub(crate) instance_id: u32,
    pub(crate) visibility_mask: u8,
}

impl Instance {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InstanceState {
                target: None,
                transform: IDENTITY_TRANSFORM,
                instance_id: 0,
                visibility_mask: 0xff,
            })),
            id: next_object_id(),
        }
    }

    /// Point this instance at a GAS, selecting which of its material sets
    /// the SBT offset is drawn from.
    pub fn set_gas(&self, gas: &GeometryAccelerationStructure, material_set: u32) {
        self.state.lock().target = Some(InstanceTarget::Gas {
            gas: gas.clone(),
            material_set,
        });
    }

    /// Set the row-major 3x4 object-to-world transform.
    pub fn set_transform(&self, transform: &[f32; 12]) {
        self.state.lock().transform = *transform;
    }

    /// Set the transform from a matrix; the translation lives in the fourth
    /// column.
    pub fn set_transform_matrix(&self, matrix: &Mat4) {
        let mut transform = [0.0f32; 12];
        transform[0..4].copy_from_slice(&matrix.row(0).to_array());
        transform[4..8].copy_from_slice(&matrix.row(1).to_array());
        transform[8..12].copy_from_slice(&matrix.row(2).to_array());
        self.state.lock().transform = transform;
    }

    /// The user instance id reported to device programs for hits under this
    /// instance.
    pub fn set_id(&self, id: u32) {
        self.state.lock().instance_id = id;
    }

    /// Rays only intersect this instance when `ray mask & visibility mask`
    /// is non-zero. Defaults to `0xff`.
    pub fn set_visibility_mask(&self, mask: u8) {
        self.state.lock().visibility_mask = mask;
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> &Arc<Mutex<InstanceState>> {
        &self.state
    }
}
