use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    device::{BufferView, BuildInput, DeviceBuffer, DevicePtr, GeometryFlags},
    error::{Error, Result},
    material::Material,
    next_object_id,
    scene::LayoutTracker,
    sbt::{HitGroupRecordData, RECORD_HEADER_SIZE},
};

/// Which primitive representation a [`GeometryInstance`] carries. Chosen at
/// creation and never reinterpreted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GeometryKind {
    /// Triangle mesh: a vertex buffer plus an optional u32-triple index
    /// buffer.
    Triangles,
    /// User-defined primitives described by an axis-aligned bounding-box
    /// buffer, intersected by a custom program.
    CustomPrimitives,
}

enum GeometrySpec {
    Triangles {
        vertex_buffer: Option<BufferView>,
        vertex_stride: u32,
        vertex_count: u32,
        index_buffer: Option<BufferView>,
        primitive_count: u32,
    },
    CustomPrimitives {
        aabb_buffer: Option<BufferView>,
        primitive_count: u32,
    },
}

/// One piece of renderable geometry plus its per-material-set material
/// bindings.
///
/// A geometry instance contributes one SBT record per declared material per
/// ray type of whichever GAS material set is selected. Material-set arrays
/// stay rectangular by construction: every set holds exactly the declared
/// material count.
///
/// Geometry buffers are snapshotted when set. Re-registering a buffer with
/// the same element count and format followed by `update()` on the owning
/// GAS is the supported deformation path; changing counts or formats
/// requires a full `prepare_for_build()` + `rebuild()`.
#[derive(Clone)]
pub struct GeometryInstance {
    state: Arc<Mutex<GeometryInstanceState>>,
    layout: Arc<LayoutTracker>,
    id: u64,
}

struct GeometryInstanceState {
    user_data: u32,
    geometry: GeometrySpec,
    primitive_index_offset: u32,
    material_index_buffer: Option<BufferView>,
    flags_per_record: Vec<GeometryFlags>,
    material_sets: Vec<Vec<Option<Material>>>,
}

impl GeometryInstance {
    pub(crate) fn new(kind: GeometryKind, layout: Arc<LayoutTracker>) -> Self {
        let geometry = match kind {
            GeometryKind::Triangles => GeometrySpec::Triangles {
                vertex_buffer: None,
                vertex_stride: 0,
                vertex_count: 0,
                index_buffer: None,
                primitive_count: 0,
            },
            GeometryKind::CustomPrimitives => GeometrySpec::CustomPrimitives {
                aabb_buffer: None,
                primitive_count: 0,
            },
        };
        Self {
            state: Arc::new(Mutex::new(GeometryInstanceState {
                user_data: 0,
                geometry,
                primitive_index_offset: 0,
                material_index_buffer: None,
                // a new instance declares a single material
                flags_per_record: vec![GeometryFlags::NONE],
                material_sets: Vec::new(),
            })),
            layout,
            id: next_object_id(),
        }
    }

    pub fn kind(&self) -> GeometryKind {
        match self.state.lock().geometry {
            GeometrySpec::Triangles { .. } => GeometryKind::Triangles,
            GeometrySpec::CustomPrimitives { .. } => GeometryKind::CustomPrimitives,
        }
    }

    /// Register the vertex buffer of a triangle-mesh instance.
    pub fn set_vertex_buffer(
        &self,
        buffer: &dyn DeviceBuffer,
        stride: u32,
        count: u32,
    ) -> Result<()> {
        let mut state = self.state.lock();
        match &mut state.geometry {
            GeometrySpec::Triangles {
                vertex_buffer,
                vertex_stride,
                vertex_count,
                ..
            } => {
                *vertex_buffer = Some(BufferView::of(buffer));
                *vertex_stride = stride;
                *vertex_count = count;
                Ok(())
            }
            GeometrySpec::CustomPrimitives { .. } => Err(Error::precondition(
                "vertex buffers apply only to triangle-mesh geometry instances",
            )),
        }
    }

    /// Register the u32-triple index buffer of a triangle-mesh instance.
    pub fn set_triangle_buffer(&self, buffer: &dyn DeviceBuffer, triangle_count: u32) -> Result<()> {
        let mut state = self.state.lock();
        match &mut state.geometry {
            GeometrySpec::Triangles {
                index_buffer,
                primitive_count,
                ..
            } => {
                *index_buffer = Some(BufferView::of(buffer));
                *primitive_count = triangle_count;
                Ok(())
            }
            GeometrySpec::CustomPrimitives { .. } => Err(Error::precondition(
                "triangle buffers apply only to triangle-mesh geometry instances",
            )),
        }
    }

    /// Register the bounding-box buffer of a custom-primitive instance.
    pub fn set_custom_primitive_aabb_buffer(
        &self,
        buffer: &dyn DeviceBuffer,
        count: u32,
    ) -> Result<()> {
        let mut state = self.state.lock();
        match &mut state.geometry {
            GeometrySpec::CustomPrimitives {
                aabb_buffer,
                primitive_count,
            } => {
                *aabb_buffer = Some(BufferView::of(buffer));
                *primitive_count = count;
                Ok(())
            }
            GeometrySpec::Triangles { .. } => Err(Error::precondition(
                "AABB buffers apply only to custom-primitive geometry instances",
            )),
        }
    }

    /// Offset added to the primitive index reported to device programs.
    pub fn set_primitive_index_offset(&self, offset: u32) {
        self.state.lock().primitive_index_offset = offset;
    }

    /// Declare how many materials (SBT records per ray type) this instance
    /// contributes. With more than one material a per-primitive
    /// material-index buffer is required at build time.
    ///
    /// Changes the instance's record count, so the owning scene's SBT layout
    /// becomes stale.
    pub fn set_num_materials(&self, count: u32, material_index_buffer: Option<&dyn DeviceBuffer>) {
        let mut state = self.state.lock();
        state
            .flags_per_record
            .resize(count as usize, GeometryFlags::NONE);
        for set in &mut state.material_sets {
            set.resize(count as usize, None);
        }
        state.material_index_buffer = material_index_buffer.map(BufferView::of);
        self.layout.mark_stale();
    }

    /// Set the build-input flags of one material slot.
    pub fn set_geometry_flags(&self, material_index: u32, flags: GeometryFlags) -> Result<()> {
        let mut state = self.state.lock();
        let num_materials = state.flags_per_record.len();
        match state.flags_per_record.get_mut(material_index as usize) {
            Some(slot) => {
                *slot = flags;
                Ok(())
            }
            None => Err(Error::precondition(format!(
                "material index {material_index} out of range ({num_materials} materials declared)"
            ))),
        }
    }

    /// Bind a material to one slot of one material set. Sets are grown on
    /// demand; every set keeps exactly the declared material count.
    pub fn set_material(&self, material_set: u32, material_index: u32, material: &Material) -> Result<()> {
        let mut state = self.state.lock();
        let num_materials = state.flags_per_record.len();
        if material_index as usize >= num_materials {
            return Err(Error::precondition(format!(
                "material index {material_index} out of range ({num_materials} materials declared)"
            )));
        }
        if state.material_sets.len() <= material_set as usize {
            state
                .material_sets
                .resize_with(material_set as usize + 1, || vec![None; num_materials]);
        }
        state.material_sets[material_set as usize][material_index as usize] =
            Some(material.clone());
        Ok(())
    }

    /// Set the 32-bit tag written into every hit-group SBT record of this
    /// instance.
    pub fn set_user_data(&self, data: u32) {
        self.state.lock().user_data = data;
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// SBT records this instance contributes per ray type.
    pub(crate) fn record_count(&self) -> u32 {
        self.state.lock().flags_per_record.len() as u32
    }

    /// Assemble the native build-input descriptor from the current buffers.
    pub(crate) fn build_input(&self, pre_transform: Option<DevicePtr>) -> Result<BuildInput> {
        let state = self.state.lock();
        if state.flags_per_record.len() > 1 && state.material_index_buffer.is_none() {
            return Err(Error::precondition(
                "a material index buffer is required when more than one material is declared",
            ));
        }
        match &state.geometry {
            GeometrySpec::Triangles {
                vertex_buffer,
                vertex_stride,
                vertex_count,
                index_buffer,
                primitive_count,
            } => {
                let vertex_buffer = vertex_buffer.ok_or_else(|| {
                    Error::precondition("geometry instance has no vertex buffer set")
                })?;
                let primitive_count = if index_buffer.is_some() {
                    *primitive_count
                } else {
                    *vertex_count / 3
                };
                Ok(BuildInput::TriangleMesh {
                    vertex_buffer,
                    vertex_stride: *vertex_stride,
                    vertex_count: *vertex_count,
                    index_buffer: *index_buffer,
                    primitive_count,
                    primitive_index_offset: state.primitive_index_offset,
                    flags_per_record: state.flags_per_record.clone(),
                    material_index_buffer: state.material_index_buffer,
                    pre_transform,
                })
            }
            GeometrySpec::CustomPrimitives {
                aabb_buffer,
                primitive_count,
            } => {
                let aabb_buffer = aabb_buffer.ok_or_else(|| {
                    Error::precondition("geometry instance has no AABB buffer set")
                })?;
                Ok(BuildInput::CustomPrimitives {
                    aabb_buffer,
                    primitive_count: *primitive_count,
                    primitive_index_offset: state.primitive_index_offset,
                    flags_per_record: state.flags_per_record.clone(),
                    material_index_buffer: state.material_index_buffer,
                })
            }
        }
    }

    /// Write this instance's hit-group records for one material set into
    /// `records`, one record per (material slot, ray type), and return how
    /// many were written.
    pub(crate) fn fill_hit_group_records(
        &self,
        pipeline_id: u64,
        material_set: u32,
        num_ray_types: u32,
        records: &mut Vec<u8>,
    ) -> Result<u32> {
        let state = self.state.lock();
        let num_materials = state.flags_per_record.len();
        let set = state.material_sets.get(material_set as usize);
        let mut written = 0;
        for material_index in 0..num_materials {
            let material = set
                .and_then(|s| s[material_index].clone())
                .ok_or_else(|| {
                    Error::SbtNotReady(format!(
                        "no material bound at slot {material_index} of material set {material_set}"
                    ))
                })?;
            for ray_type in 0..num_ray_types {
                let hit_group =
                    material.hit_group(pipeline_id, ray_type).ok_or_else(|| {
                        Error::SbtNotReady(format!(
                            "material at slot {material_index} has no hit group for ray type {ray_type}"
                        ))
                    })?;
                let base = records.len();
                records.resize(base + RECORD_HEADER_SIZE, 0);
                hit_group.pack_header(&mut records[base..])?;
                let data = HitGroupRecordData {
                    material_data: material.user_data(),
                    geometry_instance_data: state.user_data,
                };
                records.extend_from_slice(bytemuck::bytes_of(&data));
                // pad to the record stride
                records.resize(
                    base + crate::sbt::HIT_GROUP_RECORD_STRIDE,
                    0,
                );
                written += 1;
            }
        }
        Ok(written)
    }
}
