use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    device::{
        BufferPlacement, BufferView, DeviceBackend, DeviceBuffer, DevicePtr, PipelineHandle,
        ProgramGroupHandle, SbtRegion, ShaderBindingTableView, Stream,
    },
    error::{Error, Result},
    next_object_id,
    sbt::{HEADER_ONLY_RECORD_STRIDE, HIT_GROUP_RECORD_STRIDE, RECORD_HEADER_SIZE},
    scene::Scene,
};

/// A compiled device program group, wrapped so SBT assembly can pack its
/// record header and check which pipeline it belongs to. Compilation itself
/// happens outside the crate; the wrapped handle is consumed, never mutated.
#[derive(Clone)]
pub struct ProgramGroup {
    raw: ProgramGroupHandle,
    pipeline_id: u64,
    backend: Arc<dyn DeviceBackend>,
}

impl ProgramGroup {
    pub(crate) fn pipeline_id(&self) -> u64 {
        self.pipeline_id
    }

    pub(crate) fn pack_header(&self, header: &mut [u8]) -> Result<()> {
        self.backend
            .pack_record_header(self.raw, &mut header[..RECORD_HEADER_SIZE])?;
        Ok(())
    }
}

/// Owner of the program bindings of one ray-tracing pipeline and assembler
/// of its shader binding table.
///
/// Four record categories are maintained internally (one ray-generation
/// record, at most one exception record, one miss record per declared ray
/// type, one callable record per registered index); the hit-group category
/// lives in a caller-owned buffer populated by [`setup_hit_group_sbt`].
/// `launch` refreshes whatever is stale and validates the whole table before
/// submitting, because launching with an incomplete table is undefined
/// behavior on the device.
///
/// [`setup_hit_group_sbt`]: Pipeline::setup_hit_group_sbt
#[derive(Clone)]
pub struct Pipeline {
    state: Arc<Mutex<PipelineState>>,
    backend: Arc<dyn DeviceBackend>,
    id: u64,
}

struct PipelineState {
    backend: Arc<dyn DeviceBackend>,
    placement: BufferPlacement,
    raw: Option<PipelineHandle>,
    scene: Option<Scene>,
    ray_generation: Option<ProgramGroup>,
    exception: Option<ProgramGroup>,
    miss: Vec<Option<ProgramGroup>>,
    callable: Vec<Option<ProgramGroup>>,
    ray_generation_records: Option<BufferView>,
    exception_records: Option<BufferView>,
    miss_records: Option<BufferView>,
    callable_records: Option<BufferView>,
    hit_group_sbt: Option<BufferView>,
    records_up_to_date: bool,
    hit_group_up_to_date: bool,
}

impl Pipeline {
    pub(crate) fn new(backend: Arc<dyn DeviceBackend>, placement: BufferPlacement) -> Self {
        Self {
            state: Arc::new(Mutex::new(PipelineState {
                backend: backend.clone(),
                placement,
                raw: None,
                scene: None,
                ray_generation: None,
                exception: None,
                miss: Vec::new(),
                callable: Vec::new(),
                ray_generation_records: None,
                exception_records: None,
                miss_records: None,
                callable_records: None,
                hit_group_sbt: None,
                records_up_to_date: false,
                hit_group_up_to_date: false,
            })),
            backend,
            id: next_object_id(),
        }
    }

    /// Wrap a caller-compiled native program group, tying it to this
    /// pipeline for hit-group lookups and header packing.
    pub fn create_program_group(&self, raw: ProgramGroupHandle) -> ProgramGroup {
        ProgramGroup {
            raw,
            pipeline_id: self.id,
            backend: self.backend.clone(),
        }
    }

    /// Register the linked native pipeline. Launching is refused until this
    /// has been called.
    pub fn link(&self, raw: PipelineHandle) {
        self.state.lock().raw = Some(raw);
    }

    /// Declare how many miss ray types the pipeline serves; one miss record
    /// per ray type.
    pub fn set_num_miss_ray_types(&self, count: u32) {
        let mut state = self.state.lock();
        state.miss.resize(count as usize, None);
        state.records_up_to_date = false;
    }

    pub fn set_ray_generation_program(&self, program: &ProgramGroup) -> Result<()> {
        let mut state = self.state.lock();
        self.check_ownership(program)?;
        state.ray_generation = Some(program.clone());
        state.records_up_to_date = false;
        Ok(())
    }

    pub fn set_exception_program(&self, program: &ProgramGroup) -> Result<()> {
        let mut state = self.state.lock();
        self.check_ownership(program)?;
        state.exception = Some(program.clone());
        state.records_up_to_date = false;
        Ok(())
    }

    pub fn set_miss_program(&self, ray_type: u32, program: &ProgramGroup) -> Result<()> {
        let mut state = self.state.lock();
        self.check_ownership(program)?;
        let declared = state.miss.len();
        match state.miss.get_mut(ray_type as usize) {
            Some(slot) => {
                *slot = Some(program.clone());
                state.records_up_to_date = false;
                Ok(())
            }
            None => Err(Error::precondition(format!(
                "miss ray type {ray_type} out of range ({declared} declared; call set_num_miss_ray_types first)"
            ))),
        }
    }

    pub fn set_callable_program(&self, index: u32, program: &ProgramGroup) -> Result<()> {
        let mut state = self.state.lock();
        self.check_ownership(program)?;
        if state.callable.len() <= index as usize {
            state.callable.resize(index as usize + 1, None);
        }
        state.callable[index as usize] = Some(program.clone());
        state.records_up_to_date = false;
        Ok(())
    }

    /// Bind the scene whose structures and SBT layout launches traverse.
    pub fn set_scene(&self, scene: &Scene) {
        let mut state = self.state.lock();
        state.scene = Some(scene.clone());
        state.hit_group_up_to_date = false;
    }

    /// Fill the caller-owned hit-group SBT buffer for `scene`: one record per
    /// (geometry instance, ray type) of every (GAS, material set) pair in the
    /// scene's offset table, written on `stream`. The record header is the
    /// packed program-group header of the material's binding for the ray
    /// type; the payload is the material and geometry-instance user tags.
    ///
    /// Binds `scene` to the pipeline if it was not bound already.
    pub fn setup_hit_group_sbt(
        &self,
        stream: Stream,
        scene: &Scene,
        buffer: &dyn DeviceBuffer,
    ) -> Result<()> {
        let mut state = self.state.lock();
        match &state.scene {
            Some(bound) if bound.id() == scene.id() => {}
            Some(_) => {
                log::warn!("setup_hit_group_sbt rebinds the pipeline to a different scene");
                state.scene = Some(scene.clone());
            }
            None => state.scene = Some(scene.clone()),
        }

        let records = assemble_hit_group_records(self.id, scene)?;
        let view = BufferView::of(buffer);
        if view.size < records.len() as u64 {
            return Err(Error::BufferTooSmall {
                what: "hit group SBT",
                size: view.size,
                required: records.len() as u64,
            });
        }
        if !records.is_empty() {
            state.backend.upload(stream, view.ptr, &records)?;
        }
        state.hit_group_sbt = Some(view);
        state.hit_group_up_to_date = true;
        Ok(())
    }

    /// Tell the pipeline the hit-group SBT contents it last wrote are stale
    /// (for example after materials or program bindings changed). The next
    /// launch rewrites the buffer before submitting.
    ///
    /// Callers who double-buffer the SBT themselves and swap buffers
    /// asynchronously own the consistency of that scheme; the crate only
    /// tracks the buffer it wrote last.
    pub fn mark_hit_group_sbt_dirty(&self) {
        self.state.lock().hit_group_up_to_date = false;
    }

    /// Validate the pipeline and its shader binding table, refresh whatever
    /// record category is stale, and enqueue a launch over an
    /// `x * y * z` grid reading launch parameters at `params`.
    pub fn launch(
        &self,
        stream: Stream,
        params: DevicePtr,
        dim_x: u32,
        dim_y: u32,
        dim_z: u32,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let raw = state
            .raw
            .ok_or_else(|| Error::precondition("the pipeline has not been linked"))?;
        let scene = state
            .scene
            .clone()
            .ok_or_else(|| Error::precondition("no scene is bound to the pipeline"))?;
        if !scene.is_ready() {
            return Err(Error::precondition(
                "the bound scene is not ready: stale SBT layout or unbuilt acceleration structure",
            ));
        }
        let hit_view = state
            .hit_group_sbt
            .ok_or_else(|| Error::SbtNotReady("setup_hit_group_sbt has not been called".into()))?;

        if !state.records_up_to_date {
            refresh_category_records(&mut state, stream)?;
        }
        if !state.hit_group_up_to_date {
            let records = assemble_hit_group_records(self.id, &scene)?;
            if hit_view.size < records.len() as u64 {
                return Err(Error::BufferTooSmall {
                    what: "hit group SBT",
                    size: hit_view.size,
                    required: records.len() as u64,
                });
            }
            if !records.is_empty() {
                state.backend.upload(stream, hit_view.ptr, &records)?;
            }
            state.hit_group_up_to_date = true;
        }

        let hit_record_count = scene.state().lock().record_count;
        let sbt = ShaderBindingTableView {
            ray_generation: region(state.ray_generation_records, 1),
            exception: region(
                state.exception_records,
                state.exception.is_some() as u32,
            ),
            miss: region(state.miss_records, state.miss.len() as u32),
            hit_group: SbtRegion {
                base: hit_view.ptr,
                stride: HIT_GROUP_RECORD_STRIDE as u32,
                count: hit_record_count,
            },
            callable: region(state.callable_records, state.callable.len() as u32),
        };
        state
            .backend
            .launch(stream, raw, &sbt, params, [dim_x, dim_y, dim_z])?;
        Ok(())
    }

    fn check_ownership(&self, program: &ProgramGroup) -> Result<()> {
        if program.pipeline_id() != self.id {
            return Err(Error::precondition(
                "the program group belongs to a different pipeline",
            ));
        }
        Ok(())
    }
}

fn region(view: Option<BufferView>, count: u32) -> SbtRegion {
    match view {
        Some(view) if count > 0 => SbtRegion {
            base: view.ptr,
            stride: HEADER_ONLY_RECORD_STRIDE as u32,
            count,
        },
        _ => SbtRegion::default(),
    }
}

/// Upload the ray-generation, exception, miss and callable record
/// categories into internally managed buffers.
fn refresh_category_records(state: &mut PipelineState, stream: Stream) -> Result<()> {
    let ray_generation = state
        .ray_generation
        .clone()
        .ok_or_else(|| Error::SbtNotReady("no ray generation program is set".into()))?;

    let mut header = vec![0u8; RECORD_HEADER_SIZE];
    ray_generation.pack_header(&mut header)?;
    let view = ensure_buffer(
        state,
        Category::RayGeneration,
        HEADER_ONLY_RECORD_STRIDE as u64,
    )?;
    state.backend.upload(stream, view.ptr, &header)?;

    if let Some(exception) = state.exception.clone() {
        exception.pack_header(&mut header)?;
        let view = ensure_buffer(state, Category::Exception, HEADER_ONLY_RECORD_STRIDE as u64)?;
        state.backend.upload(stream, view.ptr, &header)?;
    }

    for (category, programs) in [
        (Category::Miss, state.miss.clone()),
        (Category::Callable, state.callable.clone()),
    ] {
        if programs.is_empty() {
            continue;
        }
        let mut records = vec![0u8; programs.len() * HEADER_ONLY_RECORD_STRIDE];
        for (index, program) in programs.iter().enumerate() {
            let program = program.as_ref().ok_or_else(|| {
                Error::SbtNotReady(format!(
                    "no {} program is set at index {index}",
                    category.label()
                ))
            })?;
            let base = index * HEADER_ONLY_RECORD_STRIDE;
            program.pack_header(&mut records[base..base + RECORD_HEADER_SIZE])?;
        }
        let view = ensure_buffer(state, category, records.len() as u64)?;
        state.backend.upload(stream, view.ptr, &records)?;
    }

    state.records_up_to_date = true;
    Ok(())
}

#[derive(Copy, Clone)]
enum Category {
    RayGeneration,
    Exception,
    Miss,
    Callable,
}

impl Category {
    fn label(self) -> &'static str {
        match self {
            Category::RayGeneration => "ray generation",
            Category::Exception => "exception",
            Category::Miss => "miss",
            Category::Callable => "callable",
        }
    }

    fn slot(self, state: &mut PipelineState) -> &mut Option<BufferView> {
        match self {
            Category::RayGeneration => &mut state.ray_generation_records,
            Category::Exception => &mut state.exception_records,
            Category::Miss => &mut state.miss_records,
            Category::Callable => &mut state.callable_records,
        }
    }
}

/// Reuse the category's record buffer when it is large enough, otherwise
/// replace it.
fn ensure_buffer(state: &mut PipelineState, category: Category, size: u64) -> Result<BufferView> {
    let backend = state.backend.clone();
    let placement = state.placement;
    let slot = category.slot(state);
    if let Some(view) = *slot {
        if view.size >= size {
            return Ok(view);
        }
        backend.deallocate(view);
        *slot = None;
    }
    let view = backend.allocate(size, placement, category.label())?;
    *slot = Some(view);
    Ok(view)
}

/// Walk the scene's registered GAS set in layout order and produce the full
/// hit-group record array. The scene's SBT layout must be current.
fn assemble_hit_group_records(pipeline_id: u64, scene: &Scene) -> Result<Vec<u8>> {
    if !scene.sbt_layout_generation_done() {
        return Err(Error::precondition(
            "the SBT layout is stale; call generate_shader_binding_table_layout first",
        ));
    }
    let scene_state = scene.state().lock();
    let mut records = Vec::with_capacity(scene_state.record_count as usize * HIT_GROUP_RECORD_STRIDE);
    for gas in &scene_state.gases {
        for material_set in 0..gas.num_material_sets() {
            let offset = scene_state
                .sbt_offsets
                .get(&(gas.id(), material_set))
                .copied();
            let Some(offset) = offset else {
                debug_assert!(false, "current layout is missing a registered (GAS, set) pair");
                return Err(Error::UnknownSbtEntry {
                    mat_set: material_set,
                });
            };
            debug_assert_eq!(records.len(), offset as usize * HIT_GROUP_RECORD_STRIDE);
            gas.fill_hit_group_records(pipeline_id, material_set, &mut records)?;
        }
    }
    debug_assert_eq!(
        records.len(),
        scene_state.record_count as usize * HIT_GROUP_RECORD_STRIDE
    );
    Ok(records)
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        for view in [
            self.ray_generation_records.take(),
            self.exception_records.take(),
            self.miss_records.take(),
            self.callable_records.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.backend.deallocate(view);
        }
    }
}
