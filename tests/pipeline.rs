mod common;

use std::sync::Arc;

use common::{FakeBackend, FakeBuffer, STREAM};
use rtstage::device::{DeviceBuffer, PipelineHandle, ProgramGroupHandle};
use rtstage::sbt::{HEADER_ONLY_RECORD_STRIDE, HIT_GROUP_RECORD_STRIDE, RECORD_HEADER_SIZE};
use rtstage::{Context, Error, GeometryAccelerationStructure, Material, Pipeline, Scene};

const RAYGEN: ProgramGroupHandle = ProgramGroupHandle(0x10);
const MISS: ProgramGroupHandle = ProgramGroupHandle(0x20);
const HIT: ProgramGroupHandle = ProgramGroupHandle(0xAB);

struct Fixture {
    backend: Arc<FakeBackend>,
    scene: Scene,
    gas: GeometryAccelerationStructure,
    material: Material,
    pipeline: Pipeline,
    sbt_buffer: FakeBuffer,
}

/// One built GAS with one material, a generated layout and a fully
/// programmed pipeline, stopping just short of `setup_hit_group_sbt`.
fn fixture(context: &Context, backend: &Arc<FakeBackend>) -> Fixture {
    let scene = context.create_scene();
    let pipeline = context.create_pipeline();

    let material = context.create_material();
    material.set_user_data(7);
    material.set_hit_group(0, &pipeline.create_program_group(HIT));

    let geometry = common::quad_geometry(&scene, backend);
    geometry.set_user_data(9);
    geometry.set_material(0, 0, &material).unwrap();

    let gas = scene.create_geometry_acceleration_structure().unwrap();
    gas.add_child(&geometry, None).unwrap();
    let requirements = gas.prepare_for_build().unwrap();
    let accel = FakeBuffer::alloc(backend, requirements.accel_size);
    let scratch = FakeBuffer::alloc(backend, requirements.scratch_size);
    gas.rebuild(STREAM, &accel, &scratch).unwrap();

    let table_size = scene.generate_shader_binding_table_layout();
    let sbt_buffer = FakeBuffer::alloc(backend, table_size);

    pipeline.link(PipelineHandle(1));
    pipeline
        .set_ray_generation_program(&pipeline.create_program_group(RAYGEN))
        .unwrap();
    pipeline.set_num_miss_ray_types(1);
    pipeline
        .set_miss_program(0, &pipeline.create_program_group(MISS))
        .unwrap();
    pipeline.set_scene(&scene);

    Fixture {
        backend: backend.clone(),
        scene,
        gas,
        material,
        pipeline,
        sbt_buffer,
    }
}

#[test]
fn launch_validates_the_whole_setup() {
    let (backend, context) = common::context();
    let scene = context.create_scene();
    let pipeline = context.create_pipeline();

    // not linked
    assert!(matches!(
        pipeline.launch(STREAM, 0x999, 1, 1, 1),
        Err(Error::Precondition(_))
    ));

    pipeline.link(PipelineHandle(1));
    // no scene bound
    assert!(matches!(
        pipeline.launch(STREAM, 0x999, 1, 1, 1),
        Err(Error::Precondition(_))
    ));

    let geometry = common::quad_geometry(&scene, &backend);
    let gas = scene.create_geometry_acceleration_structure().unwrap();
    gas.add_child(&geometry, None).unwrap();
    pipeline.set_scene(&scene);
    // scene has an unbuilt structure
    assert!(matches!(
        pipeline.launch(STREAM, 0x999, 1, 1, 1),
        Err(Error::Precondition(_))
    ));
}

#[test]
fn launch_requires_hit_group_setup() {
    let (backend, context) = common::context();
    let f = fixture(&context, &backend);
    assert!(matches!(
        f.pipeline.launch(STREAM, 0x999, 1, 1, 1),
        Err(Error::SbtNotReady(_))
    ));

    f.pipeline
        .setup_hit_group_sbt(STREAM, &f.scene, &f.sbt_buffer)
        .unwrap();
    f.pipeline.launch(STREAM, 0x999, 640, 480, 1).unwrap();
    assert_eq!(f.backend.launches().len(), 1);
}

#[test]
fn hit_group_records_carry_material_bindings() {
    let (backend, context) = common::context();
    let f = fixture(&context, &backend);
    f.pipeline
        .setup_hit_group_sbt(STREAM, &f.scene, &f.sbt_buffer)
        .unwrap();

    let bytes = f.backend.uploaded(f.sbt_buffer.device_ptr()).unwrap();
    assert_eq!(bytes.len(), HIT_GROUP_RECORD_STRIDE);
    // header carries the packed hit program group
    assert_eq!(bytes[..8], HIT.0.to_le_bytes());
    // payload carries the material and geometry-instance tags
    let payload = RECORD_HEADER_SIZE;
    assert_eq!(bytes[payload..payload + 4], 7u32.to_le_bytes());
    assert_eq!(bytes[payload + 4..payload + 8], 9u32.to_le_bytes());
}

#[test]
fn launch_reports_all_sbt_regions() {
    let (backend, context) = common::context();
    let f = fixture(&context, &backend);
    f.pipeline
        .setup_hit_group_sbt(STREAM, &f.scene, &f.sbt_buffer)
        .unwrap();
    f.pipeline.launch(STREAM, 0x999, 640, 480, 1).unwrap();

    let launches = f.backend.launches();
    let launch = &launches[0];
    assert_eq!(launch.pipeline, PipelineHandle(1));
    assert_eq!(launch.params, 0x999);
    assert_eq!(launch.dimensions, [640, 480, 1]);

    let sbt = &launch.sbt;
    assert_eq!(sbt.ray_generation.count, 1);
    assert_eq!(sbt.ray_generation.stride as usize, HEADER_ONLY_RECORD_STRIDE);
    assert_eq!(sbt.miss.count, 1);
    assert_eq!(sbt.hit_group.base, f.sbt_buffer.device_ptr());
    assert_eq!(sbt.hit_group.stride as usize, HIT_GROUP_RECORD_STRIDE);
    assert_eq!(sbt.hit_group.count, 1);
    assert_eq!(sbt.exception.count, 0);
    assert_eq!(sbt.callable.count, 0);

    // the ray generation record was packed and uploaded
    let raygen = f.backend.uploaded(sbt.ray_generation.base).unwrap();
    assert_eq!(raygen[..8], RAYGEN.0.to_le_bytes());
}

#[test]
fn setup_requires_generated_layout() {
    let (backend, context) = common::context();
    let f = fixture(&context, &backend);
    // a record-count mutation makes the generated layout stale
    f.gas.set_num_material_sets(2);
    assert!(matches!(
        f.pipeline
            .setup_hit_group_sbt(STREAM, &f.scene, &f.sbt_buffer),
        Err(Error::Precondition(_))
    ));
}

#[test]
fn setup_rejects_undersized_buffer() {
    let (backend, context) = common::context();
    let f = fixture(&context, &backend);
    let small = FakeBuffer::alloc(&backend, HIT_GROUP_RECORD_STRIDE as u64 - 1);
    assert!(matches!(
        f.pipeline.setup_hit_group_sbt(STREAM, &f.scene, &small),
        Err(Error::BufferTooSmall { .. })
    ));
}

#[test]
fn missing_hit_group_binding_is_reported() {
    let (backend, context) = common::context();
    let f = fixture(&context, &backend);
    // a second ray type the material has no binding for
    f.gas.set_num_ray_types(0, 2).unwrap();
    let table_size = f.scene.generate_shader_binding_table_layout();
    let buffer = FakeBuffer::alloc(&backend, table_size);
    assert!(matches!(
        f.pipeline.setup_hit_group_sbt(STREAM, &f.scene, &buffer),
        Err(Error::SbtNotReady(_))
    ));
}

#[test]
fn every_declared_miss_slot_must_be_programmed() {
    let (backend, context) = common::context();
    let f = fixture(&context, &backend);
    f.pipeline
        .setup_hit_group_sbt(STREAM, &f.scene, &f.sbt_buffer)
        .unwrap();
    f.pipeline.set_num_miss_ray_types(2);
    assert!(matches!(
        f.pipeline.launch(STREAM, 0x999, 1, 1, 1),
        Err(Error::SbtNotReady(_))
    ));

    f.pipeline
        .set_miss_program(1, &f.pipeline.create_program_group(MISS))
        .unwrap();
    f.pipeline.launch(STREAM, 0x999, 1, 1, 1).unwrap();
}

#[test]
fn program_groups_are_pipeline_scoped() {
    let (_backend, context) = common::context();
    let pipeline = context.create_pipeline();
    let other = context.create_pipeline();
    let foreign = other.create_program_group(RAYGEN);
    assert!(matches!(
        pipeline.set_ray_generation_program(&foreign),
        Err(Error::Precondition(_))
    ));
}

#[test]
fn miss_slot_out_of_range_is_rejected() {
    let (_backend, context) = common::context();
    let pipeline = context.create_pipeline();
    let miss = pipeline.create_program_group(MISS);
    assert!(matches!(
        pipeline.set_miss_program(0, &miss),
        Err(Error::Precondition(_))
    ));
    pipeline.set_num_miss_ray_types(1);
    pipeline.set_miss_program(0, &miss).unwrap();
}

#[test]
fn dirty_hit_group_sbt_is_rewritten_at_launch() {
    let (backend, context) = common::context();
    let f = fixture(&context, &backend);
    f.pipeline
        .setup_hit_group_sbt(STREAM, &f.scene, &f.sbt_buffer)
        .unwrap();
    f.pipeline.launch(STREAM, 0x999, 1, 1, 1).unwrap();

    f.material.set_user_data(13);
    f.pipeline.mark_hit_group_sbt_dirty();
    f.pipeline.launch(STREAM, 0x999, 1, 1, 1).unwrap();

    let bytes = f.backend.uploaded(f.sbt_buffer.device_ptr()).unwrap();
    let payload = RECORD_HEADER_SIZE;
    assert_eq!(bytes[payload..payload + 4], 13u32.to_le_bytes());
    assert_eq!(f.backend.launches().len(), 2);
}
