//! Cross-module scenario tests; unit tests live with their modules.

use pretty_assertions::assert_eq;

use crate::components::{EntityId, RenderComponents};
use crate::render_set::RenderSet;
use crate::testing::{
    MemAllocator, ScriptedGenerator, bounds_at, orthographic_vp, quad_data_with_lods,
};
use crate::{
    DrawIndexedIndirectArgs, Flaws, FreeCoordinate, MaterialId, MeshId, MeshRequest,
    RenderOptions, StreamingController, UpdateError, ViewProjection, visibility,
};

/// Views x, y ∈ [-10, 10], z ∈ [-100, -1].
fn vp() -> ViewProjection {
    orthographic_vp(10.0, 10.0, 1.0, 100.0)
}

fn controller() -> StreamingController<MemAllocator, ScriptedGenerator> {
    StreamingController::new(
        MemAllocator::new(),
        ScriptedGenerator::new(),
        RenderOptions::default(),
    )
}

/// An entity straight ahead of the camera at the given depth, so that its
/// signed distance and frustum visibility agree.
fn insert_ahead(
    components: &mut RenderComponents,
    entity: u32,
    mesh: MeshId,
    material: MaterialId,
    depth: FreeCoordinate,
) {
    components.insert(
        EntityId(entity),
        mesh,
        material,
        bounds_at((0.0, 0.0, -depth), 1.0),
        depth,
    );
}

/// An entity far off to the side, outside the frustum.
fn insert_aside(
    components: &mut RenderComponents,
    entity: u32,
    mesh: MeshId,
    material: MaterialId,
    distance: FreeCoordinate,
) {
    components.insert(
        EntityId(entity),
        mesh,
        material,
        bounds_at((5000.0, 0.0, -50.0), 1.0),
        distance,
    );
}

#[test]
fn scenario_a_shared_mesh_two_instances_one_batch() {
    let mut c = controller();
    let mesh = c.registry_mut().register(0.0);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, mesh, MaterialId(7), 50.0);
    insert_aside(&mut components, 1, mesh, MaterialId(7), 50.0);
    insert_ahead(&mut components, 2, mesh, MaterialId(7), 50.0);

    // First frame streams the mesh in; second frame draws it.
    c.update(&components, vp()).unwrap();
    let info = c.update(&components, vp()).unwrap();

    assert_eq!(info.flaws, Flaws::empty());
    let batches = c.render_set().batches();
    assert_eq!(batches.len(), 1);
    let batch = batches[0];
    assert_eq!(batch.material, MaterialId(7));
    assert_eq!(batch.mesh, mesh);
    assert_eq!(batch.instance_count, 2);
    let first = batch.first_instance as usize;
    assert_eq!(
        &c.render_set().instance_table()[first..first + 2],
        &[EntityId(0), EntityId(2)],
    );
}

#[test]
fn scenario_b_request_then_append_then_draw() {
    let mut c = controller();
    let mesh = c.registry_mut().register(0.0);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, mesh, MaterialId(0), 50.0);

    let info1 = c.update(&components, vp()).unwrap();
    assert_eq!(info1.requests_issued, 1);
    assert!(info1.flaws.contains(Flaws::MISSING_MESHES));
    assert_eq!(info1.meshes_streamed, 1);
    assert_eq!(c.render_set().batches().len(), 0, "not drawn until next cull");

    let info2 = c.update(&components, vp()).unwrap();
    assert!(!info2.rebuilt, "append must not trigger a rebuild");
    assert_eq!(info2.flaws, Flaws::empty());
    let batches = c.render_set().batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].mesh, mesh);
    assert_eq!(batches[0].instance_count, 1);
}

#[test]
fn request_carries_the_instance_distance() {
    let mut registry = crate::MeshRegistry::new();
    let mesh = registry.register(0.0);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 3, mesh, MaterialId(0), 42.5);

    let options = RenderOptions::default();
    let mut set = RenderSet::new(MemAllocator::new(), 1);
    set.prepare(&mut registry, &components, &[], &options).unwrap();
    let frustum = crate::Frustum::new(&vp()).unwrap();
    let output = visibility::cull(&mut set, &registry, &components, Some(&frustum), &options);

    assert_eq!(
        output.requests,
        vec![MeshRequest {
            entity: EntityId(3),
            mesh,
            distance: 42.5,
        }]
    );
}

#[test]
fn consecutive_culls_are_bit_identical() {
    let mut c = controller();
    let m0 = c.registry_mut().register(0.0);
    let m1 = c.registry_mut().register(0.0);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, m0, MaterialId(1), 20.0);
    insert_ahead(&mut components, 1, m1, MaterialId(2), 30.0);
    insert_ahead(&mut components, 2, m0, MaterialId(1), 40.0);

    c.update(&components, vp()).unwrap();
    c.update(&components, vp()).unwrap();
    let batches = c.render_set().batches().to_vec();
    let table = c.render_set().instance_table().to_vec();
    assert!(!batches.is_empty());

    // Force the cull to actually re-run against the unchanged snapshot.
    c.invalidate();
    let info = c.update(&components, vp()).unwrap();
    assert!(info.cull_ran);
    assert_eq!(c.render_set().batches(), &batches[..]);
    assert_eq!(c.render_set().instance_table(), &table[..]);
}

#[test]
fn shared_mesh_is_streamed_once() {
    let mut c = controller();
    let mesh = c.registry_mut().register(0.0);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, mesh, MaterialId(0), 10.0);
    insert_ahead(&mut components, 1, mesh, MaterialId(0), 20.0);

    let info = c.update(&components, vp()).unwrap();
    assert_eq!(info.requests_issued, 2);
    assert_eq!(info.meshes_streamed, 1);
    assert_eq!(c.generator().calls(), &[mesh]);
}

#[test]
fn streaming_is_bounded_and_closest_first() {
    let mut c = controller();
    let mut components = RenderComponents::new();
    let mut meshes = Vec::new();
    // Farthest first by entity id, so that service order must come from
    // sorting by distance, not iteration order.
    for i in 0..15u32 {
        let mesh = c.registry_mut().register(0.0);
        meshes.push(mesh);
        insert_ahead(&mut components, i, mesh, MaterialId(0), 90.0 - f64::from(i) * 5.0);
    }

    let info1 = c.update(&components, vp()).unwrap();
    assert_eq!(info1.requests_issued, 15);
    assert_eq!(info1.meshes_streamed, 10);
    assert!(info1.flaws.contains(Flaws::UNFINISHED));
    let closest_ten: Vec<MeshId> = meshes.iter().rev().take(10).copied().collect();
    assert_eq!(c.generator().calls(), &closest_ten[..]);

    let info2 = c.update(&components, vp()).unwrap();
    assert_eq!(info2.meshes_streamed, 5);
    assert!(!info2.flaws.contains(Flaws::UNFINISHED));

    let info3 = c.update(&components, vp()).unwrap();
    assert_eq!(info3.batch_count, 15);
    assert_eq!(info3.flaws, Flaws::empty());
}

#[test]
fn generation_failure_propagates_and_retries() {
    let mut c = controller();
    let mesh = c.registry_mut().register(0.0);
    c.generator_mut().set_failing(mesh, true);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, mesh, MaterialId(0), 50.0);

    let error = c.update(&components, vp()).unwrap_err();
    assert!(matches!(error, UpdateError::Generation { mesh: m, .. } if m == mesh));
    assert!(!c.registry().get(mesh).unwrap().is_resident());

    c.generator_mut().set_failing(mesh, false);
    let info = c.update(&components, vp()).unwrap();
    assert_eq!(info.meshes_streamed, 1);
    let info = c.update(&components, vp()).unwrap();
    assert_eq!(info.batch_count, 1);
}

#[test]
fn append_overflow_rebuilds_and_recovers() {
    let options = RenderOptions {
        minimum_buffer_bytes: 0,
        buffer_reserve_factor: 1.0,
        ..RenderOptions::default()
    };
    let mut c = StreamingController::new(MemAllocator::new(), ScriptedGenerator::new(), options);
    let m0 = c.registry_mut().register(0.0);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, m0, MaterialId(0), 50.0);

    // Frame 1: the initial rebuild sizes the buffers for an empty resident
    // set, so the streamed mesh cannot be appended.
    let info1 = c.update(&components, vp()).unwrap();
    assert!(info1.flaws.contains(Flaws::UNFINISHED));
    assert!(!c.render_set().is_prepared());

    // Frame 2: rebuild packs the now-resident mesh, cull draws it.
    let info2 = c.update(&components, vp()).unwrap();
    assert!(info2.rebuilt);
    assert_eq!(info2.flaws, Flaws::empty());
    assert_eq!(info2.batch_count, 1);
    let offset0 = *c.render_set().offset(m0).unwrap();

    // A second mesh appears; again no room to append. Existing offsets are
    // untouched while unprepared.
    let m1 = c.registry_mut().register(0.0);
    insert_ahead(&mut components, 1, m1, MaterialId(0), 40.0);
    c.invalidate();
    let info3 = c.update(&components, vp()).unwrap();
    assert!(info3.flaws.contains(Flaws::UNFINISHED));
    assert_eq!(c.render_set().offset(m0), Some(&offset0));

    let info4 = c.update(&components, vp()).unwrap();
    assert!(info4.rebuilt);
    assert_eq!(info4.batch_count, 2);
}

#[test]
fn batched_mesh_is_never_evicted() {
    let mut c = controller();
    let mesh = c.registry_mut().register(0.0);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, mesh, MaterialId(0), 50.0);
    // Invisible and beyond the eviction distance (0.5 × 1000 by default).
    insert_aside(&mut components, 1, mesh, MaterialId(0), 600.0);

    c.update(&components, vp()).unwrap();
    let info = c.update(&components, vp()).unwrap();
    assert_eq!(info.batch_count, 1);
    assert_eq!(info.meshes_evicted, 0);
    assert!(c.registry().get(mesh).unwrap().is_resident());
    assert!(c.render_set().offset(mesh).is_some());
}

#[test]
fn eviction_releases_offset_and_rebuild_reclaims_bytes() {
    let mut c = controller();
    let mesh = c.registry_mut().register(0.0);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, mesh, MaterialId(0), 50.0);

    // Stream the mesh in, then move its only instance out of sight and far
    // away.
    c.update(&components, vp()).unwrap();
    c.update(&components, vp()).unwrap();
    components.remove(EntityId(0));
    insert_aside(&mut components, 0, mesh, MaterialId(0), 700.0);
    c.invalidate();
    let info = c.update(&components, vp()).unwrap();

    assert_eq!(info.meshes_evicted, 1);
    assert!(!c.registry().get(mesh).unwrap().is_resident());
    assert_eq!(c.render_set().offset(mesh), None);
    // Bump allocation: the bytes stay in use until a rebuild.
    assert!(c.render_set().vertex_bytes_used() > 0);

    c.render_set_mut().set_unprepared();
    let info = c.update(&components, vp()).unwrap();
    assert!(info.rebuilt);
    assert_eq!(c.render_set().vertex_bytes_used(), 0);
}

#[test]
fn lod_levels_split_one_mesh_into_contiguous_batches() {
    let mut c = controller();
    let mesh = c.registry_mut().register(0.0);
    c.generator_mut()
        .script(mesh, quad_data_with_lods(&[10.0, 20.0, 40.0]));
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, mesh, MaterialId(0), 5.0);
    insert_ahead(&mut components, 1, mesh, MaterialId(0), 15.0);
    insert_ahead(&mut components, 2, mesh, MaterialId(0), 99.0);

    c.update(&components, vp()).unwrap();
    c.update(&components, vp()).unwrap();

    let batches = c.render_set().batches();
    assert_eq!(batches.len(), 3);
    for (i, batch) in batches.iter().enumerate() {
        let i = i as u32;
        assert_eq!(batch.lod, i);
        assert_eq!(batch.first_index, i * 6);
        assert_eq!(batch.index_count, 6);
        assert_eq!(batch.first_instance, i);
        assert_eq!(batch.instance_count, 1);
    }
    assert_eq!(
        c.render_set().instance_table(),
        &[EntityId(0), EntityId(1), EntityId(2)],
    );
}

#[test]
fn cull_distance_drops_far_instances() {
    let mut c = controller();
    let mesh = c.registry_mut().register(30.0);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, mesh, MaterialId(0), 20.0);
    insert_ahead(&mut components, 1, mesh, MaterialId(0), 50.0); // beyond 30

    c.update(&components, vp()).unwrap();
    let info = c.update(&components, vp()).unwrap();
    assert_eq!(info.instances_drawn, 1);
    let batches = c.render_set().batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].instance_count, 1);
}

#[test]
fn negative_distance_is_behind_camera() {
    let mut c = controller();
    let mesh = c.registry_mut().register(0.0);
    let mut components = RenderComponents::new();
    // In-frustum bounds but a negative signed distance: the entity manager
    // says it is behind the camera, and that wins.
    components.insert(
        EntityId(0),
        mesh,
        MaterialId(0),
        bounds_at((0.0, 0.0, -50.0), 1.0),
        -50.0,
    );

    let info = c.update(&components, vp()).unwrap();
    assert_eq!(info.requests_issued, 0);
    assert_eq!(info.instances_culled, 1);
    assert_eq!(info.batch_count, 0);
}

#[test]
fn disabled_culling_draws_everything_and_fetches_eagerly() {
    let options = RenderOptions {
        culling: false,
        ..RenderOptions::default()
    };
    let mut c = StreamingController::new(MemAllocator::new(), ScriptedGenerator::new(), options);
    let mesh = c.registry_mut().register(0.0);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, mesh, MaterialId(0), 50.0);
    insert_aside(&mut components, 1, mesh, MaterialId(0), 60.0);

    // Resident and drawn in the very first frame, no streaming latency.
    let info = c.update(&components, vp()).unwrap();
    assert_eq!(info.requests_issued, 0);
    assert_eq!(info.flaws, Flaws::empty());
    assert_eq!(info.instances_drawn, 2);
    assert_eq!(info.batch_count, 1);
}

#[test]
fn indirect_buffers_follow_the_batch_list() {
    let mut c = controller();
    let m0 = c.registry_mut().register(0.0);
    let m1 = c.registry_mut().register(0.0);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, m0, MaterialId(0), 20.0);
    insert_ahead(&mut components, 1, m1, MaterialId(1), 80.0);

    c.update(&components, vp()).unwrap();
    c.update(&components, vp()).unwrap();
    assert_eq!(c.render_set().batches().len(), 2);
    assert!(c.render_set().is_indirect_dirty(0));
    assert!(c.render_set().is_indirect_dirty(1));

    let expected: Vec<DrawIndexedIndirectArgs> = c
        .render_set()
        .batches()
        .iter()
        .map(|&batch| batch.into())
        .collect();
    assert_eq!(c.render_set_mut().write_indirect_commands(0).unwrap(), 2);
    assert!(!c.render_set().is_indirect_dirty(0));
    assert!(c.render_set().is_indirect_dirty(1), "slots are independent");
    let encoded = c.render_set().indirect_buffer(0).unwrap().contents();
    assert_eq!(encoded, bytemuck::must_cast_slice::<_, u8>(&expected));

    // Shrinking the view drops the far entity; the batch change re-dirties
    // every slot.
    let narrow_vp = orthographic_vp(10.0, 10.0, 1.0, 60.0);
    c.update(&components, narrow_vp).unwrap();
    assert_eq!(c.render_set().batches().len(), 1);
    assert!(c.render_set().is_indirect_dirty(0));
    assert_eq!(c.render_set_mut().write_indirect_commands(0).unwrap(), 1);
}

#[test]
fn instance_growth_beyond_reservation_forces_rebuild() {
    let mut c = controller();
    let mesh = c.registry_mut().register(0.0);
    let mut components = RenderComponents::new();
    insert_ahead(&mut components, 0, mesh, MaterialId(0), 50.0);

    c.update(&components, vp()).unwrap();
    c.update(&components, vp()).unwrap();
    assert_eq!(c.render_set().batches().len(), 1);

    // A second instance of the same mesh appears; only one slot was
    // reserved, so this cull cannot be trusted.
    insert_ahead(&mut components, 1, mesh, MaterialId(0), 40.0);
    c.invalidate();
    let info = c.update(&components, vp()).unwrap();
    assert!(info.flaws.contains(Flaws::UNFINISHED));
    assert_eq!(info.batch_count, 0);
    assert!(!c.render_set().is_prepared());

    let info = c.update(&components, vp()).unwrap();
    assert!(info.rebuilt);
    assert_eq!(info.batch_count, 1);
    assert_eq!(info.instances_drawn, 2);
}
