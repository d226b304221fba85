//! The per-frame cull pass: visibility, LOD selection, batching, and the
//! request/disposal side channels.

use hashbrown::HashMap;

use crate::buffers::DeviceAllocator;
use crate::components::{EntityId, RenderComponents};
use crate::frustum::Frustum;
use crate::mesh::{MaterialId, MeshId, MeshRegistry};
use crate::options::RenderOptions;
use crate::render_set::RenderSet;
use crate::vertex::{INDEX_STRIDE, VERTEX_STRIDE};
use crate::{DrawBatch, FreeCoordinate, WorldBox};

/// Instances whose signed camera distance is below this are behind the
/// camera and invisible without a frustum test.
const NEAR_CUTOFF: FreeCoordinate = 0.0;

/// One-frame transient: a visible instance references a non-resident mesh,
/// which should be streamed in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshRequest {
    /// The instance that wants the mesh.
    pub entity: EntityId,
    /// The mesh to stream in.
    pub mesh: MeshId,
    /// The instance's signed camera distance; requests are serviced closest
    /// first.
    pub distance: FreeCoordinate,
}

/// One-frame transient: a resident mesh's instance is invisible and distant,
/// making the mesh an eviction candidate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshDisposal {
    /// The instance that stopped needing the mesh.
    pub entity: EntityId,
    /// The candidate mesh.
    pub mesh: MeshId,
    /// Absolute camera distance; candidates are evicted farthest first.
    pub distance: FreeCoordinate,
    /// Vertex bytes the mesh occupies, for accounting.
    pub vertex_bytes: u64,
    /// Index bytes the mesh occupies.
    pub index_bytes: u64,
}

/// Renderable entities grouped by material, then mesh, both in first-seen
/// order over ascending entity ids. This order is reproducible for an
/// unchanged entity set, which makes batch and instance-slot assignment
/// deterministic across frames.
#[derive(Clone, Debug)]
pub(crate) struct Grouping {
    pub materials: Vec<MaterialGroup>,
}

#[derive(Clone, Debug)]
pub(crate) struct MaterialGroup {
    pub material: MaterialId,
    pub meshes: Vec<MeshGroup>,
}

#[derive(Clone, Debug)]
pub(crate) struct MeshGroup {
    pub mesh: MeshId,
    pub instances: Vec<Instance>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Instance {
    pub entity: EntityId,
    pub bounds: WorldBox,
    pub distance: FreeCoordinate,
}

pub(crate) fn group_renderables(components: &RenderComponents) -> Grouping {
    let mut materials: Vec<MaterialGroup> = Vec::new();
    let mut material_index: HashMap<MaterialId, usize> = HashMap::new();
    let mut mesh_index: HashMap<MeshId, (usize, usize)> = HashMap::new();

    for renderable in components.iter_renderable() {
        let material_i = *material_index.entry(renderable.material).or_insert_with(|| {
            materials.push(MaterialGroup {
                material: renderable.material,
                meshes: Vec::new(),
            });
            materials.len() - 1
        });
        // A mesh seen under two materials stays grouped under the first;
        // entities sharing a mesh are expected to share its material.
        let (group_i, mesh_i) = *mesh_index.entry(renderable.mesh).or_insert_with(|| {
            materials[material_i].meshes.push(MeshGroup {
                mesh: renderable.mesh,
                instances: Vec::new(),
            });
            (material_i, materials[material_i].meshes.len() - 1)
        });
        materials[group_i].meshes[mesh_i].instances.push(Instance {
            entity: renderable.entity,
            bounds: renderable.bounds,
            distance: renderable.distance,
        });
    }

    Grouping { materials }
}

/// Everything one cull pass produced besides the batches themselves (which
/// are stored into the render set).
#[derive(Clone, Debug, Default)]
pub(crate) struct CullOutput {
    pub requests: Vec<MeshRequest>,
    pub disposals: Vec<MeshDisposal>,
    pub instances_drawn: usize,
    pub instances_culled: usize,
    /// A visible instance referenced a non-resident mesh this frame.
    pub missing_meshes: bool,
    /// More survivors than reserved instance slots for some mesh; the render
    /// set declared itself unprepared and emitted no batches.
    pub overflowed: bool,
}

/// Culls all renderable entities against `frustum`, selects LOD levels,
/// writes surviving instances into the translation array, and installs one
/// batch per (material, mesh, LOD) actually used.
///
/// `frustum` is [`None`] when frustum culling is disabled (or the transform
/// was degenerate), in which case every instance in front of the camera is
/// treated as visible.
///
/// The render set must be prepared; resident meshes are addressed through
/// their offsets, and a missing offset is an invariant violation.
pub(crate) fn cull<A: DeviceAllocator>(
    render_set: &mut RenderSet<A>,
    registry: &MeshRegistry,
    components: &RenderComponents,
    frustum: Option<&Frustum>,
    options: &RenderOptions,
) -> CullOutput {
    debug_assert!(render_set.is_prepared());

    let grouping = group_renderables(components);
    let eviction_distance = options.eviction_distance();
    let mut output = CullOutput::default();
    let mut batches: Vec<DrawBatch> = Vec::new();
    let mut survivors: Vec<(u32, EntityId)> = Vec::new();

    for material_group in &grouping.materials {
        for mesh_group in &material_group.meshes {
            let mesh = registry.expect(mesh_group.mesh);

            survivors.clear();
            for instance in &mesh_group.instances {
                let distance = instance.distance;
                let visible = distance >= NEAR_CUTOFF
                    && frustum.is_none_or(|f| f.is_box_visible(instance.bounds));
                if !visible {
                    output.instances_culled += 1;
                    if mesh.is_resident() && distance.abs() > eviction_distance {
                        output.disposals.push(MeshDisposal {
                            entity: instance.entity,
                            mesh: mesh_group.mesh,
                            distance: distance.abs(),
                            vertex_bytes: mesh.vertex_bytes(),
                            index_bytes: mesh.index_bytes(),
                        });
                    }
                    continue;
                }

                if !mesh.is_resident() {
                    // Drawn only in a future frame, once streamed in.
                    output.requests.push(MeshRequest {
                        entity: instance.entity,
                        mesh: mesh_group.mesh,
                        distance,
                    });
                    output.missing_meshes = true;
                    continue;
                }

                let cull_distance = mesh.cull_distance();
                if cull_distance > 0.0 && distance.abs() > cull_distance {
                    output.instances_culled += 1;
                    continue;
                }

                let lod = if options.lod && mesh.lod_count() > 1 {
                    mesh.select_lod(distance)
                } else {
                    0
                };
                survivors.push((lod, instance.entity));
            }

            if survivors.is_empty() {
                continue;
            }

            let offset = match render_set.offset(mesh_group.mesh) {
                Some(&offset) => offset,
                None => panic!(
                    "no offset for resident mesh {:?} during batching",
                    mesh_group.mesh
                ),
            };
            if survivors.len() as u32 > offset.instance_capacity {
                // Component churn added instances beyond the reserved range;
                // the offsets can no longer be trusted for slot assignment.
                log::debug!(
                    "mesh {:?} has {} instances but {} reserved slots; forcing rebuild",
                    mesh_group.mesh,
                    survivors.len(),
                    offset.instance_capacity,
                );
                render_set.set_unprepared();
                render_set.set_batches(Vec::new());
                output.overflowed = true;
                return output;
            }

            // The mesh's reserved slot range, subdivided contiguously by
            // ascending LOD, instances in cull-iteration order within each.
            let mut slot = offset.first_instance_slot;
            for lod in 0..mesh.lod_count() {
                let first_instance = slot;
                for &(survivor_lod, entity) in &survivors {
                    if survivor_lod == lod {
                        render_set.write_instance(slot, entity);
                        slot += 1;
                    }
                }
                let instance_count = slot - first_instance;
                if instance_count == 0 {
                    continue;
                }
                let index_range = mesh.index_range(lod);
                batches.push(DrawBatch {
                    material: material_group.material,
                    mesh: mesh_group.mesh,
                    lod,
                    first_index: (offset.index_byte_offset / INDEX_STRIDE as u64) as u32
                        + index_range.start,
                    index_count: index_range.end - index_range.start,
                    base_vertex: (offset.vertex_byte_offset / VERTEX_STRIDE as u64) as i32,
                    first_instance,
                    instance_count,
                });
                output.instances_drawn += instance_count as usize;
            }
        }
    }

    render_set.set_batches(batches);
    render_set.clear_invalidated();
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MaterialId;
    use crate::testing::fixture_bounds;

    #[test]
    fn grouping_is_in_first_seen_order() {
        let mut registry = MeshRegistry::new();
        let m0 = registry.register(0.0);
        let m1 = registry.register(0.0);
        let m2 = registry.register(0.0);

        let mut components = RenderComponents::new();
        let bounds = fixture_bounds();
        components.insert(EntityId(0), m1, MaterialId(9), bounds, 1.0);
        components.insert(EntityId(1), m2, MaterialId(3), bounds, 1.0);
        components.insert(EntityId(2), m0, MaterialId(9), bounds, 1.0);
        components.insert(EntityId(3), m1, MaterialId(9), bounds, 1.0);

        let grouping = group_renderables(&components);
        let shape: Vec<(MaterialId, Vec<(MeshId, usize)>)> = grouping
            .materials
            .iter()
            .map(|mg| {
                (
                    mg.material,
                    mg.meshes
                        .iter()
                        .map(|g| (g.mesh, g.instances.len()))
                        .collect(),
                )
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                (MaterialId(9), vec![(m1, 2), (m0, 1)]),
                (MaterialId(3), vec![(m2, 1)]),
            ]
        );
    }
}
