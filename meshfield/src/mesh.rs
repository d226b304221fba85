//! Mesh data model: identifiers, LOD levels, residency, the registry, and
//! the injected generation strategy.

use core::fmt;
use core::ops::Range;

use crate::vertex::{INDEX_STRIDE, VERTEX_STRIDE};
use crate::{FreeCoordinate, MeshVertex, ModelBox, PackedVertex};

/// Unique identifier of a mesh within one [`MeshRegistry`].
///
/// Ids are allocated by an explicit monotonic counter and never reused, so a
/// stale id can never silently alias a newer mesh.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MeshId(u32);

impl MeshId {
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of a material, assigned by the external material system.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MaterialId(pub u32);

/// One level of detail of a mesh: a sub-range of the mesh's own index data,
/// usable below a distance threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LodLevel {
    /// First index within the mesh's index data.
    pub first_index: u32,
    /// Number of indices in this level.
    pub index_count: u32,
    /// The level is used when it is the first (in ascending-threshold order)
    /// whose threshold strictly exceeds the instance's absolute distance.
    pub threshold: FreeCoordinate,
}

/// Whether a mesh's geometry currently occupies space in the shared device
/// buffers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Residency {
    /// No geometry present; drawing this mesh first requires streaming it in.
    #[default]
    Unloaded,
    /// Geometry present and addressable through the offset table.
    Resident,
}

/// Geometry produced by a [`MeshGenerator`].
#[derive(Clone, Debug, PartialEq)]
pub struct MeshData {
    /// Vertices, in full precision; quantized on installation.
    pub vertices: Vec<MeshVertex>,
    /// Triangle list indices into `vertices`.
    pub indices: Vec<u32>,
    /// Model-space bounding box of the geometry.
    pub bounds: ModelBox,
    /// LOD levels in ascending threshold order, each an index sub-range.
    /// Empty means a single full-range level.
    pub lod_levels: Vec<LodLevel>,
}

/// Error type which [`MeshGenerator`] implementations may return.
pub type GenerationError = Box<dyn std::error::Error + Send + Sync>;

/// Strategy producing mesh geometry on demand, invoked synchronously by the
/// streaming controller (voxel terrain meshing, model loading, and so on).
///
/// Any context the generation needs is the implementor's own state.
pub trait MeshGenerator: fmt::Debug {
    /// Produces the geometry of `mesh`.
    ///
    /// This is a deliberately blocking call; the controller bounds the number
    /// of invocations per frame. On error the mesh stays unloaded and will be
    /// re-requested by a later cull.
    fn generate(&mut self, mesh: MeshId) -> Result<MeshData, GenerationError>;
}

/// One mesh: immutable geometry (once generated), LOD table, and residency
/// state. Mutated only by the streaming controller.
#[derive(Clone, Debug, PartialEq)]
pub struct Mesh {
    id: MeshId,
    /// Maximum draw distance; zero = unlimited.
    cull_distance: FreeCoordinate,
    residency: Residency,
    bounds: ModelBox,
    lod_levels: Vec<LodLevel>,
    vertices: Vec<PackedVertex>,
    indices: Vec<u32>,
}

impl Mesh {
    pub fn id(&self) -> MeshId {
        self.id
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn is_resident(&self) -> bool {
        self.residency == Residency::Resident
    }

    /// Maximum draw distance; zero = unlimited.
    pub fn cull_distance(&self) -> FreeCoordinate {
        self.cull_distance
    }

    /// Model-space bounding box. Zero until the mesh has been generated.
    pub fn bounds(&self) -> ModelBox {
        self.bounds
    }

    /// LOD levels in ascending threshold order; empty means a single
    /// full-range level.
    pub fn lod_levels(&self) -> &[LodLevel] {
        &self.lod_levels
    }

    /// Number of selectable levels; at least 1.
    pub fn lod_count(&self) -> u32 {
        self.lod_levels.len().max(1) as u32
    }

    /// Selects the level for an instance at the given signed distance:
    /// the first level whose threshold strictly exceeds the absolute
    /// distance, or the last (coarsest) level if none does.
    pub fn select_lod(&self, distance: FreeCoordinate) -> u32 {
        let magnitude = distance.abs();
        for (i, level) in self.lod_levels.iter().enumerate() {
            if level.threshold > magnitude {
                return i as u32;
            }
        }
        self.lod_levels.len().saturating_sub(1) as u32
    }

    /// The sub-range of this mesh's index data drawn at `lod`.
    pub fn index_range(&self, lod: u32) -> Range<u32> {
        match self.lod_levels.get(lod as usize) {
            Some(level) => level.first_index..(level.first_index + level.index_count),
            None => 0..self.indices.len() as u32,
        }
    }

    /// Quantized vertex data; empty while unloaded.
    pub fn vertices(&self) -> &[PackedVertex] {
        &self.vertices
    }

    /// Index data; empty while unloaded.
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub(crate) fn vertex_bytes(&self) -> u64 {
        (self.vertices.len() * VERTEX_STRIDE) as u64
    }

    pub(crate) fn index_bytes(&self) -> u64 {
        (self.indices.len() * INDEX_STRIDE) as u64
    }

    /// Installs generated geometry, quantizing vertices, and marks the mesh
    /// resident.
    pub(crate) fn install_data(&mut self, data: MeshData) {
        let MeshData {
            vertices,
            indices,
            bounds,
            lod_levels,
        } = data;
        self.vertices = vertices.into_iter().map(PackedVertex::from).collect();
        self.indices = indices;
        self.bounds = bounds;
        self.lod_levels = lod_levels;
        self.residency = Residency::Resident;
    }

    /// Discards geometry and marks the mesh unloaded.
    pub(crate) fn unload(&mut self) {
        self.vertices = Vec::new();
        self.indices = Vec::new();
        self.lod_levels = Vec::new();
        self.bounds = ModelBox::zero();
        self.residency = Residency::Unloaded;
    }
}

/// Owner of all [`Mesh`]es and of the id counter.
///
/// Iteration order is id order, which equals registration order; downstream
/// determinism (stable batch ordering) relies on this.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshRegistry {
    meshes: Vec<Mesh>,
    /// Explicit counter rather than deriving from `meshes.len()`, so that id
    /// allocation policy is stated in one place.
    next_id: u32,
}

impl MeshRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new unloaded mesh and returns its id.
    pub fn register(&mut self, cull_distance: FreeCoordinate) -> MeshId {
        let id = MeshId::new(self.next_id);
        self.next_id += 1;
        self.meshes.push(Mesh {
            id,
            cull_distance,
            residency: Residency::Unloaded,
            bounds: ModelBox::zero(),
            lod_levels: Vec::new(),
            vertices: Vec::new(),
            indices: Vec::new(),
        });
        id
    }

    pub fn get(&self, id: MeshId) -> Option<&Mesh> {
        self.meshes.get(id.index())
    }

    pub(crate) fn get_mut(&mut self, id: MeshId) -> Option<&mut Mesh> {
        self.meshes.get_mut(id.index())
    }

    /// As [`Self::get()`], but an absent mesh is an invariant violation:
    /// entities must only reference registered ids.
    pub(crate) fn expect(&self, id: MeshId) -> &Mesh {
        match self.get(id) {
            Some(mesh) => mesh,
            None => panic!("mesh {id:?} is referenced by a renderable entity but not registered"),
        }
    }

    /// All meshes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Mesh> + '_ {
        self.meshes.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Mesh> + '_ {
        self.meshes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    /// Discards all meshes and restarts id allocation from zero.
    /// For tests which need reproducible ids.
    #[doc(hidden)]
    pub fn reset(&mut self) {
        let Self { meshes, next_id } = self;
        meshes.clear();
        *next_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn mesh_with_thresholds(thresholds: &[FreeCoordinate]) -> Mesh {
        let mut registry = MeshRegistry::new();
        let id = registry.register(0.0);
        let mesh = registry.get_mut(id).unwrap();
        mesh.lod_levels = thresholds
            .iter()
            .enumerate()
            .map(|(i, &threshold)| LodLevel {
                first_index: i as u32 * 30,
                index_count: 30,
                threshold,
            })
            .collect();
        mesh.clone()
    }

    #[test]
    fn ids_are_monotonic_and_reset_restarts() {
        let mut registry = MeshRegistry::new();
        let a = registry.register(0.0);
        let b = registry.register(0.0);
        assert_ne!(a, b);
        assert_eq!(registry.iter().map(Mesh::id).collect::<Vec<_>>(), [a, b]);
        registry.reset();
        assert!(registry.is_empty());
        assert_eq!(registry.register(0.0), a);
    }

    #[rstest]
    #[case(0.0, 0)]
    #[case(5.0, 0)]
    #[case(-5.0, 0)]
    #[case(10.0, 1)] // threshold must strictly exceed the distance
    #[case(15.0, 1)]
    #[case(39.9, 2)]
    #[case(40.0, 2)] // beyond every threshold: coarsest level
    #[case(1e6, 2)]
    fn lod_selection(#[case] distance: FreeCoordinate, #[case] expected: u32) {
        let mesh = mesh_with_thresholds(&[10.0, 20.0, 40.0]);
        assert_eq!(mesh.select_lod(distance), expected);
    }

    #[test]
    fn lod_ranges() {
        let mesh = mesh_with_thresholds(&[10.0, 20.0]);
        assert_eq!(mesh.index_range(0), 0..30);
        assert_eq!(mesh.index_range(1), 30..60);
    }

    #[test]
    fn mesh_without_lod_table_has_one_full_range_level() {
        let mut registry = MeshRegistry::new();
        let id = registry.register(0.0);
        let mesh = registry.get_mut(id).unwrap();
        mesh.indices = vec![0, 1, 2];
        assert_eq!(mesh.lod_count(), 1);
        assert_eq!(mesh.select_lod(1e9), 0);
        assert_eq!(mesh.index_range(0), 0..3);
    }
}
