//! Per-entity data consumed by the cull pass.
//!
//! The entity manager that owns and mutates these structures is an external
//! collaborator; this subsystem only reads them, once per frame, and trusts
//! the invalidation signal it is given when they change.

use crate::{FreeCoordinate, MaterialId, MeshId, WorldBox};

/// Identifier of an entity in the external entity manager.
///
/// Used as a dense index into [`ComponentVec`]s and written into the render
/// set's instance-translation array for per-instance shader lookup.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EntityId(pub u32);

impl EntityId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A growable dense array of one component type, indexed by [`EntityId`],
/// with liveness tracked per slot.
///
/// All access is bounds-checked; an id beyond the array or a dead slot reads
/// as the component being absent, never as garbage.
#[derive(Clone, Debug)]
pub struct ComponentVec<T> {
    slots: Vec<Option<T>>,
    len: usize,
}

impl<T> ComponentVec<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
        }
    }

    /// Sets `entity`'s component, growing the array as needed.
    /// Returns the previous value if the slot was live.
    pub fn insert(&mut self, entity: EntityId, value: T) -> Option<T> {
        let index = entity.index();
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        let previous = self.slots[index].replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Removes and returns `entity`'s component, if the slot was live.
    pub fn remove(&mut self, entity: EntityId) -> Option<T> {
        let removed = self.slots.get_mut(entity.index()).and_then(Option::take);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub fn get(&self, entity: EntityId) -> Option<&T> {
        self.slots.get(entity.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, entity: EntityId) -> Option<&mut T> {
        self.slots.get_mut(entity.index()).and_then(Option::as_mut)
    }

    /// Live components in ascending entity-id order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| Some((EntityId(i as u32), slot.as_ref()?)))
    }

    /// Number of live components.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for ComponentVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The renderable-component arrays read by the cull pass, one
/// [`ComponentVec`] per component.
///
/// An entity is renderable when all four of its components are present; it
/// is skipped otherwise. The spatial transform used for actual vertex
/// placement is not read here; it is looked up downstream, per instance,
/// through the translation array.
#[derive(Clone, Debug, Default)]
pub struct RenderComponents {
    /// World-space bounding box enclosing the entity's mesh at its current
    /// transform.
    pub bounds: ComponentVec<WorldBox>,
    /// Which mesh the entity draws.
    pub meshes: ComponentVec<MeshId>,
    /// Material the mesh is drawn with. Entities sharing a mesh are expected
    /// to share its material.
    pub materials: ComponentVec<MaterialId>,
    /// Signed distance from the camera along the view direction, precomputed
    /// by the entity manager each frame.
    ///
    /// Dual use, deliberately one field: the sign distinguishes
    /// "behind camera" for visibility, and the magnitude orders both LOD
    /// selection and eviction distance, keeping the two decisions consistent.
    pub distances: ComponentVec<FreeCoordinate>,
}

impl RenderComponents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets all four renderable components of `entity` at once.
    pub fn insert(
        &mut self,
        entity: EntityId,
        mesh: MeshId,
        material: MaterialId,
        bounds: WorldBox,
        distance: FreeCoordinate,
    ) {
        self.bounds.insert(entity, bounds);
        self.meshes.insert(entity, mesh);
        self.materials.insert(entity, material);
        self.distances.insert(entity, distance);
    }

    /// Removes all renderable components of `entity`.
    pub fn remove(&mut self, entity: EntityId) {
        self.bounds.remove(entity);
        self.meshes.remove(entity);
        self.materials.remove(entity);
        self.distances.remove(entity);
    }

    /// Fully renderable entities in ascending entity-id order.
    /// This order defines cull-iteration order.
    pub(crate) fn iter_renderable(&self) -> impl Iterator<Item = Renderable> + '_ {
        self.meshes.iter().filter_map(|(entity, &mesh)| {
            Some(Renderable {
                entity,
                mesh,
                material: *self.materials.get(entity)?,
                bounds: *self.bounds.get(entity)?,
                distance: *self.distances.get(entity)?,
            })
        })
    }
}

/// One renderable entity's components, gathered for the cull pass.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Renderable {
    pub entity: EntityId,
    pub mesh: MeshId,
    pub material: MaterialId,
    pub bounds: WorldBox,
    pub distance: FreeCoordinate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_vec_insert_get_remove() {
        let mut v: ComponentVec<&str> = ComponentVec::new();
        assert_eq!(v.get(EntityId(3)), None);
        assert_eq!(v.insert(EntityId(3), "a"), None);
        assert_eq!(v.insert(EntityId(3), "b"), Some("a"));
        assert_eq!(v.get(EntityId(3)), Some(&"b"));
        assert_eq!(v.len(), 1);
        assert_eq!(v.remove(EntityId(3)), Some("b"));
        assert_eq!(v.remove(EntityId(3)), None);
        assert!(v.is_empty());
    }

    #[test]
    fn component_vec_out_of_range_reads_absent() {
        let mut v: ComponentVec<u8> = ComponentVec::new();
        v.insert(EntityId(0), 1);
        assert_eq!(v.get(EntityId(1000)), None);
        assert_eq!(v.remove(EntityId(1000)), None);
    }

    #[test]
    fn iteration_is_in_id_order_regardless_of_insertion_order() {
        let mut v: ComponentVec<u8> = ComponentVec::new();
        v.insert(EntityId(5), 50);
        v.insert(EntityId(1), 10);
        v.insert(EntityId(3), 30);
        let items: Vec<(EntityId, u8)> = v.iter().map(|(e, &c)| (e, c)).collect();
        assert_eq!(
            items,
            vec![(EntityId(1), 10), (EntityId(3), 30), (EntityId(5), 50)]
        );
    }

    #[test]
    fn partially_equipped_entity_is_not_renderable() {
        let mut components = RenderComponents::new();
        components.meshes.insert(EntityId(0), MeshId::new(0));
        components.materials.insert(EntityId(0), MaterialId(7));
        // No bounds or distance.
        assert_eq!(components.iter_renderable().count(), 0);
    }
}
