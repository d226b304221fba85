//! The render set: shared vertex/index buffers, the mesh offset table, the
//! entity-id translation array, and the draw-batch list.

use hashbrown::HashMap;

use crate::batch::{DrawBatch, IndirectBuffers};
use crate::buffers::{BufferUsage, DeviceAllocator, DeviceBuffer};
use crate::components::{EntityId, RenderComponents};
use crate::mesh::{MaterialId, Mesh, MeshId, MeshRegistry};
use crate::options::RenderOptions;
use crate::visibility::{self, MeshDisposal};

/// Location of one resident mesh inside the shared buffers, plus its
/// reserved range in the instance-translation array.
///
/// Created when the mesh is packed or appended; destroyed on eviction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct MeshOffset {
    /// Byte offset of the mesh's vertex data in the shared vertex buffer.
    pub vertex_byte_offset: u64,
    /// Number of vertices.
    pub vertex_count: u32,
    /// Byte offset of the mesh's index data in the shared index buffer.
    pub index_byte_offset: u64,
    /// Number of indices.
    pub index_count: u32,
    /// First slot of the mesh's reserved range in the translation array.
    pub first_instance_slot: u32,
    /// Number of reserved slots. A cull finding more live instances than
    /// this declares the render set unprepared.
    pub instance_capacity: u32,
    /// The material the mesh was packed under.
    pub material: MaterialId,
}

/// Fatal errors from rebuilding the render set.
#[derive(Clone, Copy, Debug, displaydoc::Display, Eq, PartialEq)]
#[non_exhaustive]
pub enum PrepareError {
    /// The meshes to pack need more buffer space than
    /// [`RenderOptions::maximum_buffer_bytes`] permits. Truncating instead
    /// would corrupt the offset table, so this is treated as a fatal
    /// configuration error.
    #[displaydoc(
        "required buffer size of {required} bytes exceeds the configured maximum of {maximum}"
    )]
    CapacityExceeded {
        /// Bytes the current mesh set needs.
        required: u64,
        /// Configured [`RenderOptions::maximum_buffer_bytes`].
        maximum: u64,
    },
    /// device allocation of a {size} byte buffer failed
    Allocation {
        /// Requested byte size.
        size: u64,
    },
}

impl std::error::Error for PrepareError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub(crate) enum AppendOutcome {
    /// The mesh was appended after the existing data; no other offset moved.
    Appended,
    /// The remaining capacity did not suffice; the render set is now
    /// unprepared and must be rebuilt before the next cull.
    InsufficientCapacity,
}

/// Owner of the shared device buffers, the offset table, and the per-frame
/// draw batches.
///
/// Invariants, holding whenever [`Self::is_prepared()`] is true:
///
/// * Used bytes never exceed buffer capacity, for both buffers.
/// * Every mesh referenced by a live batch has a valid [`MeshOffset`].
/// * Offsets recorded before a rebuild are never used by batches produced
///   after it without an intervening cull (a rebuild leaves the set
///   invalidated, forcing that cull).
#[derive(Debug)]
pub struct RenderSet<A: DeviceAllocator> {
    allocator: A,
    offsets: HashMap<MeshId, MeshOffset>,
    vertex_buffer: Option<A::Buffer>,
    index_buffer: Option<A::Buffer>,
    /// Bytes of the vertex buffer in use. Bump-allocated: eviction does not
    /// lower this; only a rebuild reclaims freed ranges.
    vertex_used: u64,
    index_used: u64,
    /// The entity-id translation array. Reused in place across frames; only
    /// slots covered by live batches are meaningful.
    instance_table: Vec<EntityId>,
    batches: Vec<DrawBatch>,
    indirect: IndirectBuffers<A::Buffer>,
    prepared: bool,
    invalidated: bool,
}

impl<A: DeviceAllocator> RenderSet<A> {
    /// Creates an empty render set. It starts unprepared; the first
    /// [`StreamingController::update()`](crate::StreamingController::update)
    /// performs the initial rebuild.
    pub fn new(allocator: A, frames_in_flight: usize) -> Self {
        Self {
            allocator,
            offsets: HashMap::new(),
            vertex_buffer: None,
            index_buffer: None,
            vertex_used: 0,
            index_used: 0,
            instance_table: Vec::new(),
            batches: Vec::new(),
            indirect: IndirectBuffers::new(frames_in_flight),
            prepared: false,
            invalidated: true,
        }
    }

    /// False whenever the offset table is stale relative to the buffers;
    /// no cull result may be trusted until a rebuild completes.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// True whenever renderable components changed since the last successful
    /// cull; cleared only by a successful cull.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Signals that renderable component data changed. The external entity
    /// manager calls this; the next update will re-cull.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub(crate) fn clear_invalidated(&mut self) {
        self.invalidated = false;
    }

    pub(crate) fn set_unprepared(&mut self) {
        self.prepared = false;
    }

    /// The current draw batches, in (material, mesh, LOD) order.
    pub fn batches(&self) -> &[DrawBatch] {
        &self.batches
    }

    /// The entity-id translation array indexed by batch instance ranges.
    pub fn instance_table(&self) -> &[EntityId] {
        &self.instance_table
    }

    /// The offset of `mesh`, if it is resident.
    pub fn offset(&self, mesh: MeshId) -> Option<&MeshOffset> {
        self.offsets.get(&mesh)
    }

    /// The shared vertex buffer, once allocated.
    pub fn vertex_buffer(&self) -> Option<&A::Buffer> {
        self.vertex_buffer.as_ref()
    }

    /// The shared index buffer, once allocated.
    pub fn index_buffer(&self) -> Option<&A::Buffer> {
        self.index_buffer.as_ref()
    }

    /// Bytes of the vertex buffer in use, including ranges of evicted meshes
    /// not yet reclaimed by a rebuild.
    pub fn vertex_bytes_used(&self) -> u64 {
        self.vertex_used
    }

    /// Counterpart of [`Self::vertex_bytes_used()`] for the index buffer.
    pub fn index_bytes_used(&self) -> u64 {
        self.index_used
    }

    /// Whether any current batch draws `mesh`.
    pub(crate) fn is_mesh_batched(&self, mesh: MeshId) -> bool {
        self.batches.iter().any(|batch| batch.mesh == mesh)
    }

    pub(crate) fn set_batches(&mut self, batches: Vec<DrawBatch>) {
        if batches != self.batches {
            self.batches = batches;
            self.indirect.mark_all_dirty();
        }
    }

    pub(crate) fn write_instance(&mut self, slot: u32, entity: EntityId) {
        self.instance_table[slot as usize] = entity;
    }

    /// Full rebuild. Groups live renderable entities by material and mesh,
    /// opportunistically frees queued disposals, (re)allocates the shared
    /// buffers if absent or undersized, and repacks every resident mesh in
    /// deterministic material/mesh order.
    ///
    /// On success the set is prepared and invalidated: the offsets are
    /// trustworthy but every previously issued batch is stale, so the next
    /// cull must run before anything is drawn.
    pub(crate) fn prepare(
        &mut self,
        registry: &mut MeshRegistry,
        components: &RenderComponents,
        queued_disposals: &[MeshDisposal],
        options: &RenderOptions,
    ) -> Result<(), PrepareError> {
        let grouping = visibility::group_renderables(components);

        // Free disposed meshes not referenced by any current batch, before
        // deciding whether the buffers must grow.
        for disposal in queued_disposals {
            if self.is_mesh_batched(disposal.mesh) {
                continue;
            }
            if let Some(mesh) = registry.get_mut(disposal.mesh)
                && mesh.is_resident()
            {
                log::trace!(
                    "rebuild dropping disposed mesh {:?} ({} + {} bytes)",
                    disposal.mesh,
                    disposal.vertex_bytes,
                    disposal.index_bytes,
                );
                mesh.unload();
                self.offsets.remove(&disposal.mesh);
            }
        }

        // Required byte totals over the unique resident meshes. Non-resident
        // meshes have no geometry yet; they arrive later by append.
        let mut vertex_required: u64 = 0;
        let mut index_required: u64 = 0;
        for material_group in &grouping.materials {
            for mesh_group in &material_group.meshes {
                let mesh = registry.expect(mesh_group.mesh);
                if mesh.is_resident() {
                    vertex_required += mesh.vertex_bytes();
                    index_required += mesh.index_bytes();
                }
            }
        }

        Self::ensure_buffer(
            &self.allocator,
            &mut self.vertex_buffer,
            BufferUsage::Vertex,
            vertex_required,
            options,
        )?;
        Self::ensure_buffer(
            &self.allocator,
            &mut self.index_buffer,
            BufferUsage::Index,
            index_required,
            options,
        )?;

        // Repack at fresh offsets, materials in first-seen order, meshes in
        // first-seen order within each material.
        self.offsets.clear();
        self.vertex_used = 0;
        self.index_used = 0;
        let mut instance_total: u32 = 0;
        for material_group in &grouping.materials {
            for mesh_group in &material_group.meshes {
                let mesh = registry.expect(mesh_group.mesh);
                let instance_capacity = mesh_group.instances.len() as u32;
                if mesh.is_resident() {
                    let offset = MeshOffset {
                        vertex_byte_offset: self.vertex_used,
                        vertex_count: mesh.vertices().len() as u32,
                        index_byte_offset: self.index_used,
                        index_count: mesh.indices().len() as u32,
                        first_instance_slot: instance_total,
                        instance_capacity,
                        material: material_group.material,
                    };
                    if let Some(buffer) = &mut self.vertex_buffer {
                        buffer.write(self.vertex_used, bytemuck::must_cast_slice(mesh.vertices()));
                    }
                    if let Some(buffer) = &mut self.index_buffer {
                        buffer.write(self.index_used, bytemuck::must_cast_slice(mesh.indices()));
                    }
                    self.vertex_used += mesh.vertex_bytes();
                    self.index_used += mesh.index_bytes();
                    self.offsets.insert(mesh_group.mesh, offset);
                    instance_total += instance_capacity;
                }
            }
        }
        self.instance_table.clear();
        self.instance_table
            .resize(instance_total as usize, EntityId(0));

        // A resident mesh no live entity references was not packed; unload
        // it so that residency continues to imply a valid offset.
        for mesh in registry.iter_mut() {
            if mesh.is_resident() && !self.offsets.contains_key(&mesh.id()) {
                log::trace!("rebuild dropping unreferenced mesh {:?}", mesh.id());
                mesh.unload();
            }
        }

        // Everything previously batched referenced the old offsets.
        self.set_batches(Vec::new());
        self.prepared = true;
        self.invalidated = true;

        #[cfg(debug_assertions)]
        self.consistency_check();

        Ok(())
    }

    /// (Re)allocates one shared buffer if absent or undersized, freeing the
    /// old buffer first. Sized to `max(required, minimum) × reserve-factor`,
    /// clamped to the configured maximum.
    fn ensure_buffer(
        allocator: &A,
        buffer: &mut Option<A::Buffer>,
        usage: BufferUsage,
        required: u64,
        options: &RenderOptions,
    ) -> Result<(), PrepareError> {
        if let Some(maximum) = options.maximum_buffer_bytes
            && required > maximum
        {
            return Err(PrepareError::CapacityExceeded { required, maximum });
        }
        if let Some(existing) = buffer
            && existing.capacity() >= required
        {
            return Ok(());
        }

        let mut size = (required.max(options.minimum_buffer_bytes) as f64
            * options.buffer_reserve_factor) as u64;
        size = size.max(required);
        if let Some(maximum) = options.maximum_buffer_bytes {
            size = size.min(maximum);
        }

        *buffer = None;
        *buffer = Some(
            allocator
                .allocate(size, usage)
                .ok_or(PrepareError::Allocation { size })?,
        );
        log::debug!("allocated {size} byte {usage:?} buffer ({required} bytes required)");
        Ok(())
    }

    /// Incremental append of a newly resident mesh at the end of the used
    /// ranges, without disturbing existing offsets. `instance_count` slots
    /// are reserved at the end of the translation array.
    ///
    /// On [`AppendOutcome::InsufficientCapacity`] the render set is left
    /// unprepared and existing offsets untouched.
    pub(crate) fn append_mesh(
        &mut self,
        mesh: &Mesh,
        material: MaterialId,
        instance_count: u32,
    ) -> AppendOutcome {
        let (Some(vertex_buffer), Some(index_buffer)) =
            (&mut self.vertex_buffer, &mut self.index_buffer)
        else {
            self.prepared = false;
            return AppendOutcome::InsufficientCapacity;
        };

        let vertex_bytes = mesh.vertex_bytes();
        let index_bytes = mesh.index_bytes();
        if vertex_buffer.capacity() - self.vertex_used < vertex_bytes
            || index_buffer.capacity() - self.index_used < index_bytes
        {
            log::trace!(
                "append of mesh {:?} ({vertex_bytes} + {index_bytes} bytes) does not fit; \
                 forcing rebuild",
                mesh.id(),
            );
            self.prepared = false;
            return AppendOutcome::InsufficientCapacity;
        }

        vertex_buffer.write(self.vertex_used, bytemuck::must_cast_slice(mesh.vertices()));
        index_buffer.write(self.index_used, bytemuck::must_cast_slice(mesh.indices()));
        self.offsets.insert(
            mesh.id(),
            MeshOffset {
                vertex_byte_offset: self.vertex_used,
                vertex_count: mesh.vertices().len() as u32,
                index_byte_offset: self.index_used,
                index_count: mesh.indices().len() as u32,
                first_instance_slot: self.instance_table.len() as u32,
                instance_capacity: instance_count,
                material,
            },
        );
        self.vertex_used += vertex_bytes;
        self.index_used += index_bytes;
        self.instance_table
            .extend(std::iter::repeat_n(EntityId(0), instance_count as usize));
        log::trace!("appended mesh {:?} ({vertex_bytes} + {index_bytes} bytes)", mesh.id());

        #[cfg(debug_assertions)]
        self.consistency_check();

        AppendOutcome::Appended
    }

    /// Removes `mesh`'s offset. The byte range stays allocated (bump
    /// allocation, no compaction); it is reclaimed by the next full rebuild.
    pub(crate) fn release_mesh(&mut self, mesh: MeshId) -> Option<MeshOffset> {
        self.offsets.remove(&mesh)
    }

    /// Re-encodes the batch list into `frame`'s indirect-command buffer if
    /// that slot is marked dirty (the batch list changed since it was last
    /// written). Returns the number of packed commands.
    ///
    /// Only meaningful when [`RenderOptions::indirect`] submission is in
    /// use; `frame` is the caller's frame-in-flight index.
    pub fn write_indirect_commands(&mut self, frame: usize) -> Result<u32, PrepareError> {
        self.indirect.write(frame, &self.batches, &self.allocator)
    }

    /// The indirect-command buffer last written for `frame`, if any.
    pub fn indirect_buffer(&self, frame: usize) -> Option<&A::Buffer> {
        self.indirect.buffer(frame)
    }

    /// Whether `frame`'s indirect-command buffer is out of date with respect
    /// to the batch list.
    pub fn is_indirect_dirty(&self, frame: usize) -> bool {
        self.indirect.is_dirty(frame)
    }

    /// Number of commands in `frame`'s indirect-command buffer.
    pub fn indirect_command_count(&self, frame: usize) -> u32 {
        self.indirect.command_count(frame)
    }

    #[cfg(debug_assertions)]
    fn consistency_check(&self) {
        if let Some(buffer) = &self.vertex_buffer {
            assert!(self.vertex_used <= buffer.capacity());
        }
        if let Some(buffer) = &self.index_buffer {
            assert!(self.index_used <= buffer.capacity());
        }
        for (id, offset) in &self.offsets {
            assert!(
                offset.vertex_byte_offset + u64::from(offset.vertex_count) * crate::VERTEX_STRIDE as u64
                    <= self.vertex_used,
                "offset of {id:?} overruns used vertex range"
            );
            assert!(
                u64::from(offset.first_instance_slot) + u64::from(offset.instance_capacity)
                    <= self.instance_table.len() as u64,
                "instance slots of {id:?} overrun the translation array"
            );
        }
    }
}
