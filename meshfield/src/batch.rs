//! Draw batches and their packed indirect-command form.

use crate::buffers::{BufferUsage, DeviceAllocator, DeviceBuffer};
use crate::render_set::PrepareError;
use crate::{MaterialId, MeshId};

/// One indexed-instanced draw covering all visible instances of one mesh at
/// one LOD level, sharing a material.
///
/// `first_instance..first_instance + instance_count` indexes into the render
/// set's entity-id translation array, through which downstream shader code
/// looks up per-instance data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct DrawBatch {
    /// Material shared by all instances in this batch.
    pub material: MaterialId,
    /// Mesh drawn, for statistics and eviction safety checks.
    pub mesh: MeshId,
    /// LOD level drawn, for statistics.
    pub lod: u32,
    /// First index, relative to the start of the shared index buffer.
    pub first_index: u32,
    /// Number of indices.
    pub index_count: u32,
    /// Added to each index before vertex lookup; the mesh's position in the
    /// shared vertex buffer.
    pub base_vertex: i32,
    /// First slot of this batch's range in the translation array.
    pub first_instance: u32,
    /// Number of instances. Zero-instance batches are never emitted.
    pub instance_count: u32,
}

/// One draw command in the standard indexed-indirect layout, as written to an
/// indirect-command buffer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct DrawIndexedIndirectArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

impl From<DrawBatch> for DrawIndexedIndirectArgs {
    fn from(batch: DrawBatch) -> Self {
        let DrawBatch {
            material: _,
            mesh: _,
            lod: _,
            first_index,
            index_count,
            base_vertex,
            first_instance,
            instance_count,
        } = batch;
        Self {
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        }
    }
}

/// Per-frame-in-flight indirect-command buffers with dirty tracking.
///
/// Each slot is re-encoded lazily, when asked for while dirty; all slots are
/// marked dirty whenever the batch list changes.
#[derive(Debug)]
pub(crate) struct IndirectBuffers<B> {
    slots: Vec<IndirectSlot<B>>,
}

#[derive(Debug)]
struct IndirectSlot<B> {
    buffer: Option<B>,
    dirty: bool,
    command_count: u32,
}

impl<B: DeviceBuffer> IndirectBuffers<B> {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            slots: (0..frames_in_flight)
                .map(|_| IndirectSlot {
                    buffer: None,
                    dirty: false,
                    command_count: 0,
                })
                .collect(),
        }
    }

    pub fn mark_all_dirty(&mut self) {
        for slot in &mut self.slots {
            slot.dirty = true;
        }
    }

    pub fn is_dirty(&self, frame: usize) -> bool {
        self.slots[frame].dirty
    }

    pub fn buffer(&self, frame: usize) -> Option<&B> {
        self.slots.get(frame).and_then(|slot| slot.buffer.as_ref())
    }

    pub fn command_count(&self, frame: usize) -> u32 {
        self.slots[frame].command_count
    }

    /// Re-encodes `batches` into `frame`'s buffer if that slot is dirty.
    /// Returns the command count.
    pub fn write<A: DeviceAllocator<Buffer = B>>(
        &mut self,
        frame: usize,
        batches: &[DrawBatch],
        allocator: &A,
    ) -> Result<u32, PrepareError> {
        assert!(frame < self.slots.len(), "frame slot {frame} out of range");
        let slot = &mut self.slots[frame];
        if !slot.dirty {
            return Ok(slot.command_count);
        }

        let commands: Vec<DrawIndexedIndirectArgs> =
            batches.iter().map(|&batch| batch.into()).collect();
        let required = (commands.len() * size_of::<DrawIndexedIndirectArgs>()) as u64;
        if required > 0 {
            if slot.buffer.as_ref().is_none_or(|b| b.capacity() < required) {
                slot.buffer = None;
                slot.buffer = Some(
                    allocator
                        .allocate(required, BufferUsage::Indirect)
                        .ok_or(PrepareError::Allocation { size: required })?,
                );
            }
            if let Some(buffer) = &mut slot.buffer {
                buffer.write(0, bytemuck::must_cast_slice(&commands));
            }
        }
        slot.command_count = commands.len() as u32;
        slot.dirty = false;
        Ok(slot.command_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indirect_args_layout() {
        assert_eq!(size_of::<DrawIndexedIndirectArgs>(), 20);
        let args = DrawIndexedIndirectArgs {
            index_count: 1,
            instance_count: 2,
            first_index: 3,
            base_vertex: -4,
            first_instance: 5,
        };
        assert_eq!(
            bytemuck::bytes_of(&args),
            [
                1u32.to_ne_bytes(),
                2u32.to_ne_bytes(),
                3u32.to_ne_bytes(),
                (-4i32).to_ne_bytes(),
                5u32.to_ne_bytes(),
            ]
            .concat()
        );
    }
}
