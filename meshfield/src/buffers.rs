//! The consumed device-buffer contract.
//!
//! This subsystem never issues graphics-API calls; it only requests
//! fixed-capacity host-writable buffers from a [`DeviceAllocator`] and writes
//! bytes through them. A real backend (e.g. wgpu) implements these traits
//! over its buffer objects; [`crate::testing::MemAllocator`] implements them
//! in plain memory for tests.

use core::fmt;

/// What a requested buffer will be bound as.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum BufferUsage {
    /// Shared vertex buffer.
    Vertex,
    /// Shared index buffer.
    Index,
    /// Packed indirect-command buffer.
    Indirect,
}

/// Allocator of fixed-capacity, host-writable, device-readable buffers.
pub trait DeviceAllocator: fmt::Debug {
    /// The allocated buffer handle type. Dropping it frees the buffer.
    type Buffer: DeviceBuffer;

    /// Allocates a buffer of exactly `size` bytes, or returns [`None`] if the
    /// device is out of resources.
    ///
    /// The allocation will not escape the allocator's lifetime, but the
    /// allocator is not required to track it.
    fn allocate(&self, size: u64, usage: BufferUsage) -> Option<Self::Buffer>;
}

/// A fixed-capacity buffer handle obtained from a [`DeviceAllocator`].
pub trait DeviceBuffer: fmt::Debug {
    /// The fixed byte capacity this buffer was allocated with.
    fn capacity(&self) -> u64;

    /// Writes `data` at byte `offset`.
    ///
    /// Callers stay within `capacity()`; implementations may panic on a
    /// violation, since by then the offset table is already corrupt.
    fn write(&mut self, offset: u64, data: &[u8]);
}
