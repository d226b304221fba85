//! Render-set management for large, dynamically streamed mesh worlds:
//! frustum culling, level-of-detail selection, per-material draw batching,
//! and a streaming controller that keeps a small set of capacity-bounded,
//! GPU-shared vertex/index buffers populated with exactly the geometry the
//! currently visible set needs.
//!
//! All of the algorithms here are independent of graphics API. To connect a
//! backend, implement [`DeviceAllocator`] and [`DeviceBuffer`] over its buffer
//! objects, feed per-entity data in through [`components::RenderComponents`],
//! and consume [`RenderSet::batches()`] (or the packed indirect-command
//! buffers) from your draw submission code.
//!
//! # Getting started
//!
//! [`StreamingController`] is the key type; everything else supports its
//! once-per-frame [`StreamingController::update()`]. Register meshes with
//! [`MeshRegistry`], provide geometry on demand via a [`MeshGenerator`]
//! implementation, and call `update()` with the frame's view-projection
//! transform.
//!
//! Restrictions and caveats:
//! * Single-threaded and frame-synchronous by design; mesh generation is a
//!   deliberately blocking call, bounded by a per-frame request cap.
//! * Shared buffers are bump-allocated: space released by eviction is only
//!   reclaimed by the next full rebuild, never compacted incrementally.

// Crate-specific lint settings. (General settings can be found in the workspace manifest.)
#![forbid(unsafe_code)]

mod batch;
pub use batch::{DrawBatch, DrawIndexedIndirectArgs};
mod buffers;
pub use buffers::{BufferUsage, DeviceAllocator, DeviceBuffer};
pub mod components;
mod frustum;
pub use frustum::Frustum;
mod mesh;
pub use mesh::{
    GenerationError, LodLevel, MaterialId, Mesh, MeshData, MeshGenerator, MeshId, MeshRegistry,
    Residency,
};
mod options;
pub use options::RenderOptions;
mod render_set;
pub use render_set::{MeshOffset, PrepareError, RenderSet};
mod streaming;
pub use streaming::{Flaws, StreamingController, UpdateError, UpdateInfo};
mod vertex;
pub use vertex::{INDEX_STRIDE, MeshVertex, PackedVertex, Texel, VERTEX_STRIDE};
mod visibility;
pub use visibility::{MeshDisposal, MeshRequest};

#[doc(hidden)]
pub mod testing;

#[cfg(test)]
mod tests;

/// Scalar type for world-space coordinates and distances.
pub type FreeCoordinate = f64;

/// Unit-of-measure tag for world space.
#[derive(Clone, Copy, Debug)]
pub enum World {}

/// Unit-of-measure tag for a mesh's own model space.
#[derive(Clone, Copy, Debug)]
pub enum Model {}

/// Unit-of-measure tag for clip space (post view-projection).
#[derive(Clone, Copy, Debug)]
pub enum Clip {}

/// A point in world space.
pub type FreePoint = euclid::Point3D<FreeCoordinate, World>;

/// A vector in world space.
pub type FreeVector = euclid::Vector3D<FreeCoordinate, World>;

/// An axis-aligned box in world space.
pub type WorldBox = euclid::Box3D<FreeCoordinate, World>;

/// An axis-aligned box in a mesh's model space.
pub type ModelBox = euclid::Box3D<FreeCoordinate, Model>;

/// A combined view-projection transform, world space to clip space.
///
/// The clip-space convention is `-w ≤ x ≤ w`, `-w ≤ y ≤ w`, `0 ≤ z ≤ w`
/// (depth range 0 to 1).
pub type ViewProjection = euclid::Transform3D<FreeCoordinate, World, Clip>;
