//! Helpers for tests of this crate (and of code depending on it).
//!
//! Do not rely on anything in this module; it is not subject to any
//! compatibility guarantees.

use core::cell::Cell;

use euclid::{point2, point3, vec3};
use hashbrown::{HashMap, HashSet};

use crate::buffers::{BufferUsage, DeviceAllocator, DeviceBuffer};
use crate::mesh::{GenerationError, LodLevel, MeshData, MeshGenerator, MeshId, MeshRegistry};
use crate::{FreeCoordinate, MeshVertex, ViewProjection, WorldBox};

/// A [`DeviceAllocator`] backed by plain memory.
#[derive(Debug, Default)]
pub struct MemAllocator {
    fail: bool,
    allocations: Cell<usize>,
}

impl MemAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An allocator whose every allocation fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            allocations: Cell::new(0),
        }
    }

    /// Number of successful allocations made so far.
    pub fn allocation_count(&self) -> usize {
        self.allocations.get()
    }
}

impl DeviceAllocator for MemAllocator {
    type Buffer = MemBuffer;

    fn allocate(&self, size: u64, usage: BufferUsage) -> Option<MemBuffer> {
        if self.fail {
            return None;
        }
        self.allocations.set(self.allocations.get() + 1);
        Some(MemBuffer {
            data: vec![0; usize::try_from(size).unwrap()],
            usage,
        })
    }
}

/// Buffer type of [`MemAllocator`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemBuffer {
    data: Vec<u8>,
    usage: BufferUsage,
}

impl MemBuffer {
    /// All bytes of the buffer, written or not.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl DeviceBuffer for MemBuffer {
    fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        let offset = usize::try_from(offset).unwrap();
        self.data[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// A [`MeshGenerator`] that returns prescripted geometry and records its
/// calls, for testing streaming behavior without real geometry.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    scripts: HashMap<MeshId, MeshData>,
    failing: HashSet<MeshId>,
    calls: Vec<MeshId>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&mut self, mesh: MeshId, data: MeshData) {
        self.scripts.insert(mesh, data);
    }

    /// Makes generation of `mesh` fail until cleared.
    pub fn set_failing(&mut self, mesh: MeshId, failing: bool) {
        if failing {
            self.failing.insert(mesh);
        } else {
            self.failing.remove(&mesh);
        }
    }

    /// Every mesh generation requested so far, in order.
    pub fn calls(&self) -> &[MeshId] {
        &self.calls
    }
}

impl MeshGenerator for ScriptedGenerator {
    fn generate(&mut self, mesh: MeshId) -> Result<MeshData, GenerationError> {
        self.calls.push(mesh);
        if self.failing.contains(&mesh) {
            return Err(format!("scripted generation failure for {mesh:?}").into());
        }
        Ok(match self.scripts.get(&mesh) {
            Some(data) => data.clone(),
            None => quad_data(),
        })
    }
}

/// A little square of geometry: 4 vertices, 6 indices, no LOD table.
pub fn quad_data() -> MeshData {
    let corners = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
    MeshData {
        vertices: corners
            .iter()
            .map(|&(x, y)| MeshVertex {
                position: point3(x, y, 0.0),
                normal: vec3(0.0, 0.0, 1.0),
                uv: point2(x as f32, y as f32),
            })
            .collect(),
        indices: vec![0, 1, 2, 0, 2, 3],
        bounds: euclid::Box3D {
            min: point3(0.0, 0.0, 0.0),
            max: point3(1.0, 1.0, 0.0),
        },
        lod_levels: Vec::new(),
    }
}

/// As [`quad_data()`], but with one 6-index LOD level per threshold,
/// thresholds ascending.
pub fn quad_data_with_lods(thresholds: &[FreeCoordinate]) -> MeshData {
    let mut data = quad_data();
    data.indices = data
        .indices
        .iter()
        .cycle()
        .take(6 * thresholds.len())
        .copied()
        .collect();
    data.lod_levels = thresholds
        .iter()
        .enumerate()
        .map(|(i, &threshold)| LodLevel {
            first_index: i as u32 * 6,
            index_count: 6,
            threshold,
        })
        .collect();
    data
}

/// Installs [`quad_data()`] into `mesh`, making it resident in the registry
/// (though not in any render set).
pub fn install_quad(registry: &mut MeshRegistry, mesh: MeshId) {
    registry.get_mut(mesh).unwrap().install_data(quad_data());
}

/// A bounding box around the world origin, for entities that should be
/// trivially inside [`orthographic_vp()`]'s frustum.
pub fn fixture_bounds() -> WorldBox {
    bounds_at((0.0, 0.0, -50.0), 1.0)
}

pub fn bounds_at(center: (FreeCoordinate, FreeCoordinate, FreeCoordinate), half: FreeCoordinate) -> WorldBox {
    WorldBox {
        min: point3(center.0 - half, center.1 - half, center.2 - half),
        max: point3(center.0 + half, center.1 + half, center.2 + half),
    }
}

/// Orthographic view-projection: camera at the origin looking along -z,
/// viewing `x ∈ [-half_width, half_width]`, `y ∈ [-half_height, half_height]`,
/// `z ∈ [-far, -near]`, with 0..1 depth.
pub fn orthographic_vp(
    half_width: FreeCoordinate,
    half_height: FreeCoordinate,
    near: FreeCoordinate,
    far: FreeCoordinate,
) -> ViewProjection {
    #[rustfmt::skip]
    let vp = ViewProjection::new(
        1.0 / half_width, 0.0, 0.0, 0.0,
        0.0, 1.0 / half_height, 0.0, 0.0,
        0.0, 0.0, -1.0 / (far - near), 0.0,
        0.0, 0.0, -near / (far - near), 1.0,
    );
    vp
}
