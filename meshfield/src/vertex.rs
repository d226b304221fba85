//! Vertex formats: generation output and the quantized device-buffer form.

use euclid::{Point2D, Point3D, Vector3D};

use crate::{FreeCoordinate, Model};

/// Unit-of-measure tag for texture coordinates.
#[derive(Clone, Copy, Debug)]
pub enum Texel {}

/// A mesh vertex as produced by geometry generation, in full precision.
///
/// This form never reaches the device; it is quantized to [`PackedVertex`]
/// once, when the mesh is streamed in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshVertex {
    /// Position in the mesh's own model space.
    pub position: Point3D<FreeCoordinate, Model>,
    /// Surface normal; need not be normalized.
    pub normal: Vector3D<f32, Model>,
    /// Texture coordinates.
    pub uv: Point2D<f32, Texel>,
}

/// The GPU form of a vertex, as written into the shared vertex buffer.
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct PackedVertex {
    position: [f32; 3],
    normal: [f32; 3],
    uv: [f32; 2],
}

impl From<MeshVertex> for PackedVertex {
    fn from(vertex: MeshVertex) -> Self {
        let MeshVertex {
            position,
            normal,
            uv,
        } = vertex;
        Self {
            position: position.cast::<f32>().into(),
            normal: normal.into(),
            uv: uv.into(),
        }
    }
}

/// Byte stride of one vertex in the shared vertex buffer.
pub const VERTEX_STRIDE: usize = size_of::<PackedVertex>();

/// Byte stride of one index in the shared index buffer.
pub const INDEX_STRIDE: usize = size_of::<u32>();

#[cfg(test)]
mod tests {
    use super::*;
    use euclid::{point2, point3, vec3};

    #[test]
    fn packing_quantizes_position() {
        let vertex = MeshVertex {
            position: point3(1.5, -2.0, 1e-40),
            normal: vec3(0.0, 1.0, 0.0),
            uv: point2(0.25, 0.75),
        };
        assert_eq!(
            PackedVertex::from(vertex),
            PackedVertex {
                position: [1.5, -2.0, 1e-40f64 as f32],
                normal: [0.0, 1.0, 0.0],
                uv: [0.25, 0.75],
            }
        );
    }

    #[test]
    fn stride_has_no_padding() {
        assert_eq!(VERTEX_STRIDE, 8 * size_of::<f32>());
    }
}
