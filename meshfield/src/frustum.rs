//! View frustum extraction and box-visibility queries.

use arrayvec::ArrayVec;
use euclid::point3;
use itertools::iproduct;

use crate::{FreeCoordinate, FreePoint, FreeVector, ViewProjection, WorldBox};

/// A plane in world space, in the form `normal · p + offset = 0`.
///
/// The normal points toward the half-space considered inside.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Plane {
    normal: FreeVector,
    offset: FreeCoordinate,
}

impl Plane {
    fn normalized(normal: FreeVector, offset: FreeCoordinate) -> Self {
        let length = normal.square_length().sqrt();
        if length > 0.0 {
            Self {
                normal: normal / length,
                offset: offset / length,
            }
        } else {
            Self { normal, offset }
        }
    }

    fn signed_distance(&self, point: FreePoint) -> FreeCoordinate {
        self.normal.dot(point.to_vector()) + self.offset
    }
}

const LEFT: usize = 0;
const RIGHT: usize = 1;
const BOTTOM: usize = 2;
const TOP: usize = 3;
const NEAR: usize = 4;
const FAR: usize = 5;

/// A view frustum derived from a combined view-projection transform:
/// six clip planes and eight corner points, computed once at construction.
///
/// Visibility answers may err toward visible (a missed cull costs only
/// draw time) but never report an axis-aligned box invisible when any part
/// of it intersects the frustum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    planes: [Plane; 6],
    corners: [FreePoint; 8],
}

impl Frustum {
    /// Extracts planes and corners from `view_projection`.
    ///
    /// Returns [`None`] if the transform is degenerate (its planes do not
    /// meet in well-defined corner points), in which case callers should
    /// treat everything as visible rather than cull against garbage.
    pub fn new(view_projection: &ViewProjection) -> Option<Self> {
        let m = view_projection;
        // Rows of the transform are combined per the usual Gribb/Hartmann
        // extraction, adjusted for row-vector convention and 0..1 depth.
        let planes = [
            // x ≥ -w
            Plane::normalized(
                FreeVector::new(m.m14 + m.m11, m.m24 + m.m21, m.m34 + m.m31),
                m.m44 + m.m41,
            ),
            // x ≤ w
            Plane::normalized(
                FreeVector::new(m.m14 - m.m11, m.m24 - m.m21, m.m34 - m.m31),
                m.m44 - m.m41,
            ),
            // y ≥ -w
            Plane::normalized(
                FreeVector::new(m.m14 + m.m12, m.m24 + m.m22, m.m34 + m.m32),
                m.m44 + m.m42,
            ),
            // y ≤ w
            Plane::normalized(
                FreeVector::new(m.m14 - m.m12, m.m24 - m.m22, m.m34 - m.m32),
                m.m44 - m.m42,
            ),
            // z ≥ 0
            Plane::normalized(FreeVector::new(m.m13, m.m23, m.m33), m.m43),
            // z ≤ w
            Plane::normalized(
                FreeVector::new(m.m14 - m.m13, m.m24 - m.m23, m.m34 - m.m33),
                m.m44 - m.m43,
            ),
        ];

        let corner_of = |a: usize, b: usize, c: usize| -> Option<FreePoint> {
            intersect_three_planes(&planes[a], &planes[b], &planes[c])
        };
        let corners = [
            corner_of(LEFT, BOTTOM, NEAR)?,
            corner_of(RIGHT, BOTTOM, NEAR)?,
            corner_of(LEFT, TOP, NEAR)?,
            corner_of(RIGHT, TOP, NEAR)?,
            corner_of(LEFT, BOTTOM, FAR)?,
            corner_of(RIGHT, BOTTOM, FAR)?,
            corner_of(LEFT, TOP, FAR)?,
            corner_of(RIGHT, TOP, FAR)?,
        ];

        Some(Self { planes, corners })
    }

    /// The eight corner points, in (left/right, bottom/top, near/far) order.
    pub fn corners(&self) -> [FreePoint; 8] {
        self.corners
    }

    /// Whether any part of the axis-aligned box `bounds` may lie inside the
    /// frustum. Min/max ordering of the box is normalized before testing.
    pub fn is_box_visible(&self, bounds: WorldBox) -> bool {
        let min = bounds.min.min(bounds.max);
        let max = bounds.min.max(bounds.max);
        let box_corners: ArrayVec<FreePoint, 8> =
            iproduct!([min.x, max.x], [min.y, max.y], [min.z, max.z])
                .map(|(x, y, z)| point3(x, y, z))
                .collect();

        // Fast reject: the whole box is behind one plane.
        'planes: for plane in &self.planes {
            for &corner in &box_corners {
                if plane.signed_distance(corner) >= 0.0 {
                    continue 'planes;
                }
            }
            return false;
        }

        // The plane test alone misses the case of a large box's corners all
        // lying outside the planes while the box still does not intersect
        // the frustum, and conversely fails to reject a box strictly beyond
        // one axis extent of a frustum whose planes are oblique. Reject if
        // every frustum corner is outside one axis bound of the box.
        if self.corners.iter().all(|c| c.x < min.x) {
            return false;
        }
        if self.corners.iter().all(|c| c.x > max.x) {
            return false;
        }
        if self.corners.iter().all(|c| c.y < min.y) {
            return false;
        }
        if self.corners.iter().all(|c| c.y > max.y) {
            return false;
        }
        if self.corners.iter().all(|c| c.z < min.z) {
            return false;
        }
        if self.corners.iter().all(|c| c.z > max.z) {
            return false;
        }

        true
    }
}

/// Point at which three planes meet, or [`None`] if any two are parallel.
fn intersect_three_planes(p1: &Plane, p2: &Plane, p3: &Plane) -> Option<FreePoint> {
    let n1 = p1.normal;
    let n2 = p2.normal;
    let n3 = p3.normal;
    let denominator = n1.dot(n2.cross(n3));
    if denominator.abs() < 1e-9 {
        return None;
    }
    let numerator = n2.cross(n3) * -p1.offset + n3.cross(n1) * -p2.offset + n1.cross(n2) * -p3.offset;
    Some((numerator / denominator).to_point())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::orthographic_vp;

    use euclid::size3;

    fn test_frustum() -> Frustum {
        // Views the box x ∈ [-10, 10], y ∈ [-10, 10], z ∈ [-100, -1].
        Frustum::new(&orthographic_vp(10.0, 10.0, 1.0, 100.0)).unwrap()
    }

    #[test]
    fn corners_of_orthographic_frustum() {
        let frustum = test_frustum();
        let corners = frustum.corners();
        for corner in corners {
            assert!(
                (corner.x.abs() - 10.0).abs() < 1e-6
                    && (corner.y.abs() - 10.0).abs() < 1e-6
                    && ((corner.z + 1.0).abs() < 1e-6 || (corner.z + 100.0).abs() < 1e-6),
                "unexpected corner {corner:?}"
            );
        }
    }

    #[test]
    fn box_inside_is_visible() {
        let frustum = test_frustum();
        let bounds = WorldBox::from_origin_and_size(point3(-1.0, -1.0, -50.0), size3(2.0, 2.0, 2.0));
        assert!(frustum.is_box_visible(bounds));
    }

    #[test]
    fn box_behind_one_plane_is_invisible() {
        let frustum = test_frustum();
        // Entirely to the right of the right plane.
        let bounds = WorldBox::from_origin_and_size(point3(20.0, -1.0, -50.0), size3(2.0, 2.0, 2.0));
        assert!(!frustum.is_box_visible(bounds));
    }

    #[test]
    fn box_behind_camera_is_invisible() {
        let frustum = test_frustum();
        let bounds = WorldBox::from_origin_and_size(point3(-1.0, -1.0, 10.0), size3(2.0, 2.0, 2.0));
        assert!(!frustum.is_box_visible(bounds));
    }

    #[test]
    fn box_enclosing_frustum_is_visible() {
        let frustum = test_frustum();
        let bounds =
            WorldBox::from_origin_and_size(point3(-1e3, -1e3, -1e3), size3(2e3, 2e3, 2e3));
        assert!(frustum.is_box_visible(bounds));
    }

    /// Perspective transform with 45° half-angle, looking along -z.
    fn perspective_vp(near: FreeCoordinate, far: FreeCoordinate) -> ViewProjection {
        let a = -far / (far - near);
        let b = -far * near / (far - near);
        #[rustfmt::skip]
        let vp = ViewProjection::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, a, -1.0,
            0.0, 0.0, b, 0.0,
        );
        vp
    }

    #[test]
    fn large_box_beside_small_frustum() {
        let frustum = Frustum::new(&perspective_vp(1.0, 100.0)).unwrap();
        // A huge box entirely to the right of the frustum's x extent, but so
        // large that no single oblique plane contains all of its corners in
        // its negative half-space. Only the corner test rejects it.
        let bounds = WorldBox {
            min: point3(1000.0, -10.0, -2000.0),
            max: point3(3000.0, 10.0, -1.0),
        };
        assert!(!frustum.is_box_visible(bounds));
    }

    #[test]
    fn swapped_min_max_is_normalized() {
        let frustum = test_frustum();
        let bounds = WorldBox {
            min: point3(1.0, 1.0, -48.0),
            max: point3(-1.0, -1.0, -50.0),
        };
        assert!(frustum.is_box_visible(bounds));
    }

    #[test]
    fn degenerate_transform_is_rejected() {
        assert_eq!(Frustum::new(&ViewProjection::identity().then_scale(0.0, 0.0, 0.0)), None);
    }
}
