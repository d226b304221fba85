//! Configuration of the render-set subsystem.

use crate::FreeCoordinate;

/// Tuning knobs for culling, buffer sizing, and streaming.
///
/// Obtain a baseline from [`RenderOptions::default()`] and adjust fields;
/// every default is documented on its field.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct RenderOptions {
    /// Whether to frustum-cull instances. When false, every instance within
    /// its cull distance is drawn, and rebuilds fetch non-resident meshes
    /// eagerly instead of deferring to streaming.
    ///
    /// Default: `true`.
    pub culling: bool,

    /// Whether to select LOD levels by distance. When false, level 0 is
    /// always drawn.
    ///
    /// Default: `true`.
    pub lod: bool,

    /// Shared buffers are sized to `max(required, minimum_buffer_bytes)`
    /// times this factor, so that moderate growth does not force a
    /// reallocation every frame.
    ///
    /// Default: `1.5`.
    pub buffer_reserve_factor: f64,

    /// Lower bound on the byte size of each shared buffer.
    ///
    /// Default: `65536`.
    pub minimum_buffer_bytes: u64,

    /// Upper bound on the byte size of each shared buffer. A rebuild whose
    /// required size exceeds this fails with
    /// [`PrepareError::CapacityExceeded`](crate::PrepareError::CapacityExceeded);
    /// truncation would corrupt the offset table.
    ///
    /// Default: `None` (unbounded).
    pub maximum_buffer_bytes: Option<u64>,

    /// Maximum number of mesh requests serviced per frame. Generation is a
    /// blocking call; this cap bounds worst-case frame time.
    ///
    /// Default: `10`.
    pub requests_per_frame: usize,

    /// A resident, invisible instance becomes an eviction candidate when its
    /// distance exceeds this fraction of [`Self::far_distance`].
    ///
    /// Default: `0.5`.
    pub eviction_distance_fraction: f64,

    /// Distance to the far plane, used only to scale
    /// [`Self::eviction_distance_fraction`].
    ///
    /// Default: `1000.0`.
    pub far_distance: FreeCoordinate,

    /// Number of indirect-command buffer slots kept, one per frame in
    /// flight.
    ///
    /// Default: `2`.
    pub frames_in_flight: usize,

    /// Whether draw batches are additionally packed into indirect-command
    /// buffers for GPU-driven submission.
    ///
    /// Default: `false`.
    pub indirect: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            culling: true,
            lod: true,
            buffer_reserve_factor: 1.5,
            minimum_buffer_bytes: 65536,
            maximum_buffer_bytes: None,
            requests_per_frame: 10,
            eviction_distance_fraction: 0.5,
            far_distance: 1000.0,
            frames_in_flight: 2,
            indirect: false,
        }
    }
}

impl RenderOptions {
    /// The distance beyond which a resident, invisible instance becomes an
    /// eviction candidate.
    pub(crate) fn eviction_distance(&self) -> FreeCoordinate {
        self.eviction_distance_fraction * self.far_distance
    }
}
