//! The per-frame streaming controller: orchestrates rebuilds and culls, then
//! resolves the cull's request and disposal side channels against buffer
//! capacity.

use core::fmt;

use hashbrown::HashMap;
use ordered_float::OrderedFloat;

use crate::buffers::DeviceAllocator;
use crate::components::RenderComponents;
use crate::frustum::Frustum;
use crate::mesh::{MaterialId, MeshGenerator, MeshId, MeshRegistry};
use crate::options::RenderOptions;
use crate::render_set::{AppendOutcome, PrepareError, RenderSet};
use crate::visibility::{self, MeshDisposal};
use crate::ViewProjection;

bitflags::bitflags! {
    /// Deficiencies of one frame's update.
    ///
    /// This type describes the ways in which the produced batch list could
    /// fail to cover everything the visible set wants drawn. The
    /// [empty](Self::empty) set means no flaws are present.
    ///
    /// It is a [`bitflags`] generated bit-flag type; treat it as a set of
    /// named values only.
    #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
    pub struct Flaws: u8 {
        /// Streaming or rebuild work was deferred to a later frame: requests
        /// beyond the per-frame cap, an append that did not fit, or an
        /// instance-slot overflow forcing a rebuild.
        const UNFINISHED = 1 << 0;

        /// A visible instance referenced a mesh that is not yet resident;
        /// it is absent from this frame's batches.
        const MISSING_MESHES = 1 << 1;
    }
}

impl Default for Flaws {
    /// Equivalent to [`Self::empty()`].
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Flaws {
    /// Displays the flags as text like `UNFINISHED | MISSING_MESHES`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Performance and degradation information produced by one
/// [`StreamingController::update()`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct UpdateInfo {
    /// Ways in which this frame's batches fall short of the visible set.
    pub flaws: Flaws,
    /// Whether a full rebuild of the render set ran.
    pub rebuilt: bool,
    /// Whether the cull pass ran (it is skipped when nothing changed).
    pub cull_ran: bool,
    /// Instances placed into batches.
    pub instances_drawn: usize,
    /// Instances rejected by the near cutoff, frustum, or cull distance.
    pub instances_culled: usize,
    /// Number of live draw batches after this update.
    pub batch_count: usize,
    /// Mesh requests emitted by this frame's cull.
    pub requests_issued: usize,
    /// Meshes generated and appended this frame.
    pub meshes_streamed: usize,
    /// Meshes evicted this frame.
    pub meshes_evicted: usize,
    /// Bytes appended to the shared buffers this frame.
    pub bytes_appended: u64,
}

/// Errors from [`StreamingController::update()`].
///
/// The controller's persisted state stays consistent after an error; the
/// next update retries naturally.
#[derive(Debug, displaydoc::Display)]
#[non_exhaustive]
pub enum UpdateError {
    /// rebuilding the render set failed
    Prepare(PrepareError),
    /// generating geometry for mesh {mesh:?} failed
    Generation {
        /// The mesh whose generation failed. It remains unloaded, so a later
        /// cull re-requests it.
        mesh: MeshId,
        /// The generator's error.
        source: crate::GenerationError,
    },
}

impl std::error::Error for UpdateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UpdateError::Prepare(e) => Some(e),
            UpdateError::Generation { source, .. } => Some(source.as_ref()),
        }
    }
}

/// Top-level driver of the render-set subsystem.
///
/// Owns the [`RenderSet`], the [`MeshRegistry`], and the injected
/// [`MeshGenerator`]. Call [`Self::update()`] exactly once per frame, on the
/// frame thread, before draw submission.
#[derive(Debug)]
pub struct StreamingController<A: DeviceAllocator, G> {
    render_set: RenderSet<A>,
    registry: MeshRegistry,
    generator: G,
    options: RenderOptions,
    last_view_projection: Option<ViewProjection>,
    /// Disposal candidates eviction had to skip (batch-referenced), queued
    /// for the next rebuild's opportunistic free.
    queued_disposals: Vec<MeshDisposal>,
    first_cull_done: bool,
    /// Residency changed since the last cull, making pending requests
    /// resolvable or batches stale.
    residency_changed: bool,
}

impl<A: DeviceAllocator, G: MeshGenerator> StreamingController<A, G> {
    pub fn new(allocator: A, generator: G, options: RenderOptions) -> Self {
        Self {
            render_set: RenderSet::new(allocator, options.frames_in_flight),
            registry: MeshRegistry::new(),
            generator,
            options,
            last_view_projection: None,
            queued_disposals: Vec::new(),
            first_cull_done: false,
            residency_changed: false,
        }
    }

    pub fn render_set(&self) -> &RenderSet<A> {
        &self.render_set
    }

    /// Mutable access, for [`RenderSet::invalidate()`] and for writing
    /// indirect-command buffers at submission time.
    pub fn render_set_mut(&mut self) -> &mut RenderSet<A> {
        &mut self.render_set
    }

    pub fn registry(&self) -> &MeshRegistry {
        &self.registry
    }

    /// Mutable access, for registering meshes.
    pub fn registry_mut(&mut self) -> &mut MeshRegistry {
        &mut self.registry
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn generator_mut(&mut self) -> &mut G {
        &mut self.generator
    }

    /// Signals that renderable component data changed since the last cull.
    pub fn invalidate(&mut self) {
        self.render_set.invalidate();
    }

    /// Performs one frame's work:
    ///
    /// 1. Rebuilds the render set if its offset table is stale.
    /// 2. Culls, selects LOD, and batches — skipped when the transform,
    ///    components, and residency are all unchanged since the last cull.
    /// 3. Services mesh requests closest-first, bounded per frame, appending
    ///    each generated mesh to the shared buffers.
    /// 4. Evicts disposal candidates farthest-first, skipping any mesh a
    ///    live batch references.
    pub fn update(
        &mut self,
        components: &RenderComponents,
        view_projection: ViewProjection,
    ) -> Result<UpdateInfo, UpdateError> {
        let mut info = UpdateInfo::default();

        if !self.render_set.is_prepared() {
            if !self.options.culling {
                // Without culling there is no request channel; residency is
                // established eagerly during the rebuild instead.
                self.fetch_all_eagerly(components)?;
            }
            self.render_set
                .prepare(
                    &mut self.registry,
                    components,
                    &self.queued_disposals,
                    &self.options,
                )
                .map_err(UpdateError::Prepare)?;
            self.queued_disposals.clear();
            info.rebuilt = true;
        }

        // The cull is a pure function of camera and entities; re-run it only
        // when an input (or mesh residency) changed.
        let need_cull = self.last_view_projection.as_ref() != Some(&view_projection)
            || self.render_set.is_invalidated()
            || self.residency_changed
            || !self.first_cull_done;
        if !need_cull {
            info.batch_count = self.render_set.batches().len();
            return Ok(info);
        }

        let frustum = if self.options.culling {
            let frustum = Frustum::new(&view_projection);
            if frustum.is_none() {
                log::warn!("degenerate view-projection transform; nothing frustum-culled");
            }
            frustum
        } else {
            None
        };
        let cull = visibility::cull(
            &mut self.render_set,
            &self.registry,
            components,
            frustum.as_ref(),
            &self.options,
        );
        self.last_view_projection = Some(view_projection);
        info.cull_ran = true;
        info.instances_drawn = cull.instances_drawn;
        info.instances_culled = cull.instances_culled;
        info.requests_issued = cull.requests.len();
        if cull.missing_meshes {
            info.flaws |= Flaws::MISSING_MESHES;
        }
        if cull.overflowed {
            // The render set declared itself unprepared; nothing can be
            // drawn this frame, and the next update rebuilds first.
            info.flaws |= Flaws::UNFINISHED;
            return Ok(info);
        }
        self.first_cull_done = true;
        self.residency_changed = false;

        if let Err(error) = self.stream_requests(cull.requests, components, &mut info) {
            // The failed request died with this frame; force the next cull
            // to run so that it is re-emitted.
            self.residency_changed = true;
            return Err(error);
        }
        self.evict(cull.disposals, &mut info);

        info.batch_count = self.render_set.batches().len();
        Ok(info)
    }

    /// Services this frame's requests, closest first, up to the per-frame
    /// cap. Each serviced mesh is generated synchronously, quantized, and
    /// appended; an append that does not fit stops the pass and leaves the
    /// render set unprepared.
    fn stream_requests(
        &mut self,
        mut requests: Vec<crate::MeshRequest>,
        components: &RenderComponents,
        info: &mut UpdateInfo,
    ) -> Result<(), UpdateError> {
        if requests.is_empty() {
            return Ok(());
        }
        requests.sort_by_key(|request| OrderedFloat(request.distance));

        // Owning material and instance count per mesh, for offset records.
        let mut usage: HashMap<MeshId, (MaterialId, u32)> = HashMap::new();
        for material_group in &visibility::group_renderables(components).materials {
            for mesh_group in &material_group.meshes {
                usage.insert(
                    mesh_group.mesh,
                    (material_group.material, mesh_group.instances.len() as u32),
                );
            }
        }

        let mut serviced = 0;
        for request in &requests {
            // A mesh requested by several instances is streamed only once.
            if self.registry.expect(request.mesh).is_resident() {
                continue;
            }
            if serviced >= self.options.requests_per_frame {
                info.flaws |= Flaws::UNFINISHED;
                break;
            }
            serviced += 1;

            let data = self
                .generator
                .generate(request.mesh)
                .map_err(|source| UpdateError::Generation {
                    mesh: request.mesh,
                    source,
                })?;
            let mesh = match self.registry.get_mut(request.mesh) {
                Some(mesh) => mesh,
                None => panic!("requested mesh {:?} is not registered", request.mesh),
            };
            mesh.install_data(data);
            let appended_bytes = mesh.vertex_bytes() + mesh.index_bytes();

            let (material, instance_count) = usage[&request.mesh];
            match self
                .render_set
                .append_mesh(self.registry.expect(request.mesh), material, instance_count)
            {
                AppendOutcome::Appended => {
                    self.residency_changed = true;
                    info.meshes_streamed += 1;
                    info.bytes_appended += appended_bytes;
                }
                AppendOutcome::InsufficientCapacity => {
                    // The mesh stays resident in the registry; the rebuild
                    // forced for next frame packs it then.
                    self.residency_changed = true;
                    info.flaws |= Flaws::UNFINISHED;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Evicts this frame's disposal candidates, farthest first. A mesh any
    /// live batch references is never evicted; such candidates are queued
    /// for the next rebuild instead.
    fn evict(&mut self, mut disposals: Vec<MeshDisposal>, info: &mut UpdateInfo) {
        disposals.sort_by_key(|disposal| core::cmp::Reverse(OrderedFloat(disposal.distance)));
        let mut queued = Vec::new();
        for disposal in disposals {
            if self.render_set.is_mesh_batched(disposal.mesh) {
                queued.push(disposal);
                continue;
            }
            if let Some(mesh) = self.registry.get_mut(disposal.mesh)
                && mesh.is_resident()
            {
                self.render_set.release_mesh(disposal.mesh);
                mesh.unload();
                info.meshes_evicted += 1;
                log::trace!(
                    "evicted mesh {:?} at distance {:.1}",
                    disposal.mesh,
                    disposal.distance,
                );
            }
        }
        self.queued_disposals = queued;
    }

    /// Generates every non-resident mesh referenced by a renderable entity.
    /// Used by rebuilds when culling is disabled.
    fn fetch_all_eagerly(&mut self, components: &RenderComponents) -> Result<(), UpdateError> {
        for material_group in &visibility::group_renderables(components).materials {
            for mesh_group in &material_group.meshes {
                if self.registry.expect(mesh_group.mesh).is_resident() {
                    continue;
                }
                let data = self
                    .generator
                    .generate(mesh_group.mesh)
                    .map_err(|source| UpdateError::Generation {
                        mesh: mesh_group.mesh,
                        source,
                    })?;
                if let Some(mesh) = self.registry.get_mut(mesh_group.mesh) {
                    mesh.install_data(data);
                    self.residency_changed = true;
                }
            }
        }
        Ok(())
    }
}
