//! Render-target arenas and extent-driven recreation.
//!
//! Passes, pipelines, framebuffers and free-standing images live in typed
//! arenas. Pipelines and framebuffers refer to their pass by [`Handle`].
//! [`RenderTargets::set_extent`] rebuilds everything in dependency order:
//! passes, then pipelines, then framebuffers, then images.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::framebuffer::Framebuffer;
use crate::image::Image;
use crate::pipeline::GraphicsPipeline;
use crate::pipeline_cache::PipelineCache;
use crate::render_pass::RenderPass;
use ash::vk;
use hashbrown::HashMap;
use kiln_core::{Arena, Extent, Handle};

/// Operations the coordinator needs from a concrete resource backend.
pub trait TargetBackend {
    /// State borrowed for the duration of one recreation sweep.
    type Context<'a>;
    type Pass;
    type Pipeline;
    type Framebuffer;
    type Image;

    fn recreate_pass(ctx: &mut Self::Context<'_>, pass: &mut Self::Pass) -> Result<()>;

    fn recreate_pipeline(
        ctx: &mut Self::Context<'_>,
        pipeline: &mut Self::Pipeline,
        pass: &Self::Pass,
        extent: Extent,
    ) -> Result<()>;

    fn recreate_framebuffer(
        ctx: &mut Self::Context<'_>,
        framebuffer: &mut Self::Framebuffer,
        pass: &Self::Pass,
        extent: Extent,
    ) -> Result<()>;

    fn recreate_image(
        ctx: &mut Self::Context<'_>,
        image: &mut Self::Image,
        extent: Extent,
    ) -> Result<()>;

    fn destroy_pass(ctx: &mut Self::Context<'_>, pass: &mut Self::Pass);
    fn destroy_pipeline(ctx: &mut Self::Context<'_>, pipeline: &mut Self::Pipeline);
    fn destroy_framebuffer(ctx: &mut Self::Context<'_>, framebuffer: &mut Self::Framebuffer);
    fn destroy_image(ctx: &mut Self::Context<'_>, image: &mut Self::Image);
}

/// Arena-backed registry of extent-dependent resources.
pub struct RenderTargets<B: TargetBackend> {
    passes: Arena<B::Pass>,
    pipelines: Arena<B::Pipeline>,
    framebuffers: Arena<B::Framebuffer>,
    images: Arena<B::Image>,
    pipeline_pass: HashMap<Handle<B::Pipeline>, Handle<B::Pass>>,
    framebuffer_pass: HashMap<Handle<B::Framebuffer>, Handle<B::Pass>>,
    extent: Extent,
    pending: Option<Extent>,
}

impl<B: TargetBackend> RenderTargets<B> {
    pub fn new(extent: Extent) -> Self {
        Self {
            passes: Arena::new(),
            pipelines: Arena::new(),
            framebuffers: Arena::new(),
            images: Arena::new(),
            pipeline_pass: HashMap::new(),
            framebuffer_pass: HashMap::new(),
            extent,
            pending: None,
        }
    }

    /// Extent of the last completed sweep.
    pub const fn extent(&self) -> Extent {
        self.extent
    }

    pub fn add_pass(&mut self, pass: B::Pass) -> Handle<B::Pass> {
        self.passes.insert(pass)
    }

    /// Register a pipeline built against `pass`.
    pub fn add_pipeline(
        &mut self,
        pipeline: B::Pipeline,
        pass: Handle<B::Pass>,
    ) -> Result<Handle<B::Pipeline>> {
        self.passes.try_get(pass)?;
        let handle = self.pipelines.insert(pipeline);
        self.pipeline_pass.insert(handle, pass);
        Ok(handle)
    }

    /// Register a framebuffer compatible with `pass`.
    pub fn add_framebuffer(
        &mut self,
        framebuffer: B::Framebuffer,
        pass: Handle<B::Pass>,
    ) -> Result<Handle<B::Framebuffer>> {
        self.passes.try_get(pass)?;
        let handle = self.framebuffers.insert(framebuffer);
        self.framebuffer_pass.insert(handle, pass);
        Ok(handle)
    }

    pub fn add_image(&mut self, image: B::Image) -> Handle<B::Image> {
        self.images.insert(image)
    }

    pub fn pass(&self, handle: Handle<B::Pass>) -> Result<&B::Pass> {
        Ok(self.passes.try_get(handle)?)
    }

    pub fn pipeline(&self, handle: Handle<B::Pipeline>) -> Result<&B::Pipeline> {
        Ok(self.pipelines.try_get(handle)?)
    }

    pub fn pipeline_mut(&mut self, handle: Handle<B::Pipeline>) -> Result<&mut B::Pipeline> {
        Ok(self.pipelines.try_get_mut(handle)?)
    }

    pub fn framebuffer(&self, handle: Handle<B::Framebuffer>) -> Result<&B::Framebuffer> {
        Ok(self.framebuffers.try_get(handle)?)
    }

    pub fn framebuffer_mut(
        &mut self,
        handle: Handle<B::Framebuffer>,
    ) -> Result<&mut B::Framebuffer> {
        Ok(self.framebuffers.try_get_mut(handle)?)
    }

    pub fn image(&self, handle: Handle<B::Image>) -> Result<&B::Image> {
        Ok(self.images.try_get(handle)?)
    }

    pub fn image_mut(&mut self, handle: Handle<B::Image>) -> Result<&mut B::Image> {
        Ok(self.images.try_get_mut(handle)?)
    }

    /// Pass a pipeline or framebuffer was registered against.
    pub fn pass_of_pipeline(&self, handle: Handle<B::Pipeline>) -> Result<Handle<B::Pass>> {
        self.pipeline_pass
            .get(&handle)
            .copied()
            .ok_or_else(|| GpuError::ResourceNotFound(format!("pipeline {handle:?}")))
    }

    pub fn pass_of_framebuffer(&self, handle: Handle<B::Framebuffer>) -> Result<Handle<B::Pass>> {
        self.framebuffer_pass
            .get(&handle)
            .copied()
            .ok_or_else(|| GpuError::ResourceNotFound(format!("framebuffer {handle:?}")))
    }

    /// Count of live records per arena: passes, pipelines, framebuffers, images.
    pub fn counts(&self) -> [usize; 4] {
        [
            self.passes.len(),
            self.pipelines.len(),
            self.framebuffers.len(),
            self.images.len(),
        ]
    }

    /// Recreate every resource at `extent`, in dependency order.
    ///
    /// Calling this with the current extent still rebuilds everything.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn set_extent(&mut self, ctx: &mut B::Context<'_>, extent: Extent) -> Result<()> {
        let extent = extent.validated()?;
        tracing::debug!(from = %self.extent, to = %extent, "recreating render targets");

        for (_, pass) in self.passes.iter_mut() {
            B::recreate_pass(ctx, pass)?;
        }
        for (handle, pipeline) in self.pipelines.iter_mut() {
            let pass = lookup_pass(&self.passes, self.pipeline_pass.get(&handle).copied())?;
            B::recreate_pipeline(ctx, pipeline, pass, extent)?;
        }
        for (handle, framebuffer) in self.framebuffers.iter_mut() {
            let pass = lookup_pass(&self.passes, self.framebuffer_pass.get(&handle).copied())?;
            B::recreate_framebuffer(ctx, framebuffer, pass, extent)?;
        }
        for (_, image) in self.images.iter_mut() {
            B::recreate_image(ctx, image, extent)?;
        }

        self.extent = extent;
        self.pending = None;
        Ok(())
    }

    /// Record an extent change to apply at the next safe point. The latest call wins.
    pub fn mark_stale(&mut self, extent: Extent) {
        self.pending = Some(extent);
    }

    pub const fn is_stale(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the pending extent, if any.
    pub fn take_pending(&mut self) -> Option<Extent> {
        self.pending.take()
    }

    /// Apply a pending extent. Returns true when a sweep ran.
    ///
    /// A pending zero extent stays pending.
    pub fn apply_pending(&mut self, ctx: &mut B::Context<'_>) -> Result<bool> {
        match self.pending {
            Some(extent) if extent.is_valid() => {
                self.set_extent(ctx, extent)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn remove_pipeline(
        &mut self,
        ctx: &mut B::Context<'_>,
        handle: Handle<B::Pipeline>,
    ) -> Result<()> {
        let mut pipeline = self.pipelines.remove(handle).ok_or_else(|| stale(handle))?;
        self.pipeline_pass.remove(&handle);
        B::destroy_pipeline(ctx, &mut pipeline);
        Ok(())
    }

    pub fn remove_framebuffer(
        &mut self,
        ctx: &mut B::Context<'_>,
        handle: Handle<B::Framebuffer>,
    ) -> Result<()> {
        let mut framebuffer = self.framebuffers.remove(handle).ok_or_else(|| stale(handle))?;
        self.framebuffer_pass.remove(&handle);
        B::destroy_framebuffer(ctx, &mut framebuffer);
        Ok(())
    }

    pub fn remove_image(
        &mut self,
        ctx: &mut B::Context<'_>,
        handle: Handle<B::Image>,
    ) -> Result<()> {
        let mut image = self.images.remove(handle).ok_or_else(|| stale(handle))?;
        B::destroy_image(ctx, &mut image);
        Ok(())
    }

    /// Remove a pass. Rejected while a pipeline or framebuffer still refers to it.
    pub fn remove_pass(&mut self, ctx: &mut B::Context<'_>, handle: Handle<B::Pass>) -> Result<()> {
        let in_use = self.pipeline_pass.values().any(|&pass| pass == handle)
            || self.framebuffer_pass.values().any(|&pass| pass == handle);
        if in_use {
            return Err(GpuError::InvalidState(format!(
                "render pass {handle:?} is still referenced"
            )));
        }
        let mut pass = self.passes.remove(handle).ok_or_else(|| stale(handle))?;
        B::destroy_pass(ctx, &mut pass);
        Ok(())
    }

    /// Destroy everything, dependents before passes.
    pub fn destroy(&mut self, ctx: &mut B::Context<'_>) {
        for mut image in self.images.drain() {
            B::destroy_image(ctx, &mut image);
        }
        for mut framebuffer in self.framebuffers.drain() {
            B::destroy_framebuffer(ctx, &mut framebuffer);
        }
        for mut pipeline in self.pipelines.drain() {
            B::destroy_pipeline(ctx, &mut pipeline);
        }
        for mut pass in self.passes.drain() {
            B::destroy_pass(ctx, &mut pass);
        }
        self.pipeline_pass.clear();
        self.framebuffer_pass.clear();
        self.pending = None;
    }
}

fn lookup_pass<P>(passes: &Arena<P>, handle: Option<Handle<P>>) -> Result<&P> {
    let handle = handle.ok_or_else(|| GpuError::ResourceNotFound("unlinked render pass".into()))?;
    Ok(passes.try_get(handle)?)
}

fn stale<T>(handle: Handle<T>) -> GpuError {
    GpuError::ResourceNotFound(format!("{handle:?}"))
}

/// Vulkan implementation of [`TargetBackend`].
pub struct VulkanTargets;

/// Borrowed state for one Vulkan recreation sweep.
pub struct VulkanTargetContext<'a> {
    pub gpu: &'a GpuContext,
    pub cache: &'a mut PipelineCache,
    /// Views of the current swapchain; empty when presenting is not involved.
    pub swapchain_views: &'a [vk::ImageView],
}

impl TargetBackend for VulkanTargets {
    type Context<'a> = VulkanTargetContext<'a>;
    type Pass = RenderPass;
    type Pipeline = GraphicsPipeline;
    type Framebuffer = Framebuffer;
    type Image = Image;

    fn recreate_pass(ctx: &mut Self::Context<'_>, pass: &mut RenderPass) -> Result<()> {
        unsafe { pass.recreate(ctx.gpu.device(), true) }
    }

    fn recreate_pipeline(
        ctx: &mut Self::Context<'_>,
        pipeline: &mut GraphicsPipeline,
        pass: &RenderPass,
        extent: Extent,
    ) -> Result<()> {
        let device = ctx.gpu.device();
        unsafe {
            let cache = ctx.cache.native(device, pipeline.name(), pipeline.properties())?;
            pipeline.recreate(device, pass, cache, true, extent)
        }
    }

    fn recreate_framebuffer(
        ctx: &mut Self::Context<'_>,
        framebuffer: &mut Framebuffer,
        pass: &RenderPass,
        extent: Extent,
    ) -> Result<()> {
        if !ctx.swapchain_views.is_empty() {
            framebuffer.rebind_swapchain(ctx.swapchain_views);
        }
        framebuffer.recreate(ctx.gpu, pass, true, extent)
    }

    fn recreate_image(
        ctx: &mut Self::Context<'_>,
        image: &mut Image,
        extent: Extent,
    ) -> Result<()> {
        image.recreate(ctx.gpu, true, extent)
    }

    fn destroy_pass(ctx: &mut Self::Context<'_>, pass: &mut RenderPass) {
        unsafe { pass.destroy(ctx.gpu.device()) }
    }

    fn destroy_pipeline(ctx: &mut Self::Context<'_>, pipeline: &mut GraphicsPipeline) {
        unsafe { pipeline.destroy(ctx.gpu.device()) }
    }

    fn destroy_framebuffer(ctx: &mut Self::Context<'_>, framebuffer: &mut Framebuffer) {
        framebuffer.destroy(ctx.gpu);
    }

    fn destroy_image(ctx: &mut Self::Context<'_>, image: &mut Image) {
        image.destroy(ctx.gpu);
    }
}

/// Render targets backed by Vulkan resources.
pub type VulkanRenderTargets = RenderTargets<VulkanTargets>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Log {
        events: Vec<String>,
        live: usize,
    }

    struct Mock {
        name: &'static str,
        extent: Extent,
        builds: u32,
    }

    impl Mock {
        fn new(name: &'static str, log: &mut Log) -> Self {
            log.live += 1;
            Self {
                name,
                extent: Extent::new(800, 600),
                builds: 1,
            }
        }

        fn rebuild(&mut self, log: &mut Log, kind: &str, extent: Extent) {
            // Destroy then create: live count is unchanged.
            log.live -= 1;
            self.extent = extent.or(self.extent);
            self.builds += 1;
            log.live += 1;
            log.events.push(format!("{kind}:{}", self.name));
        }
    }

    struct MockBackend;

    impl TargetBackend for MockBackend {
        type Context<'a> = Log;
        type Pass = Mock;
        type Pipeline = Mock;
        type Framebuffer = Mock;
        type Image = Mock;

        fn recreate_pass(ctx: &mut Log, pass: &mut Mock) -> Result<()> {
            let extent = pass.extent;
            pass.rebuild(ctx, "pass", extent);
            Ok(())
        }

        fn recreate_pipeline(
            ctx: &mut Log,
            pipeline: &mut Mock,
            _pass: &Mock,
            extent: Extent,
        ) -> Result<()> {
            pipeline.rebuild(ctx, "pipeline", extent);
            Ok(())
        }

        fn recreate_framebuffer(
            ctx: &mut Log,
            framebuffer: &mut Mock,
            _pass: &Mock,
            extent: Extent,
        ) -> Result<()> {
            framebuffer.rebuild(ctx, "framebuffer", extent);
            Ok(())
        }

        fn recreate_image(ctx: &mut Log, image: &mut Mock, extent: Extent) -> Result<()> {
            image.rebuild(ctx, "image", extent);
            Ok(())
        }

        fn destroy_pass(ctx: &mut Log, _pass: &mut Mock) {
            ctx.live -= 1;
        }

        fn destroy_pipeline(ctx: &mut Log, _pipeline: &mut Mock) {
            ctx.live -= 1;
        }

        fn destroy_framebuffer(ctx: &mut Log, _framebuffer: &mut Mock) {
            ctx.live -= 1;
        }

        fn destroy_image(ctx: &mut Log, _image: &mut Mock) {
            ctx.live -= 1;
        }
    }

    struct Scene {
        targets: RenderTargets<MockBackend>,
        log: Log,
        pipeline: Handle<Mock>,
        framebuffer: Handle<Mock>,
        image: Handle<Mock>,
    }

    fn scene() -> Scene {
        let mut log = Log::default();
        let mut targets = RenderTargets::<MockBackend>::new(Extent::new(800, 600));
        // Registered in reverse dependency order to show the sweep reorders them.
        let image = targets.add_image(Mock::new("depth", &mut log));
        let pass = targets.add_pass(Mock::new("main", &mut log));
        let framebuffer = targets
            .add_framebuffer(Mock::new("swapchain", &mut log), pass)
            .unwrap();
        let pipeline = targets.add_pipeline(Mock::new("quad", &mut log), pass).unwrap();
        Scene {
            targets,
            log,
            pipeline,
            framebuffer,
            image,
        }
    }

    #[test]
    fn sweep_follows_dependency_order() {
        let mut s = scene();
        s.targets.set_extent(&mut s.log, Extent::new(1024, 768)).unwrap();
        assert_eq!(
            s.log.events,
            ["pass:main", "pipeline:quad", "framebuffer:swapchain", "image:depth"]
        );
    }

    #[test]
    fn identical_extent_rebuilds_without_leaking() {
        let mut s = scene();
        let extent = Extent::new(800, 600);
        s.targets.set_extent(&mut s.log, extent).unwrap();
        s.targets.set_extent(&mut s.log, extent).unwrap();

        assert_eq!(s.log.live, 4);
        assert_eq!(s.targets.counts(), [1, 1, 1, 1]);
        let pipeline = s.targets.pipeline(s.pipeline).unwrap();
        assert_eq!(pipeline.builds, 3);
        assert_eq!(pipeline.extent, extent);
        assert_eq!(s.targets.extent(), extent);
    }

    #[test]
    fn repeated_resizes_end_at_last_extent() {
        let mut s = scene();
        let sizes = [(800, 600), (1920, 1080), (640, 480), (800, 600), (1920, 1080)];
        for size in sizes {
            s.targets.set_extent(&mut s.log, size.into()).unwrap();
        }

        let last = Extent::new(1920, 1080);
        assert_eq!(s.targets.pipeline(s.pipeline).unwrap().extent, last);
        assert_eq!(s.targets.framebuffer(s.framebuffer).unwrap().extent, last);
        assert_eq!(s.targets.image(s.image).unwrap().extent, last);
        assert_eq!(s.targets.extent(), last);
        assert_eq!(s.log.live, 4);
        assert_eq!(s.log.events.len(), 4 * sizes.len());
    }

    #[test]
    fn zero_extent_is_rejected_and_kept_pending() {
        let mut s = scene();
        assert!(s.targets.set_extent(&mut s.log, Extent::new(0, 600)).is_err());
        assert!(s.log.events.is_empty());

        s.targets.mark_stale(Extent::new(0, 0));
        assert!(!s.targets.apply_pending(&mut s.log).unwrap());
        assert!(s.targets.is_stale());

        s.targets.mark_stale(Extent::new(640, 480));
        assert!(s.targets.apply_pending(&mut s.log).unwrap());
        assert!(!s.targets.is_stale());
        assert_eq!(s.targets.extent(), Extent::new(640, 480));
    }

    #[test]
    fn latest_pending_extent_wins() {
        let mut s = scene();
        s.targets.mark_stale(Extent::new(640, 480));
        s.targets.mark_stale(Extent::new(1280, 720));
        assert_eq!(s.targets.take_pending(), Some(Extent::new(1280, 720)));
        assert_eq!(s.targets.take_pending(), None);
    }

    #[test]
    fn removed_records_report_stale_handles() {
        let mut s = scene();
        s.targets.remove_image(&mut s.log, s.image).unwrap();
        assert!(matches!(
            s.targets.image(s.image),
            Err(GpuError::ResourceNotFound(_))
        ));
        assert!(s.targets.remove_image(&mut s.log, s.image).is_err());
        assert_eq!(s.log.live, 3);
    }

    #[test]
    fn referenced_pass_cannot_be_removed() {
        let mut s = scene();
        let pass = s.targets.pass_of_pipeline(s.pipeline).unwrap();
        assert!(matches!(
            s.targets.remove_pass(&mut s.log, pass),
            Err(GpuError::InvalidState(_))
        ));

        s.targets.remove_pipeline(&mut s.log, s.pipeline).unwrap();
        s.targets.remove_framebuffer(&mut s.log, s.framebuffer).unwrap();
        s.targets.remove_pass(&mut s.log, pass).unwrap();
        assert_eq!(s.targets.counts(), [0, 0, 0, 1]);
    }

    #[test]
    fn destroy_releases_everything() {
        let mut s = scene();
        s.targets.destroy(&mut s.log);
        assert_eq!(s.log.live, 0);
        assert_eq!(s.targets.counts(), [0, 0, 0, 0]);
    }
}
