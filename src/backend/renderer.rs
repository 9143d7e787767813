// Frame/submission engine
//
// Drives one window's frame loop: BeginFrame -> acquire -> record -> Submit
// -> Present, consulting the task manager for wait/signal sets and owning
// the reclaim queue. One instance per window; a single CPU thread drives it
// while the GPU executes submitted work asynchronously.
//
// The CPU blocks in exactly two places: the slot-fence wait in begin_frame
// (which bounds frames in flight) and device/queue idles during teardown and
// resize. Everything else is GPU-side semaphore ordering.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::buffer::{self, Buffer, Uploadable};
use super::command::CommandBuffer;
use super::image::{Image, ImageDesc};
use super::reclaim::{ReclaimQueue, RetiredResource};
use super::surface;
use super::swapchain::Swapchain;
use super::tasks::{ExecutionPolicy, TaskManager};
use super::transition;
use super::VulkanDevice;

/// Which device queue a submission targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    Graphics,
    Compute,
}

/// Per-instance frame state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameStage {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presented,
}

pub struct RendererDesc {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub frames_in_flight: usize,
}

pub struct Renderer {
    device: Arc<VulkanDevice>,
    swapchain: Swapchain,
    tasks: TaskManager,
    reclaim: Mutex<ReclaimQueue>,
    /// Pool for one-shot transition/upload submissions.
    upload_pool: vk::CommandPool,
    frames_in_flight: usize,
    /// Ring slot, advances by exactly one per present.
    slot: usize,
    /// Monotonic presented-frame counter; stamps reclaim entries.
    frame_number: u64,
    stage: FrameStage,
    minimized: bool,
    vsync: bool,
    width: u32,
    height: u32,
}

impl Renderer {
    /// Connect the engine to a native window and build its swapchain.
    pub fn new(
        device: Arc<VulkanDevice>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
        desc: &RendererDesc,
    ) -> Result<Self> {
        anyhow::ensure!(desc.frames_in_flight >= 1, "frames_in_flight must be >= 1");

        let (surface_loader, surface) = surface::create_surface(&device, display, window)?;

        let swapchain = Swapchain::new(
            device.clone(),
            surface_loader,
            surface,
            desc.width,
            desc.height,
            desc.vsync,
            desc.frames_in_flight,
        )?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let upload_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create upload command pool")?;

        Ok(Self {
            tasks: TaskManager::new(desc.frames_in_flight),
            reclaim: Mutex::new(ReclaimQueue::new(desc.frames_in_flight)),
            upload_pool,
            frames_in_flight: desc.frames_in_flight,
            slot: 0,
            frame_number: 0,
            stage: FrameStage::Idle,
            minimized: desc.width == 0 || desc.height == 0,
            vsync: desc.vsync,
            width: desc.width,
            height: desc.height,
            swapchain,
            device,
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn swapchain_format(&self) -> vk::Format {
        self.swapchain.format
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn current_image_index(&self) -> u32 {
        self.swapchain.current_image_index()
    }

    /// Raw handle of the currently acquired swapchain image.
    pub fn current_swapchain_image(&self) -> vk::Image {
        self.swapchain.current_image().image
    }

    fn queue(&self, role: QueueRole) -> vk::Queue {
        match role {
            QueueRole::Graphics => self.device.graphics_queue,
            QueueRole::Compute => self.device.compute_queue,
        }
    }

    fn queue_family(&self, role: QueueRole) -> u32 {
        match role {
            QueueRole::Graphics => self.device.graphics_queue_family,
            QueueRole::Compute => self.device.compute_queue_family,
        }
    }

    // ------------------------------------------------------------------
    // Frame loop
    // ------------------------------------------------------------------

    /// Start a frame: wait for the ring slot's previous use, reclaim what
    /// that wait proved safe, seed the acquire semaphore and acquire the
    /// next image.
    ///
    /// Returns `false` without doing anything while the window is minimized.
    pub fn begin_frame(&mut self) -> Result<bool> {
        if self.minimized {
            return Ok(false);
        }
        debug_assert_eq!(self.stage, FrameStage::Idle, "begin_frame out of order");
        self.stage = FrameStage::Acquiring;

        // This wait is what bounds frames in flight: the ring cannot lap the
        // GPU by more than `frames_in_flight`.
        let fences = self.tasks.fences(self.slot);
        if !fences.is_empty() {
            unsafe {
                self.device
                    .device
                    .wait_for_fences(&fences, true, u64::MAX)
                    .context("Waiting on frame fences failed")?;
            }
        }
        self.tasks.reset_fences(self.slot);

        // The wait above proved frame `frame_number - frames_in_flight`
        // complete, which is exactly what drain_completed checks.
        self.run_reclaim(false);

        self.tasks.reset_semaphores(self.slot);
        self.tasks
            .add_wait_semaphore(self.slot, self.swapchain.acquire_semaphore(self.slot));
        self.swapchain.acquire_next_image(self.slot)?;

        self.stage = FrameStage::Recording;
        Ok(true)
    }

    /// Reset the buffer's slot fence and open recording. Returns the raw
    /// handle to record into.
    pub fn begin(&self, cmd: &CommandBuffer) -> Result<vk::CommandBuffer> {
        cmd.begin(&self.device, self.slot)
    }

    pub fn end(&self, cmd: &CommandBuffer) -> Result<()> {
        cmd.end(&self.device, self.slot)
    }

    /// Submit a recorded buffer.
    ///
    /// The wait set is the finished semaphores of everything in `wait_on`
    /// (consumed from the task manager so present doesn't wait on them
    /// twice) plus, for policies that order against the previous in-order
    /// submission, the next chained semaphore. `wait_stage` is broadcast to
    /// every wait. The buffer's own finished semaphore is signalled and its
    /// slot fence is attached, then the buffer is registered for this frame.
    pub fn submit(
        &mut self,
        cmd: &CommandBuffer,
        policy: ExecutionPolicy,
        role: QueueRole,
        wait_stage: vk::PipelineStageFlags,
        wait_on: &[&CommandBuffer],
    ) -> Result<()> {
        debug_assert!(
            matches!(self.stage, FrameStage::Recording | FrameStage::Submitted),
            "submit outside a frame"
        );
        let slot = self.slot;

        let mut wait_semaphores = Vec::with_capacity(wait_on.len() + 1);
        for dep in wait_on {
            let finished = dep.finished(slot);
            if !self.tasks.remove_semaphore(slot, finished) {
                log::warn!("Explicit wait on a command buffer not submitted this frame");
            }
            wait_semaphores.push(finished);
        }

        if policy.waits_on_previous() {
            if let Some(chained) = self.tasks.next_chained(slot) {
                debug_assert!(
                    !wait_semaphores.contains(&chained),
                    "Chained semaphore already in the explicit wait list"
                );
                wait_semaphores.push(chained);
            }
        }

        let wait_stages = vec![wait_stage; wait_semaphores.len()];
        let command_buffers = [cmd.handle(slot)];
        let signal_semaphores = [cmd.finished(slot)];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(self.queue(role), &[submit_info.build()], cmd.fence(slot))
                .context("vkQueueSubmit failed")?;
        }

        self.tasks
            .add_command_buffer(slot, cmd.fence(slot), cmd.finished(slot), policy);
        self.stage = FrameStage::Submitted;
        Ok(())
    }

    /// Present the acquired image, waiting on every outstanding semaphore
    /// of the frame, then advance the ring.
    ///
    /// Out-of-date/suboptimal results trigger a recreate instead of failing.
    /// Other presentation errors are logged and the frame loop continues;
    /// only device loss is fatal.
    pub fn present(&mut self) -> Result<()> {
        if self.minimized {
            return Ok(());
        }
        debug_assert!(
            matches!(self.stage, FrameStage::Recording | FrameStage::Submitted),
            "present without a frame"
        );

        let wait_semaphores = self.tasks.semaphores(self.slot);
        let result = self
            .swapchain
            .present(self.device.present_queue(), &wait_semaphores);
        self.stage = FrameStage::Presented;

        match result {
            Ok(false) => {}
            Ok(true) => {
                log::debug!("Swapchain out of date during present, recreating");
                self.recreate()?;
            }
            Err(e) => {
                if let Some(&vk::Result::ERROR_DEVICE_LOST) = e.downcast_ref::<vk::Result>() {
                    return Err(e.context("vkQueuePresentKHR: device lost"));
                }
                log::error!("vkQueuePresentKHR failed: {:#}", e);
                debug_assert!(false, "vkQueuePresentKHR failed: {:#}", e);
            }
        }

        // Ring bookkeeping happens only after presenting.
        let presented_slot = self.slot;
        self.frame_number += 1;
        self.slot = (self.slot + 1) % self.frames_in_flight;
        self.tasks.reset_semaphores(presented_slot);
        self.stage = FrameStage::Idle;
        Ok(())
    }

    /// Finish the frame. Synonym for [`present`](Self::present); the frame
    /// is over once the image is handed to the presentation engine.
    pub fn end_frame(&mut self) -> Result<()> {
        self.present()
    }

    /// Window resize notification. Zero size marks the window minimized and
    /// parks the frame loop; anything else rebuilds the swapchain after a
    /// full device/queue idle.
    pub fn on_resize(&mut self, width: u32, height: u32, vsync: bool) -> Result<()> {
        self.width = width;
        self.height = height;
        self.vsync = vsync;

        if width == 0 || height == 0 {
            self.minimized = true;
            return Ok(());
        }
        self.minimized = false;

        self.device.wait_idle()?;
        self.device.queue_wait_idle(self.device.graphics_queue)?;
        self.swapchain
            .resize(width, height, vsync, self.frames_in_flight)
    }

    /// Rebuild presentation state with the last known window size.
    pub fn recreate(&mut self) -> Result<()> {
        self.on_resize(self.width, self.height, self.vsync)
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Command buffer for graphics-queue submissions.
    pub fn create_command_buffer(&self) -> Result<CommandBuffer> {
        self.create_command_buffer_for(QueueRole::Graphics)
    }

    /// Command buffer whose pool lives on the given queue's family.
    pub fn create_command_buffer_for(&self, role: QueueRole) -> Result<CommandBuffer> {
        CommandBuffer::new(&self.device, self.queue_family(role), self.frames_in_flight)
    }

    /// Destroy a command buffer outside the per-frame cycle: purge its
    /// fences and semaphores from every slot so nothing dangles, then
    /// retire the handles.
    pub fn free_command_buffer(&self, cmd: CommandBuffer) {
        self.tasks
            .remove_from_all(cmd.fences(), cmd.finished_semaphores());
        self.free(cmd.into_retired());
    }

    pub fn create_image(&self, desc: &ImageDesc) -> Result<Image> {
        Image::new(&self.device, desc)
    }

    pub fn create_depth_image(&self) -> Result<Image> {
        Image::depth(&self.device, self.swapchain.extent)
    }

    pub fn free_image(&self, image: Image) {
        self.free(image.into_retired());
    }

    /// Recreate an image at a new size, retiring the old handles.
    pub fn resize_image(&self, image: &mut Image, width: u32, height: u32) -> Result<()> {
        let retired = image.resize(&self.device, width, height)?;
        self.free(retired);
        Ok(())
    }

    /// Transition an image, blocking until the barrier has executed.
    pub fn transition_image(&self, image: &mut Image, new_layout: vk::ImageLayout) -> Result<()> {
        image.transition(
            &self.device,
            self.upload_pool,
            self.device.graphics_queue,
            new_layout,
        )
    }

    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: gpu_allocator::MemoryLocation,
    ) -> Result<Buffer> {
        Buffer::new(&self.device, size, usage, location)
    }

    pub fn free_buffer(&self, buffer: Buffer) {
        self.free(buffer.into_retired());
    }

    /// Upload data into an image or buffer, dispatched per resource kind.
    pub fn upload(&self, target: Uploadable<'_>, data: &[u8]) -> Result<()> {
        buffer::upload(
            &self.device,
            self.upload_pool,
            self.device.graphics_queue,
            target,
            data,
        )
    }

    /// Record a layout barrier for the currently acquired swapchain image
    /// into `cmd`, keeping the tracked layout in sync.
    pub fn record_swapchain_barrier(
        &mut self,
        cmd: vk::CommandBuffer,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        let format = self.swapchain.format;
        let image = self.swapchain.current_image_mut();
        transition::record_barrier(
            &self.device.device,
            cmd,
            image.image,
            format,
            1,
            image.layout,
            new_layout,
        )?;
        image.layout = new_layout;
        Ok(())
    }

    /// Queue a resource for destruction once the GPU is provably done with
    /// it. The reclaim queue is drained at begin_frame and at teardown;
    /// those drains are the only places GPU handles are actually released.
    pub fn free(&self, resource: RetiredResource) {
        self.reclaim.lock().push(self.frame_number, resource);
    }

    /// Number of resources awaiting reclamation.
    pub fn pending_reclaims(&self) -> usize {
        self.reclaim.lock().len()
    }

    fn run_reclaim(&self, teardown: bool) {
        let drained = {
            let mut queue = self.reclaim.lock();
            if teardown {
                queue.drain_all()
            } else {
                queue.drain_completed(self.frame_number)
            }
        };
        for resource in drained {
            self.destroy_retired(resource);
        }
    }

    fn destroy_retired(&self, resource: RetiredResource) {
        let device = &self.device;
        unsafe {
            match resource {
                RetiredResource::Buffer { buffer, allocation } => {
                    device.device.destroy_buffer(buffer, None);
                    if let Some(allocation) = allocation {
                        if let Err(e) = device.free_memory(allocation) {
                            log::warn!("Failed to free buffer memory: {:#}", e);
                        }
                    }
                }
                RetiredResource::Image {
                    image,
                    view,
                    sampler,
                    allocation,
                } => {
                    if let Some(sampler) = sampler {
                        device.device.destroy_sampler(sampler, None);
                    }
                    device.device.destroy_image_view(view, None);
                    device.device.destroy_image(image, None);
                    if let Some(allocation) = allocation {
                        if let Err(e) = device.free_memory(allocation) {
                            log::warn!("Failed to free image memory: {:#}", e);
                        }
                    }
                }
                RetiredResource::ImageView { view } => {
                    device.device.destroy_image_view(view, None);
                }
                RetiredResource::Sampler { sampler } => {
                    device.device.destroy_sampler(sampler, None);
                }
                RetiredResource::CommandBuffers {
                    pool,
                    fences,
                    semaphores,
                } => {
                    for fence in fences {
                        device.device.destroy_fence(fence, None);
                    }
                    for semaphore in semaphores {
                        device.device.destroy_semaphore(semaphore, None);
                    }
                    // Destroying the pool frees its buffers.
                    device.device.destroy_command_pool(pool, None);
                }
            }
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Shutting down renderer...");

        if let Err(e) = self.device.wait_idle() {
            log::error!("Device idle wait failed during teardown: {:#}", e);
        }

        // Everything pending is safe to release after the idle above.
        self.run_reclaim(true);

        unsafe {
            self.device
                .device
                .destroy_command_pool(self.upload_pool, None);
        }

        self.swapchain.destroy();
    }
}
