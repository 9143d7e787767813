// Command buffers
//
// A CommandBuffer is a command-buffer-producing resource: one pool, and per
// ring slot one primary buffer, one fence and one "finished" semaphore. The
// fence bounds CPU reuse of the slot; the semaphore orders GPU consumers.

use anyhow::{Context, Result};
use ash::vk;

use super::reclaim::RetiredResource;
use super::VulkanDevice;

pub struct CommandBuffer {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    fences: Vec<vk::Fence>,
    finished: Vec<vk::Semaphore>,
}

impl CommandBuffer {
    /// Allocate one buffer/fence/semaphore per ring slot, with the pool on
    /// the queue family the buffer will be submitted to.
    ///
    /// Fences start signaled so the first wait on a slot doesn't block.
    pub fn new(
        device: &VulkanDevice,
        queue_family: u32,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);

        let buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        let fence_info =
            vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let semaphore_info = vk::SemaphoreCreateInfo::builder();

        let mut fences = Vec::with_capacity(frames_in_flight);
        let mut finished = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            unsafe {
                fences.push(device.device.create_fence(&fence_info, None)?);
                finished.push(device.device.create_semaphore(&semaphore_info, None)?);
            }
        }

        Ok(Self {
            pool,
            buffers,
            fences,
            finished,
        })
    }

    pub fn handle(&self, slot: usize) -> vk::CommandBuffer {
        self.buffers[slot]
    }

    pub fn fence(&self, slot: usize) -> vk::Fence {
        self.fences[slot]
    }

    /// The semaphore signaled when this buffer's work for `slot` completes.
    pub fn finished(&self, slot: usize) -> vk::Semaphore {
        self.finished[slot]
    }

    pub(crate) fn fences(&self) -> &[vk::Fence] {
        &self.fences
    }

    pub(crate) fn finished_semaphores(&self) -> &[vk::Semaphore] {
        &self.finished
    }

    /// Reset the slot's fence and buffer, then open recording.
    pub(crate) fn begin(&self, device: &VulkanDevice, slot: usize) -> Result<vk::CommandBuffer> {
        let cmd = self.buffers[slot];
        unsafe {
            device.device.reset_fences(&[self.fences[slot]])?;
            device
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::builder();
            device.device.begin_command_buffer(cmd, &begin_info)?;
        }
        Ok(cmd)
    }

    pub(crate) fn end(&self, device: &VulkanDevice, slot: usize) -> Result<()> {
        unsafe { device.device.end_command_buffer(self.buffers[slot]) }?;
        Ok(())
    }

    /// Package the owned handles for deferred destruction.
    pub fn into_retired(self) -> RetiredResource {
        RetiredResource::CommandBuffers {
            pool: self.pool,
            fences: self.fences,
            semaphores: self.finished,
        }
    }
}

/// Record and submit a one-shot command buffer, waiting for completion.
///
/// Used by layout transitions and staging uploads so the calling thread
/// observes the GPU work as done on return.
pub fn submit_once<F>(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    queue: vk::Queue,
    record: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer) -> Result<()>,
{
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let cmd = unsafe { device.device.allocate_command_buffers(&alloc_info) }
        .context("Failed to allocate one-shot command buffer")?
        .first()
        .copied()
        .context("Driver returned no command buffer")?;

    let result = (|| {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.device.begin_command_buffer(cmd, &begin_info) }?;

        record(cmd)?;

        unsafe { device.device.end_command_buffer(cmd) }?;

        let fence = unsafe {
            device
                .device
                .create_fence(&vk::FenceCreateInfo::builder(), None)
        }?;

        let buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&buffers);

        let submitted = unsafe {
            device
                .device
                .queue_submit(queue, &[submit_info.build()], fence)
        };
        let waited = match submitted {
            Ok(()) => unsafe { device.device.wait_for_fences(&[fence], true, u64::MAX) },
            Err(e) => Err(e),
        };

        unsafe { device.device.destroy_fence(fence, None) };
        waited.context("One-shot submission failed")?;
        Ok(())
    })();

    unsafe { device.device.free_command_buffers(pool, &[cmd]) };

    result
}
